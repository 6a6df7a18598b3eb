//! Folds a change's meta ref history into a [`ChangeNotesState`].
//!
//! The walk goes from the tip to the root. Scalars take the first value
//! seen (the newest), collections are appended as seen and reversed at the
//! end. Nothing is published until the whole history parsed, so a
//! malformed commit anywhere fails the read without a partial state.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::error::NotesError;
use crate::model::{
    AccountId, ChangeId, ChangeMessage, ChangeStatus, PatchSet, PatchSetApproval, PatchSetId,
    PatchSetState, ReviewerSet, ReviewerState, SubmitRecord,
};
use crate::note::footer::{
    LabelFooter, parse_bool, parse_hashtags, parse_patch_set, parse_submit_records,
    parse_timestamp,
};
use crate::note::{CommitMessage, FooterKey, IdentityCodec, RevisionNoteMap};
use crate::repo::{CommitData, CommitWalk, ObjectId, ObjectReader};

use super::state::{ChangeColumns, ChangeNotesState};

/// Parse the history ending at `tip`. A zero tip yields the empty state.
///
/// # Errors
///
/// Storage failures while walking, malformed footers or notes, and missing
/// mandatory footers.
pub fn parse_change<R: ObjectReader + ?Sized>(
    change: ChangeId,
    reader: &R,
    tip: ObjectId,
    codec: &IdentityCodec,
) -> Result<ChangeNotesState, NotesError> {
    if tip.is_zero() {
        return Ok(ChangeNotesState::empty(change));
    }
    let mut parser = Parser::new(change, codec);
    let mut tip_tree = None;
    for step in CommitWalk::new(reader, tip) {
        let (id, commit) =
            step.map_err(|e| NotesError::storage(format!("history of change {change}"), e))?;
        tip_tree.get_or_insert(commit.tree);
        parser.commit(id, &commit)?;
    }

    let mut notes = RevisionNoteMap::load(change, reader, tip_tree.unwrap_or(ObjectId::ZERO))?;
    notes.parse_all(reader, codec)?;
    parser.finish(tip, notes)
}

struct Parser<'a> {
    change: ChangeId,
    codec: &'a IdentityCodec,
    commits: usize,
    seen: Seen,
}

/// Values collected so far, newest first.
#[derive(Default)]
struct Seen {
    change_key: Option<String>,
    branch: Option<String>,
    subject: Option<String>,
    original_subject: Option<String>,
    topic: Option<Option<String>>,
    status: Option<ChangeStatus>,
    owner: Option<Option<AccountId>>,
    created_on: Option<DateTime<Utc>>,
    last_updated_on: Option<DateTime<Utc>>,
    current_patch_set: Option<PatchSetId>,
    submission_id: Option<String>,
    assignee: Option<Option<AccountId>>,
    is_private: Option<bool>,
    work_in_progress: Option<bool>,
    read_only_until: Option<DateTime<Utc>>,
    hashtags: Option<BTreeSet<String>>,

    patch_set_states: HashMap<PatchSetId, PatchSetState>,
    patch_sets: BTreeMap<PatchSetId, PatchSet>,
    groups: HashMap<PatchSetId, Vec<String>>,
    descriptions: HashMap<PatchSetId, String>,
    /// `None` marks a removal that hides older votes.
    approvals: HashMap<(PatchSetId, AccountId, String), Option<PatchSetApproval>>,
    messages: Vec<ChangeMessage>,
    reviewers: ReviewerSet,
    past_reviewers: Vec<AccountId>,
    submit_records: Option<Vec<SubmitRecord>>,
}

impl<'a> Parser<'a> {
    fn new(change: ChangeId, codec: &'a IdentityCodec) -> Self {
        Self {
            change,
            codec,
            commits: 0,
            seen: Seen::default(),
        }
    }

    fn format_err(&self, key: FooterKey, value: &str) -> NotesError {
        NotesError::format(self.change, key.as_str(), value)
    }

    fn account_footer(&self, key: FooterKey, value: &str) -> Result<AccountId, NotesError> {
        self.codec
            .parse_footer(value)
            .ok_or_else(|| self.format_err(key, value))
    }

    /// The account that made a commit; `None` for the server's own commits.
    fn commit_account(&self, commit: &CommitData) -> Result<Option<AccountId>, NotesError> {
        if commit.author.same_person(&commit.committer) {
            return Ok(None);
        }
        self.codec
            .parse_ident(&commit.author)
            .map(Some)
            .ok_or_else(|| NotesError::format(self.change, "author", commit.author.email.clone()))
    }

    fn commit(&mut self, id: ObjectId, commit: &CommitData) -> Result<(), NotesError> {
        let change = self.change;
        let msg = CommitMessage::parse(change, &commit.message)?;
        let account = self.commit_account(commit)?;
        let when = commit.committer.when;
        self.commits += 1;

        let ps_value = msg
            .single(FooterKey::PatchSet)
            .ok_or(NotesError::MissingFooter {
                change,
                field: FooterKey::PatchSet.as_str(),
            })?;
        let (ps, ps_state) = parse_patch_set(change, ps_value)?;
        self.seen.patch_set_states.entry(ps).or_insert(ps_state);

        let real_user = msg
            .single(FooterKey::RealUser)
            .map(|v| self.account_footer(FooterKey::RealUser, v))
            .transpose()?;
        let tag = msg.single(FooterKey::Tag).map(ToString::to_string);

        self.seen.last_updated_on.get_or_insert(when);
        // Overwritten on every commit; the root commit's values remain.
        self.seen.owner = Some(account);
        self.seen.created_on = Some(when);

        if let Some(v) = msg.single(FooterKey::ChangeId) {
            self.seen.change_key.get_or_insert_with(|| v.to_string());
        }
        if let Some(v) = msg.single(FooterKey::Branch) {
            self.seen.branch.get_or_insert_with(|| v.to_string());
        }
        if let Some(v) = msg.single(FooterKey::Subject) {
            self.seen.subject.get_or_insert_with(|| v.to_string());
            self.seen.original_subject = Some(v.to_string());
        }
        if let Some(v) = msg.single(FooterKey::Topic) {
            self.seen.topic
                .get_or_insert_with(|| Some(v.to_string()).filter(|t| !t.is_empty()));
        }
        if let Some(v) = msg.single(FooterKey::Status) {
            let status: ChangeStatus = v.parse().map_err(|_| self.format_err(FooterKey::Status, v))?;
            self.seen.status.get_or_insert(status);
        }
        if let Some(v) = msg.single(FooterKey::SubmissionId) {
            self.seen.submission_id.get_or_insert_with(|| v.to_string());
        }
        if let Some(v) = msg.single(FooterKey::Assignee) {
            let assignee = if v.is_empty() {
                None
            } else {
                Some(self.account_footer(FooterKey::Assignee, v)?)
            };
            self.seen.assignee.get_or_insert(assignee);
        }
        if let Some(v) = msg.single(FooterKey::Private) {
            let flag = parse_bool(change, FooterKey::Private, v)?;
            self.seen.is_private.get_or_insert(flag);
        }
        if let Some(v) = msg.single(FooterKey::WorkInProgress) {
            let flag = parse_bool(change, FooterKey::WorkInProgress, v)?;
            self.seen.work_in_progress.get_or_insert(flag);
        }
        if let Some(v) = msg.single(FooterKey::ReadOnlyUntil) {
            let until = parse_timestamp(v).ok_or_else(|| self.format_err(FooterKey::ReadOnlyUntil, v))?;
            self.seen.read_only_until.get_or_insert(until);
        }
        if let Some(v) = msg.single(FooterKey::Hashtags) {
            self.seen.hashtags.get_or_insert_with(|| parse_hashtags(v));
        }
        if let Some(v) = msg.single(FooterKey::Current) {
            if parse_bool(change, FooterKey::Current, v)? {
                self.seen.current_patch_set.get_or_insert(ps);
            }
        }

        if let Some(v) = msg.single(FooterKey::Commit) {
            let revision = ObjectId::from_hex(v).map_err(|_| self.format_err(FooterKey::Commit, v))?;
            let uploader = account.ok_or_else(|| self.format_err(FooterKey::Commit, "patch set uploaded by the server"))?;
            self.seen.patch_sets
                .entry(ps)
                .or_insert_with(|| PatchSet::new(ps, revision, uploader, when));
        }
        if let Some(v) = msg.single(FooterKey::Groups) {
            self.seen.groups.entry(ps).or_insert_with(|| {
                v.split(',')
                    .map(str::trim)
                    .filter(|g| !g.is_empty())
                    .map(ToString::to_string)
                    .collect()
            });
        }
        if let Some(v) = msg.single(FooterKey::PatchSetDescription) {
            self.seen.descriptions.entry(ps).or_insert_with(|| v.to_string());
        }

        for v in msg.values(FooterKey::Label) {
            let label = LabelFooter::parse(change, v, self.codec)?;
            let (voter, label_name, approval) = match label {
                LabelFooter::Vote { vote, account: on_behalf } => {
                    let voter = on_behalf.or(account).ok_or_else(|| self.format_err(FooterKey::Label, v))?;
                    let mut approval = PatchSetApproval::new(ps, voter, vote.label.clone(), vote.value, when);
                    approval.tag.clone_from(&tag);
                    (voter, vote.label, Some(approval))
                }
                LabelFooter::Removal { label, account: on_behalf } => {
                    let voter = on_behalf.or(account).ok_or_else(|| self.format_err(FooterKey::Label, v))?;
                    (voter, label, None)
                }
            };
            self.seen.approvals.entry((ps, voter, label_name)).or_insert(approval);
        }

        for state in ReviewerState::ALL {
            let key = FooterKey::for_reviewer_state(state);
            for v in msg.values(key) {
                let reviewer = self.account_footer(key, v)?;
                self.seen.reviewers.put_if_absent(reviewer, state, when);
                if state != ReviewerState::Removed {
                    self.seen.past_reviewers.push(reviewer);
                }
            }
        }

        if self.seen.submit_records.is_none() && msg.has(FooterKey::SubmittedWith) {
            let records = parse_submit_records(change, msg.values(FooterKey::SubmittedWith), self.codec)?;
            self.seen.submit_records = Some(records);
        }

        if let Some(body) = msg.body {
            self.seen.messages.push(ChangeMessage {
                key: id.to_hex(),
                author: account,
                real_author: real_user.filter(|real| Some(*real) != account),
                written_on: when,
                message: body,
                patch_set: Some(ps),
                tag,
            });
        }
        Ok(())
    }

    fn finish(mut self, tip: ObjectId, notes: RevisionNoteMap) -> Result<ChangeNotesState, NotesError> {
        let change = self.change;
        let missing = |field: FooterKey| NotesError::MissingFooter {
            change,
            field: field.as_str(),
        };
        let change_key = self.seen.change_key.take().ok_or_else(|| missing(FooterKey::ChangeId))?;
        let branch = self.seen.branch.take().ok_or_else(|| missing(FooterKey::Branch))?;
        let subject = self.seen.subject.take().ok_or_else(|| missing(FooterKey::Subject))?;
        let owner = self
            .seen
            .owner
            .flatten()
            .ok_or_else(|| NotesError::format(change, "owner", "root commit was written by the server"))?;

        // Deleted patch sets vanish with everything attached to them.
        let deleted: HashSet<PatchSetId> = self
            .seen
            .patch_set_states
            .iter()
            .filter(|(_, state)| **state == PatchSetState::Deleted)
            .map(|(ps, _)| *ps)
            .collect();
        self.seen.patch_sets.retain(|ps, _| !deleted.contains(ps));
        self.seen.messages
            .retain(|m| m.patch_set.is_none_or(|ps| !deleted.contains(&ps)));

        for (ps, patch_set) in &mut self.seen.patch_sets {
            if let Some(groups) = self.seen.groups.remove(ps) {
                patch_set.groups = groups;
            }
            patch_set.description = self.seen.descriptions.remove(ps);
        }

        // Removed reviewers lose their votes.
        let removed = self.seen.reviewers.by_state(ReviewerState::Removed);
        self.seen.reviewers.prune_removed();
        let approvals = self
            .seen
            .approvals
            .into_values()
            .flatten()
            .filter(|a| !removed.contains(&a.account) && !deleted.contains(&a.patch_set))
            .map(|a| (a.key(), a))
            .collect();

        let mut comments: BTreeMap<ObjectId, Vec<_>> = BTreeMap::new();
        for (revision, note) in notes.into_notes() {
            if let Some(cert) = &note.push_cert {
                if let Some(patch_set) = self.seen.patch_sets.values_mut().find(|p| p.revision == revision) {
                    patch_set.push_certificate = Some(cert.clone());
                }
            }
            let published = note.into_comments();
            if !published.is_empty() {
                comments.insert(revision, published);
            }
        }

        self.seen.messages.reverse();
        let mut added = HashSet::new();
        let all_past_reviewers = self
            .seen
            .past_reviewers
            .into_iter()
            .rev()
            .filter(|account| added.insert(*account))
            .collect();

        let current_patch_set = self
            .seen
            .current_patch_set
            .filter(|ps| self.seen.patch_sets.contains_key(ps))
            .or_else(|| self.seen.patch_sets.keys().next_back().copied());

        let fallback_time = self.seen.created_on.unwrap_or_default();
        let columns = ChangeColumns {
            change_key,
            owner,
            branch,
            original_subject: self.seen.original_subject.unwrap_or_else(|| subject.clone()),
            subject,
            topic: self.seen.topic.flatten(),
            status: self.seen.status.unwrap_or_default(),
            created_on: fallback_time,
            last_updated_on: self.seen.last_updated_on.unwrap_or(fallback_time),
            current_patch_set,
            submission_id: self.seen.submission_id,
            assignee: self.seen.assignee.flatten(),
            is_private: self.seen.is_private.unwrap_or(false),
            work_in_progress: self.seen.work_in_progress.unwrap_or(false),
        };

        tracing::debug!(
            change_id = %change,
            commits = self.commits,
            patch_sets = self.seen.patch_sets.len(),
            "parsed change notes"
        );

        Ok(ChangeNotesState {
            change,
            meta_id: tip,
            columns: Some(columns),
            patch_sets: self.seen.patch_sets,
            approvals,
            messages: self.seen.messages,
            comments,
            reviewers: self.seen.reviewers,
            all_past_reviewers,
            hashtags: self.seen.hashtags.unwrap_or_default(),
            submit_records: self.seen.submit_records.unwrap_or_default(),
            read_only_until: self.seen.read_only_until,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityConfig;
    use crate::note::MessageBuilder;
    use crate::repo::{MemoryRepository, ObjectInserter, Tree};

    const CHANGE: ChangeId = ChangeId::new(5);
    const OWNER: AccountId = AccountId::new(100);
    const ALICE: AccountId = AccountId::new(200);

    fn codec() -> IdentityCodec {
        IdentityCodec::new(&IdentityConfig::default())
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).expect("timestamp")
    }

    /// Write commits oldest first and return the tip.
    fn write_history(repo: &MemoryRepository, commits: &[(Option<AccountId>, String)]) -> ObjectId {
        let codec = codec();
        let mut ins = ObjectInserter::new();
        let tree = ins.insert_tree(repo, &Tree::new());
        let mut parent = None;
        for (i, (author, message)) in commits.iter().enumerate() {
            let when = at(i64::try_from(i).expect("small"));
            let committer = codec.server_ident(when);
            let author = author.map_or_else(|| committer.clone(), |a| codec.account_ident(a, when));
            let commit = CommitData {
                tree,
                parents: parent.into_iter().collect(),
                author,
                committer,
                message: message.clone(),
            };
            parent = Some(ins.insert_commit(repo, &commit));
        }
        ins.flush(repo).expect("flush");
        parent.expect("at least one commit")
    }

    fn root_message() -> String {
        let mut b = MessageBuilder::new("Create change");
        b.push(FooterKey::PatchSet, "1");
        b.push(FooterKey::ChangeId, "I1234");
        b.push(FooterKey::Branch, "refs/heads/main");
        b.push(FooterKey::Subject, "Add feature");
        b.push(FooterKey::Status, "new");
        b.push(FooterKey::Commit, "aa".repeat(20));
        b.build()
    }

    fn update(lines: &[(FooterKey, String)]) -> String {
        let mut b = MessageBuilder::new("Update patch set 1");
        b.push(FooterKey::PatchSet, "1");
        for (key, value) in lines {
            b.push(*key, value);
        }
        b.build()
    }

    #[test]
    fn zero_tip_is_an_empty_state() {
        let repo = MemoryRepository::new("p");
        let state = parse_change(CHANGE, &repo, ObjectId::ZERO, &codec()).expect("parse");
        assert_eq!(state, ChangeNotesState::empty(CHANGE));
    }

    #[test]
    fn owner_and_creation_come_from_the_root() {
        let repo = MemoryRepository::new("p");
        let tip = write_history(
            &repo,
            &[
                (Some(OWNER), root_message()),
                (Some(ALICE), update(&[(FooterKey::Subject, "Renamed".to_string())])),
            ],
        );
        let state = parse_change(CHANGE, &repo, tip, &codec()).expect("parse");
        let columns = state.columns.as_ref().expect("exists");
        assert_eq!(columns.owner, OWNER);
        assert_eq!(columns.created_on, at(0));
        assert_eq!(columns.last_updated_on, at(1));
        assert_eq!(columns.subject, "Renamed");
        assert_eq!(columns.original_subject, "Add feature");
        assert_eq!(columns.current_patch_set, Some(PatchSetId::new(1)));
        assert_eq!(state.patch_sets[&PatchSetId::new(1)].uploader, OWNER);
        assert_eq!(state.meta_id, tip);
    }

    #[test]
    fn removed_reviewer_is_pruned_with_votes() {
        let repo = MemoryRepository::new("p");
        let codec = codec();
        let alice = codec.format_footer(ALICE);
        let tip = write_history(
            &repo,
            &[
                (Some(OWNER), root_message()),
                (
                    Some(ALICE),
                    update(&[
                        (FooterKey::Reviewer, alice.clone()),
                        (FooterKey::Label, "Code-Review=+1".to_string()),
                    ]),
                ),
                (None, update(&[(FooterKey::Cc, alice.clone())])),
                (None, update(&[(FooterKey::Removed, alice)])),
            ],
        );
        let state = parse_change(CHANGE, &repo, tip, &codec).expect("parse");
        assert!(state.reviewers.state_of(ALICE).is_none());
        assert!(state.approvals.values().all(|a| a.account != ALICE));
        assert_eq!(state.all_past_reviewers, vec![ALICE]);
    }

    #[test]
    fn label_removal_hides_older_votes() {
        let repo = MemoryRepository::new("p");
        let tip = write_history(
            &repo,
            &[
                (Some(OWNER), root_message()),
                (Some(ALICE), update(&[(FooterKey::Label, "Verified=+1".to_string())])),
                (Some(ALICE), update(&[(FooterKey::Label, "-Verified".to_string())])),
                (Some(ALICE), update(&[(FooterKey::Label, "Code-Review=-1".to_string())])),
            ],
        );
        let state = parse_change(CHANGE, &repo, tip, &codec()).expect("parse");
        let labels: Vec<_> = state.approvals.values().map(|a| (a.label.as_str(), a.value)).collect();
        assert_eq!(labels, [("Code-Review", -1)]);
    }

    #[test]
    fn zero_vote_is_kept_and_shadows_older_votes() {
        let repo = MemoryRepository::new("p");
        let tip = write_history(
            &repo,
            &[
                (Some(OWNER), root_message()),
                (Some(ALICE), update(&[(FooterKey::Label, "Code-Review=+2".to_string())])),
                (Some(ALICE), update(&[(FooterKey::Label, "Code-Review=0".to_string())])),
            ],
        );
        let state = parse_change(CHANGE, &repo, tip, &codec()).expect("parse");
        let key = (PatchSetId::new(1), ALICE, "Code-Review".to_string());
        let vote = state.approvals.get(&key).expect("zero vote kept");
        assert_eq!(vote.value, 0);
        assert_eq!(state.approvals.len(), 1);
    }

    #[test]
    fn deleted_patch_set_is_dropped() {
        let repo = MemoryRepository::new("p");
        let mut ps2 = MessageBuilder::new("Upload patch set 2");
        ps2.push(FooterKey::PatchSet, "2");
        ps2.push(FooterKey::Commit, "bb".repeat(20));
        let mut del = MessageBuilder::new("Delete patch set 2");
        del.push(FooterKey::PatchSet, "2 (deleted)");
        let mut vote = MessageBuilder::new("Update patch set 2").body(Some("Looks wrong"));
        vote.push(FooterKey::PatchSet, "2");
        vote.push(FooterKey::Label, "Verified=-1");

        let tip = write_history(
            &repo,
            &[
                (Some(OWNER), root_message()),
                (Some(OWNER), ps2.build()),
                (Some(ALICE), vote.build()),
                (Some(OWNER), del.build()),
            ],
        );
        let state = parse_change(CHANGE, &repo, tip, &codec()).expect("parse");
        assert_eq!(state.patch_sets.keys().copied().collect::<Vec<_>>(), [PatchSetId::new(1)]);
        assert!(state.approvals.is_empty());
        assert!(state.messages.is_empty());
        assert_eq!(
            state.columns.expect("exists").current_patch_set,
            Some(PatchSetId::new(1))
        );
    }

    #[test]
    fn submit_records_come_from_newest_commit_only() {
        let repo = MemoryRepository::new("p");
        let tip = write_history(
            &repo,
            &[
                (Some(OWNER), root_message()),
                (None, update(&[(FooterKey::SubmittedWith, "NOT_READY".to_string())])),
                (
                    None,
                    update(&[
                        (FooterKey::SubmittedWith, "OK".to_string()),
                        (FooterKey::SubmittedWith, "OK: Code-Review".to_string()),
                    ]),
                ),
            ],
        );
        let state = parse_change(CHANGE, &repo, tip, &codec()).expect("parse");
        assert_eq!(state.submit_records.len(), 1);
        assert_eq!(state.submit_records[0].labels.len(), 1);
    }

    #[test]
    fn messages_are_chronological() {
        let repo = MemoryRepository::new("p");
        let msg = |text: &str| {
            let mut b = MessageBuilder::new("Update patch set 1").body(Some(text));
            b.push(FooterKey::PatchSet, "1");
            b.build()
        };
        let tip = write_history(
            &repo,
            &[(Some(OWNER), root_message()), (Some(ALICE), msg("first")), (Some(OWNER), msg("second"))],
        );
        let state = parse_change(CHANGE, &repo, tip, &codec()).expect("parse");
        let texts: Vec<_> = state.messages.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(texts, ["first", "second"]);
        assert_eq!(state.messages[0].author, Some(ALICE));
    }

    #[test]
    fn missing_mandatory_footer_fails() {
        let repo = MemoryRepository::new("p");
        let mut b = MessageBuilder::new("Create change");
        b.push(FooterKey::PatchSet, "1");
        b.push(FooterKey::Subject, "s");
        b.push(FooterKey::ChangeId, "I1");
        let tip = write_history(&repo, &[(Some(OWNER), b.build())]);
        let err = parse_change(CHANGE, &repo, tip, &codec()).expect_err("must fail");
        assert!(matches!(err, NotesError::MissingFooter { field: "Branch", .. }));
    }

    #[test]
    fn malformed_footer_anywhere_fails_the_read() {
        let repo = MemoryRepository::new("p");
        let tip = write_history(
            &repo,
            &[
                (Some(OWNER), root_message()),
                (Some(ALICE), update(&[(FooterKey::Status, "exploded".to_string())])),
            ],
        );
        let err = parse_change(CHANGE, &repo, tip, &codec()).expect_err("must fail");
        assert!(err.is_format());
    }
}
