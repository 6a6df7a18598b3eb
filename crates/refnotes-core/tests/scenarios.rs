use std::sync::{Arc, Once};

use chrono::{DateTime, Duration, Utc};
use refnotes_core::config::{NotesConfig, RewriteConfig};
use refnotes_core::db::{RelationalStore, SqliteStore};
use refnotes_core::model::{
    AccountId, Change, ChangeId, Comment, CommentKey, PatchSet, PatchSetApproval, PatchSetId,
    ReviewerState,
};
use refnotes_core::note::{IdentityCodec, RevisionNoteMap};
use refnotes_core::notes::{ChangeNotesState, parse_change};
use refnotes_core::rebuild::ChangeRebuilder;
use refnotes_core::repo::{
    CommitData, CommitWalk, MemoryRepoManager, MemoryRepository, ObjectId, Repository, refs,
};
use refnotes_core::sequence::{self, RepoSequence};
use refnotes_core::update::{BatchUpdateManager, ChangeUpdate, DeleteCommentRewriter};
use refnotes_core::{ErrorCode, NotesError};

const PROJECT: &str = "platform/tools";
const ALICE: AccountId = AccountId::new(1000);
const BOB: AccountId = AccountId::new(1001);
const CAROL: AccountId = AccountId::new(1002);

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

fn ts(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(1_700_000_000_000 + millis).expect("ts")
}

fn revision(n: u8) -> ObjectId {
    ObjectId::from_bytes([n; 20])
}

/// Oldest first.
fn history(repo: &dyn Repository, tip: ObjectId) -> Vec<(ObjectId, CommitData)> {
    let mut commits: Vec<_> = CommitWalk::new(repo, tip).map(|step| step.expect("walk")).collect();
    commits.reverse();
    commits
}

fn meta_tip(repo: &dyn Repository, change: ChangeId) -> ObjectId {
    repo.read_ref(&refs::change_meta_ref(change))
        .expect("read ref")
        .expect("meta ref exists")
}

fn read_state(config: &NotesConfig, repo: &dyn Repository, change: ChangeId) -> ChangeNotesState {
    let codec = IdentityCodec::new(&config.identity);
    parse_change(change, repo, meta_tip(repo, change), &codec).expect("parse")
}

// ---------------------------------------------------------------------------
// Rebuilding relational rows
// ---------------------------------------------------------------------------

struct Relational {
    config: NotesConfig,
    repos: Arc<MemoryRepoManager>,
    store: Arc<SqliteStore>,
}

impl Relational {
    fn new() -> Self {
        init_tracing();
        Self {
            config: NotesConfig::default(),
            repos: Arc::new(MemoryRepoManager::new()),
            store: Arc::new(SqliteStore::open_in_memory().expect("store")),
        }
    }

    fn seed(&self, change: ChangeId, uploaded: DateTime<Utc>) {
        let mut row = Change::new(change, PROJECT, "I0123abcd", ALICE, "main", "Fix the frobnicator", uploaded);
        row.current_patch_set = Some(PatchSetId::new(1));
        self.store.insert_change(&row).expect("change");
        self.store
            .insert_patch_set(change, &PatchSet::new(PatchSetId::new(1), revision(1), ALICE, uploaded))
            .expect("patch set");
    }

    fn vote(&self, change: ChangeId, who: AccountId, value: i16, at: DateTime<Utc>) {
        self.store
            .insert_approval(change, &PatchSetApproval::new(PatchSetId::new(1), who, "Code-Review", value, at))
            .expect("approval");
    }

    fn rebuilder(&self) -> ChangeRebuilder {
        ChangeRebuilder::new(&self.config, self.repos.clone(), self.store.clone())
    }

    fn repo(&self) -> Arc<MemoryRepository> {
        self.repos.get(PROJECT).expect("project repo")
    }
}

#[test]
fn upload_and_own_vote_within_a_second_rebuild_into_one_commit() {
    let fx = Relational::new();
    let change = ChangeId::new(101);
    fx.seed(change, ts(0));
    fx.vote(change, ALICE, 1, ts(400));

    let result = fx.rebuilder().rebuild(change).expect("rebuild");
    assert_eq!(result.change_commands, 1);

    let repo = fx.repo();
    let commits = history(repo.as_ref(), meta_tip(repo.as_ref(), change));
    assert_eq!(commits.len(), 1);
    assert!(commits[0].1.message.contains("Label: Code-Review=+1"));

    let state = read_state(&fx.config, repo.as_ref(), change);
    assert_eq!(state.approvals.len(), 1);
    assert_eq!(state.patch_sets.len(), 1);
}

#[test]
fn votes_from_different_accounts_land_in_separate_commits() {
    let fx = Relational::new();
    let change = ChangeId::new(102);
    fx.seed(change, ts(0));
    fx.vote(change, BOB, 2, ts(300));
    fx.vote(change, CAROL, -1, ts(600));

    fx.rebuilder().rebuild(change).expect("rebuild");

    let repo = fx.repo();
    let commits = history(repo.as_ref(), meta_tip(repo.as_ref(), change));
    assert_eq!(commits.len(), 3);
    let authors: Vec<&str> = commits.iter().map(|(_, c)| c.author.email.as_str()).collect();
    assert_ne!(authors[1], authors[2]);
    assert!(commits.iter().all(|(_, c)| c.parents.len() <= 1));

    let state = read_state(&fx.config, repo.as_ref(), change);
    let votes: Vec<i16> = state.approvals.values().map(|a| a.value).collect();
    assert_eq!(votes, vec![2, -1]);
}

#[test]
fn rebuilt_change_records_its_refs_in_the_row() {
    let fx = Relational::new();
    let change = ChangeId::new(103);
    fx.seed(change, ts(0));
    let rebuilder = fx.rebuilder();
    rebuilder.rebuild(change).expect("rebuild");

    assert!(!rebuilder.is_stale(change).expect("stale check"));
    let tip = meta_tip(fx.repo().as_ref(), change);
    let row = fx.store.change(change).expect("read").expect("row");
    assert_eq!(row.note_db_state, Some(tip.to_hex()));

    // A second rebuild of unchanged rows writes nothing.
    let before = fx.repo().ref_transactions();
    let again = rebuilder.rebuild(change).expect("rebuild again");
    assert_eq!(again.change_commands, 0);
    assert_eq!(fx.repo().ref_transactions(), before);
}

// ---------------------------------------------------------------------------
// Writing through the update pipeline
// ---------------------------------------------------------------------------

struct Pipeline {
    config: NotesConfig,
    changes: Arc<MemoryRepository>,
    drafts: Arc<MemoryRepository>,
}

impl Pipeline {
    fn new() -> Self {
        init_tracing();
        Self {
            config: NotesConfig::default(),
            changes: Arc::new(MemoryRepository::new(PROJECT)),
            drafts: Arc::new(MemoryRepository::new("All-Users")),
        }
    }

    fn manager(&self) -> BatchUpdateManager {
        BatchUpdateManager::new(&self.config, self.changes.clone(), self.drafts.clone())
    }

    fn write(&self, update: ChangeUpdate) -> Result<(), NotesError> {
        let mut manager = self.manager();
        manager.add_change_update(update);
        manager.execute().map(|_| ())
    }

    fn create(&self, change: ChangeId) {
        let mut update = ChangeUpdate::new(change, PatchSetId::new(1), Some(ALICE), ts(0));
        update.set_change_key("I0123abcd");
        update.set_branch("refs/heads/main");
        update.set_subject("Fix the frobnicator");
        update.set_commit(revision(1));
        self.write(update).expect("create");
    }
}

fn comment_key(uuid: &str) -> CommentKey {
    CommentKey {
        patch_set: PatchSetId::new(1),
        filename: "src/frob.rs".to_string(),
        uuid: uuid.to_string(),
    }
}

#[test]
fn rewriting_a_comment_keeps_older_history_intact() {
    let mut fx = Pipeline::new();
    fx.config.rewrite = RewriteConfig {
        allow_comment_rewrite: true,
    };
    let change = ChangeId::new(201);
    fx.create(change);

    let mut publish = ChangeUpdate::new(change, PatchSetId::new(1), Some(BOB), ts(60_000));
    publish.set_change_message("Patch Set 1:\n\n(1 comment)");
    publish.put_comment(Comment::new(comment_key("c1"), BOB, ts(60_000), "something private", revision(1)).with_line(12));
    fx.write(publish).expect("publish");

    let mut later = ChangeUpdate::new(change, PatchSetId::new(1), Some(CAROL), ts(120_000));
    later.set_change_message("Looks fine otherwise");
    fx.write(later).expect("later");

    let before = history(fx.changes.as_ref(), meta_tip(fx.changes.as_ref(), change));
    assert_eq!(before.len(), 3);

    let replacement = DeleteCommentRewriter::removal_message(CAROL, Some("leaked credentials"));
    let rewriter = DeleteCommentRewriter::new(&fx.config.rewrite, change, comment_key("c1"), replacement.clone())
        .expect("rewrite allowed");
    let mut manager = fx.manager();
    manager.add_rewrite(rewriter);
    manager.execute().expect("rewrite");

    let after = history(fx.changes.as_ref(), meta_tip(fx.changes.as_ref(), change));
    assert_eq!(after.len(), 3);
    assert_eq!(after[0], before[0], "commit before the comment is untouched");
    assert_ne!(after[1].0, before[1].0);
    assert_ne!(after[2].0, before[2].0);
    for (old, new) in before.iter().zip(&after) {
        assert_eq!(old.1.message, new.1.message);
        assert_eq!(old.1.author, new.1.author);
    }

    let codec = IdentityCodec::new(&fx.config.identity);
    let tip_tree = after[2].1.tree;
    let mut notes = RevisionNoteMap::load(change, fx.changes.as_ref(), tip_tree).expect("notes");
    let note = notes.note(fx.changes.as_ref(), &codec, revision(1)).expect("note");
    let comment = note.get(&comment_key("c1")).expect("comment still present");
    assert_eq!(comment.message, replacement);
    assert_eq!(comment.line, 12);
}

#[test]
fn rewrite_is_refused_unless_enabled() {
    let err = DeleteCommentRewriter::new(&RewriteConfig::default(), ChangeId::new(1), comment_key("c1"), "x")
        .expect_err("disabled by default");
    assert_eq!(err.code(), ErrorCode::RewriteDisabled);
}

#[test]
fn racing_writers_cannot_both_advance_a_ref() {
    let fx = Pipeline::new();
    let change = ChangeId::new(202);
    fx.create(change);
    let tip = meta_tip(fx.changes.as_ref(), change);

    let mut first = fx.manager();
    let mut vote = ChangeUpdate::new(change, PatchSetId::new(1), Some(BOB), ts(1_000));
    vote.put_approval("Code-Review", 2);
    first.add_change_update(vote);
    first.stage().expect("stage first");

    let mut second = fx.manager();
    let mut other = ChangeUpdate::new(change, PatchSetId::new(1), Some(CAROL), ts(1_000));
    other.put_approval("Verified", 1);
    second.add_change_update(other);
    second.stage().expect("stage second");

    first.execute().expect("first wins");
    let winner = meta_tip(fx.changes.as_ref(), change);
    assert_ne!(winner, tip);

    let err = second.execute().expect_err("second loses");
    assert!(err.is_retryable());
    assert_eq!(err.code(), ErrorCode::RefLockFailure);
    assert_eq!(meta_tip(fx.changes.as_ref(), change), winner);

    let state = read_state(&fx.config, fx.changes.as_ref(), change);
    assert_eq!(state.approvals.len(), 1);
}

#[test]
fn removed_reviewers_drop_out_but_stay_in_history() {
    let fx = Pipeline::new();
    let change = ChangeId::new(203);
    fx.create(change);

    let mut add = ChangeUpdate::new(change, PatchSetId::new(1), Some(ALICE), ts(1_000));
    add.put_reviewer(BOB, ReviewerState::Reviewer);
    add.put_reviewer(CAROL, ReviewerState::Cc);
    fx.write(add).expect("add reviewers");

    let mut remove = ChangeUpdate::new(change, PatchSetId::new(1), Some(ALICE), ts(2_000));
    remove.remove_reviewer(BOB);
    fx.write(remove).expect("remove reviewer");

    let state = read_state(&fx.config, fx.changes.as_ref(), change);
    assert_eq!(state.reviewers.state_of(BOB), None);
    assert_eq!(state.reviewers.state_of(CAROL), Some(ReviewerState::Cc));
    assert_eq!(state.all_past_reviewers, vec![BOB, CAROL]);
}

#[test]
fn lease_blocks_ordinary_writers() {
    let fx = Pipeline::new();
    let change = ChangeId::new(204);
    fx.create(change);
    let tip = meta_tip(fx.changes.as_ref(), change);

    let mut row = Change::new(change, PROJECT, "I0123abcd", ALICE, "main", "s", ts(0));
    row.note_db_state = Some(format!("{tip}={}", (Utc::now() + Duration::minutes(5)).timestamp_millis()));

    let mut manager = fx.manager();
    manager.expect_token(&row).expect("token parses");
    let mut vote = ChangeUpdate::new(change, PatchSetId::new(1), Some(BOB), ts(1_000));
    vote.put_approval("Code-Review", 1);
    manager.add_change_update(vote);
    let err = manager.execute().expect_err("read-only");
    assert_eq!(err.code(), ErrorCode::ChangeReadOnly);
    assert_eq!(meta_tip(fx.changes.as_ref(), change), tip);
}

// ---------------------------------------------------------------------------
// Sequences
// ---------------------------------------------------------------------------

#[test]
fn thousand_ids_take_at_most_a_hundred_ref_updates() {
    init_tracing();
    let mut config = NotesConfig::default();
    config.sequence.batch_size = 10;
    let repo = Arc::new(MemoryRepository::new("All-Projects"));
    let seq = RepoSequence::new(&config.sequence, repo.clone(), sequence::CHANGES);

    let mut last = 0;
    for _ in 0..1000 {
        let id = seq.next().expect("next");
        assert!(id > last);
        last = id;
    }
    assert!(repo.ref_transactions() <= 100, "{} transactions", repo.ref_transactions());
}
