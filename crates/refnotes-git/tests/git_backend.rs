use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use refnotes_core::config::NotesConfig;
use refnotes_core::model::{AccountId, ChangeId, ChangeStatus, Comment, CommentKey, PatchSetId};
use refnotes_core::notes::{ChangeNotesLoader, parse_change};
use refnotes_core::note::IdentityCodec;
use refnotes_core::repo::{
    CommitData, ObjectId, ObjectInserter, ObjectKind, PersonIdent, RefUpdate, RefUpdateOutcome,
    RepoManager, Repository, Tree, refs,
};
use refnotes_core::sequence::{self, RepoSequence};
use refnotes_core::update::{BatchUpdateManager, ChangeUpdate, DraftUpdate};
use refnotes_git::GitRepoManager;

const CHANGE: ChangeId = ChangeId::new(42);
const ALICE: AccountId = AccountId::new(1000);

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + secs, 0).expect("ts")
}

fn revision() -> ObjectId {
    ObjectId::from_bytes([0x5a; 20])
}

fn commit_with(repo: &dyn Repository, inserter: &mut ObjectInserter, parent: Option<ObjectId>, msg: &str) -> ObjectId {
    let blob = inserter.insert_blob(repo, msg.as_bytes().to_vec());
    let mut tree = Tree::new();
    tree.insert("note", blob);
    let tree = inserter.insert_tree(repo, &tree);
    let who = PersonIdent::new("Alice", "1000@server", ts(0));
    inserter.insert_commit(
        repo,
        &CommitData {
            tree,
            parents: parent.into_iter().collect(),
            author: who.clone(),
            committer: who,
            message: format!("{msg}\n"),
        },
    )
}

// ---------------------------------------------------------------------------
// Raw backend behaviour
// ---------------------------------------------------------------------------

#[test]
fn objects_written_by_core_are_valid_git_objects() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = GitRepoManager::new(dir.path());
    let repo = manager.create("proj")?;

    let mut inserter = ObjectInserter::new();
    let id = commit_with(repo.as_ref(), &mut inserter, None, "first");
    assert_eq!(inserter.len(), 3);
    inserter.flush(repo.as_ref())?;

    let git = git2::Repository::open_bare(manager.path_of("proj"))?;
    let commit = git.find_commit(git2::Oid::from_bytes(id.as_bytes())?)?;
    assert_eq!(commit.message(), Some("first\n"));
    assert_eq!(commit.author().email(), Some("1000@server"));
    assert_eq!(commit.tree()?.len(), 1);

    let (kind, bytes) = repo.read_object(id)?;
    assert_eq!(kind, ObjectKind::Commit);
    assert_eq!(bytes, git.odb()?.read(commit.id())?.data());
    Ok(())
}

#[test]
fn compare_and_swap_leaves_ref_untouched_on_mismatch() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let manager = GitRepoManager::new(dir.path());
    let repo = manager.create("proj")?;
    let name = refs::change_meta_ref(CHANGE);

    let mut inserter = ObjectInserter::new();
    let first = commit_with(repo.as_ref(), &mut inserter, None, "first");
    let second = commit_with(repo.as_ref(), &mut inserter, Some(first), "second");
    inserter.flush(repo.as_ref())?;

    let created = repo.update_refs(&[RefUpdate::new(&name, ObjectId::ZERO, first)])?;
    assert_eq!(created, vec![RefUpdateOutcome::Ok]);

    // Stale expectation: the ref is at `first`, not absent.
    let other = refs::change_meta_ref(ChangeId::new(43));
    let outcomes = repo.update_refs(&[
        RefUpdate::new(&other, ObjectId::ZERO, first),
        RefUpdate::new(&name, ObjectId::ZERO, second),
    ])?;
    assert_eq!(outcomes, vec![RefUpdateOutcome::Aborted, RefUpdateOutcome::LockFailure]);
    assert_eq!(repo.read_ref(&name)?, Some(first));
    assert_eq!(repo.read_ref(&other)?, None);

    let advanced = repo.update_refs(&[RefUpdate::new(&name, first, second)])?;
    assert!(advanced.iter().all(RefUpdateOutcome::is_ok));
    assert_eq!(repo.read_ref(&name)?, Some(second));
    Ok(())
}

#[test]
fn missing_target_object_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let repo = GitRepoManager::new(dir.path()).create("proj")?;
    let ghost = ObjectId::from_bytes([7; 20]);
    let outcomes = repo.update_refs(&[RefUpdate::new("refs/changes/01/1/meta", ObjectId::ZERO, ghost)])?;
    assert!(matches!(outcomes[0], RefUpdateOutcome::Rejected(_)));
    assert_eq!(repo.read_ref("refs/changes/01/1/meta")?, None);
    Ok(())
}

#[test]
fn scan_and_delete() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let repo = GitRepoManager::new(dir.path()).create("All-Users")?;
    let mut inserter = ObjectInserter::new();
    let id = commit_with(repo.as_ref(), &mut inserter, None, "draft");
    inserter.flush(repo.as_ref())?;

    let mine = refs::draft_comments_ref(CHANGE, ALICE);
    let theirs = refs::draft_comments_ref(CHANGE, AccountId::new(1001));
    let elsewhere = refs::draft_comments_ref(ChangeId::new(7), ALICE);
    repo.update_refs(&[
        RefUpdate::new(&mine, ObjectId::ZERO, id),
        RefUpdate::new(&theirs, ObjectId::ZERO, id),
        RefUpdate::new(&elsewhere, ObjectId::ZERO, id),
    ])?;

    let found = repo.scan_refs(&refs::draft_comments_prefix(CHANGE))?;
    assert_eq!(found.len(), 2);
    assert!(found.contains_key(&mine));

    repo.update_refs(&[RefUpdate::new(&mine, id, ObjectId::ZERO)])?;
    let found = repo.scan_refs(&refs::draft_comments_prefix(CHANGE))?;
    assert_eq!(found.keys().collect::<Vec<_>>(), vec![&theirs]);
    Ok(())
}

// ---------------------------------------------------------------------------
// Engine on top of git
// ---------------------------------------------------------------------------

fn key(uuid: &str) -> CommentKey {
    CommentKey {
        patch_set: PatchSetId::new(1),
        filename: "src/lib.rs".to_string(),
        uuid: uuid.to_string(),
    }
}

#[test]
fn update_pipeline_round_trips_through_git() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = NotesConfig::default();
    let repos: Arc<GitRepoManager> = Arc::new(GitRepoManager::new(dir.path()));
    let changes = repos.create("proj")?;
    let drafts = repos.create(&config.repos.all_users)?;

    let mut create = ChangeUpdate::new(CHANGE, PatchSetId::new(1), Some(ALICE), ts(0));
    create.set_change_key("I0123456789abcdef0123456789abcdef01234567");
    create.set_branch("refs/heads/main");
    create.set_subject("Add the thing");
    create.set_commit(revision());
    create.put_approval("Code-Review", 1);
    let mut manager = BatchUpdateManager::new(&config, changes.clone(), drafts.clone());
    manager.add_change_update(create);
    let mut draft = DraftUpdate::new(CHANGE, ALICE, ts(5));
    draft.put_comment(Comment::new(key("d1"), ALICE, ts(5), "draft", revision()).with_line(3));
    manager.add_draft_update(draft);
    manager.execute()?;

    // The draft moves to the change when published.
    let mut publish = ChangeUpdate::new(CHANGE, PatchSetId::new(1), Some(ALICE), ts(10));
    publish.set_change_message("Patch Set 1: Code-Review+1\n\n(1 comment)");
    publish.put_comment(Comment::new(key("d1"), ALICE, ts(10), "draft", revision()).with_line(3));
    publish.set_status(ChangeStatus::Merged);
    let mut manager = BatchUpdateManager::new(&config, changes.clone(), drafts.clone());
    manager.add_change_update(publish);
    let staged = manager.execute()?;
    assert_eq!(staged.change_commands.len(), 1);
    assert_eq!(staged.draft_commands.len(), 1);
    assert!(staged.draft_commands[0].is_delete());

    let tip = changes.read_ref(&refs::change_meta_ref(CHANGE))?.expect("meta ref");
    let state = parse_change(CHANGE, changes.as_ref(), tip, &IdentityCodec::new(&config.identity))?;
    let columns = state.columns.as_ref().expect("columns");
    assert_eq!(columns.subject, "Add the thing");
    assert_eq!(columns.status, ChangeStatus::Merged);
    assert_eq!(state.patch_sets.len(), 1);
    assert_eq!(state.approvals.len(), 1);
    assert_eq!(state.messages.len(), 1);
    assert_eq!(state.comments.get(&revision()).map(Vec::len), Some(1));
    assert_eq!(drafts.read_ref(&refs::draft_comments_ref(CHANGE, ALICE))?, None);

    // The meta ref is ordinary git history.
    let git = git2::Repository::open_bare(repos.path_of("proj"))?;
    let head = git.find_commit(git2::Oid::from_bytes(tip.as_bytes())?)?;
    assert_eq!(head.parent_count(), 1);
    assert!(head.message().unwrap_or_default().contains("Status: merged"));

    let loader = ChangeNotesLoader::new(repos, &config);
    let loaded = loader.load("proj", CHANGE)?;
    assert_eq!(*loaded, state);
    Ok(())
}

#[test]
fn sequence_on_git_hands_out_distinct_ids() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = NotesConfig::default();
    let repo = GitRepoManager::new(dir.path()).create(&config.repos.all_projects)?;
    let seq = Arc::new(RepoSequence::new(&config.sequence, repo.clone(), sequence::CHANGES));

    let mut ids: Vec<u64> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = Arc::clone(&seq);
                scope.spawn(move || (0..25).map(|_| seq.next().expect("next")).collect::<Vec<_>>())
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().expect("join")).collect()
    });
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 100);

    let stored = repo.read_ref(seq.ref_name())?.expect("sequence ref");
    let value = String::from_utf8(repo.read_blob(stored)?)?;
    assert!(value.trim().parse::<u64>()? > *ids.last().expect("ids"));
    Ok(())
}
