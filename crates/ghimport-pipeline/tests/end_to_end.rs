use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use bson::{doc, Document};
use ghimport_core::SnapshotOrder;
use ghimport_pipeline::{ImportError, ImportEvent, ImportOptions, Importer, RunSummary};
use ghimport_store_sqlite::{ConflictPolicy, ImportStrategy, SqliteStore};

fn entity_dir(root: &Path, name: &str) -> Result<PathBuf> {
    let dir = root.join(name);
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn encode(documents: &[Document]) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    for document in documents {
        bytes.extend(bson::to_vec(document)?);
    }
    Ok(bytes)
}

fn write_snapshot(dir: &Path, name: &str, documents: &[Document]) -> Result<()> {
    fs::write(dir.join(name), encode(documents)?)?;
    Ok(())
}

fn migrated_store() -> Result<SqliteStore> {
    let mut store = SqliteStore::open(Path::new(":memory:"))?;
    store.migrate()?;
    Ok(store)
}

fn import(
    store: &mut SqliteStore,
    options: ImportOptions,
    dirs: &[PathBuf],
) -> Result<(RunSummary, Vec<ImportEvent>)> {
    let mut events = Vec::new();
    let summary = Importer::new(store, options, &mut events).run(dirs)?;
    Ok((summary, events))
}

fn tool_repository(language: &str, updated_at: &str) -> Document {
    doc! {
        "id": 1_i64,
        "name": "tool",
        "language": language,
        "owner": { "login": "acme" },
        "updated_at": updated_at,
    }
}

fn write_tool_snapshots(repos: &Path) -> Result<()> {
    write_snapshot(repos, "2020-01-01.bson", &[tool_repository("", "2020-01-01T00:00:00Z")])?;
    write_snapshot(repos, "2020-02-01.bson", &[tool_repository("Go", "2020-02-01T00:00:00Z")])
}

// Test IDs: TIO-001
#[test]
fn newest_snapshot_wins_for_a_repository_seen_twice() -> Result<()> {
    let root = tempfile::tempdir()?;
    let repos = entity_dir(root.path(), "repos")?;
    write_tool_snapshots(&repos)?;

    let mut store = migrated_store()?;
    let (summary, _) = import(&mut store, ImportOptions::default(), &[repos])?;

    assert_eq!(summary.files_committed, 2);
    assert_eq!(summary.totals.inserted, 1);
    assert_eq!(summary.totals.unchanged, 1);
    let stored = store
        .repository(1)?
        .unwrap_or_else(|| panic!("repository 1 should have been imported"));
    assert_eq!(stored.primary_language, "Go");
    assert_eq!(stored.clone_path, "go/acme/tool");
    assert_eq!(stored.full_name, "acme/tool");
    assert_eq!(store.stats()?.repositories, 1);
    Ok(())
}

// Test IDs: TIO-002
#[test]
fn oldest_first_with_keep_first_retains_the_first_version() -> Result<()> {
    let root = tempfile::tempdir()?;
    let repos = entity_dir(root.path(), "repos")?;
    write_tool_snapshots(&repos)?;

    let mut store = migrated_store()?;
    let options = ImportOptions {
        order: SnapshotOrder::OldestFirst,
        conflict_policy: ConflictPolicy::KeepFirst,
        ..ImportOptions::default()
    };
    import(&mut store, options, &[repos])?;

    let stored = store
        .repository(1)?
        .unwrap_or_else(|| panic!("repository 1 should have been imported"));
    assert_eq!(stored.primary_language, "");
    assert_eq!(stored.clone_path, "unknown/acme/tool");
    Ok(())
}

// Test IDs: TIO-003
#[test]
fn collaboration_without_endpoints_is_rejected() -> Result<()> {
    let root = tempfile::tempdir()?;
    let collaborators = entity_dir(root.path(), "repo_collaborators")?;
    write_snapshot(
        &collaborators,
        "2020-01-01.bson",
        &[doc! { "login": "alice", "repo": "tool", "owner": "acme" }],
    )?;

    let mut store = migrated_store()?;
    let (summary, events) = import(&mut store, ImportOptions::default(), &[collaborators])?;

    assert_eq!(summary.files_committed, 1);
    assert_eq!(summary.totals.failed, 1);
    assert!(events.iter().any(|event| matches!(
        event,
        ImportEvent::RecordFailed { error, .. } if error.contains("not found")
    )));
    assert_eq!(store.stats()?.users_repositories, 0);
    Ok(())
}

// Test IDs: TIO-004
#[test]
fn relations_link_previously_imported_entities() -> Result<()> {
    let root = tempfile::tempdir()?;
    let users = entity_dir(root.path(), "users")?;
    let repos = entity_dir(root.path(), "repos")?;
    let members = entity_dir(root.path(), "org_members")?;
    let collaborators = entity_dir(root.path(), "repo_collaborators")?;
    write_snapshot(
        &users,
        "2020-01-01.bson",
        &[
            doc! { "id": 10_i64, "login": "alice", "type": "User", "name": "Alice" },
            doc! { "id": 20_i64, "login": "acme", "type": "Organization" },
        ],
    )?;
    write_snapshot(&repos, "2020-01-01.bson", &[tool_repository("Go", "2020-01-01T00:00:00Z")])?;
    write_snapshot(&members, "2020-01-01.bson", &[doc! { "login": "alice", "org": "acme" }])?;
    write_snapshot(
        &collaborators,
        "2020-01-01.bson",
        &[doc! { "login": "alice", "repo": "tool", "owner": "acme" }],
    )?;

    let mut store = migrated_store()?;
    let (summary, _) =
        import(&mut store, ImportOptions::default(), &[users, repos, members, collaborators])?;

    assert_eq!(summary.totals.failed, 0);
    let stats = store.stats()?;
    assert_eq!(stats.users, 1);
    assert_eq!(stats.gh_users, 1);
    assert_eq!(stats.gh_organizations, 1);
    assert_eq!(stats.gh_users_organizations, 1);
    assert_eq!(stats.users_repositories, 1);
    assert!(store.integrity_check()?.foreign_key_violations.is_empty());
    Ok(())
}

// Test IDs: TIO-005
#[test]
fn reimporting_the_same_snapshots_changes_nothing() -> Result<()> {
    let root = tempfile::tempdir()?;
    let users = entity_dir(root.path(), "users")?;
    write_snapshot(
        &users,
        "2020-01-01.bson",
        &[
            doc! { "id": 1_i64, "login": "alice", "type": "User", "updated_at": "2020-01-01T00:00:00Z" },
            doc! { "id": 2_i64, "login": "bob", "type": "User", "updated_at": "2020-01-01T00:00:00Z" },
        ],
    )?;
    let dirs = vec![users];

    let mut store = migrated_store()?;
    let (first, _) = import(&mut store, ImportOptions::default(), &dirs)?;
    let after_first = store.stats()?;
    let (second, _) = import(&mut store, ImportOptions::default(), &dirs)?;

    assert_eq!(first.totals.inserted, 2);
    assert_eq!(second.totals.inserted, 0);
    assert_eq!(second.totals.updated, 0);
    assert_eq!(second.totals.unchanged, 2);
    assert_eq!(store.stats()?, after_first);
    Ok(())
}

// Test IDs: TIO-006
#[test]
fn malformed_file_names_are_skipped_and_reported() -> Result<()> {
    let root = tempfile::tempdir()?;
    let users = entity_dir(root.path(), "users")?;
    write_snapshot(&users, "2020-01-01.bson", &[doc! { "id": 1_i64, "login": "alice", "type": "User" }])?;
    fs::write(users.join("latest.bson"), b"not a snapshot")?;
    fs::write(users.join("README"), b"notes")?;

    let mut store = migrated_store()?;
    let (summary, events) = import(&mut store, ImportOptions::default(), &[users])?;

    assert_eq!(summary.files_committed, 1);
    assert_eq!(summary.snapshots_skipped, 2);
    assert_eq!(summary.directories[0].skipped, vec!["README".to_string(), "latest.bson".to_string()]);
    assert_eq!(
        events.iter().filter(|event| matches!(event, ImportEvent::SnapshotSkipped { .. })).count(),
        2
    );
    assert_eq!(store.stats()?.gh_users, 1);
    Ok(())
}

// Test IDs: TIO-007
#[test]
fn truncated_file_keeps_records_read_before_the_damage() -> Result<()> {
    let root = tempfile::tempdir()?;
    let users = entity_dir(root.path(), "users")?;
    let mut bytes = encode(&[
        doc! { "id": 1_i64, "login": "alice", "type": "User" },
        doc! { "id": 2_i64, "login": "bob", "type": "User" },
    ])?;
    let tail = bson::to_vec(&doc! { "id": 3_i64, "login": "carol", "type": "User" })?;
    bytes.extend_from_slice(&tail[..tail.len() / 2]);
    fs::write(users.join("2020-01-01.bson"), bytes)?;

    let mut store = migrated_store()?;
    let (summary, events) = import(&mut store, ImportOptions::default(), &[users])?;

    assert_eq!(summary.files_committed, 1);
    assert_eq!(summary.totals.read, 2);
    assert_eq!(summary.totals.inserted, 2);
    assert_eq!(summary.totals.failed, 1);
    assert!(events.iter().any(|event| matches!(event, ImportEvent::RecordFailed { index: 3, .. })));
    assert_eq!(store.stats()?.gh_users, 2);
    Ok(())
}

// Test IDs: TIO-008
#[test]
fn staging_requires_promotion_before_the_next_run() -> Result<()> {
    let root = tempfile::tempdir()?;
    let repos = entity_dir(root.path(), "repos")?;
    write_tool_snapshots(&repos)?;
    let dirs = vec![repos];
    let options = ImportOptions { strategy: ImportStrategy::Staging, ..ImportOptions::default() };

    let mut store = migrated_store()?;
    let (summary, _) = import(&mut store, options, &dirs)?;
    assert_eq!(summary.totals.staged, 2);
    assert_eq!(store.stats()?.repositories, 0);

    let blocked = Importer::new(&mut store, options, Vec::new()).run(&dirs);
    assert!(matches!(blocked, Err(ImportError::StagingNotEmpty { count: 2 })));

    let promotion = store.promote_staged_repositories()?;
    assert_eq!(promotion.staged, 2);
    assert_eq!(promotion.promoted, 1);
    assert_eq!(promotion.superseded, 1);
    assert_eq!(store.staged_repository_count()?, 0);

    let stored = store
        .repository(1)?
        .unwrap_or_else(|| panic!("repository 1 should have been promoted"));
    assert_eq!(stored.clone_path, "go/acme/tool");
    Ok(())
}

// Test IDs: TIO-009
#[test]
fn in_place_strategy_imports_relations_with_constraints_enforced() -> Result<()> {
    let root = tempfile::tempdir()?;
    let users = entity_dir(root.path(), "users")?;
    let members = entity_dir(root.path(), "org_members")?;
    write_snapshot(
        &users,
        "2020-01-01.bson",
        &[
            doc! { "id": 10_i64, "login": "alice", "type": "User" },
            doc! { "id": 20_i64, "login": "acme", "type": "Organization" },
        ],
    )?;
    write_snapshot(
        &members,
        "2020-01-01.bson",
        &[doc! { "login": "alice", "org": "acme" }, doc! { "login": "mallory", "org": "acme" }],
    )?;

    let mut store = migrated_store()?;
    let options = ImportOptions { strategy: ImportStrategy::InPlace, ..ImportOptions::default() };
    let (summary, _) = import(&mut store, options, &[users, members])?;

    assert_eq!(summary.totals.inserted, 3);
    assert_eq!(summary.totals.failed, 1);
    assert_eq!(store.stats()?.gh_users_organizations, 1);
    Ok(())
}

// Test IDs: TIO-010
#[test]
fn oldest_first_with_keep_newest_still_ends_on_the_later_version() -> Result<()> {
    let root = tempfile::tempdir()?;
    let repos = entity_dir(root.path(), "repos")?;
    write_tool_snapshots(&repos)?;

    let mut store = migrated_store()?;
    let options = ImportOptions { order: SnapshotOrder::OldestFirst, ..ImportOptions::default() };
    let (summary, _) = import(&mut store, options, &[repos])?;

    assert_eq!(summary.totals.inserted, 1);
    assert_eq!(summary.totals.updated, 1);
    let stored = store
        .repository(1)?
        .unwrap_or_else(|| panic!("repository 1 should have been imported"));
    assert_eq!(stored.primary_language, "Go");
    assert_eq!(stored.clone_path, "go/acme/tool");
    assert_eq!(store.stats()?.repositories, 1);
    Ok(())
}

// Test IDs: TIO-011
#[test]
fn account_that_changes_kind_keeps_a_single_identity_row() -> Result<()> {
    let root = tempfile::tempdir()?;
    let users = entity_dir(root.path(), "users")?;
    write_snapshot(
        &users,
        "2020-01-01.bson",
        &[doc! { "id": 5_i64, "login": "acme", "type": "User", "updated_at": "2020-01-01T00:00:00Z" }],
    )?;
    write_snapshot(
        &users,
        "2020-02-01.bson",
        &[doc! { "id": 5_i64, "login": "acme", "type": "Organization", "updated_at": "2020-02-01T00:00:00Z" }],
    )?;

    let mut store = migrated_store()?;
    let (summary, events) = import(&mut store, ImportOptions::default(), &[users])?;

    assert_eq!(summary.files_committed, 2);
    assert_eq!(summary.totals.inserted, 1);
    assert_eq!(summary.totals.kind_changes, 1);
    let stats = store.stats()?;
    assert_eq!(stats.gh_users + stats.gh_organizations, 1);
    assert_eq!(stats.gh_organizations, 1);
    assert!(events.iter().any(|event| matches!(
        event,
        ImportEvent::KindChanged { message, .. } if message.contains("stored as Organization")
    )));
    Ok(())
}

// Test IDs: TIO-012
#[test]
fn staging_precondition_is_checked_once_per_run() -> Result<()> {
    let root = tempfile::tempdir()?;
    let first = entity_dir(&root.path().join("a"), "repos")?;
    let second = entity_dir(&root.path().join("b"), "repos")?;
    write_snapshot(&first, "2020-01-01.bson", &[tool_repository("Go", "2020-01-01T00:00:00Z")])?;
    write_snapshot(
        &second,
        "2020-01-01.bson",
        &[doc! { "id": 2_i64, "name": "lib", "language": "Rust", "owner": { "login": "acme" } }],
    )?;

    let mut store = migrated_store()?;
    let options = ImportOptions { strategy: ImportStrategy::Staging, ..ImportOptions::default() };
    let (summary, _) = import(&mut store, options, &[first, second])?;

    assert_eq!(summary.files_committed, 2);
    assert_eq!(summary.totals.staged, 2);
    assert_eq!(store.staged_repository_count()?, 2);
    Ok(())
}

// Test IDs: TIO-013
#[test]
fn file_that_fails_its_constraint_check_is_rolled_back_and_the_run_continues() -> Result<()> {
    let root = tempfile::tempdir()?;
    let users = entity_dir(root.path(), "users")?;
    let repos = entity_dir(root.path(), "repos")?;
    write_snapshot(
        &users,
        "2020-01-01.bson",
        &[
            doc! { "id": 1_i64, "login": "alice", "type": "User" },
            doc! { "id": 2_i64, "login": "acme", "type": "Organization" },
        ],
    )?;
    write_snapshot(&repos, "2020-01-01.bson", &[tool_repository("Go", "2020-01-01T00:00:00Z")])?;

    let mut store = migrated_store()?;
    store.connection().execute_batch(
        "PRAGMA foreign_keys = OFF;
         INSERT INTO gh_users(user_id, github_id, login) VALUES (999, 900, 'ghost');
         PRAGMA foreign_keys = ON;",
    )?;
    let (summary, events) = import(&mut store, ImportOptions::default(), &[users, repos])?;

    assert_eq!(summary.files_failed, 1);
    assert_eq!(summary.files_committed, 1);
    assert_eq!(summary.directories[0].failed.len(), 1);
    assert!(summary.directories[0].failed[0].error.contains("dangling"));
    assert_eq!(summary.directories[1].committed.len(), 1);
    assert!(events.iter().any(|event| matches!(event, ImportEvent::FileFailed { .. })));

    let stats = store.stats()?;
    assert_eq!(stats.users, 0);
    assert_eq!(stats.gh_users, 1);
    assert_eq!(stats.gh_organizations, 0);
    assert_eq!(stats.repositories, 1);
    Ok(())
}
