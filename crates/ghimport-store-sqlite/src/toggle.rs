//! Foreign-key relaxation around bulk-import transactions.
//!
//! SQLite cannot drop a constraint in place, so relaxing means deferring
//! every foreign-key check to commit time. Restoring re-checks the guarded
//! tables explicitly and fails if a row still dangles; the caller then drops
//! the transaction, which rolls it back.

use ghimport_core::EntityKind;
use rusqlite::Connection;

#[derive(Debug, thiserror::Error)]
pub enum ToggleError {
    #[error("failed to toggle foreign-key enforcement: {0}")]
    Pragma(#[from] rusqlite::Error),
    #[error("{count} dangling foreign-key reference(s) in {table}")]
    Violations { table: &'static str, count: usize },
}

/// Child tables whose foreign keys may point at rows that arrive later in
/// the same import.
#[must_use]
pub fn guarded_tables(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Users => &["gh_users"],
        EntityKind::OrgMembers => &["gh_users_organizations"],
        EntityKind::Repos => &["gh_repositories"],
        EntityKind::RepoCollaborators => &["users_repositories"],
    }
}

/// Proof that constraints are relaxed on a connection; consumed by [`restore`].
#[derive(Debug)]
#[must_use = "relaxed constraints must be restored before commit"]
pub struct RelaxedConstraints {
    tables: &'static [&'static str],
}

/// Defer foreign-key checks until the end of the open transaction.
///
/// # Errors
/// Returns an error when the pragma cannot be applied.
pub fn relax(conn: &Connection, kind: EntityKind) -> Result<RelaxedConstraints, ToggleError> {
    conn.execute_batch("PRAGMA defer_foreign_keys = ON;")?;
    Ok(RelaxedConstraints { tables: guarded_tables(kind) })
}

/// Verify the guarded tables and switch immediate enforcement back on.
///
/// # Errors
/// Returns [`ToggleError::Violations`] when a guarded row references a
/// missing parent, or a pragma error.
pub fn restore(conn: &Connection, relaxed: RelaxedConstraints) -> Result<(), ToggleError> {
    for &table in relaxed.tables {
        let count = foreign_key_violations(conn, table)?;
        if count > 0 {
            return Err(ToggleError::Violations { table, count });
        }
    }
    conn.execute_batch("PRAGMA defer_foreign_keys = OFF;")?;
    Ok(())
}

fn foreign_key_violations(conn: &Connection, table: &str) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_check({table})"))?;
    let mut rows = stmt.query([])?;
    let mut count = 0;
    while rows.next()?.is_some() {
        count += 1;
    }
    Ok(count)
}
