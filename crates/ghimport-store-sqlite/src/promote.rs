//! Deduplication and promotion of staged repositories.

use std::collections::HashSet;

use anyhow::{Context, Result};
use ghimport_core::EntityKind;
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use crate::toggle::{relax, restore};
use crate::SqliteStore;

/// Staged rows whose identity is not already stored, ranked inside each clone
/// path. NULL timestamps and counts rank last.
const RANKED_CANDIDATES_SQL: &str = r"
WITH candidates AS (
  SELECT s.rowid AS staged_rowid, s.*
  FROM tmp_gh_repositories s
  WHERE NOT EXISTS (SELECT 1 FROM gh_repositories g WHERE g.github_id = s.github_id)
    AND NOT EXISTS (
      SELECT 1 FROM repositories r
      WHERE r.clone_path = s.clone_path AND r.primary_language IS s.primary_language
    )
),
ranked AS (
  SELECT c.*, ROW_NUMBER() OVER (
    PARTITION BY c.clone_path
    ORDER BY c.updated_at DESC NULLS LAST,
             c.pushed_at DESC NULLS LAST,
             c.open_issues_count ASC NULLS LAST,
             c.github_id ASC,
             c.staged_rowid ASC
  ) AS winner_rank
  FROM candidates c
)
SELECT
  name, primary_language, clone_url, clone_path, vcs, full_name, description, homepage,
  fork, github_id, default_branch, master_branch, html_url, forks_count, open_issues_count,
  stargazers_count, subscribers_count, watchers_count, size_in_kb,
  created_at, updated_at, pushed_at
FROM ranked
WHERE winner_rank = 1
ORDER BY updated_at DESC NULLS LAST, clone_path ASC
";

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PromotionSummary {
    pub staged: i64,
    /// Staged rows whose github id or (clone path, language) already exist.
    pub already_present: i64,
    /// Staged rows that lost to a better row for the same clone path or github id.
    pub superseded: i64,
    pub promoted: i64,
}

struct StagedRepository {
    name: Option<String>,
    primary_language: Option<String>,
    clone_url: Option<String>,
    clone_path: Option<String>,
    vcs: Option<String>,
    full_name: Option<String>,
    description: Option<String>,
    homepage: Option<String>,
    fork: Option<bool>,
    github_id: Option<i64>,
    default_branch: Option<String>,
    master_branch: Option<String>,
    html_url: Option<String>,
    forks_count: Option<i64>,
    open_issues_count: Option<i64>,
    stargazers_count: Option<i64>,
    subscribers_count: Option<i64>,
    watchers_count: Option<i64>,
    size_in_kb: Option<i64>,
    created_at: Option<String>,
    updated_at: Option<String>,
    pushed_at: Option<String>,
}

impl StagedRepository {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            primary_language: row.get(1)?,
            clone_url: row.get(2)?,
            clone_path: row.get(3)?,
            vcs: row.get(4)?,
            full_name: row.get(5)?,
            description: row.get(6)?,
            homepage: row.get(7)?,
            fork: row.get(8)?,
            github_id: row.get(9)?,
            default_branch: row.get(10)?,
            master_branch: row.get(11)?,
            html_url: row.get(12)?,
            forks_count: row.get(13)?,
            open_issues_count: row.get(14)?,
            stargazers_count: row.get(15)?,
            subscribers_count: row.get(16)?,
            watchers_count: row.get(17)?,
            size_in_kb: row.get(18)?,
            created_at: row.get(19)?,
            updated_at: row.get(20)?,
            pushed_at: row.get(21)?,
        })
    }
}

impl SqliteStore {
    /// Promote one winning staged repository per clone path into
    /// `repositories` and `gh_repositories`, then empty the staging table.
    ///
    /// The whole batch runs in one transaction with foreign keys relaxed and
    /// is rolled back if any step fails.
    ///
    /// # Errors
    /// Returns an error when ranking, inserting, restoring constraints or
    /// committing fails.
    pub fn promote_staged_repositories(&mut self) -> Result<PromotionSummary> {
        let tx = self.conn.transaction().context("failed to start promotion transaction")?;
        let relaxed =
            relax(&tx, EntityKind::Repos).context("failed to relax repository constraints")?;

        let staged: i64 = tx
            .query_row("SELECT COUNT(*) FROM tmp_gh_repositories", [], |row| row.get(0))
            .context("failed to count staged repositories")?;
        let winners = ranked_winners(&tx)?;
        let candidates = candidate_count(&tx)?;

        let mut promoted_ids = HashSet::new();
        for winner in &winners {
            let Some(github_id) = winner.github_id else {
                continue;
            };
            if !promoted_ids.insert(github_id) {
                continue;
            }
            promote_one(&tx, winner).with_context(|| {
                format!("failed to promote staged repository with github_id {github_id}")
            })?;
        }

        tx.execute("DELETE FROM tmp_gh_repositories", [])
            .context("failed to clear staging table")?;
        restore(&tx, relaxed).context("failed to restore repository constraints")?;
        tx.commit().context("failed to commit promotion")?;

        let promoted = i64::try_from(promoted_ids.len()).context("promotion count overflow")?;
        let summary = PromotionSummary {
            staged,
            already_present: staged - candidates,
            superseded: candidates - promoted,
            promoted,
        };
        tracing::info!(
            staged = summary.staged,
            promoted = summary.promoted,
            superseded = summary.superseded,
            already_present = summary.already_present,
            "promoted staged repositories"
        );
        Ok(summary)
    }
}

fn ranked_winners(conn: &Connection) -> Result<Vec<StagedRepository>> {
    let mut stmt =
        conn.prepare(RANKED_CANDIDATES_SQL).context("failed to prepare staging ranking query")?;
    let rows = stmt.query_map([], StagedRepository::from_row)?;
    let mut winners = Vec::new();
    for row in rows {
        winners.push(row.context("failed to read ranked staged repository")?);
    }
    Ok(winners)
}

fn candidate_count(conn: &Connection) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM tmp_gh_repositories s
         WHERE NOT EXISTS (SELECT 1 FROM gh_repositories g WHERE g.github_id = s.github_id)
           AND NOT EXISTS (
             SELECT 1 FROM repositories r
             WHERE r.clone_path = s.clone_path AND r.primary_language IS s.primary_language
           )",
        [],
        |row| row.get(0),
    )
    .context("failed to count promotion candidates")
}

fn promote_one(conn: &Connection, staged: &StagedRepository) -> Result<()> {
    conn.execute(
        "INSERT INTO repositories(name, primary_language, clone_url, clone_path, vcs)
         VALUES (?1, COALESCE(?2, ''), ?3, ?4, COALESCE(?5, 'git'))",
        params![
            staged.name,
            staged.primary_language,
            staged.clone_url,
            staged.clone_path,
            staged.vcs,
        ],
    )?;
    let repository_id = conn.last_insert_rowid();

    conn.execute(
        "INSERT INTO gh_repositories(
            repository_id, github_id, full_name, description, homepage, fork,
            default_branch, master_branch, html_url, forks_count, open_issues_count,
            stargazers_count, subscribers_count, watchers_count, size_in_kb,
            created_at, updated_at, pushed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            repository_id,
            staged.github_id,
            staged.full_name,
            staged.description,
            staged.homepage,
            staged.fork,
            staged.default_branch,
            staged.master_branch,
            staged.html_url,
            staged.forks_count,
            staged.open_issues_count,
            staged.stargazers_count,
            staged.subscribers_count,
            staged.watchers_count,
            staged.size_in_kb,
            staged.created_at,
            staged.updated_at,
            staged.pushed_at,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use rusqlite::params;

    use super::*;

    struct Staged<'a> {
        github_id: i64,
        clone_path: &'a str,
        language: &'a str,
        updated_at: Option<&'a str>,
        pushed_at: Option<&'a str>,
        open_issues: Option<i64>,
    }

    fn stage(store: &SqliteStore, row: &Staged<'_>) -> Result<()> {
        store.connection().execute(
            "INSERT INTO tmp_gh_repositories(
                name, primary_language, clone_url, clone_path, vcs, full_name, github_id,
                open_issues_count, updated_at, pushed_at
            ) VALUES ('tool', ?1, ?2, ?3, 'git', ?4, ?5, ?6, ?7, ?8)",
            params![
                row.language,
                format!("https://example.test/{}.git", row.github_id),
                row.clone_path,
                format!("acme/tool-{}", row.github_id),
                row.github_id,
                row.open_issues,
                row.updated_at,
                row.pushed_at,
            ],
        )?;
        Ok(())
    }

    fn migrated_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    // Test IDs: TPR-001
    #[test]
    fn newest_row_wins_each_clone_path() -> Result<()> {
        let mut store = migrated_store()?;
        let path = "go/acme/tool";
        for row in [
            Staged { github_id: 1, clone_path: path, language: "go", updated_at: Some("2014-01-01T00:00:00Z"), pushed_at: None, open_issues: Some(0) },
            Staged { github_id: 2, clone_path: path, language: "go", updated_at: Some("2015-01-01T00:00:00Z"), pushed_at: None, open_issues: Some(9) },
            Staged { github_id: 3, clone_path: path, language: "go", updated_at: None, pushed_at: None, open_issues: Some(0) },
            Staged { github_id: 4, clone_path: "c/acme/other", language: "c", updated_at: None, pushed_at: None, open_issues: None },
        ] {
            stage(&store, &row)?;
        }

        let summary = store.promote_staged_repositories()?;
        assert_eq!(
            summary,
            PromotionSummary { staged: 4, already_present: 0, superseded: 2, promoted: 2 }
        );
        assert!(store.repository(2)?.is_some());
        assert!(store.repository(4)?.is_some());
        assert!(store.repository(1)?.is_none());
        assert_eq!(store.staged_repository_count()?, 0);
        assert!(store.integrity_check()?.foreign_key_violations.is_empty());
        Ok(())
    }

    // Test IDs: TPR-002
    #[test]
    fn ties_break_on_pushed_at_then_fewest_open_issues() -> Result<()> {
        let mut store = migrated_store()?;
        let same = Some("2015-01-01T00:00:00Z");
        for row in [
            Staged { github_id: 10, clone_path: "go/a/x", language: "go", updated_at: same, pushed_at: Some("2015-02-01T00:00:00Z"), open_issues: Some(5) },
            Staged { github_id: 11, clone_path: "go/a/x", language: "go", updated_at: same, pushed_at: Some("2015-03-01T00:00:00Z"), open_issues: Some(7) },
            Staged { github_id: 20, clone_path: "go/a/y", language: "go", updated_at: same, pushed_at: same, open_issues: Some(4) },
            Staged { github_id: 21, clone_path: "go/a/y", language: "go", updated_at: same, pushed_at: same, open_issues: Some(1) },
        ] {
            stage(&store, &row)?;
        }

        store.promote_staged_repositories()?;
        assert!(store.repository(11)?.is_some());
        assert!(store.repository(10)?.is_none());
        assert!(store.repository(21)?.is_some());
        assert!(store.repository(20)?.is_none());
        Ok(())
    }

    // Test IDs: TPR-003
    #[test]
    fn rows_already_stored_are_not_promoted_again() -> Result<()> {
        let mut store = migrated_store()?;
        stage(&store, &Staged { github_id: 1, clone_path: "go/acme/tool", language: "go", updated_at: None, pushed_at: None, open_issues: None })?;
        store.promote_staged_repositories()?;

        stage(&store, &Staged { github_id: 1, clone_path: "go/acme/tool", language: "go", updated_at: Some("2020-01-01T00:00:00Z"), pushed_at: None, open_issues: None })?;
        stage(&store, &Staged { github_id: 2, clone_path: "go/acme/tool", language: "go", updated_at: None, pushed_at: None, open_issues: None })?;
        let summary = store.promote_staged_repositories()?;

        assert_eq!(
            summary,
            PromotionSummary { staged: 2, already_present: 2, superseded: 0, promoted: 0 }
        );
        assert_eq!(store.stats()?.gh_repositories, 1);
        Ok(())
    }

    #[test]
    fn empty_staging_table_promotes_nothing() -> Result<()> {
        let mut store = migrated_store()?;
        assert_eq!(store.promote_staged_repositories()?, PromotionSummary::default());
        Ok(())
    }
}
