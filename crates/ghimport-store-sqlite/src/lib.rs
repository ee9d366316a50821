use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ghimport_core::AccountKind;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub mod engine;
pub mod promote;
pub mod resolver;
pub mod toggle;

pub use engine::{ImportStrategy, Outcome, UpsertEngine, UpsertError, VCS_GIT};
pub use promote::PromotionSummary;
pub use resolver::{ConflictPolicy, ExistingRow, IdentityResolver, Resolution, Skip};
pub use toggle::{guarded_tables, relax, restore, RelaxedConstraints, ToggleError};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  username TEXT NOT NULL,
  name TEXT,
  email TEXT
);

CREATE TABLE IF NOT EXISTS gh_users (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  github_id INTEGER NOT NULL UNIQUE,
  login TEXT NOT NULL,
  bio TEXT,
  company TEXT,
  email TEXT,
  hireable INTEGER,
  location TEXT,
  avatar_url TEXT,
  html_url TEXT,
  followers_count INTEGER,
  following_count INTEGER,
  created_at TEXT,
  updated_at TEXT,
  CONSTRAINT gh_users_fk_users FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE TABLE IF NOT EXISTS gh_organizations (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  github_id INTEGER NOT NULL UNIQUE,
  login TEXT NOT NULL,
  avatar_url TEXT,
  html_url TEXT,
  name TEXT,
  company TEXT,
  location TEXT,
  email TEXT,
  created_at TEXT,
  updated_at TEXT
);

CREATE TABLE IF NOT EXISTS gh_users_organizations (
  gh_user_id INTEGER NOT NULL,
  gh_organization_id INTEGER NOT NULL,
  PRIMARY KEY (gh_user_id, gh_organization_id),
  CONSTRAINT gh_users_organizations_fk_users FOREIGN KEY (gh_user_id) REFERENCES gh_users(id),
  CONSTRAINT gh_users_organizations_fk_organization
    FOREIGN KEY (gh_organization_id) REFERENCES gh_organizations(id)
);

CREATE TABLE IF NOT EXISTS repositories (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  primary_language TEXT NOT NULL,
  clone_url TEXT,
  clone_path TEXT NOT NULL,
  vcs TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS gh_repositories (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  repository_id INTEGER NOT NULL,
  github_id INTEGER NOT NULL UNIQUE,
  full_name TEXT NOT NULL,
  description TEXT,
  homepage TEXT,
  fork INTEGER,
  default_branch TEXT,
  master_branch TEXT,
  html_url TEXT,
  forks_count INTEGER,
  open_issues_count INTEGER,
  stargazers_count INTEGER,
  subscribers_count INTEGER,
  watchers_count INTEGER,
  size_in_kb INTEGER,
  created_at TEXT,
  updated_at TEXT,
  pushed_at TEXT,
  CONSTRAINT gh_repositories_fk_repositories FOREIGN KEY (repository_id) REFERENCES repositories(id)
);

CREATE TABLE IF NOT EXISTS users_repositories (
  user_id INTEGER NOT NULL,
  repository_id INTEGER NOT NULL,
  PRIMARY KEY (user_id, repository_id),
  CONSTRAINT users_repositories_fk_users FOREIGN KEY (user_id) REFERENCES users(id),
  CONSTRAINT users_repositories_fk_repository FOREIGN KEY (repository_id) REFERENCES repositories(id)
);

CREATE INDEX IF NOT EXISTS idx_gh_users_login ON gh_users(login);
CREATE INDEX IF NOT EXISTS idx_gh_users_user_id ON gh_users(user_id);
CREATE INDEX IF NOT EXISTS idx_gh_organizations_login ON gh_organizations(login);
CREATE INDEX IF NOT EXISTS idx_gh_repositories_full_name ON gh_repositories(full_name);
CREATE INDEX IF NOT EXISTS idx_gh_repositories_repository_id ON gh_repositories(repository_id);
CREATE INDEX IF NOT EXISTS idx_repositories_clone_path ON repositories(clone_path);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS tmp_gh_repositories (
  name TEXT,
  primary_language TEXT,
  clone_url TEXT,
  clone_path TEXT,
  vcs TEXT,
  full_name TEXT,
  description TEXT,
  homepage TEXT,
  fork INTEGER,
  github_id INTEGER,
  default_branch TEXT,
  master_branch TEXT,
  html_url TEXT,
  forks_count INTEGER,
  open_issues_count INTEGER,
  stargazers_count INTEGER,
  subscribers_count INTEGER,
  watchers_count INTEGER,
  size_in_kb INTEGER,
  created_at TEXT,
  updated_at TEXT,
  pushed_at TEXT
);
";

/// Tables reported by [`SqliteStore::stats`], in dependency order.
const COUNTED_TABLES: [&str; 8] = [
    "users",
    "gh_users",
    "gh_organizations",
    "gh_users_organizations",
    "repositories",
    "gh_repositories",
    "users_repositories",
    "tmp_gh_repositories",
];

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    /// Clone paths shared by more than one repository.
    pub duplicate_clone_paths: i64,
    /// Clone URLs shared by more than one repository.
    pub duplicate_clone_urls: i64,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreStats {
    pub users: i64,
    pub gh_users: i64,
    pub gh_organizations: i64,
    pub gh_users_organizations: i64,
    pub repositories: i64,
    pub gh_repositories: i64,
    pub users_repositories: i64,
    pub tmp_gh_repositories: i64,
}

/// An account row as stored, either in `gh_users` or `gh_organizations`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoredAccount {
    pub id: i64,
    pub kind: AccountKind,
    /// Native `users` row; organizations have none.
    pub user_id: Option<i64>,
    pub github_id: i64,
    pub login: String,
    pub name: Option<String>,
    pub bio: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub email: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoredRepository {
    pub id: i64,
    pub repository_id: i64,
    pub github_id: i64,
    pub name: String,
    pub full_name: String,
    pub primary_language: String,
    pub clone_url: Option<String>,
    pub clone_path: String,
    pub description: Option<String>,
    pub open_issues_count: Option<i64>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub pushed_at: Option<String>,
}

impl SqliteStore {
    /// Open the target store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Begin a deferred transaction; dropping it without commit rolls back.
    ///
    /// # Errors
    /// Returns an error when `SQLite` refuses to start the transaction.
    pub fn transaction(&mut self) -> Result<Transaction<'_>> {
        self.conn.transaction().context("failed to start transaction")
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        for (target, sql) in [(1_i64, MIGRATION_001_SQL), (2_i64, MIGRATION_002_SQL)] {
            if version >= target {
                continue;
            }
            let tx = self
                .conn
                .transaction()
                .with_context(|| format!("failed to start migration v{target} transaction"))?;
            tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{target}"))?;
            record_schema_version(&tx, target)?;
            tx.commit().with_context(|| format!("failed to commit migration v{target}"))?;
            tracing::debug!(version = target, "applied schema migration");
        }

        Ok(())
    }

    /// Count rows in every table touched by the importer.
    ///
    /// # Errors
    /// Returns an error when a count query fails.
    pub fn stats(&self) -> Result<StoreStats> {
        let mut counts = [0_i64; COUNTED_TABLES.len()];
        for (slot, table) in counts.iter_mut().zip(COUNTED_TABLES) {
            *slot = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .with_context(|| format!("failed to count rows in {table}"))?;
        }
        let [users, gh_users, gh_organizations, gh_users_organizations, repositories, gh_repositories, users_repositories, tmp_gh_repositories] =
            counts;
        Ok(StoreStats {
            users,
            gh_users,
            gh_organizations,
            gh_users_organizations,
            repositories,
            gh_repositories,
            users_repositories,
            tmp_gh_repositories,
        })
    }

    /// Number of repositories waiting in the staging table.
    ///
    /// # Errors
    /// Returns an error when the staging table cannot be read.
    pub fn staged_repository_count(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM tmp_gh_repositories", [], |row| row.get(0))
            .context("failed to count staged repositories")
    }

    /// Run quick-check, foreign-key-check, clone uniqueness and schema status checks.
    ///
    /// # Errors
    /// Returns an error when any integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let duplicate_clone_paths = self.duplicate_count("clone_path")?;
        let duplicate_clone_urls = self.duplicate_count("clone_url")?;
        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            duplicate_clone_paths,
            duplicate_clone_urls,
            schema_status,
        })
    }

    fn duplicate_count(&self, column: &str) -> Result<i64> {
        self.conn
            .query_row(
                &format!(
                    "SELECT COUNT(*) FROM (
                        SELECT {column} FROM repositories
                        WHERE {column} IS NOT NULL
                        GROUP BY {column} HAVING COUNT(*) > 1
                    )"
                ),
                [],
                |row| row.get(0),
            )
            .with_context(|| format!("failed to count duplicated repositories.{column}"))
    }

    /// Look up an individual or organization by its external id.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn account(&self, github_id: i64) -> Result<Option<StoredAccount>> {
        let user = self
            .conn
            .query_row(
                "SELECT gu.id, gu.user_id, gu.github_id, gu.login, u.name, gu.bio, gu.company,
                        gu.location, gu.email, gu.created_at, gu.updated_at
                 FROM gh_users gu
                 LEFT JOIN users u ON u.id = gu.user_id
                 WHERE gu.github_id = ?1",
                params![github_id],
                |row| {
                    Ok(StoredAccount {
                        id: row.get(0)?,
                        kind: AccountKind::User,
                        user_id: row.get(1)?,
                        github_id: row.get(2)?,
                        login: row.get(3)?,
                        name: row.get(4)?,
                        bio: row.get(5)?,
                        company: row.get(6)?,
                        location: row.get(7)?,
                        email: row.get(8)?,
                        created_at: row.get(9)?,
                        updated_at: row.get(10)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load gh_users row for github_id {github_id}"))?;
        if user.is_some() {
            return Ok(user);
        }

        self.conn
            .query_row(
                "SELECT id, github_id, login, name, company, location, email, created_at, updated_at
                 FROM gh_organizations WHERE github_id = ?1",
                params![github_id],
                |row| {
                    Ok(StoredAccount {
                        id: row.get(0)?,
                        kind: AccountKind::Organization,
                        user_id: None,
                        github_id: row.get(1)?,
                        login: row.get(2)?,
                        name: row.get(3)?,
                        bio: None,
                        company: row.get(4)?,
                        location: row.get(5)?,
                        email: row.get(6)?,
                        created_at: row.get(7)?,
                        updated_at: row.get(8)?,
                    })
                },
            )
            .optional()
            .with_context(|| {
                format!("failed to load gh_organizations row for github_id {github_id}")
            })
    }

    /// Look up a repository and its native row by external id.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn repository(&self, github_id: i64) -> Result<Option<StoredRepository>> {
        self.conn
            .query_row(
                "SELECT gr.id, gr.repository_id, gr.github_id, r.name, gr.full_name,
                        r.primary_language, r.clone_url, r.clone_path, gr.description,
                        gr.open_issues_count, gr.created_at, gr.updated_at, gr.pushed_at
                 FROM gh_repositories gr
                 JOIN repositories r ON r.id = gr.repository_id
                 WHERE gr.github_id = ?1",
                params![github_id],
                |row| {
                    Ok(StoredRepository {
                        id: row.get(0)?,
                        repository_id: row.get(1)?,
                        github_id: row.get(2)?,
                        name: row.get(3)?,
                        full_name: row.get(4)?,
                        primary_language: row.get(5)?,
                        clone_url: row.get(6)?,
                        clone_path: row.get(7)?,
                        description: row.get(8)?,
                        open_issues_count: row.get(9)?,
                        created_at: row.get(10)?,
                        updated_at: row.get(11)?,
                        pushed_at: row.get(12)?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load repository for github_id {github_id}"))
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test IDs: TDB-001
    #[test]
    fn migrate_creates_schema_and_is_idempotent() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1, 2]);

        store.migrate()?;
        store.migrate()?;

        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        assert_eq!(store.stats()?, StoreStats::default());
        Ok(())
    }

    #[test]
    fn migrate_upgrades_a_version_one_database() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        store.conn.execute_batch(MIGRATION_001_SQL)?;
        record_schema_version(&store.conn, 1)?;
        assert_eq!(store.schema_status()?.pending_versions, vec![2]);

        store.migrate()?;
        assert_eq!(store.staged_repository_count()?, 0);
        Ok(())
    }

    #[test]
    fn migrate_rejects_newer_schema() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        record_schema_version(&store.conn, LATEST_SCHEMA_VERSION + 1)?;
        assert!(store.migrate().is_err());
        Ok(())
    }

    // Test IDs: TDB-002
    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.duplicate_clone_paths, 0);
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    // Test IDs: TDB-003
    #[test]
    fn integrity_check_flags_shared_clone_paths() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        store.conn.execute_batch(
            "INSERT INTO repositories(name, primary_language, clone_url, clone_path, vcs)
             VALUES ('tool', 'go', 'https://a.example/tool.git', 'go/acme/tool', 'git'),
                    ('Tool', 'go', 'https://b.example/tool.git', 'go/acme/tool', 'git');",
        )?;

        let report = store.integrity_check()?;
        assert_eq!(report.duplicate_clone_paths, 1);
        assert_eq!(report.duplicate_clone_urls, 0);
        Ok(())
    }

    #[test]
    fn open_reports_unreachable_path() {
        let result = SqliteStore::open(Path::new("/nonexistent/ghimport/store.sqlite3"));
        assert!(result.is_err());
    }

    #[test]
    fn file_backed_store_survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ghimport.sqlite3");
        {
            let mut store = SqliteStore::open(&path)?;
            store.migrate()?;
            store.conn.execute("INSERT INTO users(username) VALUES ('octocat')", [])?;
        }

        let store = SqliteStore::open(&path)?;
        assert_eq!(store.schema_status()?.current_version, LATEST_SCHEMA_VERSION);
        assert_eq!(store.stats()?.users, 1);
        Ok(())
    }
}
