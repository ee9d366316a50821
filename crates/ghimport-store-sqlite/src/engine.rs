use std::borrow::Cow;

use ghimport_core::{
    strip_nul, Account, AccountKind, Collaboration, Membership, Record, Repository, Timestamp,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::resolver::{ExistingRow, IdentityResolver, Resolution, Skip};

/// Version-control system recorded for every imported repository.
pub const VCS_GIT: &str = "git";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ImportStrategy {
    /// Insert or update, with foreign keys deferred for the file transaction.
    #[default]
    ConstraintToggling,
    /// Insert or update, with foreign keys enforced on every statement.
    InPlace,
    /// Append repositories to the staging table for later promotion.
    Staging,
}

impl ImportStrategy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConstraintToggling => "constraint_toggling",
            Self::InPlace => "in_place",
            Self::Staging => "staging",
        }
    }

    #[must_use]
    pub fn relaxes_constraints(self) -> bool {
        !matches!(self, Self::InPlace)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Outcome {
    Inserted,
    Updated,
    Staged,
    Skipped(Skip),
}

impl Outcome {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Updated => "updated",
            Self::Staged => "staged",
            Self::Skipped(Skip::Stale) => "unchanged",
            Self::Skipped(Skip::LookupFailed(_)) => "lookup_failed",
            Self::Skipped(Skip::KindChanged { .. }) => "kind_changed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UpsertError {
    #[error("{relation}: {endpoint} not found")]
    EndpointNotFound { relation: String, endpoint: String },
    #[error("failed to write {identity}: {source}")]
    Write {
        identity: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("invalid {identity}: {reason}")]
    InvalidRecord { identity: String, reason: &'static str },
}

/// Applies decoded records to the store according to an [`ImportStrategy`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UpsertEngine {
    strategy: ImportStrategy,
    resolver: IdentityResolver,
}

impl UpsertEngine {
    #[must_use]
    pub fn new(strategy: ImportStrategy, resolver: IdentityResolver) -> Self {
        Self { strategy, resolver }
    }

    #[must_use]
    pub fn strategy(&self) -> ImportStrategy {
        self.strategy
    }

    #[must_use]
    pub fn resolver(&self) -> IdentityResolver {
        self.resolver
    }

    /// Insert, update, stage or skip one record.
    ///
    /// Multi-row writes are not atomic on their own; callers wrap each call
    /// in a savepoint.
    ///
    /// # Errors
    /// Returns an error when a required key is empty, a relation endpoint is
    /// missing, or a statement fails.
    pub fn apply(&self, conn: &Connection, record: &Record) -> Result<Outcome, UpsertError> {
        validate(record)?;

        if let (ImportStrategy::Staging, Record::Repository(repository)) = (self.strategy, record) {
            stage_repository(conn, repository).map_err(|source| write_error(record, source))?;
            return Ok(Outcome::Staged);
        }

        match self.resolver.resolve(conn, &record.identity(), record.effective_timestamp()) {
            Resolution::StaleOrError(skip) => Ok(Outcome::Skipped(skip)),
            Resolution::Absent => insert(conn, record).map(|()| Outcome::Inserted),
            Resolution::Present(existing) => update(conn, record, existing),
        }
    }
}

fn validate(record: &Record) -> Result<(), UpsertError> {
    let reason = match record {
        Record::Account(account) if account.github_id <= 0 => Some("non-positive github id"),
        Record::Account(account) if account.login.is_empty() => Some("empty login"),
        Record::Repository(repository) if repository.github_id <= 0 => {
            Some("non-positive github id")
        }
        Record::Membership(membership) if membership.login.is_empty() || membership.org.is_empty() => {
            Some("empty member or organization login")
        }
        Record::Collaboration(collaboration)
            if collaboration.login.is_empty()
                || collaboration.owner.is_empty()
                || collaboration.repo.is_empty() =>
        {
            Some("empty login, owner or repository name")
        }
        _ => None,
    };
    match reason {
        Some(reason) => {
            Err(UpsertError::InvalidRecord { identity: record.identity().to_string(), reason })
        }
        None => Ok(()),
    }
}

fn insert(conn: &Connection, record: &Record) -> Result<(), UpsertError> {
    match record {
        Record::Account(account) => {
            let written = match account.kind {
                AccountKind::User => insert_user(conn, account),
                AccountKind::Organization => insert_organization(conn, account),
            };
            written.map_err(|source| write_error(record, source))
        }
        Record::Repository(repository) => {
            insert_repository(conn, repository).map_err(|source| write_error(record, source))
        }
        Record::Membership(membership) => insert_membership(conn, membership),
        Record::Collaboration(collaboration) => insert_collaboration(conn, collaboration),
    }
}

fn update(conn: &Connection, record: &Record, existing: ExistingRow) -> Result<Outcome, UpsertError> {
    let written = match record {
        Record::Account(account) => match account.kind {
            AccountKind::User => update_user(conn, account, existing),
            AccountKind::Organization => update_organization(conn, account, existing),
        },
        Record::Repository(repository) => update_repository(conn, repository, existing),
        Record::Membership(_) | Record::Collaboration(_) => {
            return Ok(Outcome::Skipped(Skip::Stale));
        }
    };
    written.map(|()| Outcome::Updated).map_err(|source| write_error(record, source))
}

fn write_error(record: &Record, source: rusqlite::Error) -> UpsertError {
    UpsertError::Write { identity: record.identity().to_string(), source }
}

fn text(value: &str) -> Cow<'_, str> {
    strip_nul(value)
}

fn optional_text(value: Option<&str>) -> Option<Cow<'_, str>> {
    value.map(strip_nul)
}

fn stamp(value: Option<&Timestamp>) -> Option<&str> {
    value.map(Timestamp::as_str)
}

fn insert_user(conn: &Connection, account: &Account) -> rusqlite::Result<()> {
    conn.prepare_cached("INSERT INTO users(username, name, email) VALUES (?1, ?2, ?3)")?.execute(
        params![
            text(&account.login),
            optional_text(account.name.as_deref()),
            optional_text(account.email.as_deref()),
        ],
    )?;
    let user_id = conn.last_insert_rowid();

    conn.prepare_cached(
        "INSERT INTO gh_users(
            user_id, github_id, login, bio, company, email, hireable, location,
            avatar_url, html_url, followers_count, following_count, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
    )?
    .execute(params![
        user_id,
        account.github_id,
        text(&account.login),
        optional_text(account.bio.as_deref()),
        optional_text(account.company.as_deref()),
        optional_text(account.email.as_deref()),
        account.hireable,
        optional_text(account.location.as_deref()),
        optional_text(account.avatar_url.as_deref()),
        optional_text(account.html_url.as_deref()),
        account.followers,
        account.following,
        stamp(account.created_at.as_ref()),
        stamp(account.effective_timestamp()),
    ])?;
    Ok(())
}

fn update_user(conn: &Connection, account: &Account, existing: ExistingRow) -> rusqlite::Result<()> {
    if let Some(user_id) = existing.parent_id {
        conn.prepare_cached("UPDATE users SET username = ?1, name = ?2, email = ?3 WHERE id = ?4")?
            .execute(params![
                text(&account.login),
                optional_text(account.name.as_deref()),
                optional_text(account.email.as_deref()),
                user_id,
            ])?;
    }

    conn.prepare_cached(
        "UPDATE gh_users SET
            login = ?1, bio = ?2, company = ?3, email = ?4, hireable = ?5, location = ?6,
            avatar_url = ?7, html_url = ?8, followers_count = ?9, following_count = ?10,
            created_at = ?11, updated_at = ?12
         WHERE id = ?13",
    )?
    .execute(params![
        text(&account.login),
        optional_text(account.bio.as_deref()),
        optional_text(account.company.as_deref()),
        optional_text(account.email.as_deref()),
        account.hireable,
        optional_text(account.location.as_deref()),
        optional_text(account.avatar_url.as_deref()),
        optional_text(account.html_url.as_deref()),
        account.followers,
        account.following,
        stamp(account.created_at.as_ref()),
        stamp(account.effective_timestamp()),
        existing.id,
    ])?;
    Ok(())
}

fn insert_organization(conn: &Connection, account: &Account) -> rusqlite::Result<()> {
    conn.prepare_cached(
        "INSERT INTO gh_organizations(
            login, github_id, avatar_url, html_url, name, company, location, email,
            created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?
    .execute(params![
        text(&account.login),
        account.github_id,
        optional_text(account.avatar_url.as_deref()),
        optional_text(account.html_url.as_deref()),
        optional_text(account.name.as_deref()),
        optional_text(account.company.as_deref()),
        optional_text(account.location.as_deref()),
        optional_text(account.email.as_deref()),
        stamp(account.created_at.as_ref()),
        stamp(account.effective_timestamp()),
    ])?;
    Ok(())
}

fn update_organization(
    conn: &Connection,
    account: &Account,
    existing: ExistingRow,
) -> rusqlite::Result<()> {
    conn.prepare_cached(
        "UPDATE gh_organizations SET
            login = ?1, avatar_url = ?2, html_url = ?3, name = ?4, company = ?5,
            location = ?6, email = ?7, created_at = ?8, updated_at = ?9
         WHERE id = ?10",
    )?
    .execute(params![
        text(&account.login),
        optional_text(account.avatar_url.as_deref()),
        optional_text(account.html_url.as_deref()),
        optional_text(account.name.as_deref()),
        optional_text(account.company.as_deref()),
        optional_text(account.location.as_deref()),
        optional_text(account.email.as_deref()),
        stamp(account.created_at.as_ref()),
        stamp(account.effective_timestamp()),
        existing.id,
    ])?;
    Ok(())
}

fn insert_repository(conn: &Connection, repository: &Repository) -> rusqlite::Result<()> {
    conn.prepare_cached(
        "INSERT INTO repositories(name, primary_language, clone_url, clone_path, vcs)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?
    .execute(params![
        text(&repository.name),
        text(repository.language()),
        optional_text(repository.clone_url.as_deref()),
        text(&repository.clone_path()),
        VCS_GIT,
    ])?;
    let repository_id = conn.last_insert_rowid();

    conn.prepare_cached(
        "INSERT INTO gh_repositories(
            repository_id, github_id, full_name, description, homepage, fork,
            default_branch, master_branch, html_url, forks_count, open_issues_count,
            stargazers_count, subscribers_count, watchers_count, size_in_kb,
            created_at, updated_at, pushed_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
    )?
    .execute(params![
        repository_id,
        repository.github_id,
        text(&repository.full_name()),
        optional_text(repository.description.as_deref()),
        optional_text(repository.homepage.as_deref()),
        repository.fork,
        optional_text(repository.default_branch.as_deref()),
        optional_text(repository.master_branch.as_deref()),
        optional_text(repository.html_url.as_deref()),
        repository.forks_count,
        repository.open_issues_count,
        repository.stargazers_count,
        repository.subscribers_count,
        repository.watchers_count,
        repository.size_in_kb,
        stamp(repository.created_at.as_ref()),
        stamp(repository.effective_timestamp()),
        stamp(repository.pushed_at.as_ref()),
    ])?;
    Ok(())
}

fn update_repository(
    conn: &Connection,
    repository: &Repository,
    existing: ExistingRow,
) -> rusqlite::Result<()> {
    if let Some(repository_id) = existing.parent_id {
        conn.prepare_cached(
            "UPDATE repositories SET name = ?1, primary_language = ?2, clone_url = ?3, clone_path = ?4
             WHERE id = ?5",
        )?
        .execute(params![
            text(&repository.name),
            text(repository.language()),
            optional_text(repository.clone_url.as_deref()),
            text(&repository.clone_path()),
            repository_id,
        ])?;
    }

    conn.prepare_cached(
        "UPDATE gh_repositories SET
            full_name = ?1, description = ?2, homepage = ?3, fork = ?4, default_branch = ?5,
            master_branch = ?6, html_url = ?7, forks_count = ?8, open_issues_count = ?9,
            stargazers_count = ?10, subscribers_count = ?11, watchers_count = ?12,
            size_in_kb = ?13, created_at = ?14, updated_at = ?15, pushed_at = ?16
         WHERE id = ?17",
    )?
    .execute(params![
        text(&repository.full_name()),
        optional_text(repository.description.as_deref()),
        optional_text(repository.homepage.as_deref()),
        repository.fork,
        optional_text(repository.default_branch.as_deref()),
        optional_text(repository.master_branch.as_deref()),
        optional_text(repository.html_url.as_deref()),
        repository.forks_count,
        repository.open_issues_count,
        repository.stargazers_count,
        repository.subscribers_count,
        repository.watchers_count,
        repository.size_in_kb,
        stamp(repository.created_at.as_ref()),
        stamp(repository.effective_timestamp()),
        stamp(repository.pushed_at.as_ref()),
        existing.id,
    ])?;
    Ok(())
}

fn stage_repository(conn: &Connection, repository: &Repository) -> rusqlite::Result<()> {
    conn.prepare_cached(
        "INSERT INTO tmp_gh_repositories(
            name, primary_language, clone_url, clone_path, vcs, full_name, description,
            homepage, fork, github_id, default_branch, master_branch, html_url, forks_count,
            open_issues_count, stargazers_count, subscribers_count, watchers_count, size_in_kb,
            created_at, updated_at, pushed_at
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
            ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22
        )",
    )?
    .execute(params![
        text(&repository.name),
        text(repository.language()),
        optional_text(repository.clone_url.as_deref()),
        text(&repository.clone_path()),
        VCS_GIT,
        text(&repository.full_name()),
        optional_text(repository.description.as_deref()),
        optional_text(repository.homepage.as_deref()),
        repository.fork,
        repository.github_id,
        optional_text(repository.default_branch.as_deref()),
        optional_text(repository.master_branch.as_deref()),
        optional_text(repository.html_url.as_deref()),
        repository.forks_count,
        repository.open_issues_count,
        repository.stargazers_count,
        repository.subscribers_count,
        repository.watchers_count,
        repository.size_in_kb,
        stamp(repository.created_at.as_ref()),
        stamp(repository.effective_timestamp()),
        stamp(repository.pushed_at.as_ref()),
    ])?;
    Ok(())
}

fn insert_membership(conn: &Connection, membership: &Membership) -> Result<(), UpsertError> {
    let relation = format!("membership {} in {}", membership.login, membership.org);
    let write = |source: rusqlite::Error| UpsertError::Write { identity: relation.clone(), source };

    let gh_user_id = lookup_id(conn, "SELECT id FROM gh_users WHERE login = ?1", &membership.login)
        .map_err(write)?
        .ok_or_else(|| UpsertError::EndpointNotFound {
            relation: relation.clone(),
            endpoint: format!("user {}", membership.login),
        })?;
    let gh_organization_id =
        lookup_id(conn, "SELECT id FROM gh_organizations WHERE login = ?1", &membership.org)
            .map_err(write)?
            .ok_or_else(|| UpsertError::EndpointNotFound {
                relation: relation.clone(),
                endpoint: format!("organization {}", membership.org),
            })?;

    conn.prepare_cached(
        "INSERT INTO gh_users_organizations(gh_user_id, gh_organization_id) VALUES (?1, ?2)",
    )
    .and_then(|mut stmt| stmt.execute(params![gh_user_id, gh_organization_id]))
    .map_err(write)?;
    Ok(())
}

fn insert_collaboration(
    conn: &Connection,
    collaboration: &Collaboration,
) -> Result<(), UpsertError> {
    let full_name = collaboration.full_name();
    let relation = format!("collaboration {} on {full_name}", collaboration.login);
    let write = |source: rusqlite::Error| UpsertError::Write { identity: relation.clone(), source };

    let user_id =
        lookup_id(conn, "SELECT user_id FROM gh_users WHERE login = ?1", &collaboration.login)
            .map_err(write)?
            .ok_or_else(|| UpsertError::EndpointNotFound {
                relation: relation.clone(),
                endpoint: format!("user {}", collaboration.login),
            })?;
    let repository_id =
        lookup_id(conn, "SELECT repository_id FROM gh_repositories WHERE full_name = ?1", &full_name)
            .map_err(write)?
            .ok_or_else(|| UpsertError::EndpointNotFound {
                relation: relation.clone(),
                endpoint: format!("repository {full_name}"),
            })?;

    conn.prepare_cached("INSERT INTO users_repositories(user_id, repository_id) VALUES (?1, ?2)")
        .and_then(|mut stmt| stmt.execute(params![user_id, repository_id]))
        .map_err(write)?;
    Ok(())
}

fn lookup_id(conn: &Connection, sql: &str, key: &str) -> rusqlite::Result<Option<i64>> {
    conn.prepare_cached(sql)?.query_row(params![key], |row| row.get(0)).optional()
}
