use std::fmt::{Display, Formatter};

use ghimport_core::{AccountKind, ExternalIdentity, Timestamp};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// How an existing row is treated when the same identity shows up again.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Update only when the incoming record is strictly newer.
    #[default]
    KeepNewest,
    /// Never touch an existing row.
    KeepFirst,
}

impl ConflictPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeepNewest => "keep_newest",
            Self::KeepFirst => "keep_first",
        }
    }
}

/// Why a record was not written.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Skip {
    Stale,
    LookupFailed(String),
    /// The account id is already stored under the other account kind.
    KindChanged { stored: AccountKind, incoming: AccountKind },
}

impl Display for Skip {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stale => f.write_str("stored row is up to date"),
            Self::LookupFailed(message) => write!(f, "lookup failed: {message}"),
            Self::KindChanged { stored, incoming } => write!(
                f,
                "account is stored as {} but arrived as {}",
                stored.as_str(),
                incoming.as_str()
            ),
        }
    }
}

/// Row ids of an existing entity: the external-profile row and, when the
/// entity has one, its native parent row.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ExistingRow {
    pub id: i64,
    pub parent_id: Option<i64>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Resolution {
    Absent,
    Present(ExistingRow),
    /// The row is current or the lookup failed; either way nothing is written.
    StaleOrError(Skip),
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct IdentityResolver {
    policy: ConflictPolicy,
    no_check: bool,
}

impl IdentityResolver {
    #[must_use]
    pub fn new(policy: ConflictPolicy, no_check: bool) -> Self {
        Self { policy, no_check }
    }

    #[must_use]
    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    #[must_use]
    pub fn no_check(&self) -> bool {
        self.no_check
    }

    /// Decide whether `identity` must be inserted, updated or left alone.
    ///
    /// `incoming` is the record's effective timestamp; relations pass `None`.
    pub fn resolve(
        &self,
        conn: &Connection,
        identity: &ExternalIdentity,
        incoming: Option<&Timestamp>,
    ) -> Resolution {
        if self.no_check {
            return Resolution::Absent;
        }

        let lookup = match identity {
            ExternalIdentity::Account { github_id, kind } => lookup_account(conn, *github_id, *kind),
            ExternalIdentity::Repository { github_id } => lookup_versioned(
                conn,
                "SELECT id, repository_id, updated_at FROM gh_repositories WHERE github_id = ?1",
                *github_id,
            ),
            ExternalIdentity::Membership { login, org } => lookup_relation(
                conn,
                "SELECT m.gh_user_id, m.gh_organization_id
                 FROM gh_users_organizations m
                 JOIN gh_users u ON u.id = m.gh_user_id
                 JOIN gh_organizations o ON o.id = m.gh_organization_id
                 WHERE u.login = ?1 AND o.login = ?2",
                login,
                org,
            ),
            ExternalIdentity::Collaboration { login, full_name } => lookup_relation(
                conn,
                "SELECT ur.user_id, ur.repository_id
                 FROM users_repositories ur
                 JOIN gh_users gu ON gu.user_id = ur.user_id
                 JOIN gh_repositories gr ON gr.repository_id = ur.repository_id
                 WHERE gu.login = ?1 AND gr.full_name = ?2",
                login,
                full_name,
            ),
        };

        match lookup {
            Err(err) => Resolution::StaleOrError(Skip::LookupFailed(err.to_string())),
            Ok(None) => Resolution::Absent,
            Ok(Some(found)) => self.compare(found, incoming),
        }
    }

    fn compare(&self, found: Found, incoming: Option<&Timestamp>) -> Resolution {
        let (row, stored_updated_at) = match found {
            Found::Versioned { row, stored_updated_at } => (row, stored_updated_at),
            Found::Relation => return Resolution::StaleOrError(Skip::Stale),
            Found::OtherKind { stored, incoming } => {
                return Resolution::StaleOrError(Skip::KindChanged { stored, incoming })
            }
        };
        if self.policy == ConflictPolicy::KeepFirst {
            return Resolution::StaleOrError(Skip::Stale);
        }

        let Some(incoming) = incoming else {
            return Resolution::StaleOrError(Skip::Stale);
        };
        let stored = stored_updated_at.as_deref().and_then(|raw| Timestamp::parse(raw).ok());
        match stored {
            Some(stored) if *incoming <= stored => Resolution::StaleOrError(Skip::Stale),
            _ => Resolution::Present(row),
        }
    }
}

enum Found {
    Versioned { row: ExistingRow, stored_updated_at: Option<String> },
    Relation,
    OtherKind { stored: AccountKind, incoming: AccountKind },
}

/// Users and organizations share one GitHub id space, so both tables are
/// searched whatever kind the record claims.
fn lookup_account(
    conn: &Connection,
    github_id: i64,
    incoming: AccountKind,
) -> rusqlite::Result<Option<Found>> {
    let user = lookup_versioned(
        conn,
        "SELECT id, user_id, updated_at FROM gh_users WHERE github_id = ?1",
        github_id,
    )?;
    let (found, stored) = match user {
        Some(found) => (found, AccountKind::User),
        None => match lookup_versioned(
            conn,
            "SELECT id, NULL, updated_at FROM gh_organizations WHERE github_id = ?1",
            github_id,
        )? {
            Some(found) => (found, AccountKind::Organization),
            None => return Ok(None),
        },
    };
    if stored == incoming {
        Ok(Some(found))
    } else {
        Ok(Some(Found::OtherKind { stored, incoming }))
    }
}

fn lookup_versioned(
    conn: &Connection,
    sql: &str,
    github_id: i64,
) -> rusqlite::Result<Option<Found>> {
    conn.prepare_cached(sql)?
        .query_row(params![github_id], |row| {
            Ok(Found::Versioned {
                row: ExistingRow { id: row.get(0)?, parent_id: row.get(1)? },
                stored_updated_at: row.get(2)?,
            })
        })
        .optional()
}

fn lookup_relation(
    conn: &Connection,
    sql: &str,
    left: &str,
    right: &str,
) -> rusqlite::Result<Option<Found>> {
    conn.prepare_cached(sql)?.query_row(params![left, right], |_| Ok(Found::Relation)).optional()
}
