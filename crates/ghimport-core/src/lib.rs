use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub mod decode;
pub mod frame;
pub mod snapshot;

pub use decode::{decode_record, DecodeError};
pub use frame::{DumpReader, FrameError, MAX_DOCUMENT_LEN, MIN_DOCUMENT_LEN};
pub use snapshot::{
    parse_snapshot_name, select_snapshots, Snapshot, SnapshotOrder, SnapshotSelection,
    SNAPSHOT_EXTENSION,
};

/// Language segment used in a clone path when the repository has no primary language.
pub const UNKNOWN_LANGUAGE: &str = "unknown";
/// Owner segment used in a clone path when the owner login is missing.
pub const UNKNOWN_OWNER: &str = "john_doe";
/// Name segment used in a clone path when the repository name is empty.
pub const UNKNOWN_NAME: &str = "42";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TimestampError {
    #[error("invalid RFC3339 timestamp `{raw}`: {reason}")]
    Parse { raw: String, reason: String },
    #[error("timestamp out of range: {0}")]
    OutOfRange(String),
}

/// The four entity kinds a snapshot directory can hold.
///
/// The directory base name selects the kind, so the names are part of the
/// input contract.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Users,
    OrgMembers,
    Repos,
    RepoCollaborators,
}

impl EntityKind {
    pub const ALL: [Self; 4] = [Self::Users, Self::OrgMembers, Self::Repos, Self::RepoCollaborators];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::OrgMembers => "org_members",
            Self::Repos => "repos",
            Self::RepoCollaborators => "repo_collaborators",
        }
    }

    #[must_use]
    pub fn from_dir_name(value: &str) -> Option<Self> {
        match value {
            "users" => Some(Self::Users),
            "org_members" => Some(Self::OrgMembers),
            "repos" => Some(Self::Repos),
            "repo_collaborators" => Some(Self::RepoCollaborators),
            _ => None,
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A UTC instant truncated to whole seconds, kept together with its canonical
/// RFC3339 text so that stored values sort lexically in chronological order.
#[derive(Debug, Clone)]
pub struct Timestamp {
    instant: OffsetDateTime,
    text: String,
}

impl Timestamp {
    /// Parse an RFC3339 timestamp such as `2014-02-01T10:00:00Z`.
    ///
    /// # Errors
    /// Returns an error when the text is not RFC3339 or falls outside years 0..=9999.
    pub fn parse(raw: &str) -> Result<Self, TimestampError> {
        let parsed = OffsetDateTime::parse(raw.trim(), &Rfc3339).map_err(|err| {
            TimestampError::Parse { raw: raw.to_string(), reason: err.to_string() }
        })?;
        Self::from_offset_date_time(parsed)
    }

    /// Build a timestamp from milliseconds since the Unix epoch.
    ///
    /// # Errors
    /// Returns an error when the instant cannot be represented.
    pub fn from_unix_millis(millis: i64) -> Result<Self, TimestampError> {
        Self::from_unix_seconds(millis.div_euclid(1000))
    }

    /// Normalize any offset date-time to UTC whole seconds.
    ///
    /// # Errors
    /// Returns an error when the instant cannot be represented as RFC3339.
    pub fn from_offset_date_time(value: OffsetDateTime) -> Result<Self, TimestampError> {
        Self::from_unix_seconds(value.unix_timestamp())
    }

    fn from_unix_seconds(seconds: i64) -> Result<Self, TimestampError> {
        let instant = OffsetDateTime::from_unix_timestamp(seconds)
            .map_err(|err| TimestampError::OutOfRange(err.to_string()))?;
        let text =
            instant.format(&Rfc3339).map_err(|err| TimestampError::OutOfRange(err.to_string()))?;
        Ok(Self { instant, text })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub fn instant(&self) -> OffsetDateTime {
        self.instant
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.instant == other.instant
    }
}

impl Eq for Timestamp {}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.instant.cmp(&other.instant)
    }
}

impl Hash for Timestamp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.instant.hash(state);
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum AccountKind {
    User,
    Organization,
}

impl AccountKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "User",
            Self::Organization => "Organization",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
pub struct Account {
    #[serde(rename = "id")]
    pub github_id: i64,
    pub login: String,
    #[serde(rename = "type")]
    pub kind: AccountKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub hireable: Option<bool>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub followers: Option<i64>,
    #[serde(default)]
    pub following: Option<i64>,
    #[serde(default, deserialize_with = "decode::optional_timestamp")]
    pub created_at: Option<Timestamp>,
    #[serde(default, deserialize_with = "decode::optional_timestamp")]
    pub updated_at: Option<Timestamp>,
}

impl Account {
    /// Last modification if known, creation otherwise.
    #[must_use]
    pub fn effective_timestamp(&self) -> Option<&Timestamp> {
        self.updated_at.as_ref().or(self.created_at.as_ref())
    }
}

/// Membership of an individual account in an organization, keyed by logins.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
pub struct Membership {
    #[serde(default)]
    pub id: Option<i64>,
    pub login: String,
    pub org: String,
}

#[derive(Debug, Clone, Default, Deserialize, Eq, PartialEq)]
pub struct RepositoryOwner {
    #[serde(default)]
    pub login: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
pub struct Repository {
    #[serde(rename = "id")]
    pub github_id: i64,
    pub name: String,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub homepage: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub master_branch: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
    #[serde(default)]
    pub clone_url: Option<String>,
    #[serde(default)]
    pub fork: Option<bool>,
    #[serde(default)]
    pub forks_count: Option<i64>,
    #[serde(default)]
    pub open_issues_count: Option<i64>,
    #[serde(default)]
    pub stargazers_count: Option<i64>,
    #[serde(default)]
    pub subscribers_count: Option<i64>,
    #[serde(default)]
    pub watchers_count: Option<i64>,
    #[serde(default, alias = "size")]
    pub size_in_kb: Option<i64>,
    #[serde(default, deserialize_with = "decode::optional_timestamp")]
    pub created_at: Option<Timestamp>,
    #[serde(default, deserialize_with = "decode::optional_timestamp")]
    pub updated_at: Option<Timestamp>,
    #[serde(default, deserialize_with = "decode::optional_timestamp")]
    pub pushed_at: Option<Timestamp>,
    #[serde(default)]
    pub owner: Option<RepositoryOwner>,
}

impl Repository {
    #[must_use]
    pub fn owner_login(&self) -> &str {
        self.owner.as_ref().and_then(|owner| owner.login.as_deref()).unwrap_or_default()
    }

    #[must_use]
    pub fn language(&self) -> &str {
        self.language.as_deref().unwrap_or_default()
    }

    /// `owner/name`, used as the natural key of a repository.
    #[must_use]
    pub fn full_name(&self) -> String {
        match self.full_name.as_deref() {
            Some(full_name) if !full_name.is_empty() => full_name.to_string(),
            _ => format!("{}/{}", self.owner_login(), self.name),
        }
    }

    #[must_use]
    pub fn clone_path(&self) -> String {
        clone_path(self.language(), self.owner_login(), &self.name)
    }

    #[must_use]
    pub fn effective_timestamp(&self) -> Option<&Timestamp> {
        self.updated_at.as_ref().or(self.created_at.as_ref())
    }
}

/// Collaboration of an account on a repository, keyed by login and `owner/repo`.
#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
pub struct Collaboration {
    #[serde(default)]
    pub id: Option<i64>,
    pub login: String,
    pub repo: String,
    pub owner: String,
}

impl Collaboration {
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Record {
    Account(Account),
    Membership(Membership),
    Repository(Repository),
    Collaboration(Collaboration),
}

impl Record {
    #[must_use]
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Account(_) => EntityKind::Users,
            Self::Membership(_) => EntityKind::OrgMembers,
            Self::Repository(_) => EntityKind::Repos,
            Self::Collaboration(_) => EntityKind::RepoCollaborators,
        }
    }

    #[must_use]
    pub fn identity(&self) -> ExternalIdentity {
        match self {
            Self::Account(account) => {
                ExternalIdentity::Account { github_id: account.github_id, kind: account.kind }
            }
            Self::Membership(membership) => ExternalIdentity::Membership {
                login: membership.login.clone(),
                org: membership.org.clone(),
            },
            Self::Repository(repository) => {
                ExternalIdentity::Repository { github_id: repository.github_id }
            }
            Self::Collaboration(collaboration) => ExternalIdentity::Collaboration {
                login: collaboration.login.clone(),
                full_name: collaboration.full_name(),
            },
        }
    }

    /// Relations carry no timestamp.
    #[must_use]
    pub fn effective_timestamp(&self) -> Option<&Timestamp> {
        match self {
            Self::Account(account) => account.effective_timestamp(),
            Self::Repository(repository) => repository.effective_timestamp(),
            Self::Membership(_) | Self::Collaboration(_) => None,
        }
    }
}

/// Identifier assigned by the upstream source, numeric or natural key.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum ExternalIdentity {
    Account { github_id: i64, kind: AccountKind },
    Repository { github_id: i64 },
    Membership { login: String, org: String },
    Collaboration { login: String, full_name: String },
}

impl Display for ExternalIdentity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Account { github_id, kind: AccountKind::User } => {
                write!(f, "user github_id={github_id}")
            }
            Self::Account { github_id, kind: AccountKind::Organization } => {
                write!(f, "organization github_id={github_id}")
            }
            Self::Repository { github_id } => write!(f, "repository github_id={github_id}"),
            Self::Membership { login, org } => write!(f, "membership {login} in {org}"),
            Self::Collaboration { login, full_name } => {
                write!(f, "collaboration {login} on {full_name}")
            }
        }
    }
}

#[must_use]
pub fn clone_path(language: &str, owner_login: &str, name: &str) -> String {
    let language = if language.is_empty() { UNKNOWN_LANGUAGE } else { language };
    let owner_login = if owner_login.is_empty() { UNKNOWN_OWNER } else { owner_login };
    let name = if name.is_empty() { UNKNOWN_NAME } else { name };
    format!("{language}/{owner_login}/{name}").to_lowercase()
}

/// Remove embedded NUL bytes, which the store rejects in text columns.
#[must_use]
pub fn strip_nul(value: &str) -> Cow<'_, str> {
    if value.contains('\0') {
        Cow::Owned(value.replace('\0', ""))
    } else {
        Cow::Borrowed(value)
    }
}
