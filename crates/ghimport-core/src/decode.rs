use bson::Bson;
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};

use crate::{EntityKind, Record, Timestamp};

#[derive(Debug, thiserror::Error)]
#[error("cannot decode {kind} record: {source}")]
pub struct DecodeError {
    pub kind: EntityKind,
    #[source]
    pub source: bson::de::Error,
}

/// Decode one framed document into the record type selected by `kind`.
///
/// Fields outside the mapping are ignored.
///
/// # Errors
/// Returns a [`DecodeError`] when the bytes are not a valid document, a
/// required key is missing, or a field has the wrong type.
pub fn decode_record(kind: EntityKind, bytes: &[u8]) -> Result<Record, DecodeError> {
    match kind {
        EntityKind::Users => from_bytes(kind, bytes).map(Record::Account),
        EntityKind::OrgMembers => from_bytes(kind, bytes).map(Record::Membership),
        EntityKind::Repos => from_bytes(kind, bytes).map(Record::Repository),
        EntityKind::RepoCollaborators => from_bytes(kind, bytes).map(Record::Collaboration),
    }
}

fn from_bytes<T: DeserializeOwned>(kind: EntityKind, bytes: &[u8]) -> Result<T, DecodeError> {
    bson::from_slice(bytes).map_err(|source| DecodeError { kind, source })
}

/// Date field that may be absent, `null`, an empty string, an RFC3339 string
/// or a native datetime.
pub(crate) fn optional_timestamp<'de, D>(deserializer: D) -> Result<Option<Timestamp>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Bson>::deserialize(deserializer)? {
        None | Some(Bson::Null) => Ok(None),
        Some(Bson::String(text)) if text.trim().is_empty() => Ok(None),
        Some(Bson::String(text)) => Timestamp::parse(&text).map(Some).map_err(D::Error::custom),
        Some(Bson::DateTime(value)) => {
            Timestamp::from_unix_millis(value.timestamp_millis()).map(Some).map_err(D::Error::custom)
        }
        Some(other) => Err(D::Error::custom(format!(
            "expected a date string or datetime, found {:?}",
            other.element_type()
        ))),
    }
}
