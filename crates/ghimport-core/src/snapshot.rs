use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::{Date, Month};

/// Snapshot files are named `YYYY-MM-DD.bson`; any other extension is skipped.
pub const SNAPSHOT_EXTENSION: &str = "bson";

/// Order in which dated snapshots of one entity kind are processed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

impl SnapshotOrder {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NewestFirst => "newest_first",
            Self::OldestFirst => "oldest_first",
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Snapshot {
    pub date: Date,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct SnapshotSelection {
    pub snapshots: Vec<Snapshot>,
    /// Entry names that did not match `YYYY-MM-DD.bson`.
    pub skipped: Vec<String>,
}

/// Parse `YYYY-MM-DD.bson` into its calendar date.
#[must_use]
pub fn parse_snapshot_name(file_name: &str) -> Option<Date> {
    let stem = file_name.strip_suffix(SNAPSHOT_EXTENSION)?.strip_suffix('.')?;
    let bytes = stem.as_bytes();
    if bytes.len() != 10 || bytes[4] != b'-' || bytes[7] != b'-' {
        return None;
    }
    let year = parse_digits(&stem[0..4])?;
    let month = parse_digits(&stem[5..7])?;
    let day = parse_digits(&stem[8..10])?;

    let month = Month::try_from(u8::try_from(month).ok()?).ok()?;
    Date::from_calendar_date(i32::try_from(year).ok()?, month, u8::try_from(day).ok()?).ok()
}

fn parse_digits(value: &str) -> Option<u32> {
    if value.bytes().all(|byte| byte.is_ascii_digit()) {
        value.parse().ok()
    } else {
        None
    }
}

/// List `dir` and return its dated snapshot files in the requested order.
///
/// Entries whose file type cannot be read are reported as skipped.
///
/// # Errors
/// Returns an error when the directory or one of its entries cannot be read.
pub fn select_snapshots(dir: &Path, order: SnapshotOrder) -> io::Result<SnapshotSelection> {
    let mut selection = SnapshotSelection::default();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        match parse_snapshot_name(&name) {
            Some(date) if is_regular_file(entry.file_type()) => {
                selection.snapshots.push(Snapshot { date, path: entry.path() });
            }
            _ => selection.skipped.push(name),
        }
    }

    selection.snapshots.sort_by(|left, right| match order {
        SnapshotOrder::NewestFirst => right.date.cmp(&left.date),
        SnapshotOrder::OldestFirst => left.date.cmp(&right.date),
    });
    selection.skipped.sort();
    Ok(selection)
}

fn is_regular_file(file_type: io::Result<fs::FileType>) -> bool {
    file_type.is_ok_and(|file_type| file_type.is_file())
}
