use std::path::PathBuf;

use ghimport_core::EntityKind;
use ghimport_store_sqlite::{Outcome, Skip};
use serde::Serialize;

/// Per-record tallies, summed from files up to the whole run.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RecordCounts {
    pub read: u64,
    pub inserted: u64,
    pub updated: u64,
    pub staged: u64,
    /// Stale records, failed lookups and accounts that changed kind.
    pub unchanged: u64,
    pub lookup_failures: u64,
    pub kind_changes: u64,
    /// Framing, decode and write failures.
    pub failed: u64,
}

impl RecordCounts {
    pub fn record(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Inserted => self.inserted += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Staged => self.staged += 1,
            Outcome::Skipped(Skip::Stale) => self.unchanged += 1,
            Outcome::Skipped(Skip::LookupFailed(_)) => {
                self.unchanged += 1;
                self.lookup_failures += 1;
            }
            Outcome::Skipped(Skip::KindChanged { .. }) => {
                self.unchanged += 1;
                self.kind_changes += 1;
            }
        }
    }

    pub fn add(&mut self, other: &Self) {
        self.read += other.read;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.staged += other.staged;
        self.unchanged += other.unchanged;
        self.lookup_failures += other.lookup_failures;
        self.kind_changes += other.kind_changes;
        self.failed += other.failed;
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileSummary {
    pub kind: EntityKind,
    pub path: PathBuf,
    #[serde(flatten)]
    pub counts: RecordCounts,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DirectorySummary {
    pub kind: EntityKind,
    pub path: PathBuf,
    pub committed: Vec<FileSummary>,
    pub failed: Vec<FileFailure>,
    /// Entry names that are not dated snapshot files.
    pub skipped: Vec<String>,
}

impl DirectorySummary {
    #[must_use]
    pub fn counts(&self) -> RecordCounts {
        let mut counts = RecordCounts::default();
        for file in &self.committed {
            counts.add(&file.counts);
        }
        counts
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RunSummary {
    pub files_committed: usize,
    pub files_failed: usize,
    pub snapshots_skipped: usize,
    pub totals: RecordCounts,
    pub directories: Vec<DirectorySummary>,
}

impl RunSummary {
    pub fn push(&mut self, directory: DirectorySummary) {
        self.files_committed += directory.committed.len();
        self.files_failed += directory.failed.len();
        self.snapshots_skipped += directory.skipped.len();
        self.totals.add(&directory.counts());
        self.directories.push(directory);
    }
}
