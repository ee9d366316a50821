//! Structured events emitted by the importer.
//!
//! The importer never formats log lines itself; an [`ImportObserver`] decides
//! what to do with each event.

use std::path::PathBuf;

use ghimport_core::EntityKind;
use tracing::Level;

use crate::summary::{RecordCounts, RunSummary};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportEvent {
    RunStarted {
        directories: usize,
    },
    RunFinished {
        files_committed: usize,
        files_failed: usize,
        totals: RecordCounts,
    },
    SnapshotSkipped {
        directory: PathBuf,
        name: String,
    },
    FileStarted {
        kind: EntityKind,
        path: PathBuf,
    },
    RecordApplied {
        kind: EntityKind,
        index: u64,
        identity: String,
        outcome: &'static str,
    },
    LookupFailed {
        kind: EntityKind,
        path: PathBuf,
        index: u64,
        identity: String,
        message: String,
    },
    KindChanged {
        kind: EntityKind,
        path: PathBuf,
        index: u64,
        identity: String,
        message: String,
    },
    RecordFailed {
        kind: EntityKind,
        path: PathBuf,
        index: u64,
        error: String,
    },
    FileCommitted {
        kind: EntityKind,
        path: PathBuf,
        counts: RecordCounts,
    },
    FileFailed {
        kind: EntityKind,
        path: PathBuf,
        error: String,
    },
}

impl ImportEvent {
    #[must_use]
    pub fn level(&self) -> Level {
        match self {
            Self::RunStarted { .. }
            | Self::RunFinished { .. }
            | Self::SnapshotSkipped { .. }
            | Self::FileStarted { .. }
            | Self::FileCommitted { .. } => Level::INFO,
            Self::RecordApplied { .. } => Level::DEBUG,
            Self::LookupFailed { .. } | Self::KindChanged { .. } | Self::RecordFailed { .. } => {
                Level::WARN
            }
            Self::FileFailed { .. } => Level::ERROR,
        }
    }

    pub(crate) fn run_finished(summary: &RunSummary) -> Self {
        Self::RunFinished {
            files_committed: summary.files_committed,
            files_failed: summary.files_failed,
            totals: summary.totals,
        }
    }
}

pub trait ImportObserver {
    fn observe(&mut self, event: ImportEvent);
}

/// Collects events in memory.
impl ImportObserver for Vec<ImportEvent> {
    fn observe(&mut self, event: ImportEvent) {
        self.push(event);
    }
}

impl<O: ImportObserver + ?Sized> ImportObserver for &mut O {
    fn observe(&mut self, event: ImportEvent) {
        (**self).observe(event);
    }
}

/// Forwards events to the installed `tracing` subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ImportObserver for TracingObserver {
    fn observe(&mut self, event: ImportEvent) {
        match event {
            ImportEvent::RunStarted { directories } => {
                tracing::info!(directories, "import run started");
            }
            ImportEvent::RunFinished { files_committed, files_failed, totals } => {
                tracing::info!(
                    files_committed,
                    files_failed,
                    read = totals.read,
                    inserted = totals.inserted,
                    updated = totals.updated,
                    staged = totals.staged,
                    unchanged = totals.unchanged,
                    failed = totals.failed,
                    "import run finished"
                );
            }
            ImportEvent::SnapshotSkipped { directory, name } => {
                tracing::info!(directory = %directory.display(), %name, "skipping non-snapshot entry");
            }
            ImportEvent::FileStarted { kind, path } => {
                tracing::info!(%kind, path = %path.display(), "importing snapshot");
            }
            ImportEvent::RecordApplied { kind, index, identity, outcome } => {
                tracing::debug!(%kind, index, %identity, outcome, "record applied");
            }
            ImportEvent::LookupFailed { kind, path, index, identity, message } => {
                tracing::warn!(
                    %kind,
                    path = %path.display(),
                    index,
                    %identity,
                    %message,
                    "identity lookup failed; record skipped"
                );
            }
            ImportEvent::KindChanged { kind, path, index, identity, message } => {
                tracing::warn!(
                    %kind,
                    path = %path.display(),
                    index,
                    %identity,
                    %message,
                    "account changed kind; record skipped"
                );
            }
            ImportEvent::RecordFailed { kind, path, index, error } => {
                tracing::warn!(%kind, path = %path.display(), index, %error, "record skipped");
            }
            ImportEvent::FileCommitted { kind, path, counts } => {
                tracing::info!(
                    %kind,
                    path = %path.display(),
                    read = counts.read,
                    inserted = counts.inserted,
                    updated = counts.updated,
                    staged = counts.staged,
                    unchanged = counts.unchanged,
                    failed = counts.failed,
                    "snapshot committed"
                );
            }
            ImportEvent::FileFailed { kind, path, error } => {
                tracing::error!(%kind, path = %path.display(), %error, "snapshot rolled back");
            }
        }
    }
}
