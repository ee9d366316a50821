use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use ghimport_core::{decode_record, select_snapshots, DumpReader, EntityKind, Record};
use ghimport_store_sqlite::{
    relax, restore, IdentityResolver, ImportStrategy, Outcome, Skip, SqliteStore, ToggleError,
    UpsertEngine,
};

pub mod config;
pub mod events;
pub mod summary;

pub use config::{entity_kind_for, DatabaseConfig, ImportConfig, ImportOptions};
pub use events::{ImportEvent, ImportObserver, TracingObserver};
pub use summary::{DirectorySummary, FileFailure, FileSummary, RecordCounts, RunSummary};

/// Errors that abort the whole run.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("{} is not an entity directory (users, org_members, repos, repo_collaborators)", .0.display())]
    UnknownEntityDirectory(PathBuf),
    #[error("failed to list {}: {source}", .path.display())]
    ListDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("staging table already holds {count} repositories; promote or clear them first")]
    StagingNotEmpty { count: i64 },
    #[error("store error: {0:#}")]
    Store(anyhow::Error),
}

/// Errors that abort one snapshot file; its transaction is rolled back.
#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("failed to open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to begin transaction: {0:#}")]
    Begin(anyhow::Error),
    #[error("failed to relax constraints: {0}")]
    Relax(#[source] ToggleError),
    #[error("failed to restore constraints: {0}")]
    Restore(#[source] ToggleError),
    #[error("failed to commit: {0}")]
    Commit(#[source] rusqlite::Error),
    #[error("savepoint failed: {0}")]
    Savepoint(#[source] rusqlite::Error),
}

/// Drives snapshot directories through decoding and the upsert engine, one
/// transaction per snapshot file.
pub struct Importer<'a, O> {
    store: &'a mut SqliteStore,
    engine: UpsertEngine,
    options: ImportOptions,
    observer: O,
}

impl<'a, O: ImportObserver> Importer<'a, O> {
    pub fn new(store: &'a mut SqliteStore, options: ImportOptions, observer: O) -> Self {
        let resolver = IdentityResolver::new(options.conflict_policy, options.no_check);
        let engine = UpsertEngine::new(options.strategy, resolver);
        Self { store, engine, options, observer }
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    /// Import every directory in order.
    ///
    /// All directory names, and for a staging run the staging table, are
    /// checked before any file is touched.
    ///
    /// # Errors
    /// Returns an error for an unknown directory name, an unlistable
    /// directory, a non-empty staging table or a failed store query. Failed
    /// records and files are reported through the observer instead.
    pub fn run(&mut self, dirs: &[PathBuf]) -> Result<RunSummary, ImportError> {
        if let Some(unknown) = dirs.iter().find(|dir| entity_kind_for(dir).is_none()) {
            return Err(ImportError::UnknownEntityDirectory(unknown.clone()));
        }
        let stages_repos = dirs.iter().any(|dir| entity_kind_for(dir) == Some(EntityKind::Repos));
        if self.options.strategy == ImportStrategy::Staging && stages_repos {
            let count = self.store.staged_repository_count().map_err(ImportError::Store)?;
            if count > 0 {
                return Err(ImportError::StagingNotEmpty { count });
            }
        }

        self.observer.observe(ImportEvent::RunStarted { directories: dirs.len() });
        let mut summary = RunSummary::default();
        for dir in dirs {
            summary.push(self.import_directory(dir)?);
        }
        self.observer.observe(ImportEvent::run_finished(&summary));
        Ok(summary)
    }

    /// Import the dated snapshots of one entity directory.
    ///
    /// # Errors
    /// See [`Importer::run`].
    pub fn import_directory(&mut self, dir: &Path) -> Result<DirectorySummary, ImportError> {
        let kind =
            entity_kind_for(dir).ok_or_else(|| ImportError::UnknownEntityDirectory(dir.into()))?;
        let selection = select_snapshots(dir, self.options.order)
            .map_err(|source| ImportError::ListDirectory { path: dir.into(), source })?;

        for name in &selection.skipped {
            self.observer.observe(ImportEvent::SnapshotSkipped {
                directory: dir.into(),
                name: name.clone(),
            });
        }

        let mut summary = DirectorySummary {
            kind,
            path: dir.into(),
            committed: Vec::new(),
            failed: Vec::new(),
            skipped: selection.skipped,
        };
        for snapshot in &selection.snapshots {
            match self.import_file(kind, &snapshot.path) {
                Ok(file) => summary.committed.push(file),
                Err(err) => {
                    let error = err.to_string();
                    self.observer.observe(ImportEvent::FileFailed {
                        kind,
                        path: snapshot.path.clone(),
                        error: error.clone(),
                    });
                    summary.failed.push(FileFailure { path: snapshot.path.clone(), error });
                }
            }
        }
        Ok(summary)
    }

    /// Import one snapshot file inside a single transaction.
    ///
    /// Record-level failures are counted and reported; they never abort the
    /// transaction. Reading stops at the first framing error.
    ///
    /// # Errors
    /// Returns a [`FileError`] when the file cannot be opened or the
    /// transaction cannot be started, relaxed, restored or committed. Nothing
    /// from the file is kept in that case.
    pub fn import_file(&mut self, kind: EntityKind, path: &Path) -> Result<FileSummary, FileError> {
        let file =
            File::open(path).map_err(|source| FileError::Open { path: path.into(), source })?;
        let reader = DumpReader::new(BufReader::new(file));

        let Self { store, engine, observer, .. } = self;
        observer.observe(ImportEvent::FileStarted { kind, path: path.into() });

        let mut tx = store.transaction().map_err(FileError::Begin)?;
        let relaxed = if engine.strategy().relaxes_constraints() {
            Some(relax(&tx, kind).map_err(FileError::Relax)?)
        } else {
            None
        };

        let mut counts = RecordCounts::default();
        let mut index = 0_u64;
        for frame in reader {
            index += 1;
            let bytes = match frame {
                Ok(bytes) => bytes,
                Err(err) => {
                    counts.failed += 1;
                    observer.observe(ImportEvent::RecordFailed {
                        kind,
                        path: path.into(),
                        index,
                        error: err.to_string(),
                    });
                    continue;
                }
            };
            counts.read += 1;

            let record = match decode_record(kind, &bytes) {
                Ok(record) => record,
                Err(err) => {
                    counts.failed += 1;
                    observer.observe(ImportEvent::RecordFailed {
                        kind,
                        path: path.into(),
                        index,
                        error: err.to_string(),
                    });
                    continue;
                }
            };

            let savepoint = tx.savepoint().map_err(FileError::Savepoint)?;
            match engine.apply(&savepoint, &record) {
                Ok(outcome) => {
                    savepoint.commit().map_err(FileError::Savepoint)?;
                    counts.record(&outcome);
                    observer.observe(applied_event(kind, path, index, &record, &outcome));
                }
                Err(err) => {
                    drop(savepoint);
                    counts.failed += 1;
                    observer.observe(ImportEvent::RecordFailed {
                        kind,
                        path: path.into(),
                        index,
                        error: err.to_string(),
                    });
                }
            }
        }

        if let Some(relaxed) = relaxed {
            restore(&tx, relaxed).map_err(FileError::Restore)?;
        }
        tx.commit().map_err(FileError::Commit)?;

        observer.observe(ImportEvent::FileCommitted { kind, path: path.into(), counts });
        Ok(FileSummary { kind, path: path.into(), counts })
    }
}

fn applied_event(
    kind: EntityKind,
    path: &Path,
    index: u64,
    record: &Record,
    outcome: &Outcome,
) -> ImportEvent {
    match outcome {
        Outcome::Skipped(Skip::LookupFailed(message)) => ImportEvent::LookupFailed {
            kind,
            path: path.into(),
            index,
            identity: record.identity().to_string(),
            message: message.clone(),
        },
        Outcome::Skipped(skip @ Skip::KindChanged { .. }) => ImportEvent::KindChanged {
            kind,
            path: path.into(),
            index,
            identity: record.identity().to_string(),
            message: skip.to_string(),
        },
        _ => ImportEvent::RecordApplied {
            kind,
            index,
            identity: record.identity().to_string(),
            outcome: outcome.as_str(),
        },
    }
}
