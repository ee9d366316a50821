use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use ghimport_core::{EntityKind, SnapshotOrder};
use ghimport_store_sqlite::{ConflictPolicy, ImportStrategy};
use serde::{Deserialize, Serialize};

/// Knobs that change how records are reconciled with the store.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ImportOptions {
    pub strategy: ImportStrategy,
    pub order: SnapshotOrder,
    pub conflict_policy: ConflictPolicy,
    /// Skip existence checks; only safe when the input holds no duplicates.
    pub no_check: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

/// On-disk configuration file.
///
/// Folders are processed in the listed order, and each folder's base name
/// selects its entity kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportConfig {
    #[serde(rename = "ghtorrent_folders")]
    pub source_dirs: Vec<PathBuf>,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub import: ImportOptions,
}

impl ImportConfig {
    /// Read and validate a JSON configuration file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed, lists no
    /// folders, or names a folder that is not an entity kind.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when no folder is listed or a folder name is not an entity kind.
    pub fn validate(&self) -> Result<()> {
        if self.source_dirs.is_empty() {
            return Err(anyhow!("ghtorrent_folders must list at least one folder"));
        }
        for dir in &self.source_dirs {
            if entity_kind_for(dir).is_none() {
                return Err(anyhow!(
                    "folder {} must be named one of users, org_members, repos, repo_collaborators",
                    dir.display()
                ));
            }
        }
        Ok(())
    }
}

/// Entity kind selected by a directory's base name.
#[must_use]
pub fn entity_kind_for(dir: &Path) -> Option<EntityKind> {
    dir.file_name().and_then(|name| name.to_str()).and_then(EntityKind::from_dir_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_default_options() -> Result<()> {
        let config: ImportConfig = serde_json::from_str(
            r#"{
                "ghtorrent_folders": ["/data/users", "/data/repos/"],
                "database": { "path": "./ghimport.sqlite3" }
            }"#,
        )?;
        config.validate()?;
        assert_eq!(config.import, ImportOptions::default());
        assert_eq!(config.import.strategy, ImportStrategy::ConstraintToggling);
        assert_eq!(config.import.order, SnapshotOrder::NewestFirst);
        assert_eq!(
            config.source_dirs.iter().filter_map(|dir| entity_kind_for(dir)).collect::<Vec<_>>(),
            vec![EntityKind::Users, EntityKind::Repos]
        );
        Ok(())
    }

    #[test]
    fn parses_explicit_import_options() -> Result<()> {
        let config: ImportConfig = serde_json::from_str(
            r#"{
                "ghtorrent_folders": ["/data/repos"],
                "database": { "path": "db.sqlite3" },
                "import": { "strategy": "staging", "order": "oldest_first", "conflict_policy": "keep_first", "no_check": true }
            }"#,
        )?;
        assert_eq!(
            config.import,
            ImportOptions {
                strategy: ImportStrategy::Staging,
                order: SnapshotOrder::OldestFirst,
                conflict_policy: ConflictPolicy::KeepFirst,
                no_check: true,
            }
        );
        Ok(())
    }

    #[test]
    fn rejects_unknown_folder_names_and_empty_lists() -> Result<()> {
        let mut config: ImportConfig = serde_json::from_str(
            r#"{ "ghtorrent_folders": ["/data/commits"], "database": { "path": "db.sqlite3" } }"#,
        )?;
        assert!(config.validate().is_err());
        config.source_dirs.clear();
        assert!(config.validate().is_err());
        Ok(())
    }

    #[test]
    fn load_reports_missing_file() {
        let err = match ImportConfig::load(Path::new("/nonexistent/ghimport.json")) {
            Err(err) => err,
            Ok(config) => panic!("expected a missing-file error, got {config:?}"),
        };
        assert!(err.to_string().contains("failed to read config file"));
    }
}
