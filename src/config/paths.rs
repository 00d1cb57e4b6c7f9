//! Canonical locations derived from a [`PipelineConfig`].
//!
//! Single source of truth for table names and directories; stages and the
//! CLI import these instead of joining paths themselves.
//!
//! | Location | Derived as |
//! |----------|------------|
//! | Storage prefix | `{volumes_root}/{catalog}/{schema}/files/` |
//! | Tables | `{tables_root}/{catalog}/{schema}/{table}` |
//! | Checkpoints | `{schema_location_base}/{table}` |

use std::path::PathBuf;

use super::PipelineConfig;

pub const BRONZE_TABLE: &str = "bronze_audio_files";
pub const SILVER_TABLE: &str = "silver_audio_files";
pub const DEAD_LETTER_TABLE: &str = "bronze_audio_files_dead_letter";

/// Directory files land in, with a trailing separator
pub fn storage_prefix(config: &PipelineConfig) -> String {
    let dir = config
        .volumes_root
        .join(&config.catalog)
        .join(&config.schema)
        .join("files");

    let mut prefix = dir.to_string_lossy().into_owned();
    if !prefix.ends_with('/') {
        prefix.push('/');
    }
    prefix
}

/// Parent directory of every table in the schema
pub fn schema_dir(config: &PipelineConfig) -> PathBuf {
    config.tables_root.join(&config.catalog).join(&config.schema)
}

/// Checkpoint directory of the stage that writes `table`
pub fn checkpoint_dir(config: &PipelineConfig, table: &str) -> PathBuf {
    config.schema_location_base.join(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PipelineConfig {
        PipelineConfig::from_yaml(
            "catalog: main\nschema: audio\nschema_location_base: /cp\ntables_root: /t\n",
        )
        .unwrap()
    }

    #[test]
    fn test_derived_locations() {
        let config = config();

        assert_eq!(storage_prefix(&config), "/Volumes/main/audio/files/");
        assert_eq!(schema_dir(&config), PathBuf::from("/t/main/audio"));
        assert_eq!(
            checkpoint_dir(&config, BRONZE_TABLE),
            PathBuf::from("/cp/bronze_audio_files")
        );
    }
}
