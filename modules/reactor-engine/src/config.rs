use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// TOML-backed reactor tuning. Every field has a default, so an empty file
/// (or no file) is valid.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ReactorConfig {
    pub executor: ExecutorConfig,
    pub write_cache: WriteCacheConfig,
    pub read_models: ReadModelConfig,
    /// Documents of this type host other documents and get processors.
    pub drive_document_type: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    pub worker_count: usize,
    pub max_skip_threshold: u64,
    pub error_history_limit: usize,
    /// Store each operation's resulting scope state alongside it.
    pub record_resulting_state: bool,
    /// How long settled jobs stay queryable before they are pruned.
    pub job_retention_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WriteCacheConfig {
    /// Streams kept in memory before least-recently-used eviction.
    pub max_documents: usize,
    /// Snapshots kept per stream.
    pub ring_buffer_size: usize,
    /// Persist a keyframe every N revisions.
    pub keyframe_interval: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ReadModelConfig {
    /// Rows fetched per page while read models catch up at startup.
    pub catch_up_page_size: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            write_cache: WriteCacheConfig::default(),
            read_models: ReadModelConfig::default(),
            drive_document_type: "powerhouse/document-drive".to_string(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_skip_threshold: 1000,
            error_history_limit: 10,
            record_resulting_state: false,
            job_retention_secs: 3600,
        }
    }
}

impl Default for WriteCacheConfig {
    fn default() -> Self {
        Self {
            max_documents: 1000,
            ring_buffer_size: 10,
            keyframe_interval: 10,
        }
    }
}

impl Default for ReadModelConfig {
    fn default() -> Self {
        Self {
            catch_up_page_size: 500,
        }
    }
}

impl ExecutorConfig {
    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_secs)
    }
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<ReactorConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: ReactorConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[executor]\nworker_count = 8\n\n[write_cache]\nkeyframe_interval = 50").unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.executor.worker_count, 8);
        assert_eq!(config.executor.max_skip_threshold, 1000);
        assert_eq!(config.write_cache.keyframe_interval, 50);
        assert_eq!(config.write_cache.ring_buffer_size, 10);
        assert_eq!(config.drive_document_type, "powerhouse/document-drive");
        assert_eq!(config.read_models.catch_up_page_size, 500);
        assert_eq!(config.executor.job_retention(), Duration::from_secs(3600));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[executor]\nworkers = 8").unwrap();
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = load_config(Path::new("/nonexistent/reactor.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/reactor.toml"));
    }
}
