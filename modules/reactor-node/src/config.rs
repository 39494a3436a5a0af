use std::path::PathBuf;

use anyhow::{Context, Result};
use reactor_engine::{load_config, ReactorConfig};

/// Process configuration loaded from environment variables. Tuning lives in
/// the optional TOML file named by `REACTOR_CONFIG`.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub database_url: String,
    pub config_path: Option<PathBuf>,
    pub workers: Option<usize>,
    pub max_connections: u32,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL is required")?,
            config_path: std::env::var("REACTOR_CONFIG").ok().map(PathBuf::from),
            workers: std::env::var("REACTOR_WORKERS")
                .ok()
                .map(|v| v.parse())
                .transpose()
                .context("REACTOR_WORKERS must be a number")?,
            max_connections: std::env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
        };

        config.log_keys();
        Ok(config)
    }

    /// File config with the env overrides applied.
    pub fn reactor_config(&self) -> Result<ReactorConfig> {
        let mut config = match &self.config_path {
            Some(path) => load_config(path)?,
            None => ReactorConfig::default(),
        };
        if let Some(workers) = self.workers {
            config.executor.worker_count = workers;
        }
        Ok(config)
    }

    fn log_keys(&self) {
        fn preview(val: &str) -> String {
            let head: String = val.chars().take(12).collect();
            format!("{}...({} chars)", head, val.len())
        }

        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: {}", preview(&self.database_url));
        tracing::info!(
            "  REACTOR_CONFIG: {}",
            self.config_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<not set>".to_string())
        );
        tracing::info!(
            "  REACTOR_WORKERS: {}",
            self.workers
                .map(|w| w.to_string())
                .unwrap_or_else(|| "<not set>".to_string())
        );
    }
}
