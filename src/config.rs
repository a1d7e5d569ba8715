use crate::error::{EvalError, Result};

/// Engine configuration, environment-driven with sensible defaults.
///
/// Staleness thresholds govern the recovery sweeper: a batch or task that has
/// sat in a transient status longer than its threshold is treated as
/// abandoned by a lost worker and repaired.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Control-plane store (batches, documents, tasks, connections, prompts)
    pub database_url: String,
    /// Content-plane store (encoded document bytes, task result detail)
    pub content_database_url: String,
    /// Maximum number of tasks claimed per dispatch wave
    pub dispatch_wave_size: i64,
    /// Seconds a task may sit PROCESSING before the sweeper re-queues it
    pub task_staleness_secs: i64,
    /// Seconds a batch may sit in a transient status before repair
    pub batch_staleness_secs: i64,
    /// Sweeper wake-up interval in seconds
    pub sweeper_interval_secs: u64,
    /// One-time startup repair of historical malformed content records.
    /// When false the startup scan only counts and reports them.
    pub repair_legacy_padding: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "postgresql://localhost/doceval_development".to_string(),
            content_database_url: "postgresql://localhost/doceval_content_development".to_string(),
            dispatch_wave_size: 10,
            task_staleness_secs: 1800, // 30 minutes
            batch_staleness_secs: 3600,
            sweeper_interval_secs: 300,
            repair_legacy_padding: false,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(db_url) = std::env::var("DATABASE_URL") {
            config.database_url = db_url;
        }

        if let Ok(content_url) = std::env::var("CONTENT_DATABASE_URL") {
            config.content_database_url = content_url;
        } else {
            // Single-database deployments share one physical store
            config.content_database_url = config.database_url.clone();
        }

        if let Ok(wave) = std::env::var("DOCEVAL_DISPATCH_WAVE_SIZE") {
            config.dispatch_wave_size = wave.parse().map_err(|e| {
                EvalError::ConfigurationError(format!("Invalid dispatch_wave_size: {e}"))
            })?;
        }

        if let Ok(secs) = std::env::var("DOCEVAL_TASK_STALENESS_SECS") {
            config.task_staleness_secs = secs.parse().map_err(|e| {
                EvalError::ConfigurationError(format!("Invalid task_staleness_secs: {e}"))
            })?;
        }

        if let Ok(secs) = std::env::var("DOCEVAL_BATCH_STALENESS_SECS") {
            config.batch_staleness_secs = secs.parse().map_err(|e| {
                EvalError::ConfigurationError(format!("Invalid batch_staleness_secs: {e}"))
            })?;
        }

        if let Ok(secs) = std::env::var("DOCEVAL_SWEEPER_INTERVAL_SECS") {
            config.sweeper_interval_secs = secs.parse().map_err(|e| {
                EvalError::ConfigurationError(format!("Invalid sweeper_interval_secs: {e}"))
            })?;
        }

        if let Ok(flag) = std::env::var("DOCEVAL_REPAIR_LEGACY_PADDING") {
            config.repair_legacy_padding = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.dispatch_wave_size, 10);
        assert_eq!(config.task_staleness_secs, 1800);
        assert!(!config.repair_legacy_padding);
    }

    // Single test because the process environment is shared across the
    // parallel test runner
    #[test]
    fn test_from_env() {
        std::env::set_var("DOCEVAL_DISPATCH_WAVE_SIZE", "25");
        std::env::set_var("DOCEVAL_REPAIR_LEGACY_PADDING", "true");
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config.dispatch_wave_size, 25);
        assert!(config.repair_legacy_padding);
        std::env::remove_var("DOCEVAL_DISPATCH_WAVE_SIZE");
        std::env::remove_var("DOCEVAL_REPAIR_LEGACY_PADDING");

        std::env::set_var("DOCEVAL_TASK_STALENESS_SECS", "soon");
        assert!(EngineConfig::from_env().is_err());
        std::env::remove_var("DOCEVAL_TASK_STALENESS_SECS");
    }
}
