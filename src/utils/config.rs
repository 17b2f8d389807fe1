// src/utils/config.rs

use log::{debug, info};
use std::env;

/// Worker-level settings read once at startup. Per-task thresholds live on
/// the task rows; these only shape the worker process itself.
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Seconds between polls for a pending task when the queue is empty
    pub worker_poll_secs: u64,
    /// Whether to render progress bars
    pub progress_enabled: bool,
    /// Actor recorded on system-initiated memory mutations
    pub system_actor: String,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            worker_poll_secs: 10,
            progress_enabled: true,
            system_actor: "system".to_string(),
        }
    }
}

impl MatcherConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let config = Self {
            worker_poll_secs: env::var("WORKER_POLL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.worker_poll_secs),
            progress_enabled: env::var("PROGRESS_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(defaults.progress_enabled),
            system_actor: env::var("SYSTEM_ACTOR").unwrap_or(defaults.system_actor),
        };
        debug!("Matcher config: {:?}", config);
        config
    }

    pub fn log_config(&self) {
        info!(
            "Worker config: poll every {}s, progress bars {}",
            self.worker_poll_secs,
            if self.progress_enabled { "on" } else { "off" }
        );
    }
}
