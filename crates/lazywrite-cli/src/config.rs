//! Top-level configuration file for the `lazywrite` binary.
//!
//! ```toml
//! log_level = "info"
//!
//! [queue]
//! inter_write_delay_ms = 500
//! pre_task_delay_ms = 3000
//! max_queue_depth = 6
//! thread_name = "lazywrite-writer"
//! ```
//!
//! Every key is optional.  `RUST_LOG` takes precedence over `log_level`.

use std::path::Path;

use anyhow::{Context, Result};
use lazywrite_queue::QueueConfig;
use serde::{Deserialize, Serialize};

/// Default log filter when neither the file nor `RUST_LOG` sets one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LazywriteConfig {
    /// `tracing` filter directive, e.g. `"debug"` or `"lazywrite_queue=debug"`.
    pub log_level: String,
    pub queue: QueueConfig,
}

impl Default for LazywriteConfig {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            queue: QueueConfig::default(),
        }
    }
}

impl LazywriteConfig {
    /// Load from `path`, or fall back to defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("failed to parse TOML")?;
        if config.log_level.trim().is_empty() {
            anyhow::bail!("`log_level` must not be empty");
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to render config as TOML")
    }
}
