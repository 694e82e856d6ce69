//! Queue configuration.
//!
//! [`QueueConfig`] holds the timing policy of a [`crate::PersisterQueue`].
//! On disk it is a TOML table with delays expressed in milliseconds:
//!
//! ```toml
//! inter_write_delay_ms = 500
//! pre_task_delay_ms = 3000
//! max_queue_depth = 6
//! thread_name = "lazywrite-writer"
//! ```
//!
//! Every field is optional in the file; missing fields take the defaults
//! below.  Values are validated when the document is deserialized, so a
//! `QueueConfig` obtained from TOML is always usable.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PersisterError, Result};

/// Default gap between two consecutive writes of one drain pass.
pub const DEFAULT_INTER_WRITE_DELAY: Duration = Duration::from_millis(500);

/// Default settle time after the first item of a burst.
pub const DEFAULT_PRE_TASK_DELAY: Duration = Duration::from_millis(3000);

/// Default queue length above which a burst is flushed without delays.
pub const DEFAULT_MAX_QUEUE_DEPTH: usize = 6;

/// Default name given to the worker thread.
pub const DEFAULT_THREAD_NAME: &str = "lazywrite-writer";

/// Upper bound for either delay.  Keeps worker deadlines representable.
pub const MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Timing policy and worker settings for a persistence queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawQueueConfig", into = "RawQueueConfig")]
pub struct QueueConfig {
    /// Minimum spacing between finishing one item and starting the next one
    /// within a single drain pass.
    ///
    /// Default: **500 ms**.
    pub inter_write_delay: Duration,

    /// Settle time between the first item of a new burst arriving and the
    /// worker starting to drain.  Items added inside this window are
    /// coalesced into the same pass.
    ///
    /// Default: **3 000 ms**.
    pub pre_task_delay: Duration,

    /// When more than this many items are queued, the current burst is
    /// drained without any delays.
    ///
    /// Default: **6**.
    pub max_queue_depth: usize,

    /// Name of the dedicated worker thread.
    ///
    /// Default: **`lazywrite-writer`**.
    pub thread_name: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            inter_write_delay: DEFAULT_INTER_WRITE_DELAY,
            pre_task_delay: DEFAULT_PRE_TASK_DELAY,
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            thread_name: DEFAULT_THREAD_NAME.to_owned(),
        }
    }
}

impl QueueConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from signed millisecond delays, rejecting
    /// negative values.
    pub fn from_millis(inter_write_delay_ms: i64, pre_task_delay_ms: i64) -> Result<Self> {
        Ok(Self {
            inter_write_delay: non_negative_millis("inter_write_delay_ms", inter_write_delay_ms)?,
            pre_task_delay: non_negative_millis("pre_task_delay_ms", pre_task_delay_ms)?,
            ..Self::default()
        })
    }

    /// Set the inter-write delay.
    pub fn with_inter_write_delay(mut self, delay: Duration) -> Self {
        self.inter_write_delay = delay;
        self
    }

    /// Set the pre-task (settle) delay.
    pub fn with_pre_task_delay(mut self, delay: Duration) -> Self {
        self.pre_task_delay = delay;
        self
    }

    /// Set the queue depth that forces a delay-free drain.
    pub fn with_max_queue_depth(mut self, depth: usize) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// Set the worker thread name.
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    /// Check the invariants the worker relies on.
    pub fn validate(&self) -> Result<()> {
        for (field, delay) in [
            ("inter_write_delay_ms", self.inter_write_delay),
            ("pre_task_delay_ms", self.pre_task_delay),
        ] {
            if delay > MAX_DELAY {
                return Err(PersisterError::InvalidConfig {
                    field,
                    reason: format!(
                        "must not exceed {} ms (got {} ms)",
                        MAX_DELAY.as_millis(),
                        delay.as_millis()
                    ),
                });
            }
        }
        if self.max_queue_depth == 0 {
            return Err(PersisterError::InvalidConfig {
                field: "max_queue_depth",
                reason: "must be at least 1".into(),
            });
        }
        if self.thread_name.trim().is_empty() {
            return Err(PersisterError::InvalidConfig {
                field: "thread_name",
                reason: "must not be empty".into(),
            });
        }
        if self.thread_name.contains('\0') {
            return Err(PersisterError::InvalidConfig {
                field: "thread_name",
                reason: "must not contain NUL bytes".into(),
            });
        }
        Ok(())
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        // Validation failures from `TryFrom<RawQueueConfig>` arrive here as
        // custom serde errors and keep their field name in the message.
        toml::from_str(content).map_err(|e| PersisterError::ConfigParse {
            reason: e.to_string(),
        })
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "queue config loaded");
        Ok(config)
    }

    /// Render the configuration as a TOML document.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| PersisterError::Internal(e.to_string()))
    }
}

fn non_negative_millis(field: &'static str, value: i64) -> Result<Duration> {
    u64::try_from(value)
        .map(Duration::from_millis)
        .map_err(|_| PersisterError::InvalidConfig {
            field,
            reason: format!("must not be negative (got {value})"),
        })
}

fn duration_to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// On-disk shape of [`QueueConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawQueueConfig {
    inter_write_delay_ms: i64,
    pre_task_delay_ms: i64,
    max_queue_depth: usize,
    thread_name: String,
}

impl Default for RawQueueConfig {
    fn default() -> Self {
        QueueConfig::default().into()
    }
}

impl TryFrom<RawQueueConfig> for QueueConfig {
    type Error = PersisterError;

    fn try_from(raw: RawQueueConfig) -> Result<Self> {
        let config = Self {
            inter_write_delay: non_negative_millis("inter_write_delay_ms", raw.inter_write_delay_ms)?,
            pre_task_delay: non_negative_millis("pre_task_delay_ms", raw.pre_task_delay_ms)?,
            max_queue_depth: raw.max_queue_depth,
            thread_name: raw.thread_name,
        };
        config.validate()?;
        Ok(config)
    }
}

impl From<QueueConfig> for RawQueueConfig {
    fn from(config: QueueConfig) -> Self {
        Self {
            inter_write_delay_ms: duration_to_millis(config.inter_write_delay),
            pre_task_delay_ms: duration_to_millis(config.pre_task_delay),
            max_queue_depth: config.max_queue_depth,
            thread_name: config.thread_name,
        }
    }
}
