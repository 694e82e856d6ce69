//! lazywrite persistence queue.
//!
//! This crate provides a debounced, single-worker write queue:
//!
//! - **[`queue`]** -- [`PersisterQueue`], the worker loop and its timing
//!   policy: settle delay per burst, spacing between writes, explicit and
//!   depth-triggered flushes.
//! - **[`item`]** -- the [`WriteItem`] and [`MergeableItem`] contracts for
//!   queued work, and [`QueueListener`] for observing the worker.
//! - **[`config`]** -- [`QueueConfig`], loadable from TOML.
//! - **[`error`]** -- [`PersisterError`] via [`thiserror`].
//!
//! Items are processed strictly in insertion order on one named OS thread.
//! Callers never run `process()` themselves; [`PersisterQueue::flush`] only
//! blocks them until the worker is done.

pub mod config;
pub mod error;
pub mod item;
pub mod queue;

// Re-export the most commonly used types at the crate root for convenience.
pub use config::QueueConfig;
pub use error::{PersisterError, Result};
pub use item::{MergeableItem, QueueListener, WriteItem};
pub use queue::{PersisterQueue, QueuePhase, QueueStats};
