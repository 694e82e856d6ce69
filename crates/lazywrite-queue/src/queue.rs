//! Debounced persistence queue.
//!
//! [`PersisterQueue`] accepts [`WriteItem`]s from any thread and processes
//! them, one at a time and in insertion order, on a single dedicated worker
//! thread.  Bursts of writes are coalesced: the first item of a burst arms a
//! settle timer (`pre_task_delay`), and consecutive items of one drain pass
//! are spaced by `inter_write_delay`.
//!
//! # Worker phases
//!
//! ```text
//!             start_persisting()
//! Stopped  ---------------------->  IdleWaiting  <-----------------+
//!    ^                                   | add_item()               |
//!    |                                   v                          |
//!    |  stop_persisting()            Settling  --(deadline)-->  Draining
//!    +----------------------------  (any phase)   --(flush)-->    |
//!                                                                  |
//!                                          queue empty ------------+
//! ```
//!
//! # Next-write deadline
//!
//! The worker paces itself with a single deadline:
//!
//! - `Idle` -- the queue was observed empty; the next `add_item` arms
//!   `now + pre_task_delay`.
//! - `At(t)` -- do not start the next item before `t`.  Re-armed to
//!   `now + inter_write_delay` before every item of a drain pass.
//! - `Flush` -- drain without delays until the queue is observed empty.
//!   Set by [`PersisterQueue::flush`], by `add_item(_, true)`, and when more
//!   than `max_queue_depth` items are queued.
//!
//! # Locking
//!
//! One mutex guards the queue and the deadline.  A single condition variable
//! wakes both the worker and blocked `flush` callers, so every signal is a
//! `notify_all`.  Listener callbacks and `process()` run without the lock.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{PersisterError, Result};
use crate::item::{MergeableItem, QueueListener, QueuedItem, WriteItem};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Where the worker currently is in its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePhase {
    /// No worker thread is running.
    Stopped,
    /// The worker is parked on an empty queue.
    IdleWaiting,
    /// The worker holds items but waits for the next-write deadline.
    Settling,
    /// The worker is processing an item.
    Draining,
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub phase: QueuePhase,
    /// Items waiting to be processed.
    pub pending: usize,
    /// Items whose `process()` returned `Ok`.
    pub processed: u64,
    /// Items whose `process()` returned an error or panicked.
    pub failed: u64,
    /// Items dropped by [`PersisterQueue::remove_items`].
    pub removed: u64,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextWrite {
    Idle,
    At(Instant),
    Flush,
}

struct State {
    items: VecDeque<QueuedItem>,
    next_write: NextWrite,
    phase: QueuePhase,
    /// A worker thread exists and has not exited yet.
    running: bool,
    /// The worker has been asked to exit.
    shutdown: bool,
    worker_id: Option<ThreadId>,
}

struct Inner {
    config: QueueConfig,
    state: Mutex<State>,
    wakeup: Condvar,
    /// Non-owning registrations, notified in registration order.
    listeners: RwLock<Vec<Weak<dyn QueueListener>>>,
    processed: AtomicU64,
    failed: AtomicU64,
    removed: AtomicU64,
}

// ---------------------------------------------------------------------------
// PersisterQueue
// ---------------------------------------------------------------------------

/// Single-worker write queue with settle and inter-write delays.
///
/// Share it across threads behind an `Arc`.  Dropping the queue stops the
/// worker; items still queued at that point are never processed.
pub struct PersisterQueue {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PersisterQueue {
    /// Create a queue **without** starting the worker.
    ///
    /// Call [`PersisterQueue::start_persisting`] to spawn it.
    pub fn new(config: QueueConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State {
                    items: VecDeque::new(),
                    next_write: NextWrite::Idle,
                    phase: QueuePhase::Stopped,
                    running: false,
                    shutdown: false,
                    worker_id: None,
                }),
                wakeup: Condvar::new(),
                listeners: RwLock::new(Vec::new()),
                processed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                removed: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        })
    }

    /// The configuration this queue was built with.
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Spawn the worker thread.
    ///
    /// A no-op when the worker is already running.  A stopped queue can be
    /// started again; items left behind by the previous stop are picked up.
    ///
    /// Returns [`PersisterError::WorkerReentrancy`] when called from an item
    /// or listener.
    pub fn start_persisting(&self) -> Result<()> {
        self.ensure_off_worker("start_persisting")?;
        let mut worker = self.worker.lock();

        if let Some(handle) = worker.as_ref()
            && !handle.is_finished()
        {
            debug!("persister worker already running");
            return Ok(());
        }
        // A finished handle that nobody stopped means the worker died.
        if let Some(handle) = worker.take()
            && handle.join().is_err()
        {
            warn!("previous persister worker had panicked; restarting");
        }

        {
            let mut state = self.inner.state.lock();
            state.shutdown = false;
            state.running = true;
            state.phase = QueuePhase::IdleWaiting;
        }

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(self.inner.config.thread_name.clone())
            .spawn(move || inner.run());

        match spawned {
            Ok(handle) => {
                *worker = Some(handle);
                Ok(())
            }
            Err(source) => {
                let mut state = self.inner.state.lock();
                state.running = false;
                state.phase = QueuePhase::Stopped;
                Err(PersisterError::Spawn { source })
            }
        }
    }

    /// Ask the worker to exit and wait for it.
    ///
    /// An in-flight `process()` call runs to completion; items still queued
    /// are left in place and not processed.  A no-op when already stopped.
    ///
    /// Returns [`PersisterError::WorkerReentrancy`] when called from an item
    /// or listener.
    pub fn stop_persisting(&self) -> Result<()> {
        // Checked before taking `worker`: a concurrent stop holds that lock
        // while it joins this very thread.
        self.ensure_off_worker("stop_persisting")?;

        // Held across the join so a concurrent start cannot race the exiting
        // worker.
        let mut worker = self.worker.lock();
        let Some(handle) = worker.take() else {
            debug!("persister worker already stopped");
            return Ok(());
        };

        self.inner.request_shutdown();
        handle.join().map_err(|_| PersisterError::WorkerPanicked)
    }

    fn ensure_off_worker(&self, operation: &'static str) -> Result<()> {
        if self.inner.state.lock().worker_id == Some(thread::current().id()) {
            return Err(PersisterError::WorkerReentrancy { operation });
        }
        Ok(())
    }

    /// Whether a worker thread is currently running.
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Current worker phase.
    pub fn phase(&self) -> QueuePhase {
        self.inner.state.lock().phase
    }

    /// Snapshot of the queue's counters.
    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        QueueStats {
            phase: state.phase,
            pending: state.items.len(),
            processed: self.inner.processed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            removed: self.inner.removed.load(Ordering::Relaxed),
        }
    }

    /// Register a listener.
    ///
    /// The queue keeps only a weak reference: once the caller drops its last
    /// `Arc`, the listener is no longer notified.
    pub fn add_listener<L: QueueListener + 'static>(&self, listener: &Arc<L>) {
        let weak = Arc::downgrade(listener) as Weak<dyn QueueListener>;
        let mut listeners = self.inner.listeners.write();
        listeners.retain(|registered| registered.strong_count() > 0);
        listeners.push(weak);
    }

    /// Unregister every registration of `listener`.  Returns whether any
    /// registration was removed.
    pub fn remove_listener<L: QueueListener + 'static>(&self, listener: &Arc<L>) -> bool {
        let target = Arc::as_ptr(listener);
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|registered| !std::ptr::addr_eq(registered.as_ptr(), target));
        listeners.len() != before
    }

    /// Append `item` to the queue and return the queued handle.
    ///
    /// With `flush` set, the current burst is drained without the settle and
    /// inter-write delays.  Otherwise the first item of a burst arms the
    /// settle timer.  Items may be added while the worker is stopped; they
    /// are processed once it starts.
    pub fn add_item<T: WriteItem>(&self, item: T, flush: bool) -> Arc<T> {
        let item = Arc::new(item);
        self.add_shared(Arc::clone(&item), flush);
        item
    }

    /// Same as [`PersisterQueue::add_item`] for an item the caller already
    /// shares.
    pub fn add_shared<T: WriteItem>(&self, item: Arc<T>, flush: bool) {
        let mut state = self.inner.state.lock();
        self.inner.push_locked(&mut state, QueuedItem::new(item), flush);
    }

    /// Most recently added queued item of type `T` accepted by `predicate`.
    ///
    /// `predicate` runs with the queue lock held and must not call back into
    /// the queue.
    pub fn find_last_item<T, P>(&self, predicate: P) -> Option<Arc<T>>
    where
        T: WriteItem,
        P: Fn(&T) -> bool,
    {
        let state = self.inner.state.lock();
        find_last_locked(&state, &predicate)
    }

    /// Drop every queued item of type `T` accepted by `predicate` without
    /// processing it.  Returns the number of items removed.
    ///
    /// An item the worker has already dequeued is not affected.
    pub fn remove_items<T, P>(&self, predicate: P) -> usize
    where
        T: WriteItem,
        P: Fn(&T) -> bool,
    {
        let mut state = self.inner.state.lock();
        let before = state.items.len();
        state.items.retain(|entry| !entry.is_match::<T, P>(&predicate));
        let removed = before - state.items.len();

        if removed > 0 {
            self.inner.removed.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(
                item = std::any::type_name::<T>(),
                removed,
                pending = state.items.len(),
                "write items removed"
            );
            if state.items.is_empty() {
                // Let a settling worker go back to idle and release flushers.
                self.inner.wakeup.notify_all();
            }
        }
        removed
    }

    /// Fold `item` into the last queued `T` that [`MergeableItem::matches`]
    /// it, or queue it if there is none.  Returns the handle that now carries
    /// the write.
    pub fn update_last_or_add_item<T: MergeableItem>(&self, item: T, flush: bool) -> Arc<T> {
        let handle = {
            let mut state = self.inner.state.lock();
            let existing = find_last_locked(&state, &|queued: &T| queued.matches(&item));
            match existing {
                Some(existing) => {
                    existing.update_from(&item);
                    debug!(item = std::any::type_name::<T>(), "queued write item updated");
                    if flush {
                        state.next_write = NextWrite::Flush;
                        self.inner.wakeup.notify_all();
                    }
                    existing
                }
                None => {
                    let item = Arc::new(item);
                    self.inner
                        .push_locked(&mut state, QueuedItem::new(Arc::clone(&item)), flush);
                    item
                }
            }
        };
        self.yield_if_queue_too_deep();
        handle
    }

    /// Yield the calling thread while the queue is draining in flush mode, so
    /// producers give the worker a chance to catch up.
    pub fn yield_if_queue_too_deep(&self) {
        let stall = self.inner.state.lock().next_write == NextWrite::Flush;
        if stall {
            thread::yield_now();
        }
    }

    /// Drain the queue now, without delays, and block until the worker has
    /// observed it empty.
    ///
    /// Items added by other threads while the flush is in progress are
    /// drained before this returns.
    pub fn flush(&self) -> Result<()> {
        self.inner.flush()
    }

    /// [`PersisterQueue::flush`] for async callers; the wait happens on
    /// tokio's blocking pool.
    pub async fn flush_async(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.flush())
            .await
            .map_err(|e| PersisterError::Internal(format!("flush task failed: {e}")))?
    }
}

impl Drop for PersisterQueue {
    fn drop(&mut self) {
        match self.stop_persisting() {
            Ok(()) => {}
            // Dropped from inside an item or listener: the worker exits on
            // its own once the current call returns.
            Err(PersisterError::WorkerReentrancy { .. }) => self.inner.request_shutdown(),
            Err(err) => warn!(error = %err, "persister worker did not stop cleanly"),
        }
    }
}

impl std::fmt::Debug for PersisterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersisterQueue")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish()
    }
}

fn find_last_locked<T, P>(state: &State, predicate: &P) -> Option<Arc<T>>
where
    T: WriteItem,
    P: Fn(&T) -> bool + ?Sized,
{
    state
        .items
        .iter()
        .rev()
        .find(|entry| entry.is_match::<T, P>(predicate))
        .and_then(QueuedItem::downcast_arc::<T>)
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

impl Inner {
    fn push_locked(&self, state: &mut State, entry: QueuedItem, flush: bool) {
        let item = entry.type_name();
        state.items.push_back(entry);

        if flush || state.items.len() > self.config.max_queue_depth {
            state.next_write = NextWrite::Flush;
        } else if state.next_write == NextWrite::Idle {
            state.next_write = NextWrite::At(Instant::now() + self.config.pre_task_delay);
        }
        debug!(item, flush, pending = state.items.len(), "write item queued");
        self.wakeup.notify_all();
    }

    fn request_shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.wakeup.notify_all();
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.worker_id == Some(thread::current().id()) {
            return Err(PersisterError::WorkerReentrancy { operation: "flush" });
        }
        if !state.running || state.shutdown {
            return Err(PersisterError::NotRunning);
        }

        debug!(pending = state.items.len(), "flush requested");
        state.next_write = NextWrite::Flush;
        self.wakeup.notify_all();

        while state.next_write == NextWrite::Flush {
            if !state.running || state.shutdown {
                return Err(PersisterError::NotRunning);
            }
            self.wakeup.wait(&mut state);
        }
        debug!("flush complete");
        Ok(())
    }

    /// Worker thread body.
    fn run(&self) {
        let _exit = WorkerExit { inner: self };
        self.state.lock().worker_id = Some(thread::current().id());
        info!(thread = %self.config.thread_name, "persister worker started");

        loop {
            let queue_empty = self.state.lock().items.is_empty();
            self.notify_listeners(queue_empty);

            let Some(entry) = self.next_item() else {
                break;
            };
            self.process(entry);
        }
    }

    /// Block until an item is due, then dequeue it.  `None` means shutdown.
    fn next_item(&self) -> Option<QueuedItem> {
        let mut state = self.state.lock();
        if state.next_write != NextWrite::Flush {
            state.next_write = NextWrite::At(Instant::now() + self.config.inter_write_delay);
        }

        loop {
            if state.shutdown {
                return None;
            }

            if state.items.is_empty() {
                if state.next_write != NextWrite::Idle {
                    state.next_write = NextWrite::Idle;
                    // Flush callers wait for exactly this transition.
                    self.wakeup.notify_all();
                }
                state.phase = QueuePhase::IdleWaiting;
                self.wakeup.wait(&mut state);
                continue;
            }

            if let NextWrite::At(deadline) = state.next_write
                && Instant::now() < deadline
            {
                state.phase = QueuePhase::Settling;
                self.wakeup.wait_until(&mut state, deadline);
                continue;
            }

            state.phase = QueuePhase::Draining;
            return state.items.pop_front();
        }
    }

    fn process(&self, entry: QueuedItem) {
        let item = entry.type_name();
        debug!(item, "processing write item");

        match panic::catch_unwind(AssertUnwindSafe(|| entry.process())) {
            Ok(Ok(())) => {
                self.processed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(err)) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(item, error = %format!("{err:#}"), "write item failed");
            }
            Err(payload) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                error!(item, panic = panic_message(payload.as_ref()), "write item panicked");
            }
        }
    }

    fn notify_listeners(&self, queue_empty: bool) {
        let listeners: Vec<Arc<dyn QueueListener>> = self
            .listeners
            .read()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();

        for listener in listeners {
            let notified = panic::catch_unwind(AssertUnwindSafe(|| {
                listener.on_pre_process_item(queue_empty)
            }));
            if let Err(payload) = notified {
                error!(panic = panic_message(payload.as_ref()), "queue listener panicked");
            }
        }
    }
}

/// Publishes the worker's exit, including an unwinding one.
struct WorkerExit<'a> {
    inner: &'a Inner,
}

impl Drop for WorkerExit<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if !state.items.is_empty() {
            warn!(
                abandoned = state.items.len(),
                "persister worker stopping with items still queued"
            );
        }
        state.running = false;
        state.phase = QueuePhase::Stopped;
        state.worker_id = None;
        self.inner.wakeup.notify_all();
        info!(thread = %self.inner.config.thread_name, "persister worker stopped");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn fast_config() -> QueueConfig {
        QueueConfig::new()
            .with_inter_write_delay(Duration::from_millis(5))
            .with_pre_task_delay(Duration::from_millis(20))
    }

    struct Count(Arc<AtomicU32>);

    impl WriteItem for Count {
        fn process(&self) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn new_rejects_invalid_config() {
        let err = PersisterQueue::new(fast_config().with_max_queue_depth(0)).unwrap_err();
        assert!(matches!(err, PersisterError::InvalidConfig { .. }));
    }

    #[test]
    fn starts_stopped() {
        let queue = PersisterQueue::new(fast_config()).unwrap();
        assert!(!queue.is_running());
        assert_eq!(queue.phase(), QueuePhase::Stopped);
    }

    #[test]
    fn double_start_and_double_stop_are_noops() {
        let queue = PersisterQueue::new(fast_config()).unwrap();
        queue.start_persisting().unwrap();
        queue.start_persisting().unwrap();
        assert!(queue.is_running());

        queue.stop_persisting().unwrap();
        queue.stop_persisting().unwrap();
        assert!(!queue.is_running());
        assert_eq!(queue.phase(), QueuePhase::Stopped);
    }

    #[test]
    fn flush_without_worker_is_not_running() {
        let queue = PersisterQueue::new(fast_config()).unwrap();
        queue.add_item(Count(Arc::new(AtomicU32::new(0))), false);
        assert!(matches!(queue.flush(), Err(PersisterError::NotRunning)));
    }

    #[test]
    fn flush_on_idle_queue_returns() {
        let queue = PersisterQueue::new(fast_config()).unwrap();
        queue.start_persisting().unwrap();
        queue.flush().unwrap();
        assert_eq!(queue.stats().pending, 0);
    }

    #[test]
    fn items_wait_for_start() {
        let counter = Arc::new(AtomicU32::new(0));
        let queue = PersisterQueue::new(fast_config()).unwrap();
        queue.add_item(Count(Arc::clone(&counter)), false);
        queue.add_item(Count(Arc::clone(&counter)), false);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(queue.stats().pending, 2);

        queue.start_persisting().unwrap();
        queue.flush().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn idle_worker_reports_idle_phase() {
        let queue = PersisterQueue::new(fast_config()).unwrap();
        queue.start_persisting().unwrap();
        queue.flush().unwrap();
        assert_eq!(queue.phase(), QueuePhase::IdleWaiting);
    }

    #[test]
    fn stats_count_processed_and_removed() {
        let counter = Arc::new(AtomicU32::new(0));
        let queue = PersisterQueue::new(fast_config()).unwrap();
        queue.add_item(Count(Arc::clone(&counter)), false);
        queue.add_item(Count(Arc::clone(&counter)), false);
        assert_eq!(queue.remove_items(|_: &Count| true), 2);
        queue.add_item(Count(Arc::clone(&counter)), false);

        queue.start_persisting().unwrap();
        queue.flush().unwrap();

        let stats = queue.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.removed, 2);
        assert_eq!(stats.failed, 0);
    }

    #[test]
    fn drop_stops_worker() {
        let queue = PersisterQueue::new(fast_config()).unwrap();
        queue.start_persisting().unwrap();
        let inner = Arc::clone(&queue.inner);
        drop(queue);
        assert!(!inner.state.lock().running);
    }

    #[test]
    fn worker_thread_is_named() {
        let name = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&name);
        let listener = Arc::new(move |_empty: bool| {
            *seen.lock() = thread::current().name().map(str::to_owned);
        });

        let queue = PersisterQueue::new(fast_config().with_thread_name("unit-writer")).unwrap();
        queue.add_listener(&listener);
        queue.start_persisting().unwrap();
        queue.flush().unwrap();

        assert_eq!(name.lock().as_deref(), Some("unit-writer"));
    }

    #[test]
    fn remove_listener_unregisters() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);
        let listener = Arc::new(move |_empty: bool| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let queue = PersisterQueue::new(fast_config()).unwrap();
        queue.add_listener(&listener);
        assert!(queue.remove_listener(&listener));
        assert!(!queue.remove_listener(&listener));

        queue.start_persisting().unwrap();
        queue.flush().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panic_message_extracts_strings() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");

        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");

        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
