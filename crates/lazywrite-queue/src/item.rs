//! Write items and queue listeners.
//!
//! A [`WriteItem`] is one deferred persistence operation.  The queue stores
//! items behind an `Arc` so callers can keep a handle to what they enqueued
//! (see [`crate::PersisterQueue::add_item`]) and look items up again by
//! concrete type with [`crate::PersisterQueue::find_last_item`].
//!
//! Items are processed through `&self`.  Anything that must change after an
//! item is queued (see [`MergeableItem::update_from`]) uses interior
//! mutability.

use std::any::Any;
use std::sync::Arc;

/// One pending write.
///
/// `process` runs synchronously on the queue's worker thread.  Returning an
/// error (or panicking) does not stop the queue: the failure is logged,
/// counted in [`crate::QueueStats::failed`], and the drain moves on to the
/// next item.  Failed items are not retried.
pub trait WriteItem: Any + Send + Sync {
    /// Perform the write.
    fn process(&self) -> anyhow::Result<()>;
}

/// A write item that can absorb a newer write of the same target while it is
/// still queued.
///
/// Used by [`crate::PersisterQueue::update_last_or_add_item`] so that a
/// record written many times during one settle window is persisted once,
/// with its latest content.
pub trait MergeableItem: WriteItem {
    /// Whether `other` targets the same thing as `self`.
    fn matches(&self, other: &Self) -> bool;

    /// Replace this item's payload with `other`'s.
    fn update_from(&self, other: &Self);
}

/// Observer of the worker loop.
pub trait QueueListener: Send + Sync {
    /// Called on the worker thread once per loop iteration, right before it
    /// looks for the next item.  `queue_empty` is the queue state at that
    /// moment; `true` means the queue has (probably) been fully persisted.
    ///
    /// Runs without the queue lock held.  Keep it short.
    fn on_pre_process_item(&self, queue_empty: bool);
}

impl<F> QueueListener for F
where
    F: Fn(bool) + Send + Sync,
{
    fn on_pre_process_item(&self, queue_empty: bool) {
        self(queue_empty)
    }
}

/// Type-erased queue entry.
///
/// The same allocation is held twice: once as a [`WriteItem`] for the worker
/// and once as [`Any`] so lookups can filter by concrete type before handing
/// out a typed `Arc`.
pub(crate) struct QueuedItem {
    item: Arc<dyn WriteItem>,
    any: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl QueuedItem {
    pub(crate) fn new<T: WriteItem>(item: Arc<T>) -> Self {
        Self {
            any: Arc::clone(&item) as Arc<dyn Any + Send + Sync>,
            item,
            type_name: std::any::type_name::<T>(),
        }
    }

    pub(crate) fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn process(&self) -> anyhow::Result<()> {
        self.item.process()
    }

    /// Borrow the item as `T` if that is its concrete type.
    pub(crate) fn downcast_ref<T: WriteItem>(&self) -> Option<&T> {
        self.any.downcast_ref::<T>()
    }

    /// Clone out a typed handle if the item's concrete type is `T`.
    pub(crate) fn downcast_arc<T: WriteItem>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.any).downcast::<T>().ok()
    }

    /// Whether the item is a `T` accepted by `predicate`.
    pub(crate) fn is_match<T, P>(&self, predicate: &P) -> bool
    where
        T: WriteItem,
        P: Fn(&T) -> bool + ?Sized,
    {
        self.downcast_ref::<T>().is_some_and(predicate)
    }
}

impl std::fmt::Debug for QueuedItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedItem")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}
