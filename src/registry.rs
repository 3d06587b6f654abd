//! Per-channel callback registry
//!
//! Reactive predicates over the measurement table are stored here, one
//! ordered list per channel. The ingest loop materialises one
//! callback-evaluation task per registered callback when a subscribed
//! channel receives data; workers then invoke the callback against the
//! *current* table snapshot, which may be newer than the frame that
//! scheduled it. Callbacks that need frame-exact data must capture it
//! themselves.
//!
//! # Handles
//!
//! Registration returns an opaque [`CallbackHandle`] allocated from a
//! monotonic counter. Handles stay valid across removals of other
//! callbacks, unknown handles unregister as a no-op, and clearing a
//! channel is a distinct operation ([`CallbackRegistry::unregister_all`]).
//!
//! # Iteration
//!
//! [`CallbackRegistry::handles`] and callback invocation work on a
//! snapshot copy of the channel's list, so a callback may register or
//! unregister callbacks (itself included) without affecting the cycle
//! that is currently being evaluated; additions take effect on the next
//! cycle.

use crate::dispatch::TaskContext;
use crate::error::Result;
use crate::types::{validate_channel, Snapshot, MAX_CHANNELS};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Opaque identifier for one registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle(u64);

/// Everything a callback can see and act on when it fires.
///
/// Collaborators are reached through `services` rather than captured by the
/// closure, so callbacks hold no owning references back into the service.
pub struct CallbackContext<'a> {
    /// Channel whose data-plane update triggered the evaluation.
    pub channel: usize,
    /// The invoked callback's own handle, for self-unregistration.
    pub handle: CallbackHandle,
    /// Current table snapshot for the channel.
    pub snapshot: &'a Snapshot,
    /// Access to the table, registry, driver and task submission.
    pub services: &'a TaskContext,
}

/// A reactive predicate evaluated on worker threads.
pub type CallbackFn = dyn Fn(&CallbackContext<'_>) + Send + Sync;

struct Entry {
    handle: CallbackHandle,
    callback: Arc<CallbackFn>,
}

/// Ordered callback lists for every channel.
pub struct CallbackRegistry {
    channels: Vec<Mutex<Vec<Entry>>>,
    next_handle: AtomicU64,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRegistry {
    /// Create an empty registry covering every channel.
    pub fn new() -> Self {
        Self {
            channels: (0..MAX_CHANNELS).map(|_| Mutex::new(Vec::new())).collect(),
            next_handle: AtomicU64::new(1),
        }
    }

    fn list(&self, channel: usize) -> Result<&Mutex<Vec<Entry>>> {
        validate_channel(channel)?;
        Ok(&self.channels[channel])
    }

    /// Append a callback to the channel's list and return its handle.
    pub fn register(
        &self,
        channel: usize,
        callback: Box<CallbackFn>,
    ) -> Result<CallbackHandle> {
        let handle = CallbackHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.list(channel)?
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Entry {
                handle,
                callback: Arc::from(callback),
            });
        tracing::trace!(channel, ?handle, "callback registered");
        Ok(handle)
    }

    /// Remove the callback with the given handle. Unknown handles are a no-op.
    pub fn unregister(&self, channel: usize, handle: CallbackHandle) -> Result<()> {
        let mut entries = self
            .list(channel)?
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|entry| entry.handle != handle);
        if entries.len() < before {
            tracing::trace!(channel, ?handle, "callback unregistered");
        }
        Ok(())
    }

    /// Remove every callback for the channel.
    pub fn unregister_all(&self, channel: usize) -> Result<()> {
        let mut entries = self
            .list(channel)?
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let removed = entries.len();
        entries.clear();
        if removed > 0 {
            tracing::trace!(channel, removed, "all callbacks unregistered");
        }
        Ok(())
    }

    /// Number of callbacks currently registered for the channel.
    pub fn len(&self, channel: usize) -> Result<usize> {
        Ok(self
            .list(channel)?
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len())
    }

    /// Whether the channel has no registered callbacks.
    pub fn is_empty(&self, channel: usize) -> Result<bool> {
        Ok(self.len(channel)? == 0)
    }

    /// Snapshot of the channel's handles in registration order.
    ///
    /// The ingest loop uses this to materialise one evaluation task per
    /// registered callback; mutations after the snapshot do not affect the
    /// tasks already scheduled.
    pub fn handles(&self, channel: usize) -> Result<Vec<CallbackHandle>> {
        Ok(self
            .list(channel)?
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| entry.handle)
            .collect())
    }

    /// Look up a callback by handle, if it is still registered.
    ///
    /// The returned `Arc` keeps the callback alive for the invocation even
    /// if it is unregistered concurrently; the lock is not held while the
    /// callback runs.
    pub fn get(&self, channel: usize, handle: CallbackHandle) -> Result<Option<Arc<CallbackFn>>> {
        Ok(self
            .list(channel)?
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|entry| entry.handle == handle)
            .map(|entry| Arc::clone(&entry.callback)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Box<CallbackFn> {
        Box::new(|_cx| {})
    }

    #[test]
    fn test_register_unregister_roundtrip() {
        let registry = CallbackRegistry::new();
        let handle = registry.register(1, noop()).unwrap();
        assert_eq!(registry.len(1).unwrap(), 1);
        registry.unregister(1, handle).unwrap();
        assert_eq!(registry.len(1).unwrap(), 0);
    }

    #[test]
    fn test_handles_stay_valid_across_removals() {
        let registry = CallbackRegistry::new();
        let a = registry.register(0, noop()).unwrap();
        let b = registry.register(0, noop()).unwrap();
        let c = registry.register(0, noop()).unwrap();

        // Removing an earlier registration must not shift later ones.
        registry.unregister(0, a).unwrap();
        registry.unregister(0, b).unwrap();
        assert_eq!(registry.handles(0).unwrap(), vec![c]);
        assert!(registry.get(0, c).unwrap().is_some());
    }

    #[test]
    fn test_unknown_handle_is_noop() {
        let registry = CallbackRegistry::new();
        let handle = registry.register(2, noop()).unwrap();
        registry.unregister(2, handle).unwrap();
        // Second removal of the same handle does nothing.
        registry.unregister(2, handle).unwrap();
        assert_eq!(registry.len(2).unwrap(), 0);
    }

    #[test]
    fn test_unregister_all_clears_channel_only() {
        let registry = CallbackRegistry::new();
        registry.register(0, noop()).unwrap();
        registry.register(0, noop()).unwrap();
        let other = registry.register(1, noop()).unwrap();

        registry.unregister_all(0).unwrap();
        assert!(registry.is_empty(0).unwrap());
        assert_eq!(registry.handles(1).unwrap(), vec![other]);
    }

    #[test]
    fn test_handles_preserve_registration_order() {
        let registry = CallbackRegistry::new();
        let a = registry.register(4, noop()).unwrap();
        let b = registry.register(4, noop()).unwrap();
        let c = registry.register(4, noop()).unwrap();
        assert_eq!(registry.handles(4).unwrap(), vec![a, b, c]);
    }

    #[test]
    fn test_invalid_channel_rejected() {
        let registry = CallbackRegistry::new();
        assert!(registry.register(MAX_CHANNELS, noop()).is_err());
        assert!(registry.handles(MAX_CHANNELS).is_err());
    }
}
