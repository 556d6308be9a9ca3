//! Cancellation handles for child subscriptions
//!
//! Snapshot bookkeeping maps need to remember which subscriptions exist, but
//! published snapshot clones must never be able to cancel anything. The
//! event loop therefore owns a handle table mapping opaque ids to
//! cancellation tokens; the snapshot stores only the ids. Cloning a snapshot
//! copies ids, not tokens.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Opaque id of one child subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(u64);

/// Handle table owned by a proxy's event loop.
///
/// Every live child subscription has exactly one entry. Cancelling removes
/// the entry and cancels the subscription's token.
#[derive(Debug, Default)]
pub struct WatchHandles {
    next_id: u64,
    active: HashMap<WatchHandle, CancellationToken>,
}

impl WatchHandles {
    /// Create a new empty handle table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription's token and return its handle
    pub fn register(&mut self, token: CancellationToken) -> WatchHandle {
        let handle = WatchHandle(self.next_id);
        self.next_id += 1;
        self.active.insert(handle, token);
        handle
    }

    /// Cancel a subscription by handle.
    ///
    /// Returns false if the handle is unknown, e.g. stale ids carried by a
    /// snapshot clone.
    pub fn cancel(&mut self, handle: WatchHandle) -> bool {
        match self.active.remove(&handle) {
            Some(token) => {
                debug!(handle = handle.0, "Cancelling watch");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of live subscriptions
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Whether the handle refers to a live subscription
    pub fn is_active(&self, handle: WatchHandle) -> bool {
        self.active.contains_key(&handle)
    }
}
