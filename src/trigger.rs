//! Coalescing edge trigger
//!
//! A `Trigger` turns any number of non-blocking signals into at most one
//! pending wakeup for a single consumer. Firing while a previous signal is
//! unobserved collapses into that signal.

use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// One-slot edge trigger with a single consumer.
#[derive(Debug, Default)]
pub struct Trigger {
    notify: Notify,
}

impl Trigger {
    /// Create a new, unfired trigger
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the trigger without blocking.
    ///
    /// If the consumer is not currently waiting, a single permit is stored;
    /// repeated fires before the next observation count as one.
    pub fn trigger(&self) {
        self.notify.notify_one();
    }

    /// Readiness future that resolves once the trigger has fired.
    ///
    /// Observing readiness consumes the stored permit.
    pub fn wait(&self) -> Notified<'_> {
        self.notify.notified()
    }
}
