//! Anti-entropy synchronization of local agent state
//!
//! A single long-lived loop per agent keeps the local state convergent with
//! the remote authority. Periodic full syncs self-heal; partial syncs push
//! local changes promptly. All cadences are jittered by cluster size so a
//! new server joining does not trigger a cluster-wide stampede.

use std::time::Duration;

use async_trait::async_trait;
use futures::future;
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::trigger::Trigger;
use crate::Error;

/// Max time to wait before a full sync triggered by a new server joining.
pub const SERVER_UP_INTERVAL: Duration = Duration::from_secs(3);

/// Min time to wait before a failed full sync is retried.
pub const RETRY_FAIL_INTERVAL: Duration = Duration::from_secs(15);

/// Cluster size after which sync runs are spread out farther apart.
///
/// The delay factor doubles each time the cluster doubles past this size,
/// so it should stay a power of two.
pub const SCALE_THRESHOLD: usize = 128;

/// The local state being reconciled against the remote authority.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SyncState: Send + Sync {
    /// Push local changes to the remote authority
    async fn sync_changes(&self) -> Result<(), Error>;
    /// Reconcile the full local state with the remote authority
    async fn sync_full(&self) -> Result<(), Error>;
}

/// Computes the stagger applied to the next sync operation.
pub trait Delayer: Send + Sync {
    /// A random duration derived from `base`
    fn jitter(&self, base: Duration) -> Duration;
}

/// Uniform random duration in `[0, duration)`.
pub fn random_stagger(duration: Duration) -> Duration {
    if duration.is_zero() {
        return Duration::ZERO;
    }
    let nanos = rand::thread_rng().gen_range(0..duration.as_nanos());
    Duration::from_nanos(nanos as u64)
}

/// Factor by which the next sync run is delayed to avoid saturating the
/// cluster: log2 scale doubling each time the cluster doubles in size past
/// [`SCALE_THRESHOLD`].
pub fn scale_factor(nodes: usize) -> u32 {
    if nodes <= SCALE_THRESHOLD {
        return 1;
    }
    ((nodes as f64).log2() - (SCALE_THRESHOLD as f64).log2()).ceil() as u32 + 1
}

/// Delayer whose stagger grows with the cluster size.
pub struct ClusterSizeDelayer {
    nodes: Box<dyn Fn() -> usize + Send + Sync>,
}

impl ClusterSizeDelayer {
    /// Create a delayer reading the cluster size from `nodes`
    pub fn new(nodes: impl Fn() -> usize + Send + Sync + 'static) -> Self {
        Self {
            nodes: Box::new(nodes),
        }
    }
}

impl Delayer for ClusterSizeDelayer {
    fn jitter(&self, base: Duration) -> Duration {
        random_stagger(base * scale_factor((self.nodes)()))
    }
}

#[derive(Default)]
struct PauseState {
    count: u32,
    /// Cancelled when the last pause is resumed
    gate: Option<CancellationToken>,
}

/// Internal sentinel: the loop observed shutdown.
struct Shutdown;

/// Background synchronizer for a [`SyncState`].
///
/// The state is synchronized on a regular jittered cadence and on demand
/// when either the local state changed or a new server joined the cluster.
pub struct StateSyncer<S> {
    state: S,
    interval: Duration,
    shutdown: CancellationToken,
    delayer: Box<dyn Delayer>,
    full_trigger: Trigger,
    changes_trigger: Trigger,
    pause: Mutex<PauseState>,
    server_up_interval: Duration,
    retry_fail_interval: Duration,
}

impl<S: SyncState> StateSyncer<S> {
    /// Create a syncer running full syncs every `interval` (plus jitter)
    pub fn new(
        state: S,
        interval: Duration,
        shutdown: CancellationToken,
        delayer: Box<dyn Delayer>,
    ) -> Self {
        Self {
            state,
            interval,
            shutdown,
            delayer,
            full_trigger: Trigger::new(),
            changes_trigger: Trigger::new(),
            pause: Mutex::new(PauseState::default()),
            server_up_interval: SERVER_UP_INTERVAL,
            retry_fail_interval: RETRY_FAIL_INTERVAL,
        }
    }

    /// Long-running synchronization loop; returns on shutdown.
    ///
    /// Performs an initial full sync, then reacts to triggers and the
    /// periodic timer.
    pub async fn run(&self) {
        let mut next_full_sync = None;
        if self
            .full_sync(Duration::ZERO, &mut next_full_sync)
            .await
            .is_err()
        {
            return;
        }
        loop {
            if self.cycle(&mut next_full_sync).await.is_err() {
                return;
            }
        }
    }

    /// Signal that a full sync should run soon (staggered).
    ///
    /// Non-blocking; triggers collapsing before being observed count once.
    pub fn trigger_full(&self) {
        self.full_trigger.trigger();
    }

    /// Signal that local changes should be pushed.
    ///
    /// Non-blocking; triggers collapsing before being observed count once.
    pub fn trigger_changes(&self) {
        self.changes_trigger.trigger();
    }

    /// Temporarily disable sync runs; nestable.
    pub fn pause(&self) {
        let mut pause = self.pause.lock();
        pause.count += 1;
        if pause.gate.is_none() {
            pause.gate = Some(CancellationToken::new());
        }
    }

    /// Whether sync runs are currently disabled
    pub fn is_paused(&self) -> bool {
        self.pause.lock().count != 0
    }

    /// Re-enable sync runs.
    ///
    /// Returns true if this resume released the last pause, in which case a
    /// partial sync is triggered immediately.
    ///
    /// # Panics
    ///
    /// Panics on a resume without a matching pause.
    pub fn resume(&self) -> bool {
        let resumed = {
            let mut pause = self.pause.lock();
            if pause.count == 0 {
                panic!("unbalanced pause/resume");
            }
            pause.count -= 1;
            if pause.count == 0 {
                if let Some(gate) = pause.gate.take() {
                    gate.cancel();
                }
                true
            } else {
                false
            }
        };
        if resumed {
            self.changes_trigger.trigger();
        }
        resumed
    }

    /// Token that is cancelled once the syncer has been resumed, or `None`
    /// if the syncer is not paused.
    pub fn wait_resume(&self) -> Option<CancellationToken> {
        self.pause.lock().gate.clone()
    }

    async fn cycle(&self, next_full_sync: &mut Option<Instant>) -> Result<(), Shutdown> {
        tokio::select! {
            _ = self.full_trigger.wait() => {
                self.full_sync(self.delayer.jitter(self.server_up_interval), next_full_sync)
                    .await
            }
            _ = wait_deadline(*next_full_sync) => {
                self.full_sync(Duration::ZERO, next_full_sync).await
            }
            _ = self.changes_trigger.wait() => {
                if self.is_paused() {
                    return Ok(());
                }
                if let Err(e) = self.state.sync_changes().await {
                    error!(error = %e, "Failed to sync changes");
                }
                Ok(())
            }
            _ = self.shutdown.cancelled() => Err(Shutdown),
        }
    }

    /// Run a full sync after `delay`.
    ///
    /// A zero delay schedules the next periodic run and syncs immediately;
    /// failure (or being paused) converts into a retry delay. While waiting,
    /// a fresh full-sync trigger restarts the stagger and shutdown aborts.
    async fn full_sync(
        &self,
        mut delay: Duration,
        next_full_sync: &mut Option<Instant>,
    ) -> Result<(), Shutdown> {
        loop {
            if delay.is_zero() {
                *next_full_sync =
                    Some(Instant::now() + self.interval + self.delayer.jitter(self.interval));

                if self.is_paused() {
                    delay = self.retry_delay();
                    continue;
                }

                match self.state.sync_full().await {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        error!(error = %e, "Failed to sync remote state");
                        delay = self.retry_delay();
                        continue;
                    }
                }
            }

            tokio::select! {
                _ = sleep(delay) => {
                    delay = Duration::ZERO;
                }
                _ = self.full_trigger.wait() => {
                    delay = self.delayer.jitter(self.server_up_interval);
                }
                _ = self.shutdown.cancelled() => return Err(Shutdown),
            }
        }
    }

    fn retry_delay(&self) -> Duration {
        self.retry_fail_interval + self.delayer.jitter(self.retry_fail_interval)
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => future::pending().await,
    }
}
