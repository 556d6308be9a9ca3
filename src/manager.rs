//! Per-proxy configuration manager
//!
//! One [`Manager`] per registered mesh-proxy instance owns the proxy's
//! snapshot and its child subscriptions. The event loop is the snapshot's
//! only mutator; consumers receive deep clones through the outbound channel
//! or the synchronous request channel.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use crate::cache::{CacheNotifier, Health, UpdateEvent};
use crate::handlers::{HandlerState, KindHandler};
use crate::snapshot::{ConfigSnapshot, ServerSniFn};
use crate::types::{copy_proxy_config, DnsConfig, ProxyRegistration, QuerySource, ServiceInstance};
use crate::watch::WatchHandles;
use crate::Error;

/// How long updates are coalesced before a snapshot is delivered.
pub const COALESCE_TIMEOUT: Duration = Duration::from_millis(200);

/// Inbound event capacity: the mandatory watches plus a typical number of
/// upstream watches can all deliver their initial events without
/// back-pressuring the cache.
const EVENT_CHANNEL_CAPACITY: usize = 10;

/// Dependencies and identity shared by every manager on an agent.
#[derive(Clone)]
pub struct ManagerConfig {
    /// Local agent identity stamped on outbound requests
    pub source: QuerySource,
    /// Subscription provider for non-health queries
    pub cache: Arc<dyn CacheNotifier>,
    /// Subscription provider for service-health queries
    pub health: Arc<dyn Health>,
    /// DNS naming used for ingress SAN generation
    pub dns: DnsConfig,
    /// Server SNI naming passed through to downstream rendering
    pub server_sni_fn: Option<ServerSniFn>,
    /// Default intention policy when nothing matches
    pub intention_default_allow: bool,
}

/// Watch orchestrator and snapshot assembler for one proxy instance.
///
/// Identity is fixed at creation; a changed registration means the manager
/// is discarded and a new one created (see [`Manager::changed`]).
pub struct Manager {
    instance: ServiceInstance,
    handler: KindHandler,
    cancel: CancellationToken,
    request_tx: mpsc::Sender<oneshot::Sender<Option<ConfigSnapshot>>>,
    events_rx: Option<mpsc::Receiver<UpdateEvent>>,
    request_rx: Option<mpsc::Receiver<oneshot::Sender<Option<ConfigSnapshot>>>>,
}

impl Manager {
    /// Create a manager for a registration.
    ///
    /// The registration is deep-copied so the registration service may keep
    /// mutating its own record. Fails for kinds without a handler.
    pub fn new(
        registration: &ProxyRegistration,
        token: impl Into<String>,
        config: ManagerConfig,
    ) -> Result<Self, Error> {
        let instance = ServiceInstance::new(registration, token)?;
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (request_tx, request_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let handler = KindHandler::new(HandlerState {
            config,
            instance: instance.clone(),
            events: events_tx,
            cancel: cancel.clone(),
        })?;

        Ok(Self {
            instance,
            handler,
            cancel,
            request_tx,
            events_rx: Some(events_rx),
            request_rx: Some(request_rx),
        })
    }

    /// Register the initial watches and start the event loop.
    ///
    /// One-shot: the returned channel delivers valid snapshots until
    /// [`Manager::close`] and is closed afterwards. A registration failure
    /// cancels any partially registered subscriptions.
    pub async fn watch(&mut self) -> Result<mpsc::Receiver<ConfigSnapshot>, Error> {
        let events_rx = self
            .events_rx
            .take()
            .ok_or_else(|| Error::watch("watch may only be called once"))?;
        let request_rx = self
            .request_rx
            .take()
            .expect("request channel outlives events channel");

        let mut handles = WatchHandles::new();
        let snap = match self.handler.initialize(&mut handles).await {
            Ok(snap) => snap,
            Err(e) => {
                self.cancel.cancel();
                return Err(Error::watch(format!(
                    "watch setup for proxy {} failed: {}",
                    self.instance.proxy_id, e
                )));
            }
        };

        let (snapshot_tx, snapshot_rx) = mpsc::channel(1);
        tokio::spawn(run(
            self.handler.clone(),
            self.cancel.clone(),
            snap,
            handles,
            events_rx,
            request_rx,
            snapshot_tx,
        ));
        Ok(snapshot_rx)
    }

    /// The current snapshot, or `None` while it has not become valid yet.
    pub async fn current_snapshot(&self) -> Option<ConfigSnapshot> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx.send(reply_tx).await.ok()?;
        reply_rx.await.unwrap_or(None)
    }

    /// Whether a registration differs in any field the watches depend on.
    pub fn changed(&self, registration: &ProxyRegistration, token: &str) -> bool {
        let i = &self.instance;
        registration.kind != Some(i.kind)
            || registration.compound_id() != i.proxy_id
            || registration.address != i.address
            || registration.port != i.port
            || copy_proxy_config(registration) != i.proxy
            || token != i.token
    }

    /// Stop all watches and close the snapshot channel; idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The assembler loop: applies events, coalesces deliveries, answers
/// snapshot requests. Exclusive owner of `snap` and `handles`.
async fn run(
    handler: KindHandler,
    cancel: CancellationToken,
    mut snap: ConfigSnapshot,
    mut handles: WatchHandles,
    mut events_rx: mpsc::Receiver<UpdateEvent>,
    mut request_rx: mpsc::Receiver<oneshot::Sender<Option<ConfigSnapshot>>>,
    snapshot_tx: mpsc::Sender<ConfigSnapshot>,
) {
    let mut coalesce: Option<Pin<Box<Sleep>>> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Dropping snapshot_tx closes the outbound channel, which is
                // how consumers learn the manager is gone.
                return;
            }

            Some(event) = events_rx.recv() => {
                let correlation_id = event.correlation_id.clone();
                trace!(id = %correlation_id, "A watch delivered; handling snapshot update");

                if let Err(e) = handler.handle_update(event, &mut snap, &mut handles).await {
                    // Transient cache errors and payload mismatches leave
                    // the snapshot untouched; the next delivery catches up.
                    error!(id = %correlation_id, error = %e, "Failed to handle update from watch");
                    continue;
                }

                if snap.valid() && coalesce.is_none() {
                    // Wait briefly so bursts from other watches land in the
                    // same delivery.
                    coalesce = Some(Box::pin(sleep(COALESCE_TIMEOUT)));
                }
            }

            _ = async {
                match coalesce.as_mut() {
                    Some(timer) => timer.await,
                    None => future::pending().await,
                }
            } => {
                match snapshot_tx.try_send(snap.clone()) {
                    Ok(()) => {
                        trace!("Delivered new snapshot to proxy config watchers");
                        coalesce = None;
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        // A previous snapshot is still unconsumed. Blocking
                        // here could deadlock against a paused consumer, so
                        // retry after another coalesce window instead.
                        trace!("Failed to deliver new snapshot to proxy config watchers");
                        coalesce = Some(Box::pin(sleep(COALESCE_TIMEOUT)));
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        trace!("Snapshot consumer is gone");
                        coalesce = None;
                    }
                }
            }

            Some(reply_tx) = request_rx.recv() => {
                trace!("A proxy config snapshot was requested");
                let response = if snap.valid() {
                    Some(snap.clone())
                } else {
                    trace!("The proxy's config snapshot is not valid yet");
                    None
                };
                let _ = reply_tx.send(response);
            }
        }
    }
}
