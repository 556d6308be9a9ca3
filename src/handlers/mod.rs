//! Kind-specific watch orchestration and snapshot update handling
//!
//! Each proxy kind has a handler with two operations: `initialize` sets up
//! the watches derivable from the registration alone, `handle_update`
//! applies one inbound event to the snapshot and reshapes child watches as
//! new dependencies are discovered. Dispatch is a tagged enum; the common
//! plumbing lives in [`HandlerState`].

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheKind, CacheRequest, HealthRequest, UpdateEvent, ROOTS_WATCH_ID};
use crate::manager::ManagerConfig;
use crate::snapshot::ConfigSnapshot;
use crate::types::{ServiceInstance, ServiceKind};
use crate::watch::{WatchHandle, WatchHandles};
use crate::Error;

mod connect_proxy;
mod ingress_gateway;
mod mesh_gateway;
mod terminating_gateway;
mod upstreams;

pub(crate) use self::connect_proxy::ConnectProxyHandler;
pub(crate) use self::ingress_gateway::IngressGatewayHandler;
pub(crate) use self::mesh_gateway::MeshGatewayHandler;
pub(crate) use self::terminating_gateway::TerminatingGatewayHandler;

/// Shared dependencies of every kind handler.
#[derive(Clone)]
pub(crate) struct HandlerState {
    pub config: ManagerConfig,
    pub instance: ServiceInstance,
    pub events: mpsc::Sender<UpdateEvent>,
    /// Root of the subscription context tree
    pub cancel: CancellationToken,
}

impl HandlerState {
    /// Empty snapshot seeded from the instance record
    pub fn new_snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot::new(
            &self.instance,
            self.config.source.datacenter.clone(),
            self.config.server_sni_fn.clone(),
            self.config.intention_default_allow,
        )
    }

    /// Register a cache subscription under a fresh child token
    pub async fn start_cache_watch(
        &self,
        handles: &mut WatchHandles,
        kind: CacheKind,
        request: CacheRequest,
        correlation_id: impl Into<String>,
    ) -> Result<WatchHandle, Error> {
        let correlation_id = correlation_id.into();
        let token = self.cancel.child_token();
        match self
            .config
            .cache
            .notify(
                token.clone(),
                kind,
                request,
                correlation_id.clone(),
                self.events.clone(),
            )
            .await
        {
            Ok(()) => Ok(handles.register(token)),
            Err(e) => {
                token.cancel();
                Err(Error::watch(format!(
                    "failed to register watch {}: {}",
                    correlation_id, e
                )))
            }
        }
    }

    /// Register a health subscription under a fresh child token
    pub async fn start_health_watch(
        &self,
        handles: &mut WatchHandles,
        request: HealthRequest,
        correlation_id: impl Into<String>,
    ) -> Result<WatchHandle, Error> {
        let correlation_id = correlation_id.into();
        let token = self.cancel.child_token();
        match self
            .config
            .health
            .notify(
                token.clone(),
                request,
                correlation_id.clone(),
                self.events.clone(),
            )
            .await
        {
            Ok(()) => Ok(handles.register(token)),
            Err(e) => {
                token.cancel();
                Err(Error::watch(format!(
                    "failed to register watch {}: {}",
                    correlation_id, e
                )))
            }
        }
    }

    /// Watch the CA roots; every kind subscribes to these
    pub async fn watch_roots(&self, handles: &mut WatchHandles) -> Result<WatchHandle, Error> {
        self.start_cache_watch(
            handles,
            CacheKind::CaRoots,
            CacheRequest::CaRoots {
                datacenter: self.config.source.datacenter.clone(),
                token: self.instance.token.clone(),
                source: self.config.source.clone(),
            },
            ROOTS_WATCH_ID,
        )
        .await
    }
}

/// Kind dispatch for initialize/handle-update.
#[derive(Clone)]
pub(crate) enum KindHandler {
    ConnectProxy(ConnectProxyHandler),
    TerminatingGateway(TerminatingGatewayHandler),
    MeshGateway(MeshGatewayHandler),
    IngressGateway(IngressGatewayHandler),
}

impl KindHandler {
    /// Build the handler for the instance's kind
    pub fn new(state: HandlerState) -> Result<Self, Error> {
        match state.instance.kind {
            ServiceKind::ConnectProxy => Ok(Self::ConnectProxy(ConnectProxyHandler { state })),
            ServiceKind::TerminatingGateway => {
                Ok(Self::TerminatingGateway(TerminatingGatewayHandler { state }))
            }
            ServiceKind::MeshGateway => Ok(Self::MeshGateway(MeshGatewayHandler { state })),
            ServiceKind::IngressGateway => {
                Ok(Self::IngressGateway(IngressGatewayHandler { state }))
            }
            ServiceKind::Typical => Err(Error::config(
                "not a connect-proxy, terminating-gateway, mesh-gateway, or ingress-gateway",
            )),
        }
    }

    /// Set up the watches derivable from the registration alone
    pub async fn initialize(&self, handles: &mut WatchHandles) -> Result<ConfigSnapshot, Error> {
        match self {
            Self::ConnectProxy(h) => h.initialize(handles).await,
            Self::TerminatingGateway(h) => h.initialize(handles).await,
            Self::MeshGateway(h) => h.initialize(handles).await,
            Self::IngressGateway(h) => h.initialize(handles).await,
        }
    }

    /// Apply one inbound event to the snapshot
    pub async fn handle_update(
        &self,
        event: UpdateEvent,
        snap: &mut ConfigSnapshot,
        handles: &mut WatchHandles,
    ) -> Result<(), Error> {
        let result = match event.result {
            Ok(result) => result,
            Err(e) => return Err(Error::watch(e.to_string())),
        };
        match self {
            Self::ConnectProxy(h) => {
                h.handle_update(&event.correlation_id, result, snap, handles)
                    .await
            }
            Self::TerminatingGateway(h) => {
                h.handle_update(&event.correlation_id, result, snap, handles)
                    .await
            }
            Self::MeshGateway(h) => {
                h.handle_update(&event.correlation_id, result, snap, handles)
                    .await
            }
            Self::IngressGateway(h) => {
                h.handle_update(&event.correlation_id, result, snap, handles)
                    .await
            }
        }
    }
}

/// Schema error for a payload that does not match its correlation id.
pub(crate) fn invalid_payload(correlation_id: &str, result: &crate::cache::UpdateResult) -> Error {
    Error::schema(format!(
        "invalid payload type {} for correlation id {:?}",
        result.variant_name(),
        correlation_id
    ))
}
