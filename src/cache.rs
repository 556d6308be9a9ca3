//! Subscription interfaces against the external cache/RPC layer
//!
//! The manager never performs blocking queries itself. It registers
//! long-lived subscriptions through [`CacheNotifier`] (and [`Health`] for
//! service-health queries, which use a richer request type) and consumes
//! [`UpdateEvent`]s on a single per-proxy channel. Retries, backoff and
//! deduplication are the cache's concern; cancelling a subscription's token
//! detaches it.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::chain::{CompiledDiscoveryChain, MeshGatewayConfig};
use crate::types::entries::{ConfigEntry, ConfigEntryKind, GatewayService, ServiceConfigResponse};
use crate::types::{
    CaRoots, CheckServiceNode, CheckType, Intentions, IssuedCert, QuerySource, ServiceName,
};
use crate::Error;

/// How often prepared-query results are allowed to go stale before the
/// cache re-polls; prepared queries have no blocking-query support.
pub const PREPARED_QUERY_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Max staleness hint for the datacenter list, which changes rarely.
pub const DATACENTERS_POLL_INTERVAL: Duration = Duration::from_secs(30);

// Correlation ids the assembler dispatches on. Exact literals: watches are
// registered under them and events routed back by them.
pub const ROOTS_WATCH_ID: &str = "roots";
pub const LEAF_WATCH_ID: &str = "leaf";
pub const INTENTIONS_WATCH_ID: &str = "intentions";
pub const INTENTION_UPSTREAMS_WATCH_ID: &str = "intention-upstreams";
pub const MESH_CONFIG_WATCH_ID: &str = "mesh";
pub const SERVICE_LIST_WATCH_ID: &str = "service-list";
pub const DATACENTERS_WATCH_ID: &str = "datacenters";
pub const SERVICE_RESOLVERS_WATCH_ID: &str = "service-resolvers";
pub const FEDERATION_STATE_LIST_GATEWAYS_WATCH_ID: &str = "federation-state-list-mesh-gateways";
pub const CONSUL_SERVER_LIST_WATCH_ID: &str = "consul-server-list";
pub const GATEWAY_SERVICES_WATCH_ID: &str = "gateway-services";
pub const GATEWAY_CONFIG_WATCH_ID: &str = "gateway-config";
pub const SVC_CHECKS_WATCH_PREFIX: &str = "service-http-checks:";
pub const UPSTREAM_WATCH_PREFIX: &str = "upstream:";
pub const PREPARED_QUERY_ID_PREFIX: &str = "prepared_query:";
pub const DISCOVERY_CHAIN_WATCH_PREFIX: &str = "discovery-chain:";
pub const UPSTREAM_TARGET_WATCH_PREFIX: &str = "upstream-target:";
pub const MESH_GATEWAY_WATCH_PREFIX: &str = "mesh-gateway:";
pub const CONNECT_SERVICE_WATCH_PREFIX: &str = "connect-service:";
pub const EXTERNAL_SERVICE_WATCH_PREFIX: &str = "external-service:";
pub const SERVICE_LEAF_WATCH_PREFIX: &str = "service-leaf:";
pub const SERVICE_CONFIG_WATCH_PREFIX: &str = "service-config:";
pub const SERVICE_RESOLVER_WATCH_PREFIX: &str = "service-resolver:";
pub const SERVICE_INTENTIONS_WATCH_PREFIX: &str = "service-intentions:";

/// Remote query type a subscription is registered against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    CaRoots,
    CaLeaf,
    IntentionMatch,
    IntentionUpstreams,
    ConfigEntry,
    ConfigEntryList,
    CatalogServiceList,
    CatalogDatacenters,
    ServiceDump,
    FederationStateListMeshGateways,
    GatewayServices,
    ServiceHttpChecks,
    ResolvedServiceConfig,
    PreparedQuery,
    CompiledDiscoveryChain,
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CacheKind::CaRoots => "connect-ca-roots",
            CacheKind::CaLeaf => "connect-ca-leaf",
            CacheKind::IntentionMatch => "intention-match",
            CacheKind::IntentionUpstreams => "intention-upstreams",
            CacheKind::ConfigEntry => "config-entry",
            CacheKind::ConfigEntryList => "config-entry-list",
            CacheKind::CatalogServiceList => "catalog-service-list",
            CacheKind::CatalogDatacenters => "catalog-datacenters",
            CacheKind::ServiceDump => "service-dump",
            CacheKind::FederationStateListMeshGateways => "federation-state-list-mesh-gateways",
            CacheKind::GatewayServices => "gateway-services",
            CacheKind::ServiceHttpChecks => "service-http-checks",
            CacheKind::ResolvedServiceConfig => "resolved-service-config",
            CacheKind::PreparedQuery => "prepared-query",
            CacheKind::CompiledDiscoveryChain => "compiled-discovery-chain",
        };
        f.write_str(s)
    }
}

/// Request body of a cache subscription.
///
/// Variants mirror the remote query types; the token and source identity
/// ride along so the cache can stamp outbound RPCs.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheRequest {
    CaRoots {
        datacenter: String,
        token: String,
        source: QuerySource,
    },
    LeafCert {
        datacenter: String,
        token: String,
        service: String,
        namespace: String,
        dns_sans: Vec<String>,
    },
    IntentionMatch {
        datacenter: String,
        token: String,
        namespace: String,
        name: String,
    },
    IntentionUpstreams {
        datacenter: String,
        token: String,
        service: String,
        namespace: String,
    },
    ConfigEntry {
        kind: ConfigEntryKind,
        name: String,
        datacenter: String,
        token: String,
        namespace: String,
    },
    ConfigEntryList {
        kind: ConfigEntryKind,
        /// Restrict to one entry name; `None` lists all entries of the kind
        name: Option<String>,
        datacenter: String,
        token: String,
    },
    ServiceList {
        datacenter: String,
        token: String,
        source: QuerySource,
    },
    Datacenters {
        token: String,
        max_age: Duration,
    },
    /// Dump of all instances of one service kind in a datacenter
    ServiceDump {
        datacenter: String,
        token: String,
        kind: crate::types::ServiceKind,
        source: QuerySource,
    },
    FederationStateListMeshGateways {
        datacenter: String,
        token: String,
        source: QuerySource,
    },
    GatewayServices {
        datacenter: String,
        token: String,
        service: String,
        namespace: String,
    },
    ServiceHttpChecks {
        service_id: String,
        namespace: String,
    },
    ResolvedServiceConfig {
        datacenter: String,
        token: String,
        name: String,
        namespace: String,
    },
    PreparedQuery {
        datacenter: String,
        token: String,
        query: String,
        connect: bool,
        source: QuerySource,
        max_age: Duration,
    },
    DiscoveryChain {
        datacenter: String,
        token: String,
        name: String,
        evaluate_in_datacenter: String,
        evaluate_in_namespace: String,
        override_mesh_gateway: MeshGatewayConfig,
        override_protocol: String,
        override_connect_timeout: Duration,
    },
}

/// Request body of a service-health subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthRequest {
    pub datacenter: String,
    pub token: String,
    pub service: String,
    pub namespace: String,
    /// Restrict to mesh-capable instances
    pub connect: bool,
    /// Subset filter expression
    pub filter: Option<String>,
    pub source: QuerySource,
}

/// Payload of one update event.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateResult {
    Roots(CaRoots),
    Leaf(IssuedCert),
    /// Per-entry intention match results; queries here carry one entry
    IntentionMatches(Vec<Intentions>),
    ServiceList(Vec<ServiceName>),
    GatewayServices(Vec<GatewayService>),
    ConfigEntry(Option<ConfigEntry>),
    ConfigEntries(Vec<ConfigEntry>),
    Endpoints(Vec<CheckServiceNode>),
    /// Gateway dumps are a distinct remote result type
    NodesWithGateways(Vec<CheckServiceNode>),
    PreparedQueryResults(Vec<CheckServiceNode>),
    Datacenters(Vec<String>),
    DatacenterGateways(HashMap<String, Vec<CheckServiceNode>>),
    HttpChecks(Vec<CheckType>),
    ServiceConfig(ServiceConfigResponse),
    DiscoveryChain(CompiledDiscoveryChain),
}

impl UpdateResult {
    /// Short payload-variant name for schema-error messages
    pub fn variant_name(&self) -> &'static str {
        match self {
            UpdateResult::Roots(_) => "Roots",
            UpdateResult::Leaf(_) => "Leaf",
            UpdateResult::IntentionMatches(_) => "IntentionMatches",
            UpdateResult::ServiceList(_) => "ServiceList",
            UpdateResult::GatewayServices(_) => "GatewayServices",
            UpdateResult::ConfigEntry(_) => "ConfigEntry",
            UpdateResult::ConfigEntries(_) => "ConfigEntries",
            UpdateResult::Endpoints(_) => "Endpoints",
            UpdateResult::NodesWithGateways(_) => "NodesWithGateways",
            UpdateResult::PreparedQueryResults(_) => "PreparedQueryResults",
            UpdateResult::Datacenters(_) => "Datacenters",
            UpdateResult::DatacenterGateways(_) => "DatacenterGateways",
            UpdateResult::HttpChecks(_) => "HttpChecks",
            UpdateResult::ServiceConfig(_) => "ServiceConfig",
            UpdateResult::DiscoveryChain(_) => "DiscoveryChain",
        }
    }
}

/// Error produced by the cache for one delivery.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("error filling agent cache: {0}")]
pub struct CacheError(pub String);

/// One delivery on a proxy's inbound channel.
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    pub correlation_id: String,
    pub result: Result<UpdateResult, CacheError>,
}

impl UpdateEvent {
    /// A successful delivery
    pub fn ok(correlation_id: impl Into<String>, result: UpdateResult) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            result: Ok(result),
        }
    }

    /// A failed delivery
    pub fn err(correlation_id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            result: Err(CacheError(msg.into())),
        }
    }
}

/// Subscription provider for all non-health query types.
#[async_trait]
pub trait CacheNotifier: Send + Sync {
    /// Register a subscription.
    ///
    /// Events are delivered to `sink` tagged with `correlation_id` until
    /// `shutdown` is cancelled. The provider must stop sending once the
    /// token is cancelled.
    async fn notify(
        &self,
        shutdown: CancellationToken,
        kind: CacheKind,
        request: CacheRequest,
        correlation_id: String,
        sink: mpsc::Sender<UpdateEvent>,
    ) -> Result<(), Error>;
}

/// Subscription provider for service-health queries.
#[async_trait]
pub trait Health: Send + Sync {
    /// Register a health subscription; semantics as [`CacheNotifier::notify`]
    async fn notify(
        &self,
        shutdown: CancellationToken,
        request: HealthRequest,
        correlation_id: String,
        sink: mpsc::Sender<UpdateEvent>,
    ) -> Result<(), Error>;
}

/// Split `"prefix:rest"` into `(prefix, rest)` at the first colon.
pub(crate) fn remove_colon_prefix(s: &str) -> Option<(&str, &str)> {
    s.split_once(':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_colon_prefix() {
        assert_eq!(
            remove_colon_prefix("db.default.dc1.internal:db"),
            Some(("db.default.dc1.internal", "db"))
        );
        assert_eq!(remove_colon_prefix("dc2:web"), Some(("dc2", "web")));
        assert_eq!(remove_colon_prefix("no-colon"), None);
    }

    #[test]
    fn test_update_event_constructors() {
        let ok = UpdateEvent::ok(ROOTS_WATCH_ID, UpdateResult::Roots(CaRoots::default()));
        assert_eq!(ok.correlation_id, "roots");
        assert!(ok.result.is_ok());

        let err = UpdateEvent::err(LEAF_WATCH_ID, "rpc timed out");
        assert!(err.result.unwrap_err().to_string().contains("rpc timed out"));
    }

    #[test]
    fn test_cache_kind_names() {
        assert_eq!(CacheKind::CaRoots.to_string(), "connect-ca-roots");
        assert_eq!(
            CacheKind::FederationStateListMeshGateways.to_string(),
            "federation-state-list-mesh-gateways"
        );
    }
}
