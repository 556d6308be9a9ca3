//! Point-in-time accumulated configuration for one proxy instance
//!
//! A [`ConfigSnapshot`] is mutated exclusively by its proxy's event loop and
//! published to consumers as deep clones once it is valid. Kind-specific
//! bookkeeping lives in a tagged body; watch-cancellation state is kept as
//! opaque [`WatchHandle`] ids so published copies can never cancel anything.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::types::chain::CompiledDiscoveryChain;
use crate::types::entries::{
    GatewayService, MeshConfigEntry, ServiceConfigResponse, ServiceResolverEntry,
};
use crate::types::{
    is_ip_address, CaRoots, CheckServiceNode, CheckType, Intentions, IssuedCert, ProxyConfig,
    ProxyMode, ServiceAddress, ServiceId, ServiceInstance, ServiceKind, ServiceName, Upstream,
    UpstreamDestType, WILDCARD,
};
use crate::watch::WatchHandle;

/// Maps a `(datacenter, node)` pair to the SNI a server is dialed under.
#[derive(Clone)]
pub struct ServerSniFn(pub Arc<dyn Fn(&str, &str) -> String + Send + Sync>);

impl ServerSniFn {
    /// Wrap a naming function
    pub fn new(f: impl Fn(&str, &str) -> String + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Compute the SNI for a server node
    pub fn call(&self, datacenter: &str, node: &str) -> String {
        (self.0)(datacenter, node)
    }
}

impl fmt::Debug for ServerSniFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ServerSniFn(..)")
    }
}

/// Listener identity of an ingress upstream group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IngressListenerKey {
    pub protocol: String,
    pub port: u16,
}

/// Dial addresses for a service whose instances are dialed directly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServicePassthroughAddrs {
    /// SNI the destination presents inside the trust domain
    pub sni: String,
    /// Deduplicated `host:port` dial addresses
    pub addrs: HashSet<String>,
}

/// Watch bookkeeping and endpoint data shared by the kinds that resolve
/// upstreams through discovery chains (connect proxies and ingress
/// gateways).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpstreamsData {
    pub leaf: Option<IssuedCert>,
    /// Compiled chain per upstream id
    pub discovery_chain: HashMap<String, CompiledDiscoveryChain>,
    /// Chain watch per upstream id
    pub watched_discovery_chains: HashMap<String, WatchHandle>,
    /// Target watches per upstream id, keyed by target id
    pub watched_upstreams: HashMap<String, HashMap<String, WatchHandle>>,
    /// Endpoints per upstream id, keyed by target id
    pub watched_upstream_endpoints: HashMap<String, HashMap<String, Vec<CheckServiceNode>>>,
    /// Remote gateway watches per upstream id, keyed by datacenter
    pub watched_gateways: HashMap<String, HashMap<String, WatchHandle>>,
    /// Remote gateway endpoints per upstream id, keyed by datacenter
    pub watched_gateway_endpoints: HashMap<String, HashMap<String, Vec<CheckServiceNode>>>,
    /// Per-upstream configuration, wildcard defaults included
    pub upstream_config: HashMap<String, Upstream>,
    /// Directly-dialed destinations, keyed by destination service
    pub passthrough_upstreams: HashMap<String, ServicePassthroughAddrs>,
}

/// Kind-specific data for a connect proxy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectProxyData {
    pub upstreams: UpstreamsData,
    /// Prepared-query results per upstream id
    pub prepared_query_endpoints: HashMap<String, Vec<CheckServiceNode>>,
    /// HTTP checks of the local destination service
    pub watched_service_checks: HashMap<ServiceId, Vec<CheckType>>,
    pub intentions: Intentions,
    pub intentions_set: bool,
    pub mesh_config: Option<MeshConfigEntry>,
    pub mesh_config_set: bool,
}

/// Kind-specific data for a terminating gateway.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TerminatingGatewayData {
    pub watched_services: HashMap<ServiceName, WatchHandle>,
    pub watched_intentions: HashMap<ServiceName, WatchHandle>,
    pub watched_leaves: HashMap<ServiceName, WatchHandle>,
    pub watched_configs: HashMap<ServiceName, WatchHandle>,
    pub watched_resolvers: HashMap<ServiceName, WatchHandle>,
    pub service_groups: HashMap<ServiceName, Vec<CheckServiceNode>>,
    pub service_leaves: HashMap<ServiceName, IssuedCert>,
    pub service_configs: HashMap<ServiceName, ServiceConfigResponse>,
    pub service_resolvers: HashMap<ServiceName, ServiceResolverEntry>,
    /// A resolver delivery was seen, even if no entry exists
    pub service_resolvers_set: HashSet<ServiceName>,
    pub gateway_services: HashMap<ServiceName, GatewayService>,
    /// The linked-services list arrived at least once
    pub gateway_services_set: bool,
    /// An endpoint delivery was seen, even if it was empty
    pub endpoints_received: HashSet<ServiceName>,
    pub intentions: HashMap<ServiceName, Intentions>,
    /// Instances addressed by DNS name instead of IP
    pub hostname_services: HashMap<ServiceName, Vec<CheckServiceNode>>,
}

/// Kind-specific data for a mesh gateway.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshGatewayData {
    pub watched_services: HashMap<ServiceName, WatchHandle>,
    /// The service list arrived at least once
    pub watched_services_set: bool,
    pub watched_datacenters: HashMap<String, WatchHandle>,
    pub service_groups: HashMap<ServiceName, Vec<CheckServiceNode>>,
    /// Gateways in other datacenters, keyed by datacenter
    pub gateway_groups: HashMap<String, Vec<CheckServiceNode>>,
    pub service_resolvers: HashMap<ServiceName, ServiceResolverEntry>,
    /// Remote gateways addressed by DNS name instead of IP
    pub hostname_datacenters: HashMap<String, Vec<CheckServiceNode>>,
    /// WAN-federated gateways keyed by datacenter
    pub fed_state_gateways: HashMap<String, Vec<CheckServiceNode>>,
    /// Local mesh servers (WAN federation only)
    pub consul_servers: Vec<CheckServiceNode>,
}

/// Kind-specific data for an ingress gateway.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngressGatewayData {
    pub upstreams: UpstreamsData,
    pub tls_enabled: bool,
    pub tls_set: bool,
    pub hosts: Vec<String>,
    pub hosts_set: bool,
    /// Synthesized upstreams grouped by listener
    pub listener_upstreams: HashMap<IngressListenerKey, Vec<Upstream>>,
    /// Active leaf-cert watch, re-issued when SANs change
    pub leaf_cert_watch: Option<WatchHandle>,
}

/// Tagged kind-specific body of a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotData {
    ConnectProxy(ConnectProxyData),
    TerminatingGateway(TerminatingGatewayData),
    MeshGateway(MeshGatewayData),
    IngressGateway(IngressGatewayData),
}

/// Accumulated configuration for one proxy instance.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub kind: ServiceKind,
    pub service: String,
    pub proxy_id: ServiceId,
    pub address: String,
    pub port: u16,
    pub service_meta: HashMap<String, String>,
    pub tagged_addresses: HashMap<String, ServiceAddress>,
    pub proxy: ProxyConfig,
    pub datacenter: String,
    pub server_sni_fn: Option<ServerSniFn>,
    pub intention_default_allow: bool,
    pub roots: Option<CaRoots>,
    pub data: SnapshotData,
}

impl ConfigSnapshot {
    /// Build an empty snapshot for a service instance
    pub fn new(
        instance: &ServiceInstance,
        datacenter: impl Into<String>,
        server_sni_fn: Option<ServerSniFn>,
        intention_default_allow: bool,
    ) -> Self {
        let data = match instance.kind {
            ServiceKind::ConnectProxy => SnapshotData::ConnectProxy(ConnectProxyData::default()),
            ServiceKind::TerminatingGateway => {
                SnapshotData::TerminatingGateway(TerminatingGatewayData::default())
            }
            ServiceKind::MeshGateway => SnapshotData::MeshGateway(MeshGatewayData::default()),
            ServiceKind::IngressGateway => {
                SnapshotData::IngressGateway(IngressGatewayData::default())
            }
            // Manager construction rejects other kinds.
            ServiceKind::Typical => unreachable!("snapshot for non-proxy kind"),
        };

        Self {
            kind: instance.kind,
            service: instance.service.clone(),
            proxy_id: instance.proxy_id.clone(),
            address: instance.address.clone(),
            port: instance.port,
            service_meta: instance.meta.clone(),
            tagged_addresses: instance.tagged_addresses.clone(),
            proxy: instance.proxy.clone(),
            datacenter: datacenter.into(),
            server_sni_fn,
            intention_default_allow,
            roots: None,
            data,
        }
    }

    /// Trust domain of the current root set, if known
    pub fn trust_domain(&self) -> Option<&str> {
        self.roots.as_ref().map(|r| r.trust_domain.as_str())
    }

    pub fn connect_proxy(&self) -> Option<&ConnectProxyData> {
        match &self.data {
            SnapshotData::ConnectProxy(d) => Some(d),
            _ => None,
        }
    }

    pub fn connect_proxy_mut(&mut self) -> Option<&mut ConnectProxyData> {
        match &mut self.data {
            SnapshotData::ConnectProxy(d) => Some(d),
            _ => None,
        }
    }

    pub fn terminating_gateway(&self) -> Option<&TerminatingGatewayData> {
        match &self.data {
            SnapshotData::TerminatingGateway(d) => Some(d),
            _ => None,
        }
    }

    pub fn terminating_gateway_mut(&mut self) -> Option<&mut TerminatingGatewayData> {
        match &mut self.data {
            SnapshotData::TerminatingGateway(d) => Some(d),
            _ => None,
        }
    }

    pub fn mesh_gateway(&self) -> Option<&MeshGatewayData> {
        match &self.data {
            SnapshotData::MeshGateway(d) => Some(d),
            _ => None,
        }
    }

    pub fn mesh_gateway_mut(&mut self) -> Option<&mut MeshGatewayData> {
        match &mut self.data {
            SnapshotData::MeshGateway(d) => Some(d),
            _ => None,
        }
    }

    pub fn ingress_gateway(&self) -> Option<&IngressGatewayData> {
        match &self.data {
            SnapshotData::IngressGateway(d) => Some(d),
            _ => None,
        }
    }

    pub fn ingress_gateway_mut(&mut self) -> Option<&mut IngressGatewayData> {
        match &mut self.data {
            SnapshotData::IngressGateway(d) => Some(d),
            _ => None,
        }
    }

    /// Shared upstream bookkeeping for the kinds that have it
    pub fn upstreams(&self) -> Option<&UpstreamsData> {
        match &self.data {
            SnapshotData::ConnectProxy(d) => Some(&d.upstreams),
            SnapshotData::IngressGateway(d) => Some(&d.upstreams),
            _ => None,
        }
    }

    /// Mutable variant of [`Self::upstreams`]
    pub fn upstreams_mut(&mut self) -> Option<&mut UpstreamsData> {
        match &mut self.data {
            SnapshotData::ConnectProxy(d) => Some(&mut d.upstreams),
            SnapshotData::IngressGateway(d) => Some(&mut d.upstreams),
            _ => None,
        }
    }

    /// The proxy's own leaf certificate, if issued
    pub fn leaf(&self) -> Option<&IssuedCert> {
        self.upstreams().and_then(|u| u.leaf.as_ref())
    }

    /// Whether the snapshot is complete enough to hand to a consumer.
    ///
    /// Once valid, a snapshot stays valid unless a later update logically
    /// invalidates a required field.
    pub fn valid(&self) -> bool {
        if self.roots.is_none() {
            return false;
        }
        match &self.data {
            SnapshotData::ConnectProxy(d) => self.connect_proxy_valid(d),
            SnapshotData::TerminatingGateway(d) => terminating_gateway_valid(d),
            SnapshotData::MeshGateway(d) => d.watched_services_set || !d.service_groups.is_empty(),
            SnapshotData::IngressGateway(d) => ingress_gateway_valid(d),
        }
    }

    fn connect_proxy_valid(&self, d: &ConnectProxyData) -> bool {
        if d.upstreams.leaf.is_none() || !d.intentions_set {
            return false;
        }
        let transparent = self.proxy.mode == ProxyMode::Transparent;
        if transparent && !d.mesh_config_set {
            return false;
        }

        // Every explicitly declared upstream must have resolved far enough
        // to produce endpoints. Wildcard entries only carry defaults and
        // centrally-configured entries are never watched; in transparent
        // mode local-datacenter upstreams resolve through the inferred
        // intention-upstream watches instead.
        for upstream in &self.proxy.upstreams {
            if upstream.destination_name == WILDCARD || upstream.centrally_configured {
                continue;
            }
            let id = upstream.identifier();
            match upstream.destination_type {
                UpstreamDestType::PreparedQuery => {
                    if !d.prepared_query_endpoints.contains_key(&id) {
                        return false;
                    }
                }
                UpstreamDestType::Service => {
                    if transparent
                        && (upstream.datacenter.is_empty()
                            || upstream.datacenter == self.datacenter)
                    {
                        continue;
                    }
                    let Some(chain) = d.upstreams.discovery_chain.get(&id) else {
                        return false;
                    };
                    let Some(first) = chain.targets.first() else {
                        return false;
                    };
                    let resolved = d
                        .upstreams
                        .watched_upstream_endpoints
                        .get(&id)
                        .map(|targets| targets.contains_key(&first.id))
                        .unwrap_or(false);
                    if !resolved {
                        return false;
                    }
                }
            }
        }
        true
    }
}

fn terminating_gateway_valid(d: &TerminatingGatewayData) -> bool {
    // A gateway with zero linked services is complete once the (empty)
    // service list has been seen.
    if !d.gateway_services_set {
        return false;
    }
    d.gateway_services.keys().all(|sn| {
        d.service_leaves.contains_key(sn)
            && d.service_configs.contains_key(sn)
            && d.service_resolvers_set.contains(sn)
            && d.endpoints_received.contains(sn)
    })
}

fn ingress_gateway_valid(d: &IngressGatewayData) -> bool {
    if !d.tls_set || !d.hosts_set || d.upstreams.leaf.is_none() {
        return false;
    }
    d.listener_upstreams
        .values()
        .flatten()
        .all(|u| d.upstreams.discovery_chain.contains_key(&u.identifier()))
}

/// Instances addressed by DNS name instead of IP.
///
/// The downstream proxy cannot mix endpoint discovery and strict-DNS
/// resolution inside one cluster, so when a service has both, only the
/// DNS-named instances are kept and a warning is emitted.
pub fn hostname_endpoints(
    local_datacenter: &str,
    nodes: &[CheckServiceNode],
) -> Vec<CheckServiceNode> {
    let mut has_ip = false;
    let mut hostnames = Vec::new();

    for node in nodes {
        let (address, _) = node.best_address(local_datacenter != node.node.datacenter);
        if is_ip_address(&address) {
            has_ip = true;
            continue;
        }
        hostnames.push(node.clone());
    }

    if has_ip && !hostnames.is_empty() {
        let service = nodes[0].destination_service_name();
        let datacenter = &nodes[0].node.datacenter;
        warn!(
            service = %service,
            datacenter = %datacenter,
            "Service has a mix of hostnames and IP addresses; only hostnames will be used"
        );
    }
    hostnames
}
