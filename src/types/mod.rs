//! Core data model for proxy configuration
//!
//! Identity types, registration records, endpoint data and mesh
//! certificates. Everything here is plain owned data, so `Clone` is a deep
//! copy; snapshot publication relies on that.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

pub mod chain;
pub mod entries;

use self::chain::MeshGatewayConfig;

/// Namespace assumed when a registration or query does not specify one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Wildcard specifier used by upstream defaults.
pub const WILDCARD: &str = "*";

/// Service meta key that opts a mesh gateway into WAN federation.
pub const WAN_FEDERATION_META_KEY: &str = "consul-wan-federation";

/// Name under which mesh servers register themselves in the catalog.
pub const CONSUL_SERVICE_NAME: &str = "consul";

/// Tagged-address key holding an instance's WAN-reachable address.
pub const TAGGED_ADDRESS_WAN: &str = "wan";

/// Kind of a registered service instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    /// A plain service instance with no mesh role
    Typical,
    /// Sidecar proxy in front of a single service instance
    ConnectProxy,
    /// Gateway terminating mesh traffic for non-mesh backends
    TerminatingGateway,
    /// Gateway bridging mesh traffic across network boundaries
    MeshGateway,
    /// Gateway admitting external traffic into the mesh
    IngressGateway,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceKind::Typical => "typical",
            ServiceKind::ConnectProxy => "connect-proxy",
            ServiceKind::TerminatingGateway => "terminating-gateway",
            ServiceKind::MeshGateway => "mesh-gateway",
            ServiceKind::IngressGateway => "ingress-gateway",
        };
        f.write_str(s)
    }
}

/// Compound `(namespace, name)` identity of a logical service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceName {
    pub namespace: String,
    pub name: String,
}

impl ServiceName {
    /// Create a service name, defaulting an empty namespace
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            namespace: if namespace.is_empty() {
                DEFAULT_NAMESPACE.to_string()
            } else {
                namespace
            },
            name: name.into(),
        }
    }

    /// Service name in the default namespace
    pub fn default_ns(name: impl Into<String>) -> Self {
        Self::new(DEFAULT_NAMESPACE, name)
    }

    /// Parse the rendering produced by [`fmt::Display`]
    pub fn parse(s: &str) -> Self {
        match s.split_once('/') {
            Some((ns, name)) => Self::new(ns, name),
            None => Self::default_ns(s),
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace == DEFAULT_NAMESPACE {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Compound `(namespace, id)` identity of one service instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceId {
    pub namespace: String,
    pub id: String,
}

impl ServiceId {
    /// Create a service id, defaulting an empty namespace
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            namespace: if namespace.is_empty() {
                DEFAULT_NAMESPACE.to_string()
            } else {
                namespace
            },
            id: id.into(),
        }
    }

    /// Parse the rendering produced by [`fmt::Display`]
    pub fn parse(s: &str) -> Self {
        match s.split_once('/') {
            Some((ns, id)) => Self::new(ns, id),
            None => Self::new(DEFAULT_NAMESPACE, s),
        }
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace == DEFAULT_NAMESPACE {
            f.write_str(&self.id)
        } else {
            write!(f, "{}/{}", self.namespace, self.id)
        }
    }
}

/// Local agent identity stamped on outbound requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuerySource {
    pub datacenter: String,
    pub node: String,
    pub segment: String,
}

/// DNS naming configuration used for ingress SAN generation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsConfig {
    pub domain: String,
    pub alt_domain: String,
}

/// An `(address, port)` pair attached to a tagged-address key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceAddress {
    pub address: String,
    pub port: u16,
}

/// Deployment mode of a connect proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProxyMode {
    /// Upstreams are declared explicitly on the registration
    #[default]
    Direct,
    /// Upstreams are inferred from intentions
    Transparent,
}

/// Destination type of an upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpstreamDestType {
    #[default]
    Service,
    PreparedQuery,
}

/// A single upstream dependency declared (or synthesized) for a proxy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Upstream {
    pub destination_type: UpstreamDestType,
    pub destination_name: String,
    pub destination_namespace: String,
    pub datacenter: String,
    pub mesh_gateway: MeshGatewayConfig,
    /// Opaque user configuration; only the reduced keys are interpreted
    pub config: HashMap<String, Value>,
    /// Ingress gateways bind each upstream to a local listener port
    pub local_bind_port: Option<u16>,
    pub ingress_hosts: Vec<String>,
    /// Synthetic entries from centralized config get no watches
    pub centrally_configured: bool,
}

impl Upstream {
    /// Stable identifier used as map key and correlation-id segment
    pub fn identifier(&self) -> String {
        match self.destination_type {
            UpstreamDestType::PreparedQuery => {
                format!("prepared_query:{}", self.destination_name)
            }
            UpstreamDestType::Service => {
                ServiceName::new(self.destination_namespace.clone(), self.destination_name.clone())
                    .to_string()
            }
        }
    }

    /// Destination as a service name (namespace defaulted)
    pub fn destination(&self) -> ServiceName {
        ServiceName::new(self.destination_namespace.clone(), self.destination_name.clone())
    }
}

/// Reduced view of an upstream's opaque config.
///
/// Only these keys influence discovery-chain compilation; everything else in
/// the map passes through untouched.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ReducedUpstreamConfig {
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub connect_timeout_ms: u64,
}

impl ReducedUpstreamConfig {
    /// The configured connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Parse the reduced upstream config out of an opaque map.
///
/// Unknown keys are ignored; a value of the wrong shape is an error the
/// caller downgrades to a warning.
pub fn parse_reduced_upstream_config(
    config: &HashMap<String, Value>,
) -> Result<ReducedUpstreamConfig, serde_json::Error> {
    let mut trimmed = serde_json::Map::new();
    for key in ["protocol", "connect_timeout_ms"] {
        if let Some(v) = config.get(key) {
            trimmed.insert(key.to_string(), v.clone());
        }
    }
    serde_json::from_value(Value::Object(trimmed))
}

/// Mesh-specific configuration block of a proxy registration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyConfig {
    pub destination_service_name: String,
    pub destination_service_id: String,
    pub mode: ProxyMode,
    pub mesh_gateway: MeshGatewayConfig,
    pub upstreams: Vec<Upstream>,
    /// Opaque proxy-level user configuration
    pub config: HashMap<String, Value>,
}

/// A local proxy registration as handed over by the registration service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProxyRegistration {
    pub kind: Option<ServiceKind>,
    pub id: String,
    pub service: String,
    pub namespace: String,
    pub address: String,
    pub port: u16,
    pub meta: HashMap<String, String>,
    pub tagged_addresses: HashMap<String, ServiceAddress>,
    pub proxy: ProxyConfig,
}

impl ProxyRegistration {
    /// Compound id of this instance (namespace defaulted)
    pub fn compound_id(&self) -> ServiceId {
        ServiceId::new(self.namespace.clone(), self.id.clone())
    }
}

/// Immutable copy of a registration taken at manager creation.
///
/// The registration service may keep mutating its own record; this copy is
/// what the manager's tasks read afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInstance {
    pub kind: ServiceKind,
    pub service: String,
    pub proxy_id: ServiceId,
    pub address: String,
    pub port: u16,
    pub meta: HashMap<String, String>,
    pub tagged_addresses: HashMap<String, ServiceAddress>,
    pub proxy: ProxyConfig,
    pub token: String,
}

/// Copy a registration's proxy config, defaulting each service upstream's
/// destination namespace to the proxy's own namespace so upstream ids dedup
/// cleanly everywhere downstream.
pub fn copy_proxy_config(registration: &ProxyRegistration) -> ProxyConfig {
    let mut proxy = registration.proxy.clone();
    let ns = if registration.namespace.is_empty() {
        DEFAULT_NAMESPACE.to_string()
    } else {
        registration.namespace.clone()
    };
    for upstream in &mut proxy.upstreams {
        if upstream.destination_type != UpstreamDestType::PreparedQuery
            && upstream.destination_namespace.is_empty()
        {
            upstream.destination_namespace = ns.clone();
        }
    }
    proxy
}

impl ServiceInstance {
    /// Snapshot a registration into an instance record.
    ///
    /// Fails for kinds the manager does not handle.
    pub fn new(
        registration: &ProxyRegistration,
        token: impl Into<String>,
    ) -> Result<Self, crate::Error> {
        let kind = match registration.kind {
            Some(
                k @ (ServiceKind::ConnectProxy
                | ServiceKind::TerminatingGateway
                | ServiceKind::MeshGateway
                | ServiceKind::IngressGateway),
            ) => k,
            _ => {
                return Err(crate::Error::config(
                    "not a connect-proxy, terminating-gateway, mesh-gateway, or ingress-gateway",
                ))
            }
        };

        Ok(Self {
            kind,
            service: registration.service.clone(),
            proxy_id: registration.compound_id(),
            address: registration.address.clone(),
            port: registration.port,
            meta: registration.meta.clone(),
            tagged_addresses: registration.tagged_addresses.clone(),
            proxy: copy_proxy_config(registration),
            token: token.into(),
        })
    }
}

/// A node in the catalog.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub name: String,
    pub datacenter: String,
    pub address: String,
}

/// Proxy-specific attributes of an endpoint's service record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointProxyInfo {
    pub destination_service_name: String,
    pub destination_service_id: String,
    /// Instance may be dialed directly, bypassing discovery
    pub dialed_directly: bool,
}

/// The service half of an endpoint record.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointService {
    pub kind: ServiceKind,
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub address: String,
    pub port: u16,
    pub tagged_addresses: HashMap<String, ServiceAddress>,
    pub proxy: Option<EndpointProxyInfo>,
}

impl Default for EndpointService {
    fn default() -> Self {
        Self {
            kind: ServiceKind::Typical,
            id: String::new(),
            name: String::new(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            address: String::new(),
            port: 0,
            tagged_addresses: HashMap::new(),
            proxy: None,
        }
    }
}

/// Health status of a single check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CheckStatus {
    #[default]
    Passing,
    Warning,
    Critical,
}

/// One health check attached to an endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthCheck {
    pub name: String,
    pub status: CheckStatus,
}

/// One service instance together with its node and health checks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckServiceNode {
    pub node: Node,
    pub service: EndpointService,
    pub checks: Vec<HealthCheck>,
}

impl CheckServiceNode {
    /// Best address to dial this instance.
    ///
    /// The service address overrides the node address; for a remote
    /// datacenter a `wan` tagged address wins over both.
    pub fn best_address(&self, remote: bool) -> (String, u16) {
        if remote {
            if let Some(wan) = self.service.tagged_addresses.get(TAGGED_ADDRESS_WAN) {
                if !wan.address.is_empty() {
                    return (wan.address.clone(), wan.port);
                }
            }
        }
        let address = if self.service.address.is_empty() {
            self.node.address.clone()
        } else {
            self.service.address.clone()
        };
        (address, self.service.port)
    }

    /// Logical service this instance belongs to.
    ///
    /// A connect proxy stands in for its destination, so naming (for SNI and
    /// passthrough bookkeeping) uses the destination's name, which shares
    /// the proxy's namespace.
    pub fn destination_service_name(&self) -> ServiceName {
        let mut name = self.service.name.clone();
        if self.service.kind == ServiceKind::ConnectProxy {
            if let Some(proxy) = &self.service.proxy {
                if !proxy.destination_service_name.is_empty() {
                    name = proxy.destination_service_name.clone();
                } else if !proxy.destination_service_id.is_empty() {
                    name = proxy.destination_service_id.clone();
                }
            }
        }
        ServiceName::new(self.service.namespace.clone(), name)
    }
}

/// Whether an address is a literal IP (as opposed to a DNS name).
pub fn is_ip_address(addr: &str) -> bool {
    addr.parse::<IpAddr>().is_ok()
}

/// A CA root certificate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaRoot {
    pub id: String,
    pub name: String,
    pub root_cert_pem: String,
    pub active: bool,
}

/// The mesh CA root set plus the trust domain they anchor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaRoots {
    pub trust_domain: String,
    pub active_root_id: String,
    pub roots: Vec<CaRoot>,
}

/// A short-lived service identity certificate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IssuedCert {
    pub serial_number: String,
    pub cert_pem: String,
    pub private_key_pem: String,
    pub service: String,
    pub namespace: String,
}

/// Effect of an intention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentionAction {
    Allow,
    Deny,
}

/// Authorization rule for source → destination traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct Intention {
    pub source: ServiceName,
    pub destination: ServiceName,
    pub action: IntentionAction,
    pub precedence: i32,
}

/// Intention match results for one destination, highest precedence first.
pub type Intentions = Vec<Intention>;

/// Definition of an HTTP health check exposed to the data plane.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckType {
    pub check_id: String,
    pub name: String,
    pub http: String,
    pub method: String,
    pub interval: Duration,
    pub timeout: Duration,
}

/// SNI under which a service is addressed inside a trust domain.
pub fn service_sni(name: &str, namespace: &str, datacenter: &str, trust_domain: &str) -> String {
    format!("{}.{}.{}.{}", name, namespace, datacenter, trust_domain)
}
