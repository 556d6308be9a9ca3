//! Configuration entries and gateway catalog records

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde_json::Value;

use super::ServiceName;

/// A service linked to a terminating or ingress gateway.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayService {
    pub gateway: ServiceName,
    pub service: ServiceName,
    /// Listener port (ingress) the service is exposed on
    pub port: u16,
    pub protocol: String,
    pub hosts: Vec<String>,
    /// TLS origination material for non-mesh backends
    pub ca_file: String,
    pub cert_file: String,
    pub key_file: String,
    pub sni: String,
}

/// Transparent-proxy section of the mesh config entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransparentProxyMeshConfig {
    pub mesh_destinations_only: bool,
}

/// Cluster-wide mesh configuration entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeshConfigEntry {
    pub transparent_proxy: TransparentProxyMeshConfig,
}

/// TLS section of an ingress gateway's config entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayTlsConfig {
    pub enabled: bool,
}

/// An ingress gateway's own config entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngressGatewayEntry {
    pub name: String,
    pub tls: GatewayTlsConfig,
}

/// One named subset within a service resolver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceResolverSubset {
    pub filter: String,
    pub only_passing: bool,
}

/// A service-resolver config entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceResolverEntry {
    pub name: String,
    pub namespace: String,
    pub default_subset: String,
    pub subsets: HashMap<String, ServiceResolverSubset>,
    pub connect_timeout: Duration,
}

impl ServiceResolverEntry {
    /// Name of the resolved service (namespace defaulted)
    pub fn service_name(&self) -> ServiceName {
        ServiceName::new(self.namespace.clone(), self.name.clone())
    }
}

/// Kinds of config entries the manager subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigEntryKind {
    Mesh,
    IngressGateway,
    ServiceResolver,
}

impl fmt::Display for ConfigEntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConfigEntryKind::Mesh => "mesh",
            ConfigEntryKind::IngressGateway => "ingress-gateway",
            ConfigEntryKind::ServiceResolver => "service-resolver",
        };
        f.write_str(s)
    }
}

/// A config entry delivered by the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigEntry {
    Mesh(MeshConfigEntry),
    IngressGateway(IngressGatewayEntry),
    ServiceResolver(ServiceResolverEntry),
}

impl ConfigEntry {
    /// Kind tag of this entry
    pub fn kind(&self) -> ConfigEntryKind {
        match self {
            ConfigEntry::Mesh(_) => ConfigEntryKind::Mesh,
            ConfigEntry::IngressGateway(_) => ConfigEntryKind::IngressGateway,
            ConfigEntry::ServiceResolver(_) => ConfigEntryKind::ServiceResolver,
        }
    }
}

/// Resolved (merged central + local) configuration for one service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceConfigResponse {
    pub proxy_config: HashMap<String, Value>,
}

impl ServiceConfigResponse {
    /// Protocol the service speaks, if centrally configured
    pub fn protocol(&self) -> Option<&str> {
        self.proxy_config.get("protocol").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_entry_kind_tags() {
        assert_eq!(
            ConfigEntry::Mesh(MeshConfigEntry::default()).kind(),
            ConfigEntryKind::Mesh
        );
        assert_eq!(ConfigEntryKind::ServiceResolver.to_string(), "service-resolver");
    }

    #[test]
    fn test_service_config_protocol() {
        let mut proxy_config = HashMap::new();
        proxy_config.insert("protocol".to_string(), json!("http"));
        let resp = ServiceConfigResponse { proxy_config };
        assert_eq!(resp.protocol(), Some("http"));

        assert_eq!(ServiceConfigResponse::default().protocol(), None);
    }

    #[test]
    fn test_resolver_service_name() {
        let resolver = ServiceResolverEntry {
            name: "db".to_string(),
            namespace: String::new(),
            ..Default::default()
        };
        assert_eq!(resolver.service_name(), ServiceName::default_ns("db"));
    }
}
