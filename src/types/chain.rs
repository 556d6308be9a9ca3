//! Compiled discovery chains
//!
//! A discovery chain is the compiled resolution of a logical service name
//! into concrete targets, after resolvers, splitters and routers have been
//! applied by the remote compiler. The manager only consumes chains; it
//! never compiles them.

use std::fmt;

/// How traffic to a target crosses datacenter boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MeshGatewayMode {
    /// Inherit from a wider scope
    #[default]
    Default,
    /// Dial the target directly
    None,
    /// Dial through a gateway in the source datacenter
    Local,
    /// Dial through a gateway in the target's datacenter
    Remote,
}

/// Mesh-gateway preference carried by proxies and upstreams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeshGatewayConfig {
    pub mode: MeshGatewayMode,
}

impl MeshGatewayConfig {
    /// Overlay a more specific config on top of this one.
    ///
    /// The override wins unless it is `Default`.
    pub fn overlay_with(self, over: MeshGatewayConfig) -> MeshGatewayConfig {
        if over.mode != MeshGatewayMode::Default {
            over
        } else {
            self
        }
    }
}

/// One concrete target of a compiled chain.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryTarget {
    /// `<service>.<namespace>.<datacenter>.internal`
    pub id: String,
    pub service: String,
    pub namespace: String,
    pub datacenter: String,
    /// Health filter selecting the subset's instances
    pub subset_filter: String,
    pub mesh_gateway: MeshGatewayConfig,
}

impl DiscoveryTarget {
    /// Create a target for a `(service, namespace, datacenter)` triple
    pub fn new(
        service: impl Into<String>,
        namespace: impl Into<String>,
        datacenter: impl Into<String>,
    ) -> Self {
        let service = service.into();
        let namespace = namespace.into();
        let datacenter = datacenter.into();
        Self {
            id: target_id(&service, &namespace, &datacenter),
            service,
            namespace,
            datacenter,
            subset_filter: String::new(),
            mesh_gateway: MeshGatewayConfig::default(),
        }
    }
}

impl fmt::Display for DiscoveryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Canonical target id for a `(service, namespace, datacenter)` triple.
pub fn target_id(service: &str, namespace: &str, datacenter: &str) -> String {
    format!("{}.{}.{}.internal", service, namespace, datacenter)
}

/// A fully compiled discovery chain for one logical service.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledDiscoveryChain {
    pub service_name: String,
    pub namespace: String,
    pub datacenter: String,
    pub protocol: String,
    pub targets: Vec<DiscoveryTarget>,
}

impl CompiledDiscoveryChain {
    /// Target id of the chain's own `(service, namespace, datacenter)`
    pub fn id(&self) -> String {
        target_id(&self.service_name, &self.namespace, &self.datacenter)
    }

    /// Convenience constructor for a single-target chain
    pub fn single_target(
        service: impl Into<String>,
        namespace: impl Into<String>,
        datacenter: impl Into<String>,
    ) -> Self {
        let service = service.into();
        let namespace = namespace.into();
        let datacenter = datacenter.into();
        Self {
            targets: vec![DiscoveryTarget::new(
                service.clone(),
                namespace.clone(),
                datacenter.clone(),
            )],
            service_name: service,
            namespace,
            datacenter,
            protocol: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_id_format() {
        assert_eq!(target_id("db", "default", "dc1"), "db.default.dc1.internal");
    }

    #[test]
    fn test_single_target_chain_watches_its_own_endpoints() {
        let chain = CompiledDiscoveryChain::single_target("db", "default", "dc1");
        assert_eq!(chain.id(), "db.default.dc1.internal");
        assert_eq!(chain.targets.len(), 1);
        assert_eq!(chain.targets[0].id, chain.id());
    }

    #[test]
    fn test_overlay_with() {
        let base = MeshGatewayConfig {
            mode: MeshGatewayMode::Local,
        };
        let default = MeshGatewayConfig::default();
        let remote = MeshGatewayConfig {
            mode: MeshGatewayMode::Remote,
        };

        assert_eq!(base.overlay_with(default).mode, MeshGatewayMode::Local);
        assert_eq!(base.overlay_with(remote).mode, MeshGatewayMode::Remote);
        assert_eq!(default.overlay_with(default).mode, MeshGatewayMode::Default);
    }
}
