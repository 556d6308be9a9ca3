//! Ingress gateway handler
//!
//! The gateway's config entry and linked-services list drive listener
//! synthesis: each listed service becomes an upstream with a discovery
//! chain watch, and the leaf-cert watch is re-issued whenever the SAN set
//! implied by TLS config, upstream namespaces or custom hosts changes.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde_json::json;

use crate::cache::{
    CacheKind, CacheRequest, UpdateResult, GATEWAY_CONFIG_WATCH_ID, GATEWAY_SERVICES_WATCH_ID,
    LEAF_WATCH_ID, ROOTS_WATCH_ID,
};
use crate::snapshot::{ConfigSnapshot, IngressListenerKey};
use crate::types::entries::{ConfigEntry, ConfigEntryKind, GatewayService};
use crate::types::{Upstream, DEFAULT_NAMESPACE};
use crate::watch::WatchHandles;
use crate::Error;

use super::upstreams::{handle_upstream_event, watch_discovery_chain, DiscoveryChainWatchOpts};
use super::{invalid_payload, HandlerState};

#[derive(Clone)]
pub(crate) struct IngressGatewayHandler {
    pub state: HandlerState,
}

impl IngressGatewayHandler {
    pub async fn initialize(&self, handles: &mut WatchHandles) -> Result<ConfigSnapshot, Error> {
        let s = &self.state;
        let snap = s.new_snapshot();
        let datacenter = s.config.source.datacenter.clone();
        let token = s.instance.token.clone();

        s.watch_roots(handles).await?;

        // The gateway's own config entry, for the TLS flag.
        s.start_cache_watch(
            handles,
            CacheKind::ConfigEntry,
            CacheRequest::ConfigEntry {
                kind: ConfigEntryKind::IngressGateway,
                name: s.instance.service.clone(),
                datacenter: datacenter.clone(),
                token: token.clone(),
                namespace: s.instance.proxy_id.namespace.clone(),
            },
            GATEWAY_CONFIG_WATCH_ID,
        )
        .await?;

        // The gateway's list of exposed services.
        s.start_cache_watch(
            handles,
            CacheKind::GatewayServices,
            CacheRequest::GatewayServices {
                datacenter,
                token,
                service: s.instance.service.clone(),
                namespace: s.instance.proxy_id.namespace.clone(),
            },
            GATEWAY_SERVICES_WATCH_ID,
        )
        .await?;

        Ok(snap)
    }

    pub async fn handle_update(
        &self,
        correlation_id: &str,
        result: UpdateResult,
        snap: &mut ConfigSnapshot,
        handles: &mut WatchHandles,
    ) -> Result<(), Error> {
        match correlation_id {
            ROOTS_WATCH_ID => {
                let roots = match result {
                    UpdateResult::Roots(roots) => roots,
                    other => return Err(invalid_payload(correlation_id, &other)),
                };
                snap.roots = Some(roots);
                Ok(())
            }
            GATEWAY_CONFIG_WATCH_ID => {
                let entry = match result {
                    UpdateResult::ConfigEntry(entry) => entry,
                    other => return Err(invalid_payload(correlation_id, &other)),
                };
                let gateway = match entry {
                    Some(ConfigEntry::IngressGateway(gateway)) => gateway,
                    Some(other) => {
                        return Err(Error::schema(format!(
                            "invalid config entry kind {} for correlation id {:?}",
                            other.kind(),
                            correlation_id
                        )))
                    }
                    None => {
                        return Err(Error::schema(format!(
                            "missing config entry for correlation id {:?}",
                            correlation_id
                        )))
                    }
                };
                {
                    let d = snap.ingress_gateway_mut().unwrap();
                    d.tls_enabled = gateway.tls.enabled;
                    d.tls_set = true;
                }
                self.watch_leaf_cert(snap, handles).await
            }
            GATEWAY_SERVICES_WATCH_ID => {
                let services = match result {
                    UpdateResult::GatewayServices(services) => services,
                    other => return Err(invalid_payload(correlation_id, &other)),
                };
                self.reconcile_listeners(services, snap, handles).await?;
                self.watch_leaf_cert(snap, handles).await
            }
            _ => handle_upstream_event(&self.state, correlation_id, result, snap, handles).await,
        }
    }

    /// Rebuild the listener upstream map and the chain watch set from the
    /// gateway's service list.
    async fn reconcile_listeners(
        &self,
        services: Vec<GatewayService>,
        snap: &mut ConfigSnapshot,
        handles: &mut WatchHandles,
    ) -> Result<(), Error> {
        let s = &self.state;

        let mut hosts = Vec::new();
        let mut watched: HashSet<String> = HashSet::new();
        let mut listeners: HashMap<IngressListenerKey, Vec<Upstream>> = HashMap::new();

        for gateway_service in services {
            let upstream = make_upstream(&gateway_service);
            let id = upstream.identifier();

            let opts = DiscoveryChainWatchOpts {
                id: id.clone(),
                name: upstream.destination_name.clone(),
                namespace: upstream.destination_namespace.clone(),
                datacenter: s.config.source.datacenter.clone(),
                ..Default::default()
            };
            let up = &mut snap.ingress_gateway_mut().unwrap().upstreams;
            watch_discovery_chain(s, handles, up, opts).await?;
            watched.insert(id);

            hosts.extend(gateway_service.hosts.iter().cloned());

            let key = IngressListenerKey {
                protocol: gateway_service.protocol.clone(),
                port: gateway_service.port,
            };
            listeners.entry(key).or_default().push(upstream);
        }

        let d = snap.ingress_gateway_mut().unwrap();
        d.listener_upstreams = listeners;
        d.hosts = hosts;
        d.hosts_set = true;

        let stale: Vec<String> = d
            .upstreams
            .watched_discovery_chains
            .keys()
            .filter(|id| !watched.contains(*id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(handle) = d.upstreams.watched_discovery_chains.remove(&id) {
                handles.cancel(handle);
            }
        }

        Ok(())
    }

    /// (Re-)issue the leaf-cert watch with the current SAN set.
    ///
    /// The previous watch is cancelled first; its remaining deliveries are
    /// discarded by the cache once its token is cancelled.
    async fn watch_leaf_cert(
        &self,
        snap: &mut ConfigSnapshot,
        handles: &mut WatchHandles,
    ) -> Result<(), Error> {
        let s = &self.state;
        {
            let d = snap.ingress_gateway().unwrap();
            if !d.tls_set || !d.hosts_set {
                return Ok(());
            }
        }

        let dns_sans = self.generate_dns_sans(snap);

        if let Some(previous) = snap.ingress_gateway_mut().unwrap().leaf_cert_watch.take() {
            handles.cancel(previous);
        }

        let handle = s
            .start_cache_watch(
                handles,
                CacheKind::CaLeaf,
                CacheRequest::LeafCert {
                    datacenter: s.config.source.datacenter.clone(),
                    token: s.instance.token.clone(),
                    service: s.instance.service.clone(),
                    namespace: s.instance.proxy_id.namespace.clone(),
                    dns_sans,
                },
                LEAF_WATCH_ID,
            )
            .await?;
        snap.ingress_gateway_mut().unwrap().leaf_cert_watch = Some(handle);
        Ok(())
    }

    /// Wildcard SANs for every upstream namespace under both DNS domains,
    /// then the custom hosts.
    fn generate_dns_sans(&self, snap: &ConfigSnapshot) -> Vec<String> {
        let d = snap.ingress_gateway().unwrap();
        if !d.tls_enabled {
            return Vec::new();
        }

        let dns = &self.state.config.dns;
        let datacenter = &self.state.config.source.datacenter;

        // Sorted so the SAN list (and thus the issued cert) is stable.
        let namespaces: BTreeSet<&str> = d
            .listener_upstreams
            .values()
            .flatten()
            .map(|u| u.destination_namespace.as_str())
            .collect();

        let mut dns_sans = Vec::new();
        for namespace in namespaces {
            // The default namespace is special-cased in DNS resolution.
            let ns = if namespace == DEFAULT_NAMESPACE {
                String::new()
            } else {
                format!("{}.", namespace)
            };

            dns_sans.push(format!("*.ingress.{}{}", ns, dns.domain));
            dns_sans.push(format!("*.ingress.{}{}.{}", ns, datacenter, dns.domain));
            if !dns.alt_domain.is_empty() {
                dns_sans.push(format!("*.ingress.{}{}", ns, dns.alt_domain));
                dns_sans.push(format!("*.ingress.{}{}.{}", ns, datacenter, dns.alt_domain));
            }
        }

        dns_sans.extend(d.hosts.iter().cloned());
        dns_sans
    }
}

/// Synthesize the upstream behind one exposed gateway service.
///
/// Ingress listeners are always port-bound; the listener protocol is forced
/// onto the upstream through its config map.
fn make_upstream(gateway_service: &GatewayService) -> Upstream {
    let mut config = HashMap::new();
    config.insert("protocol".to_string(), json!(gateway_service.protocol));

    Upstream {
        destination_name: gateway_service.service.name.clone(),
        destination_namespace: gateway_service.service.namespace.clone(),
        local_bind_port: Some(gateway_service.port),
        ingress_hosts: gateway_service.hosts.clone(),
        config,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ServiceName;

    #[test]
    fn test_make_upstream() {
        let gateway_service = GatewayService {
            service: ServiceName::new("web", "api"),
            port: 8080,
            protocol: "http".to_string(),
            hosts: vec!["api.example.com".to_string()],
            ..Default::default()
        };

        let upstream = make_upstream(&gateway_service);
        assert_eq!(upstream.destination_name, "api");
        assert_eq!(upstream.destination_namespace, "web");
        assert_eq!(upstream.local_bind_port, Some(8080));
        assert_eq!(upstream.config["protocol"], json!("http"));
        assert_eq!(upstream.identifier(), "web/api");
    }
}
