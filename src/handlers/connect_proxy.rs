//! Connect (sidecar) proxy handler
//!
//! Watches the proxy's own identity material (roots, leaf, intentions,
//! local HTTP checks) plus one resolution pipeline per upstream. In
//! transparent mode the upstream set is inferred from intentions instead of
//! the registration.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::cache::{
    CacheKind, CacheRequest, UpdateResult, INTENTIONS_WATCH_ID, INTENTION_UPSTREAMS_WATCH_ID,
    LEAF_WATCH_ID, MESH_CONFIG_WATCH_ID, PREPARED_QUERY_ID_PREFIX, PREPARED_QUERY_POLL_INTERVAL,
    ROOTS_WATCH_ID, SVC_CHECKS_WATCH_PREFIX, UPSTREAM_WATCH_PREFIX,
};
use crate::snapshot::ConfigSnapshot;
use crate::types::entries::{ConfigEntry, ConfigEntryKind};
use crate::types::{
    parse_reduced_upstream_config, ProxyMode, ReducedUpstreamConfig, ServiceId, ServiceName,
    Upstream, UpstreamDestType, WILDCARD,
};
use crate::watch::WatchHandles;
use crate::Error;

use super::upstreams::{handle_upstream_event, watch_discovery_chain, DiscoveryChainWatchOpts};
use super::{invalid_payload, HandlerState};

#[derive(Clone)]
pub(crate) struct ConnectProxyHandler {
    pub state: HandlerState,
}

impl ConnectProxyHandler {
    pub async fn initialize(&self, handles: &mut WatchHandles) -> Result<ConfigSnapshot, Error> {
        let s = &self.state;
        let mut snap = s.new_snapshot();
        let source = &s.config.source;
        let proxy = &s.instance.proxy;
        let namespace = s.instance.proxy_id.namespace.clone();

        s.watch_roots(handles).await?;

        // The proxy's own leaf cert.
        s.start_cache_watch(
            handles,
            CacheKind::CaLeaf,
            CacheRequest::LeafCert {
                datacenter: source.datacenter.clone(),
                token: s.instance.token.clone(),
                service: proxy.destination_service_name.clone(),
                namespace: namespace.clone(),
                dns_sans: Vec::new(),
            },
            LEAF_WATCH_ID,
        )
        .await?;

        // Intentions with the destination service as their target.
        s.start_cache_watch(
            handles,
            CacheKind::IntentionMatch,
            CacheRequest::IntentionMatch {
                datacenter: source.datacenter.clone(),
                token: s.instance.token.clone(),
                namespace: namespace.clone(),
                name: proxy.destination_service_name.clone(),
            },
            INTENTIONS_WATCH_ID,
        )
        .await?;

        // HTTP checks of the local destination service, re-exposed through
        // the proxy.
        let destination_id = ServiceId::new(namespace.clone(), proxy.destination_service_id.clone());
        s.start_cache_watch(
            handles,
            CacheKind::ServiceHttpChecks,
            CacheRequest::ServiceHttpChecks {
                service_id: proxy.destination_service_id.clone(),
                namespace: namespace.clone(),
            },
            format!("{}{}", SVC_CHECKS_WATCH_PREFIX, destination_id),
        )
        .await?;

        if proxy.mode == ProxyMode::Transparent {
            // Upstreams are inferred from intentions naming this service as
            // a source.
            s.start_cache_watch(
                handles,
                CacheKind::IntentionUpstreams,
                CacheRequest::IntentionUpstreams {
                    datacenter: source.datacenter.clone(),
                    token: s.instance.token.clone(),
                    service: proxy.destination_service_name.clone(),
                    namespace: namespace.clone(),
                },
                INTENTION_UPSTREAMS_WATCH_ID,
            )
            .await?;

            s.start_cache_watch(
                handles,
                CacheKind::ConfigEntry,
                CacheRequest::ConfigEntry {
                    kind: ConfigEntryKind::Mesh,
                    name: "mesh".to_string(),
                    datacenter: source.datacenter.clone(),
                    token: s.instance.token.clone(),
                    namespace: String::new(),
                },
                MESH_CONFIG_WATCH_ID,
            )
            .await?;
        }

        for upstream in &proxy.upstreams {
            // Wildcard entries only carry defaults for intention-inferred
            // upstreams.
            if upstream.destination_name == WILDCARD {
                snap.connect_proxy_mut()
                    .unwrap()
                    .upstreams
                    .upstream_config
                    .insert(upstream.identifier(), upstream.clone());
                continue;
            }
            // Synthetic entries from centralized config get no watches.
            if upstream.centrally_configured {
                continue;
            }
            snap.connect_proxy_mut()
                .unwrap()
                .upstreams
                .upstream_config
                .insert(upstream.identifier(), upstream.clone());

            let datacenter = if upstream.datacenter.is_empty() {
                source.datacenter.clone()
            } else {
                upstream.datacenter.clone()
            };

            if proxy.mode == ProxyMode::Transparent && datacenter == source.datacenter {
                // Local-datacenter upstreams are resolved through the
                // intention-upstreams watch instead.
                continue;
            }

            let cfg = self.reduced_config(upstream);

            match upstream.destination_type {
                UpstreamDestType::PreparedQuery => {
                    s.start_cache_watch(
                        handles,
                        CacheKind::PreparedQuery,
                        CacheRequest::PreparedQuery {
                            datacenter: datacenter.clone(),
                            token: s.instance.token.clone(),
                            query: upstream.destination_name.clone(),
                            connect: true,
                            source: source.clone(),
                            max_age: PREPARED_QUERY_POLL_INTERVAL,
                        },
                        format!("{}{}", UPSTREAM_WATCH_PREFIX, upstream.identifier()),
                    )
                    .await?;
                }
                UpstreamDestType::Service => {
                    let opts = DiscoveryChainWatchOpts {
                        id: upstream.identifier(),
                        name: upstream.destination_name.clone(),
                        namespace: upstream.destination().namespace,
                        datacenter,
                        cfg,
                        mesh_gateway: proxy.mesh_gateway.overlay_with(upstream.mesh_gateway),
                    };
                    let up = &mut snap.connect_proxy_mut().unwrap().upstreams;
                    watch_discovery_chain(s, handles, up, opts).await?;
                }
            }
        }

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
            INTENTIONS_WATCH_ID => {
                let matches = match result {
                    UpdateResult::IntentionMatches(matches) => matches,
                    other => return Err(invalid_payload(correlation_id, &other)),
                };
                let d = snap.connect_proxy_mut().unwrap();
                // The query carries exactly one match entry, so only the
                // first result set is relevant.
                if let Some(first) = matches.into_iter().next() {
                    d.intentions = first;
                }
                d.intentions_set = true;
                Ok(())
            }
            INTENTION_UPSTREAMS_WATCH_ID => {
                let services = match result {
                    UpdateResult::ServiceList(services) => services,
                    other => return Err(invalid_payload(correlation_id, &other)),
                };
                self.reconcile_intention_upstreams(services, snap, handles)
                    .await
            }
            MESH_CONFIG_WATCH_ID => {
                let entry = match result {
                    UpdateResult::ConfigEntry(entry) => entry,
                    other => return Err(invalid_payload(correlation_id, &other)),
                };
                let mesh = match entry {
                    Some(ConfigEntry::Mesh(mesh)) => Some(mesh),
                    Some(other) => {
                        return Err(Error::schema(format!(
                            "invalid config entry kind {} for correlation id {:?}",
                            other.kind(),
                            correlation_id
                        )))
                    }
                    None => None,
                };
                let d = snap.connect_proxy_mut().unwrap();
                d.mesh_config = mesh;
                d.mesh_config_set = true;
                Ok(())
            }
            _ => {
                if let Some(rest) = correlation_id.strip_prefix(UPSTREAM_WATCH_PREFIX) {
                    if rest.starts_with(PREPARED_QUERY_ID_PREFIX) {
                        let nodes = match result {
                            UpdateResult::PreparedQueryResults(nodes) => nodes,
                            other => return Err(invalid_payload(correlation_id, &other)),
                        };
                        snap.connect_proxy_mut()
                            .unwrap()
                            .prepared_query_endpoints
                            .insert(rest.to_string(), nodes);
                        return Ok(());
                    }
                }
                if let Some(id) = correlation_id.strip_prefix(SVC_CHECKS_WATCH_PREFIX) {
                    let checks = match result {
                        UpdateResult::HttpChecks(checks) => checks,
                        other => return Err(invalid_payload(correlation_id, &other)),
                    };
                    snap.connect_proxy_mut()
                        .unwrap()
                        .watched_service_checks
                        .insert(ServiceId::parse(id), checks);
                    return Ok(());
                }
                handle_upstream_event(&self.state, correlation_id, result, snap, handles).await
            }
        }
    }

    /// Reconcile the inferred upstream set against the current watches.
    async fn reconcile_intention_upstreams(
        &self,
        services: Vec<ServiceName>,
        snap: &mut ConfigSnapshot,
        handles: &mut WatchHandles,
    ) -> Result<(), Error> {
        let s = &self.state;
        let source_datacenter = s.config.source.datacenter.clone();
        let proxy_mesh_gateway = s.instance.proxy.mesh_gateway;

        let mut seen = HashSet::new();
        for svc in services {
            let id = svc.to_string();
            seen.insert(id.clone());

            let d = snap.connect_proxy_mut().unwrap();
            let upstream = if let Some(explicit) = d.upstreams.upstream_config.get(&id).cloned() {
                Some(explicit)
            } else if let Some(defaults) = d.upstreams.upstream_config.get(WILDCARD).cloned() {
                // Inferred upstreams adopt the wildcard defaults when no
                // specific configuration exists; explicit upstreams had
                // their defaults resolved centrally already.
                d.upstreams
                    .upstream_config
                    .insert(id.clone(), defaults.clone());
                Some(defaults)
            } else {
                None
            };

            let cfg = upstream
                .as_ref()
                .map(|u| self.reduced_config(u))
                .unwrap_or_default();
            let mesh_gateway = proxy_mesh_gateway
                .overlay_with(upstream.map(|u| u.mesh_gateway).unwrap_or_default());

            let opts = DiscoveryChainWatchOpts {
                id: id.clone(),
                name: svc.name.clone(),
                namespace: svc.namespace.clone(),
                datacenter: source_datacenter.clone(),
                cfg,
                mesh_gateway,
            };
            let up = &mut snap.connect_proxy_mut().unwrap().upstreams;
            watch_discovery_chain(s, handles, up, opts).await?;
        }

        // Purge upstreams that disappeared from the inferred set. Entries
        // pinned to a remote datacenter came from the registration and are
        // left alone.
        let up = &mut snap.connect_proxy_mut().unwrap().upstreams;
        let is_pinned_remote = |config: &HashMap<String, Upstream>, id: &str| {
            config
                .get(id)
                .map(|u| !u.datacenter.is_empty() && u.datacenter != source_datacenter)
                .unwrap_or(false)
        };

        let stale: Vec<String> = up
            .watched_discovery_chains
            .keys()
            .chain(up.watched_upstreams.keys())
            .filter(|id| !seen.contains(*id) && !is_pinned_remote(&up.upstream_config, id.as_str()))
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        for id in stale {
            if let Some(handle) = up.watched_discovery_chains.remove(&id) {
                handles.cancel(handle);
            }
            up.discovery_chain.remove(&id);
            if let Some(targets) = up.watched_upstreams.remove(&id) {
                for handle in targets.into_values() {
                    handles.cancel(handle);
                }
            }
            up.watched_upstream_endpoints.remove(&id);
            if let Some(gateways) = up.watched_gateways.remove(&id) {
                for handle in gateways.into_values() {
                    handles.cancel(handle);
                }
            }
            up.watched_gateway_endpoints.remove(&id);
        }

        Ok(())
    }

    /// Reduced upstream config, downgraded to defaults on a parse failure
    fn reduced_config(&self, upstream: &Upstream) -> ReducedUpstreamConfig {
        match parse_reduced_upstream_config(&upstream.config) {
            Ok(cfg) => cfg,
            Err(e) => {
                // A config typo must not lose the upstream; the plain
                // discovery chain works without the overrides.
                warn!(
                    upstream = %upstream.identifier(),
                    error = %e,
                    "Failed to parse upstream config"
                );
                ReducedUpstreamConfig::default()
            }
        }
    }
}
