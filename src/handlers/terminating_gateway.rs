//! Terminating gateway handler
//!
//! The gateway's linked-services list drives everything: each linked
//! service gets five subscriptions (instances, intentions, leaf cert,
//! resolved config, resolver entry) whose results the gateway mirrors per
//! service. Services dropped from the list have their subscriptions
//! cancelled and their mirrored state purged.

use std::collections::HashSet;

use tracing::debug;

use crate::cache::{
    CacheKind, CacheRequest, HealthRequest, UpdateResult, EXTERNAL_SERVICE_WATCH_PREFIX,
    GATEWAY_SERVICES_WATCH_ID, ROOTS_WATCH_ID, SERVICE_CONFIG_WATCH_PREFIX,
    SERVICE_INTENTIONS_WATCH_PREFIX, SERVICE_LEAF_WATCH_PREFIX, SERVICE_RESOLVER_WATCH_PREFIX,
};
use crate::snapshot::{hostname_endpoints, ConfigSnapshot};
use crate::types::entries::{ConfigEntry, ConfigEntryKind, GatewayService};
use crate::types::ServiceName;
use crate::watch::WatchHandles;
use crate::Error;

use super::{invalid_payload, HandlerState};

#[derive(Clone)]
pub(crate) struct TerminatingGatewayHandler {
    pub state: HandlerState,
}

impl TerminatingGatewayHandler {
    pub async fn initialize(&self, handles: &mut WatchHandles) -> Result<ConfigSnapshot, Error> {
        let s = &self.state;
        let snap = s.new_snapshot();

        s.watch_roots(handles).await?;

        // The gateway's linked services; everything else keys off this.
        s.start_cache_watch(
            handles,
            CacheKind::GatewayServices,
            CacheRequest::GatewayServices {
                datacenter: s.config.source.datacenter.clone(),
                token: s.instance.token.clone(),
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
            GATEWAY_SERVICES_WATCH_ID => {
                let services = match result {
                    UpdateResult::GatewayServices(services) => services,
                    other => return Err(invalid_payload(correlation_id, &other)),
                };
                self.reconcile_linked_services(services, snap, handles).await
            }
            _ => self.handle_per_service_update(correlation_id, result, snap),
        }
    }

    /// Open the five per-service subscriptions for new linked services and
    /// tear down state for services that disappeared.
    async fn reconcile_linked_services(
        &self,
        services: Vec<GatewayService>,
        snap: &mut ConfigSnapshot,
        handles: &mut WatchHandles,
    ) -> Result<(), Error> {
        let s = &self.state;
        let datacenter = s.config.source.datacenter.clone();
        let token = s.instance.token.clone();

        let mut seen = HashSet::new();
        for gateway_service in services {
            let sn = gateway_service.service.clone();
            seen.insert(sn.clone());

            // Keep the gateway <-> service mapping for TLS origination.
            snap.terminating_gateway_mut()
                .unwrap()
                .gateway_services
                .insert(sn.clone(), gateway_service);

            // Instances backing the service. The gateway acts as the
            // service's proxy, so other proxies are not of interest.
            if !snap
                .terminating_gateway()
                .unwrap()
                .watched_services
                .contains_key(&sn)
            {
                let handle = s
                    .start_health_watch(
                        handles,
                        HealthRequest {
                            datacenter: datacenter.clone(),
                            token: token.clone(),
                            service: sn.name.clone(),
                            namespace: sn.namespace.clone(),
                            connect: false,
                            filter: None,
                            source: s.config.source.clone(),
                        },
                        format!("{}{}", EXTERNAL_SERVICE_WATCH_PREFIX, sn),
                    )
                    .await?;
                snap.terminating_gateway_mut()
                    .unwrap()
                    .watched_services
                    .insert(sn.clone(), handle);
            }

            // Intentions the gateway enforces on the service's behalf.
            if !snap
                .terminating_gateway()
                .unwrap()
                .watched_intentions
                .contains_key(&sn)
            {
                let handle = s
                    .start_cache_watch(
                        handles,
                        CacheKind::IntentionMatch,
                        CacheRequest::IntentionMatch {
                            datacenter: datacenter.clone(),
                            token: token.clone(),
                            namespace: sn.namespace.clone(),
                            name: sn.name.clone(),
                        },
                        format!("{}{}", SERVICE_INTENTIONS_WATCH_PREFIX, sn),
                    )
                    .await?;
                snap.terminating_gateway_mut()
                    .unwrap()
                    .watched_intentions
                    .insert(sn.clone(), handle);
            }

            // Leaf cert used to terminate mTLS on the service's behalf.
            if !snap
                .terminating_gateway()
                .unwrap()
                .watched_leaves
                .contains_key(&sn)
            {
                let handle = s
                    .start_cache_watch(
                        handles,
                        CacheKind::CaLeaf,
                        CacheRequest::LeafCert {
                            datacenter: datacenter.clone(),
                            token: token.clone(),
                            service: sn.name.clone(),
                            namespace: sn.namespace.clone(),
                            dns_sans: Vec::new(),
                        },
                        format!("{}{}", SERVICE_LEAF_WATCH_PREFIX, sn),
                    )
                    .await?;
                snap.terminating_gateway_mut()
                    .unwrap()
                    .watched_leaves
                    .insert(sn.clone(), handle);
            }

            // Resolved config, which determines the service's protocol.
            if !snap
                .terminating_gateway()
                .unwrap()
                .watched_configs
                .contains_key(&sn)
            {
                let handle = s
                    .start_cache_watch(
                        handles,
                        CacheKind::ResolvedServiceConfig,
                        CacheRequest::ResolvedServiceConfig {
                            datacenter: datacenter.clone(),
                            token: token.clone(),
                            name: sn.name.clone(),
                            namespace: sn.namespace.clone(),
                        },
                        format!("{}{}", SERVICE_CONFIG_WATCH_PREFIX, sn),
                    )
                    .await?;
                snap.terminating_gateway_mut()
                    .unwrap()
                    .watched_configs
                    .insert(sn.clone(), handle);
            }

            // Resolver entry, which defines subset clusters.
            if !snap
                .terminating_gateway()
                .unwrap()
                .watched_resolvers
                .contains_key(&sn)
            {
                let handle = s
                    .start_cache_watch(
                        handles,
                        CacheKind::ConfigEntryList,
                        CacheRequest::ConfigEntryList {
                            kind: ConfigEntryKind::ServiceResolver,
                            name: Some(sn.name.clone()),
                            datacenter: datacenter.clone(),
                            token: token.clone(),
                        },
                        format!("{}{}", SERVICE_RESOLVER_WATCH_PREFIX, sn),
                    )
                    .await?;
                snap.terminating_gateway_mut()
                    .unwrap()
                    .watched_resolvers
                    .insert(sn.clone(), handle);
            }
        }

        let d = snap.terminating_gateway_mut().unwrap();
        d.gateway_services_set = true;

        d.gateway_services.retain(|sn, _| seen.contains(sn));
        d.hostname_services.retain(|sn, _| seen.contains(sn));

        let stale: Vec<ServiceName> = d
            .watched_services
            .keys()
            .filter(|sn| !seen.contains(*sn))
            .cloned()
            .collect();
        for sn in stale {
            debug!(service = %sn, "Cancelling watches for service");
            if let Some(handle) = d.watched_services.remove(&sn) {
                handles.cancel(handle);
            }
            d.service_groups.remove(&sn);
            d.endpoints_received.remove(&sn);

            if let Some(handle) = d.watched_leaves.remove(&sn) {
                handles.cancel(handle);
            }
            d.service_leaves.remove(&sn);

            if let Some(handle) = d.watched_configs.remove(&sn) {
                handles.cancel(handle);
            }
            d.service_configs.remove(&sn);

            if let Some(handle) = d.watched_resolvers.remove(&sn) {
                handles.cancel(handle);
            }
            d.service_resolvers.remove(&sn);
            d.service_resolvers_set.remove(&sn);

            if let Some(handle) = d.watched_intentions.remove(&sn) {
                handles.cancel(handle);
            }
            d.intentions.remove(&sn);
        }

        Ok(())
    }

    fn handle_per_service_update(
        &self,
        correlation_id: &str,
        result: UpdateResult,
        snap: &mut ConfigSnapshot,
    ) -> Result<(), Error> {
        let local_datacenter = snap.datacenter.clone();
        let d = snap.terminating_gateway_mut().unwrap();

        if let Some(rest) = correlation_id.strip_prefix(EXTERNAL_SERVICE_WATCH_PREFIX) {
            let nodes = match result {
                UpdateResult::Endpoints(nodes) => nodes,
                other => return Err(invalid_payload(correlation_id, &other)),
            };
            let sn = ServiceName::parse(rest);
            d.endpoints_received.insert(sn.clone());
            d.service_groups.remove(&sn);
            d.hostname_services.remove(&sn);
            if !nodes.is_empty() {
                d.hostname_services
                    .insert(sn.clone(), hostname_endpoints(&local_datacenter, &nodes));
                d.service_groups.insert(sn, nodes);
            }
            return Ok(());
        }

        if let Some(rest) = correlation_id.strip_prefix(SERVICE_LEAF_WATCH_PREFIX) {
            let leaf = match result {
                UpdateResult::Leaf(leaf) => leaf,
                other => return Err(invalid_payload(correlation_id, &other)),
            };
            d.service_leaves.insert(ServiceName::parse(rest), leaf);
            return Ok(());
        }

        if let Some(rest) = correlation_id.strip_prefix(SERVICE_CONFIG_WATCH_PREFIX) {
            let config = match result {
                UpdateResult::ServiceConfig(config) => config,
                other => return Err(invalid_payload(correlation_id, &other)),
            };
            d.service_configs.insert(ServiceName::parse(rest), config);
            return Ok(());
        }

        if let Some(rest) = correlation_id.strip_prefix(SERVICE_RESOLVER_WATCH_PREFIX) {
            let entries = match result {
                UpdateResult::ConfigEntries(entries) => entries,
                other => return Err(invalid_payload(correlation_id, &other)),
            };
            let sn = ServiceName::parse(rest);
            // At most one resolver exists for a service within a namespace.
            if entries.len() == 1 {
                if let ConfigEntry::ServiceResolver(resolver) = &entries[0] {
                    d.service_resolvers.insert(sn.clone(), resolver.clone());
                }
            }
            d.service_resolvers_set.insert(sn);
            return Ok(());
        }

        if let Some(rest) = correlation_id.strip_prefix(SERVICE_INTENTIONS_WATCH_PREFIX) {
            let matches = match result {
                UpdateResult::IntentionMatches(matches) => matches,
                other => return Err(invalid_payload(correlation_id, &other)),
            };
            // Single-entry query, so only the first result set matters.
            if let Some(first) = matches.into_iter().next() {
                d.intentions.insert(ServiceName::parse(rest), first);
            }
            return Ok(());
        }

        Err(Error::schema(format!(
            "unknown correlation id {:?}",
            correlation_id
        )))
    }
}
