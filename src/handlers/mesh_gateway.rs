//! Mesh gateway handler
//!
//! Watches the full connect-enabled service list and the datacenter list,
//! fanning out to per-service instance watches and per-datacenter gateway
//! watches as they appear. WAN-federated gateways additionally track the
//! federation-state gateway list and the local server set.

use std::collections::HashSet;

use tracing::debug;

use crate::cache::{
    remove_colon_prefix, CacheKind, CacheRequest, HealthRequest, UpdateResult,
    CONNECT_SERVICE_WATCH_PREFIX, CONSUL_SERVER_LIST_WATCH_ID, DATACENTERS_POLL_INTERVAL,
    DATACENTERS_WATCH_ID, FEDERATION_STATE_LIST_GATEWAYS_WATCH_ID, MESH_GATEWAY_WATCH_PREFIX,
    ROOTS_WATCH_ID, SERVICE_LIST_WATCH_ID, SERVICE_RESOLVERS_WATCH_ID,
};
use crate::snapshot::{hostname_endpoints, ConfigSnapshot};
use crate::types::entries::{ConfigEntry, ConfigEntryKind};
use crate::types::{ServiceKind, ServiceName, CONSUL_SERVICE_NAME, WAN_FEDERATION_META_KEY};
use crate::watch::WatchHandles;
use crate::Error;

use super::{invalid_payload, HandlerState};

#[derive(Clone)]
pub(crate) struct MeshGatewayHandler {
    pub state: HandlerState,
}

impl MeshGatewayHandler {
    pub async fn initialize(&self, handles: &mut WatchHandles) -> Result<ConfigSnapshot, Error> {
        let s = &self.state;
        let snap = s.new_snapshot();
        let datacenter = s.config.source.datacenter.clone();
        let token = s.instance.token.clone();

        s.watch_roots(handles).await?;

        // All connect-enabled services; per-service watches are set up once
        // the list arrives.
        s.start_cache_watch(
            handles,
            CacheKind::CatalogServiceList,
            CacheRequest::ServiceList {
                datacenter: datacenter.clone(),
                token: token.clone(),
                source: s.config.source.clone(),
            },
            SERVICE_LIST_WATCH_ID,
        )
        .await?;

        if s.instance.meta.get(WAN_FEDERATION_META_KEY).map(String::as_str) == Some("1") {
            s.start_cache_watch(
                handles,
                CacheKind::FederationStateListMeshGateways,
                CacheRequest::FederationStateListMeshGateways {
                    datacenter: datacenter.clone(),
                    token: token.clone(),
                    source: s.config.source.clone(),
                },
                FEDERATION_STATE_LIST_GATEWAYS_WATCH_ID,
            )
            .await?;

            s.start_health_watch(
                handles,
                HealthRequest {
                    datacenter: datacenter.clone(),
                    token: token.clone(),
                    service: CONSUL_SERVICE_NAME.to_string(),
                    namespace: String::new(),
                    connect: false,
                    filter: None,
                    source: s.config.source.clone(),
                },
                CONSUL_SERVER_LIST_WATCH_ID,
            )
            .await?;
        }

        // Known datacenters; per-datacenter gateway watches follow the list.
        s.start_cache_watch(
            handles,
            CacheKind::CatalogDatacenters,
            CacheRequest::Datacenters {
                token: token.clone(),
                max_age: DATACENTERS_POLL_INTERVAL,
            },
            DATACENTERS_WATCH_ID,
        )
        .await?;

        // Resolvers define the service subsets the gateway routes between.
        s.start_cache_watch(
            handles,
            CacheKind::ConfigEntryList,
            CacheRequest::ConfigEntryList {
                kind: ConfigEntryKind::ServiceResolver,
                name: None,
                datacenter,
                token,
            },
            SERVICE_RESOLVERS_WATCH_ID,
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
            FEDERATION_STATE_LIST_GATEWAYS_WATCH_ID => {
                let by_datacenter = match result {
                    UpdateResult::DatacenterGateways(by_datacenter) => by_datacenter,
                    other => return Err(invalid_payload(correlation_id, &other)),
                };
                let local_datacenter = snap.datacenter.clone();
                let d = snap.mesh_gateway_mut().unwrap();
                for (datacenter, nodes) in &by_datacenter {
                    d.hostname_datacenters.insert(
                        datacenter.clone(),
                        hostname_endpoints(&local_datacenter, nodes),
                    );
                }
                d.hostname_datacenters
                    .retain(|datacenter, _| by_datacenter.contains_key(datacenter));
                d.fed_state_gateways = by_datacenter;
                Ok(())
            }
            SERVICE_LIST_WATCH_ID => {
                let services = match result {
                    UpdateResult::ServiceList(services) => services,
                    other => return Err(invalid_payload(correlation_id, &other)),
                };
                self.reconcile_service_list(services, snap, handles).await
            }
            DATACENTERS_WATCH_ID => {
                let datacenters = match result {
                    UpdateResult::Datacenters(datacenters) => datacenters,
                    other => return Err(invalid_payload(correlation_id, &other)),
                };
                self.reconcile_datacenters(datacenters, snap, handles).await
            }
            SERVICE_RESOLVERS_WATCH_ID => {
                let entries = match result {
                    UpdateResult::ConfigEntries(entries) => entries,
                    other => return Err(invalid_payload(correlation_id, &other)),
                };
                // Fully rebuilt on every delivery.
                let d = snap.mesh_gateway_mut().unwrap();
                d.service_resolvers = entries
                    .into_iter()
                    .filter_map(|entry| match entry {
                        ConfigEntry::ServiceResolver(resolver) => {
                            Some((resolver.service_name(), resolver))
                        }
                        _ => None,
                    })
                    .collect();
                Ok(())
            }
            CONSUL_SERVER_LIST_WATCH_ID => {
                let nodes = match result {
                    UpdateResult::Endpoints(nodes) => nodes,
                    other => return Err(invalid_payload(correlation_id, &other)),
                };
                // Guard against a watch wired to the wrong query.
                for csn in &nodes {
                    if csn.service.name != CONSUL_SERVICE_NAME {
                        return Err(Error::schema(format!(
                            "expected service name {:?} but got {:?}",
                            CONSUL_SERVICE_NAME, csn.service.name
                        )));
                    }
                    if csn.node.datacenter != snap.datacenter {
                        return Err(Error::schema(format!(
                            "expected datacenter {:?} but got {:?}",
                            snap.datacenter, csn.node.datacenter
                        )));
                    }
                }
                snap.mesh_gateway_mut().unwrap().consul_servers = nodes;
                Ok(())
            }
            _ => {
                if let Some(rest) = correlation_id.strip_prefix(CONNECT_SERVICE_WATCH_PREFIX) {
                    let nodes = match result {
                        UpdateResult::Endpoints(nodes) => nodes,
                        other => return Err(invalid_payload(correlation_id, &other)),
                    };
                    let sn = ServiceName::parse(rest);
                    let d = snap.mesh_gateway_mut().unwrap();
                    if nodes.is_empty() {
                        d.service_groups.remove(&sn);
                    } else {
                        d.service_groups.insert(sn, nodes);
                    }
                    return Ok(());
                }

                if let Some(rest) = correlation_id.strip_prefix(MESH_GATEWAY_WATCH_PREFIX) {
                    // Upstream-style ids carry a second segment; a bare
                    // datacenter belongs to this gateway's peer watches.
                    if remove_colon_prefix(rest).is_some() {
                        return Err(Error::schema(format!(
                            "unknown correlation id {:?}",
                            correlation_id
                        )));
                    }
                    let nodes = match result {
                        UpdateResult::NodesWithGateways(nodes) => nodes,
                        other => return Err(invalid_payload(correlation_id, &other)),
                    };
                    let local_datacenter = snap.datacenter.clone();
                    let d = snap.mesh_gateway_mut().unwrap();
                    d.gateway_groups.remove(rest);
                    d.hostname_datacenters.remove(rest);
                    if !nodes.is_empty() {
                        d.hostname_datacenters.insert(
                            rest.to_string(),
                            hostname_endpoints(&local_datacenter, &nodes),
                        );
                        d.gateway_groups.insert(rest.to_string(), nodes);
                    }
                    return Ok(());
                }

                Err(Error::schema(format!(
                    "unknown correlation id {:?}",
                    correlation_id
                )))
            }
        }
    }

    /// Open instance watches for new services; cancel watches for dropped
    /// services but keep their endpoint state until an empty delivery.
    async fn reconcile_service_list(
        &self,
        services: Vec<ServiceName>,
        snap: &mut ConfigSnapshot,
        handles: &mut WatchHandles,
    ) -> Result<(), Error> {
        let s = &self.state;

        let mut seen = HashSet::new();
        for sn in services {
            seen.insert(sn.clone());

            if snap
                .mesh_gateway()
                .unwrap()
                .watched_services
                .contains_key(&sn)
            {
                continue;
            }
            let handle = s
                .start_health_watch(
                    handles,
                    HealthRequest {
                        datacenter: s.config.source.datacenter.clone(),
                        token: s.instance.token.clone(),
                        service: sn.name.clone(),
                        namespace: sn.namespace.clone(),
                        connect: true,
                        filter: None,
                        source: s.config.source.clone(),
                    },
                    format!("{}{}", CONNECT_SERVICE_WATCH_PREFIX, sn),
                )
                .await?;
            snap.mesh_gateway_mut()
                .unwrap()
                .watched_services
                .insert(sn, handle);
        }

        let d = snap.mesh_gateway_mut().unwrap();
        let stale: Vec<ServiceName> = d
            .watched_services
            .keys()
            .filter(|sn| !seen.contains(*sn))
            .cloned()
            .collect();
        for sn in stale {
            debug!(service = %sn, "Cancelling watch for service");
            // Endpoint state stays until the watch (or a later list) says
            // the service is gone; cancelling only stops the updates.
            if let Some(handle) = d.watched_services.remove(&sn) {
                handles.cancel(handle);
            }
        }

        d.watched_services_set = true;
        Ok(())
    }

    /// Open gateway watches for new datacenters, cancel dropped ones.
    async fn reconcile_datacenters(
        &self,
        datacenters: Vec<String>,
        snap: &mut ConfigSnapshot,
        handles: &mut WatchHandles,
    ) -> Result<(), Error> {
        let s = &self.state;
        let source_datacenter = s.config.source.datacenter.clone();

        for datacenter in &datacenters {
            if *datacenter == source_datacenter {
                continue;
            }
            if snap
                .mesh_gateway()
                .unwrap()
                .watched_datacenters
                .contains_key(datacenter)
            {
                continue;
            }
            let handle = s
                .start_cache_watch(
                    handles,
                    CacheKind::ServiceDump,
                    CacheRequest::ServiceDump {
                        datacenter: datacenter.clone(),
                        token: s.instance.token.clone(),
                        kind: ServiceKind::MeshGateway,
                        source: s.config.source.clone(),
                    },
                    format!("{}{}", MESH_GATEWAY_WATCH_PREFIX, datacenter),
                )
                .await?;
            snap.mesh_gateway_mut()
                .unwrap()
                .watched_datacenters
                .insert(datacenter.clone(), handle);
        }

        let d = snap.mesh_gateway_mut().unwrap();
        let stale: Vec<String> = d
            .watched_datacenters
            .keys()
            .filter(|dc| !datacenters.contains(*dc))
            .cloned()
            .collect();
        for datacenter in stale {
            debug!(datacenter = %datacenter, "Cancelling watch for datacenter");
            if let Some(handle) = d.watched_datacenters.remove(&datacenter) {
                handles.cancel(handle);
            }
        }

        Ok(())
    }
}
