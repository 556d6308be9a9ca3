//! Shared upstream watch reshaping for chain-resolving kinds
//!
//! Connect proxies and ingress gateways both resolve upstreams through
//! compiled discovery chains: a chain arrival replaces the set of
//! per-target endpoint watches and the set of mesh-gateway watches implied
//! by target gateway modes.

use std::collections::HashSet;

use tracing::trace;

use crate::cache::{
    remove_colon_prefix, CacheKind, CacheRequest, HealthRequest, UpdateResult,
    DISCOVERY_CHAIN_WATCH_PREFIX, LEAF_WATCH_ID, MESH_GATEWAY_WATCH_PREFIX,
    UPSTREAM_TARGET_WATCH_PREFIX,
};
use crate::snapshot::{ConfigSnapshot, ServicePassthroughAddrs, UpstreamsData};
use crate::types::chain::{CompiledDiscoveryChain, MeshGatewayConfig, MeshGatewayMode};
use crate::types::{service_sni, ProxyMode, ReducedUpstreamConfig, ServiceKind};
use crate::watch::WatchHandles;
use crate::Error;

use super::{invalid_payload, HandlerState};

/// Parameters of one discovery-chain watch.
#[derive(Debug, Clone, Default)]
pub(crate) struct DiscoveryChainWatchOpts {
    /// Upstream id the chain resolves
    pub id: String,
    pub name: String,
    pub namespace: String,
    /// Datacenter the chain is evaluated in
    pub datacenter: String,
    pub cfg: ReducedUpstreamConfig,
    pub mesh_gateway: MeshGatewayConfig,
}

/// Watch the compiled discovery chain for one upstream.
///
/// Re-requesting an already-watched upstream id is a no-op.
pub(crate) async fn watch_discovery_chain(
    state: &HandlerState,
    handles: &mut WatchHandles,
    up: &mut UpstreamsData,
    opts: DiscoveryChainWatchOpts,
) -> Result<(), Error> {
    if up.watched_discovery_chains.contains_key(&opts.id) {
        return Ok(());
    }

    let correlation_id = format!("{}{}", DISCOVERY_CHAIN_WATCH_PREFIX, opts.id);
    let handle = state
        .start_cache_watch(
            handles,
            CacheKind::CompiledDiscoveryChain,
            CacheRequest::DiscoveryChain {
                datacenter: state.config.source.datacenter.clone(),
                token: state.instance.token.clone(),
                name: opts.name,
                evaluate_in_datacenter: opts.datacenter,
                evaluate_in_namespace: opts.namespace,
                override_mesh_gateway: opts.mesh_gateway,
                override_protocol: opts.cfg.protocol.clone(),
                override_connect_timeout: opts.cfg.connect_timeout(),
            },
            correlation_id,
        )
        .await?;
    up.watched_discovery_chains.insert(opts.id, handle);
    Ok(())
}

/// Apply an event belonging to the shared upstream machinery.
pub(crate) async fn handle_upstream_event(
    state: &HandlerState,
    correlation_id: &str,
    result: UpdateResult,
    snap: &mut ConfigSnapshot,
    handles: &mut WatchHandles,
) -> Result<(), Error> {
    let transparent = snap.proxy.mode == ProxyMode::Transparent;
    let local_datacenter = snap.datacenter.clone();
    let trust_domain = snap.trust_domain().map(str::to_string);

    let up = snap
        .upstreams_mut()
        .ok_or_else(|| Error::schema("upstream event for a kind without upstream state"))?;

    if correlation_id == LEAF_WATCH_ID {
        let leaf = match result {
            UpdateResult::Leaf(leaf) => leaf,
            other => return Err(invalid_payload(correlation_id, &other)),
        };
        up.leaf = Some(leaf);
        return Ok(());
    }

    if let Some(id) = correlation_id.strip_prefix(DISCOVERY_CHAIN_WATCH_PREFIX) {
        let chain = match result {
            UpdateResult::DiscoveryChain(chain) => chain,
            other => return Err(invalid_payload(correlation_id, &other)),
        };
        up.discovery_chain.insert(id.to_string(), chain.clone());
        return reset_watches_from_chain(state, handles, up, id, &chain, transparent).await;
    }

    if let Some(rest) = correlation_id.strip_prefix(UPSTREAM_TARGET_WATCH_PREFIX) {
        let nodes = match result {
            UpdateResult::Endpoints(nodes) => nodes,
            other => return Err(invalid_payload(correlation_id, &other)),
        };
        let Some((target_id, upstream_id)) = remove_colon_prefix(rest) else {
            return Err(Error::schema(format!(
                "invalid correlation id {:?}",
                correlation_id
            )));
        };

        up.watched_upstream_endpoints
            .entry(upstream_id.to_string())
            .or_default()
            .insert(target_id.to_string(), nodes.clone());

        // Record passthrough addresses for instances that are dialed
        // directly, keyed by the destination service so multiple chains
        // reaching the same target dedup into one entry.
        if transparent {
            if let Some(trust_domain) = &trust_domain {
                for node in &nodes {
                    let dialed_directly = node
                        .service
                        .proxy
                        .as_ref()
                        .map(|p| p.dialed_directly)
                        .unwrap_or(false);
                    if !dialed_directly {
                        continue;
                    }

                    let destination = node.destination_service_name();
                    let entry = up
                        .passthrough_upstreams
                        .entry(destination.to_string())
                        .or_insert_with(|| ServicePassthroughAddrs {
                            sni: service_sni(
                                &destination.name,
                                &destination.namespace,
                                &local_datacenter,
                                trust_domain,
                            ),
                            addrs: HashSet::new(),
                        });
                    let (address, _) = node.best_address(false);
                    entry.addrs.insert(address);
                }
            }
        }
        return Ok(());
    }

    if let Some(rest) = correlation_id.strip_prefix(MESH_GATEWAY_WATCH_PREFIX) {
        let nodes = match result {
            UpdateResult::NodesWithGateways(nodes) => nodes,
            other => return Err(invalid_payload(correlation_id, &other)),
        };
        let Some((datacenter, upstream_id)) = remove_colon_prefix(rest) else {
            return Err(Error::schema(format!(
                "invalid correlation id {:?}",
                correlation_id
            )));
        };
        up.watched_gateway_endpoints
            .entry(upstream_id.to_string())
            .or_default()
            .insert(datacenter.to_string(), nodes);
        return Ok(());
    }

    Err(Error::schema(format!(
        "unknown correlation id {:?}",
        correlation_id
    )))
}

/// Replace the target and gateway watches implied by a fresh chain.
///
/// Everything about the upstream is reset when its chain changes in any
/// way; per-target diffing is not worth the bookkeeping.
async fn reset_watches_from_chain(
    state: &HandlerState,
    handles: &mut WatchHandles,
    up: &mut UpstreamsData,
    id: &str,
    chain: &CompiledDiscoveryChain,
    transparent: bool,
) -> Result<(), Error> {
    trace!(upstream = id, chain = %chain.service_name, "Resetting watches for discovery chain");

    up.watched_upstreams.entry(id.to_string()).or_default();
    up.watched_upstream_endpoints
        .entry(id.to_string())
        .or_default();
    up.watched_gateways.entry(id.to_string()).or_default();
    up.watched_gateway_endpoints
        .entry(id.to_string())
        .or_default();

    let watched = up.watched_upstreams.get_mut(id).unwrap();
    let endpoints = up.watched_upstream_endpoints.get_mut(id).unwrap();
    for (target_id, handle) in watched.drain() {
        trace!(upstream = id, target = %target_id, "Stopping watch of target");
        endpoints.remove(&target_id);
        handles.cancel(handle);
    }

    let chain_id = chain.id();
    let mut watched_chain_endpoints = false;
    let mut need_gateways: HashSet<String> = HashSet::new();

    for target in &chain.targets {
        if target.id == chain_id {
            watched_chain_endpoints = true;
        }

        watch_upstream_target(
            state,
            handles,
            up,
            id,
            &target.id,
            &target.service,
            &target.namespace,
            &target.datacenter,
            &target.subset_filter,
        )
        .await?;

        // Endpoints come from the gateway query, but health still comes
        // from the backing service query.
        match target.mesh_gateway.mode {
            MeshGatewayMode::Remote => {
                need_gateways.insert(target.datacenter.clone());
            }
            MeshGatewayMode::Local => {
                need_gateways.insert(state.config.source.datacenter.clone());
            }
            _ => {}
        }
    }

    // If no chain target covers the chain's own endpoints, a transparent
    // proxy watches them separately: a service that redirects to another
    // still needs its own virtual address associated with this chain.
    if !watched_chain_endpoints && transparent {
        watch_upstream_target(
            state,
            handles,
            up,
            id,
            &chain_id,
            &chain.service_name,
            &chain.namespace,
            &chain.datacenter,
            "",
        )
        .await?;
    }

    for datacenter in &need_gateways {
        if up.watched_gateways[id].contains_key(datacenter) {
            continue;
        }
        trace!(
            upstream = id,
            chain = %chain.service_name,
            datacenter = %datacenter,
            "Initializing watch of mesh gateway in datacenter"
        );

        let correlation_id = format!("{}{}:{}", MESH_GATEWAY_WATCH_PREFIX, datacenter, id);
        let handle = state
            .start_cache_watch(
                handles,
                CacheKind::ServiceDump,
                CacheRequest::ServiceDump {
                    datacenter: datacenter.clone(),
                    token: state.instance.token.clone(),
                    kind: ServiceKind::MeshGateway,
                    source: state.config.source.clone(),
                },
                correlation_id,
            )
            .await?;
        up.watched_gateways
            .get_mut(id)
            .unwrap()
            .insert(datacenter.clone(), handle);
    }

    let gateways = up.watched_gateways.get_mut(id).unwrap();
    let stale: Vec<String> = gateways
        .keys()
        .filter(|dc| !need_gateways.contains(*dc))
        .cloned()
        .collect();
    for datacenter in stale {
        trace!(
            upstream = id,
            chain = %chain.service_name,
            datacenter = %datacenter,
            "Stopping watch of mesh gateway in datacenter"
        );
        if let Some(handle) = gateways.remove(&datacenter) {
            handles.cancel(handle);
        }
        up.watched_gateway_endpoints
            .get_mut(id)
            .unwrap()
            .remove(&datacenter);
    }

    Ok(())
}

/// Watch the healthy endpoints of one chain target.
#[allow(clippy::too_many_arguments)]
async fn watch_upstream_target(
    state: &HandlerState,
    handles: &mut WatchHandles,
    up: &mut UpstreamsData,
    upstream_id: &str,
    target_id: &str,
    service: &str,
    namespace: &str,
    datacenter: &str,
    filter: &str,
) -> Result<(), Error> {
    trace!(
        upstream = upstream_id,
        chain = service,
        target = target_id,
        "Initializing watch of target"
    );

    let correlation_id = format!("{}{}:{}", UPSTREAM_TARGET_WATCH_PREFIX, target_id, upstream_id);
    let handle = state
        .start_health_watch(
            handles,
            HealthRequest {
                datacenter: datacenter.to_string(),
                token: state.instance.token.clone(),
                service: service.to_string(),
                namespace: namespace.to_string(),
                connect: true,
                filter: if filter.is_empty() {
                    None
                } else {
                    Some(filter.to_string())
                },
                source: state.config.source.clone(),
            },
            correlation_id,
        )
        .await?;
    up.watched_upstreams
        .get_mut(upstream_id)
        .unwrap()
        .insert(target_id.to_string(), handle);
    Ok(())
}
