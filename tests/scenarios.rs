//! End-to-end assembler scenarios against a recording fake cache
//!
//! The fake accepts every subscription, records its request and token, and
//! lets tests deliver update events through the recorded sinks, which is
//! exactly the contract the real cache layer implements.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use meshcfg::cache::{
    CacheKind, CacheNotifier, CacheRequest, Health, HealthRequest, UpdateEvent, UpdateResult,
};
use meshcfg::snapshot::ConfigSnapshot;
use meshcfg::types::chain::{CompiledDiscoveryChain, DiscoveryTarget};
use meshcfg::types::entries::{
    ConfigEntry, GatewayService, GatewayTlsConfig, IngressGatewayEntry, ServiceConfigResponse,
};
use meshcfg::types::{
    CaRoots, CheckServiceNode, DnsConfig, EndpointService, IssuedCert, Node, ProxyConfig,
    ProxyMode, ProxyRegistration, QuerySource, ServiceKind, ServiceName, Upstream,
};
use meshcfg::{Error, Manager, ManagerConfig};

#[derive(Clone)]
#[allow(dead_code)]
struct RecordedWatch {
    correlation_id: String,
    request: Option<CacheRequest>,
    health_request: Option<HealthRequest>,
    token: CancellationToken,
    sink: mpsc::Sender<UpdateEvent>,
}

/// Recording subscription provider shared by cache and health roles.
#[derive(Default)]
struct FakeCache {
    watches: Mutex<Vec<RecordedWatch>>,
}

impl FakeCache {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Correlation ids of all watches whose tokens are still live
    fn active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .watches
            .lock()
            .iter()
            .filter(|w| !w.token.is_cancelled())
            .map(|w| w.correlation_id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// All recorded watches for one correlation id, oldest first
    fn watches_for(&self, correlation_id: &str) -> Vec<RecordedWatch> {
        self.watches
            .lock()
            .iter()
            .filter(|w| w.correlation_id == correlation_id)
            .cloned()
            .collect()
    }

    fn has_active(&self, correlation_id: &str) -> bool {
        self.watches_for(correlation_id)
            .iter()
            .any(|w| !w.token.is_cancelled())
    }

    /// Deliver a successful event through the newest watch for the id
    async fn deliver(&self, correlation_id: &str, result: UpdateResult) {
        let watch = self
            .watches_for(correlation_id)
            .pop()
            .unwrap_or_else(|| panic!("no watch registered for {:?}", correlation_id));
        watch
            .sink
            .send(UpdateEvent::ok(correlation_id, result))
            .await
            .expect("inbound channel open");
    }

    /// Deliver an error event through the newest watch for the id
    async fn deliver_err(&self, correlation_id: &str, msg: &str) {
        let watch = self
            .watches_for(correlation_id)
            .pop()
            .unwrap_or_else(|| panic!("no watch registered for {:?}", correlation_id));
        watch
            .sink
            .send(UpdateEvent::err(correlation_id, msg))
            .await
            .expect("inbound channel open");
    }
}

#[async_trait]
impl CacheNotifier for FakeCache {
    async fn notify(
        &self,
        shutdown: CancellationToken,
        _kind: CacheKind,
        request: CacheRequest,
        correlation_id: String,
        sink: mpsc::Sender<UpdateEvent>,
    ) -> Result<(), Error> {
        self.watches.lock().push(RecordedWatch {
            correlation_id,
            request: Some(request),
            health_request: None,
            token: shutdown,
            sink,
        });
        Ok(())
    }
}

#[async_trait]
impl Health for FakeCache {
    async fn notify(
        &self,
        shutdown: CancellationToken,
        request: HealthRequest,
        correlation_id: String,
        sink: mpsc::Sender<UpdateEvent>,
    ) -> Result<(), Error> {
        self.watches.lock().push(RecordedWatch {
            correlation_id,
            request: None,
            health_request: Some(request),
            token: shutdown,
            sink,
        });
        Ok(())
    }
}

/// Let the manager's event loop drain everything delivered so far.
async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

fn manager_config(cache: &Arc<FakeCache>) -> ManagerConfig {
    // Surface manager logs under RUST_LOG when a test needs debugging.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    ManagerConfig {
        source: QuerySource {
            datacenter: "dc1".to_string(),
            node: "agent-1".to_string(),
            segment: String::new(),
        },
        cache: cache.clone(),
        health: cache.clone(),
        dns: DnsConfig {
            domain: "consul".to_string(),
            alt_domain: "example.com".to_string(),
        },
        server_sni_fn: None,
        intention_default_allow: false,
    }
}

fn roots() -> CaRoots {
    CaRoots {
        trust_domain: "11111111-2222.consul".to_string(),
        active_root_id: "R1".to_string(),
        ..Default::default()
    }
}

fn leaf(service: &str) -> IssuedCert {
    IssuedCert {
        serial_number: "L1".to_string(),
        service: service.to_string(),
        namespace: "default".to_string(),
        ..Default::default()
    }
}

fn endpoint(node: &str, address: &str, port: u16) -> CheckServiceNode {
    CheckServiceNode {
        node: Node {
            name: node.to_string(),
            datacenter: "dc1".to_string(),
            address: address.to_string(),
        },
        service: EndpointService {
            name: "db".to_string(),
            port,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn sidecar_registration() -> ProxyRegistration {
    ProxyRegistration {
        kind: Some(ServiceKind::ConnectProxy),
        id: "web-sidecar".to_string(),
        service: "web-sidecar".to_string(),
        namespace: "default".to_string(),
        address: "10.0.0.1".to_string(),
        port: 20000,
        proxy: ProxyConfig {
            destination_service_name: "web".to_string(),
            destination_service_id: "web".to_string(),
            upstreams: vec![Upstream {
                destination_name: "db".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Deliver the identity material every connect proxy needs.
async fn deliver_identity(cache: &Arc<FakeCache>) {
    cache.deliver("roots", UpdateResult::Roots(roots())).await;
    cache.deliver("leaf", UpdateResult::Leaf(leaf("web"))).await;
    cache
        .deliver("intentions", UpdateResult::IntentionMatches(vec![vec![]]))
        .await;
}

// =============================================================================
// Connect proxy
// =============================================================================

#[tokio::test(start_paused = true)]
async fn connect_proxy_happy_path() {
    let cache = FakeCache::new();
    let mut manager = Manager::new(&sidecar_registration(), "token", manager_config(&cache))
        .expect("valid registration");
    let mut snapshots = manager.watch().await.expect("watch starts");
    settle().await;

    assert_eq!(
        cache.active_ids(),
        vec![
            "discovery-chain:db",
            "intentions",
            "leaf",
            "roots",
            "service-http-checks:web",
        ]
    );

    deliver_identity(&cache).await;
    cache
        .deliver(
            "discovery-chain:db",
            UpdateResult::DiscoveryChain(CompiledDiscoveryChain::single_target(
                "db", "default", "dc1",
            )),
        )
        .await;
    settle().await;

    assert!(cache.has_active("upstream-target:db.default.dc1.internal:db"));

    cache
        .deliver(
            "upstream-target:db.default.dc1.internal:db",
            UpdateResult::Endpoints(vec![
                endpoint("node1", "10.0.0.2", 8080),
                endpoint("node2", "10.0.0.3", 8080),
            ]),
        )
        .await;

    let snap = tokio::time::timeout(Duration::from_secs(5), snapshots.recv())
        .await
        .expect("snapshot published")
        .expect("channel open");

    assert_eq!(snap.roots.as_ref().unwrap().active_root_id, "R1");
    let d = snap.connect_proxy().unwrap();
    assert_eq!(d.upstreams.leaf.as_ref().unwrap().serial_number, "L1");
    assert!(d.intentions_set);
    assert!(d.intentions.is_empty());

    let targets = &d.upstreams.watched_upstream_endpoints["db"];
    let nodes = &targets["db.default.dc1.internal"];
    assert_eq!(nodes.len(), 2);
    assert_eq!(nodes[0].node.name, "node1");
    assert_eq!(nodes[1].node.name, "node2");
}

#[tokio::test(start_paused = true)]
async fn connect_proxy_snapshot_request_returns_none_until_valid() {
    let cache = FakeCache::new();
    let mut manager = Manager::new(&sidecar_registration(), "token", manager_config(&cache))
        .expect("valid registration");
    let _snapshots = manager.watch().await.expect("watch starts");
    settle().await;

    cache.deliver("roots", UpdateResult::Roots(roots())).await;
    settle().await;
    assert!(manager.current_snapshot().await.is_none());

    cache.deliver("leaf", UpdateResult::Leaf(leaf("web"))).await;
    cache
        .deliver("intentions", UpdateResult::IntentionMatches(vec![vec![]]))
        .await;
    cache
        .deliver(
            "discovery-chain:db",
            UpdateResult::DiscoveryChain(CompiledDiscoveryChain::single_target(
                "db", "default", "dc1",
            )),
        )
        .await;
    settle().await;
    cache
        .deliver(
            "upstream-target:db.default.dc1.internal:db",
            UpdateResult::Endpoints(vec![endpoint("node1", "10.0.0.2", 8080)]),
        )
        .await;
    settle().await;

    let snap = manager.current_snapshot().await.expect("valid snapshot");
    assert!(snap.roots.is_some());
}

#[tokio::test(start_paused = true)]
async fn transparent_mode_infers_upstreams_from_intentions() {
    let mut registration = sidecar_registration();
    registration.proxy.mode = ProxyMode::Transparent;
    registration.proxy.upstreams.clear();

    let cache = FakeCache::new();
    let mut manager =
        Manager::new(&registration, "token", manager_config(&cache)).expect("valid registration");
    let mut snapshots = manager.watch().await.expect("watch starts");
    settle().await;

    assert_eq!(
        cache.active_ids(),
        vec![
            "intention-upstreams",
            "intentions",
            "leaf",
            "mesh",
            "roots",
            "service-http-checks:web",
        ]
    );

    deliver_identity(&cache).await;
    cache.deliver("mesh", UpdateResult::ConfigEntry(None)).await;
    cache
        .deliver(
            "intention-upstreams",
            UpdateResult::ServiceList(vec![ServiceName::default_ns("svcA")]),
        )
        .await;
    settle().await;

    assert!(cache.has_active("discovery-chain:svcA"));

    cache
        .deliver(
            "discovery-chain:svcA",
            UpdateResult::DiscoveryChain(CompiledDiscoveryChain::single_target(
                "svcA", "default", "dc1",
            )),
        )
        .await;
    settle().await;
    cache
        .deliver(
            "upstream-target:svcA.default.dc1.internal:svcA",
            UpdateResult::Endpoints(vec![endpoint("node1", "10.0.0.2", 8080)]),
        )
        .await;

    let snap = tokio::time::timeout(Duration::from_secs(5), snapshots.recv())
        .await
        .expect("snapshot published")
        .expect("channel open");
    let d = snap.connect_proxy().unwrap();
    assert!(d.mesh_config_set);
    assert!(d.mesh_config.is_none());
    assert!(d.upstreams.discovery_chain.contains_key("svcA"));
}

#[tokio::test(start_paused = true)]
async fn transparent_mode_purges_dropped_inferred_upstreams() {
    let mut registration = sidecar_registration();
    registration.proxy.mode = ProxyMode::Transparent;
    registration.proxy.upstreams.clear();

    let cache = FakeCache::new();
    let mut manager =
        Manager::new(&registration, "token", manager_config(&cache)).expect("valid registration");
    let _snapshots = manager.watch().await.expect("watch starts");
    settle().await;

    deliver_identity(&cache).await;
    cache.deliver("mesh", UpdateResult::ConfigEntry(None)).await;
    cache
        .deliver(
            "intention-upstreams",
            UpdateResult::ServiceList(vec![ServiceName::default_ns("svcA")]),
        )
        .await;
    settle().await;
    cache
        .deliver(
            "discovery-chain:svcA",
            UpdateResult::DiscoveryChain(CompiledDiscoveryChain::single_target(
                "svcA", "default", "dc1",
            )),
        )
        .await;
    settle().await;
    cache
        .deliver(
            "upstream-target:svcA.default.dc1.internal:svcA",
            UpdateResult::Endpoints(vec![endpoint("node1", "10.0.0.2", 8080)]),
        )
        .await;
    settle().await;

    // svcA disappears from the inferred set: its chain and target watches
    // go away and the mirrored state is purged.
    cache
        .deliver("intention-upstreams", UpdateResult::ServiceList(vec![]))
        .await;
    settle().await;

    assert!(!cache.has_active("discovery-chain:svcA"));
    assert!(!cache.has_active("upstream-target:svcA.default.dc1.internal:svcA"));

    let snap = manager.current_snapshot().await.expect("still valid");
    let d = snap.connect_proxy().unwrap();
    assert!(!d.upstreams.discovery_chain.contains_key("svcA"));
    assert!(!d.upstreams.watched_upstream_endpoints.contains_key("svcA"));
}

#[tokio::test(start_paused = true)]
async fn chain_retargeting_replaces_target_watches() {
    let cache = FakeCache::new();
    let mut manager = Manager::new(&sidecar_registration(), "token", manager_config(&cache))
        .expect("valid registration");
    let mut snapshots = manager.watch().await.expect("watch starts");
    settle().await;

    deliver_identity(&cache).await;
    cache
        .deliver(
            "discovery-chain:db",
            UpdateResult::DiscoveryChain(CompiledDiscoveryChain::single_target(
                "db", "default", "dc1",
            )),
        )
        .await;
    settle().await;
    cache
        .deliver(
            "upstream-target:db.default.dc1.internal:db",
            UpdateResult::Endpoints(vec![endpoint("node1", "10.0.0.2", 8080)]),
        )
        .await;
    let _first = tokio::time::timeout(Duration::from_secs(5), snapshots.recv())
        .await
        .expect("snapshot published")
        .expect("channel open");

    // The chain now resolves db through db-v2.
    let mut retargeted = CompiledDiscoveryChain::single_target("db", "default", "dc1");
    retargeted.targets = vec![DiscoveryTarget::new("db-v2", "default", "dc1")];
    cache
        .deliver("discovery-chain:db", UpdateResult::DiscoveryChain(retargeted))
        .await;
    settle().await;

    assert!(!cache.has_active("upstream-target:db.default.dc1.internal:db"));
    assert!(cache.has_active("upstream-target:db-v2.default.dc1.internal:db"));

    cache
        .deliver(
            "upstream-target:db-v2.default.dc1.internal:db",
            UpdateResult::Endpoints(vec![endpoint("node3", "10.0.0.4", 8080)]),
        )
        .await;
    settle().await;

    let snap = manager.current_snapshot().await.expect("valid snapshot");
    let targets = &snap.connect_proxy().unwrap().upstreams.watched_upstream_endpoints["db"];
    assert!(!targets.contains_key("db.default.dc1.internal"));
    assert_eq!(targets["db-v2.default.dc1.internal"].len(), 1);
}

#[tokio::test(start_paused = true)]
async fn redelivering_an_event_is_idempotent() {
    let cache = FakeCache::new();
    let mut manager = Manager::new(&sidecar_registration(), "token", manager_config(&cache))
        .expect("valid registration");
    let _snapshots = manager.watch().await.expect("watch starts");
    settle().await;

    deliver_identity(&cache).await;
    cache
        .deliver(
            "discovery-chain:db",
            UpdateResult::DiscoveryChain(CompiledDiscoveryChain::single_target(
                "db", "default", "dc1",
            )),
        )
        .await;
    settle().await;

    let nodes = vec![endpoint("node1", "10.0.0.2", 8080)];
    cache
        .deliver(
            "upstream-target:db.default.dc1.internal:db",
            UpdateResult::Endpoints(nodes.clone()),
        )
        .await;
    settle().await;
    let before = manager.current_snapshot().await.expect("valid snapshot");

    cache
        .deliver(
            "upstream-target:db.default.dc1.internal:db",
            UpdateResult::Endpoints(nodes),
        )
        .await;
    settle().await;
    let after = manager.current_snapshot().await.expect("valid snapshot");

    assert_eq!(before.connect_proxy(), after.connect_proxy());
    assert_eq!(before.roots, after.roots);
}

#[tokio::test(start_paused = true)]
async fn undrained_consumer_still_receives_latest_snapshot() {
    let cache = FakeCache::new();
    let mut manager = Manager::new(&sidecar_registration(), "token", manager_config(&cache))
        .expect("valid registration");
    let mut snapshots = manager.watch().await.expect("watch starts");
    settle().await;

    deliver_identity(&cache).await;
    cache
        .deliver(
            "discovery-chain:db",
            UpdateResult::DiscoveryChain(CompiledDiscoveryChain::single_target(
                "db", "default", "dc1",
            )),
        )
        .await;
    settle().await;
    cache
        .deliver(
            "upstream-target:db.default.dc1.internal:db",
            UpdateResult::Endpoints(vec![endpoint("node1", "10.0.0.2", 8080)]),
        )
        .await;

    // Let the first snapshot land in the (undrained) outbound slot.
    tokio::time::sleep(Duration::from_millis(500)).await;

    // A newer update cannot be delivered while the slot is full, but the
    // assembler keeps running and retries instead of blocking.
    cache
        .deliver(
            "upstream-target:db.default.dc1.internal:db",
            UpdateResult::Endpoints(vec![
                endpoint("node1", "10.0.0.2", 8080),
                endpoint("node2", "10.0.0.3", 8080),
            ]),
        )
        .await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let stale = snapshots.recv().await.expect("buffered snapshot");
    assert_eq!(
        stale.connect_proxy().unwrap().upstreams.watched_upstream_endpoints["db"]
            ["db.default.dc1.internal"]
            .len(),
        1
    );

    // The re-armed coalesce timer delivers the superseding snapshot.
    let latest = tokio::time::timeout(Duration::from_secs(5), snapshots.recv())
        .await
        .expect("retried delivery")
        .expect("channel open");
    assert_eq!(
        latest.connect_proxy().unwrap().upstreams.watched_upstream_endpoints["db"]
            ["db.default.dc1.internal"]
            .len(),
        2
    );
}

#[tokio::test(start_paused = true)]
async fn errors_and_schema_mismatches_do_not_stop_the_loop() {
    let cache = FakeCache::new();
    let mut manager = Manager::new(&sidecar_registration(), "token", manager_config(&cache))
        .expect("valid registration");
    let mut snapshots = manager.watch().await.expect("watch starts");
    settle().await;

    // A transient cache error and a payload delivered under the wrong
    // correlation id are both logged and skipped.
    cache.deliver_err("roots", "rpc timed out").await;
    cache.deliver("leaf", UpdateResult::Roots(roots())).await;
    settle().await;

    deliver_identity(&cache).await;
    cache
        .deliver(
            "discovery-chain:db",
            UpdateResult::DiscoveryChain(CompiledDiscoveryChain::single_target(
                "db", "default", "dc1",
            )),
        )
        .await;
    settle().await;
    cache
        .deliver(
            "upstream-target:db.default.dc1.internal:db",
            UpdateResult::Endpoints(vec![endpoint("node1", "10.0.0.2", 8080)]),
        )
        .await;

    let snap = tokio::time::timeout(Duration::from_secs(5), snapshots.recv())
        .await
        .expect("loop survived bad events")
        .expect("channel open");
    assert!(snap.valid());
}

#[tokio::test(start_paused = true)]
async fn close_cancels_watches_and_closes_the_channel() {
    let cache = FakeCache::new();
    let mut manager = Manager::new(&sidecar_registration(), "token", manager_config(&cache))
        .expect("valid registration");
    let mut snapshots = manager.watch().await.expect("watch starts");
    settle().await;

    manager.close();
    settle().await;

    assert!(cache.watches_for("roots")[0].token.is_cancelled());
    assert!(snapshots.recv().await.is_none(), "channel closes on close");
}

// =============================================================================
// Terminating gateway
// =============================================================================

fn terminating_registration() -> ProxyRegistration {
    ProxyRegistration {
        kind: Some(ServiceKind::TerminatingGateway),
        id: "east-gateway".to_string(),
        service: "east-gateway".to_string(),
        namespace: "default".to_string(),
        address: "10.0.0.1".to_string(),
        port: 8443,
        ..Default::default()
    }
}

fn linked(name: &str) -> GatewayService {
    GatewayService {
        gateway: ServiceName::default_ns("east-gateway"),
        service: ServiceName::default_ns(name),
        ..Default::default()
    }
}

async fn deliver_linked_service_state(cache: &Arc<FakeCache>, name: &str) {
    cache
        .deliver(
            &format!("external-service:{}", name),
            UpdateResult::Endpoints(vec![endpoint("node1", "10.0.0.2", 8080)]),
        )
        .await;
    cache
        .deliver(&format!("service-leaf:{}", name), UpdateResult::Leaf(leaf(name)))
        .await;
    cache
        .deliver(
            &format!("service-config:{}", name),
            UpdateResult::ServiceConfig(ServiceConfigResponse::default()),
        )
        .await;
    cache
        .deliver(
            &format!("service-resolver:{}", name),
            UpdateResult::ConfigEntries(vec![]),
        )
        .await;
    cache
        .deliver(
            &format!("service-intentions:{}", name),
            UpdateResult::IntentionMatches(vec![vec![]]),
        )
        .await;
}

#[tokio::test(start_paused = true)]
async fn terminating_gateway_add_and_remove_linked_service() {
    let cache = FakeCache::new();
    let mut manager = Manager::new(&terminating_registration(), "token", manager_config(&cache))
        .expect("valid registration");
    let _snapshots = manager.watch().await.expect("watch starts");
    settle().await;

    assert_eq!(cache.active_ids(), vec!["gateway-services", "roots"]);

    cache.deliver("roots", UpdateResult::Roots(roots())).await;
    cache
        .deliver(
            "gateway-services",
            UpdateResult::GatewayServices(vec![linked("svcX")]),
        )
        .await;
    settle().await;

    for prefix in [
        "external-service",
        "service-intentions",
        "service-leaf",
        "service-config",
        "service-resolver",
    ] {
        assert!(
            cache.has_active(&format!("{}:svcX", prefix)),
            "missing {} watch for svcX",
            prefix
        );
    }

    deliver_linked_service_state(&cache, "svcX").await;
    settle().await;

    let snap = manager.current_snapshot().await.expect("valid snapshot");
    let d = snap.terminating_gateway().unwrap();
    assert!(d.service_groups.contains_key(&ServiceName::default_ns("svcX")));
    assert!(d.service_resolvers_set.contains(&ServiceName::default_ns("svcX")));

    // svcX is replaced by svcY: the five svcX subscriptions die and every
    // mirrored piece of svcX state is purged.
    cache
        .deliver(
            "gateway-services",
            UpdateResult::GatewayServices(vec![linked("svcY")]),
        )
        .await;
    settle().await;

    for prefix in [
        "external-service",
        "service-intentions",
        "service-leaf",
        "service-config",
        "service-resolver",
    ] {
        assert!(
            !cache.has_active(&format!("{}:svcX", prefix)),
            "{} watch for svcX not cancelled",
            prefix
        );
        assert!(
            cache.has_active(&format!("{}:svcY", prefix)),
            "missing {} watch for svcY",
            prefix
        );
    }

    deliver_linked_service_state(&cache, "svcY").await;
    settle().await;

    let snap = manager.current_snapshot().await.expect("valid snapshot");
    let d = snap.terminating_gateway().unwrap();
    let svc_x = ServiceName::default_ns("svcX");
    assert!(!d.gateway_services.contains_key(&svc_x));
    assert!(!d.service_groups.contains_key(&svc_x));
    assert!(!d.service_leaves.contains_key(&svc_x));
    assert!(!d.service_configs.contains_key(&svc_x));
    assert!(!d.service_resolvers_set.contains(&svc_x));
    assert!(!d.intentions.contains_key(&svc_x));
    assert!(d.gateway_services.contains_key(&ServiceName::default_ns("svcY")));
}

#[tokio::test(start_paused = true)]
async fn terminating_gateway_with_no_services_is_valid() {
    let cache = FakeCache::new();
    let mut manager = Manager::new(&terminating_registration(), "token", manager_config(&cache))
        .expect("valid registration");
    let mut snapshots = manager.watch().await.expect("watch starts");
    settle().await;

    cache.deliver("roots", UpdateResult::Roots(roots())).await;
    cache
        .deliver("gateway-services", UpdateResult::GatewayServices(vec![]))
        .await;

    let snap = tokio::time::timeout(Duration::from_secs(5), snapshots.recv())
        .await
        .expect("empty gateway still publishes")
        .expect("channel open");
    assert!(snap.valid());
    assert!(snap.terminating_gateway().unwrap().gateway_services.is_empty());
}

// =============================================================================
// Mesh gateway
// =============================================================================

fn mesh_registration(wan_federation: bool) -> ProxyRegistration {
    let mut meta = HashMap::new();
    if wan_federation {
        meta.insert("consul-wan-federation".to_string(), "1".to_string());
    }
    ProxyRegistration {
        kind: Some(ServiceKind::MeshGateway),
        id: "mesh-gateway".to_string(),
        service: "mesh-gateway".to_string(),
        namespace: "default".to_string(),
        address: "10.0.0.1".to_string(),
        port: 8443,
        meta,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn mesh_gateway_tracks_services_and_datacenters() {
    let cache = FakeCache::new();
    let mut manager = Manager::new(&mesh_registration(false), "token", manager_config(&cache))
        .expect("valid registration");
    let _snapshots = manager.watch().await.expect("watch starts");
    settle().await;

    assert_eq!(
        cache.active_ids(),
        vec!["datacenters", "roots", "service-list", "service-resolvers"]
    );

    cache.deliver("roots", UpdateResult::Roots(roots())).await;
    cache
        .deliver(
            "service-list",
            UpdateResult::ServiceList(vec![ServiceName::default_ns("web")]),
        )
        .await;
    cache
        .deliver(
            "datacenters",
            UpdateResult::Datacenters(vec!["dc1".to_string(), "dc2".to_string()]),
        )
        .await;
    settle().await;

    assert!(cache.has_active("connect-service:web"));
    assert!(cache.has_active("mesh-gateway:dc2"));
    assert!(
        !cache.has_active("mesh-gateway:dc1"),
        "the source datacenter is never watched"
    );

    cache
        .deliver(
            "connect-service:web",
            UpdateResult::Endpoints(vec![endpoint("node1", "10.0.0.2", 8080)]),
        )
        .await;
    settle().await;

    let snap = manager.current_snapshot().await.expect("valid snapshot");
    let d = snap.mesh_gateway().unwrap();
    assert!(d.watched_services_set);
    assert!(d.service_groups.contains_key(&ServiceName::default_ns("web")));

    // The service disappears: its watch dies, but the endpoint state stays
    // until an (absent) empty delivery.
    cache
        .deliver("service-list", UpdateResult::ServiceList(vec![]))
        .await;
    settle().await;

    assert!(!cache.has_active("connect-service:web"));
    let snap = manager.current_snapshot().await.expect("still valid");
    assert!(snap
        .mesh_gateway()
        .unwrap()
        .service_groups
        .contains_key(&ServiceName::default_ns("web")));
}

#[tokio::test(start_paused = true)]
async fn wan_federated_mesh_gateway_watches_federation_state() {
    let cache = FakeCache::new();
    let mut manager = Manager::new(&mesh_registration(true), "token", manager_config(&cache))
        .expect("valid registration");
    let _snapshots = manager.watch().await.expect("watch starts");
    settle().await;

    assert!(cache.has_active("federation-state-list-mesh-gateways"));
    assert!(cache.has_active("consul-server-list"));
}

// =============================================================================
// Ingress gateway
// =============================================================================

fn ingress_registration() -> ProxyRegistration {
    ProxyRegistration {
        kind: Some(ServiceKind::IngressGateway),
        id: "ingress".to_string(),
        service: "ingress".to_string(),
        namespace: "default".to_string(),
        address: "10.0.0.1".to_string(),
        port: 8080,
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn ingress_gateway_generates_leaf_dns_sans() {
    let cache = FakeCache::new();
    let mut manager = Manager::new(&ingress_registration(), "token", manager_config(&cache))
        .expect("valid registration");
    let _snapshots = manager.watch().await.expect("watch starts");
    settle().await;

    assert_eq!(
        cache.active_ids(),
        vec!["gateway-config", "gateway-services", "roots"]
    );

    cache.deliver("roots", UpdateResult::Roots(roots())).await;
    cache
        .deliver(
            "gateway-config",
            UpdateResult::ConfigEntry(Some(ConfigEntry::IngressGateway(IngressGatewayEntry {
                name: "ingress".to_string(),
                tls: GatewayTlsConfig { enabled: true },
            }))),
        )
        .await;
    cache
        .deliver(
            "gateway-services",
            UpdateResult::GatewayServices(vec![GatewayService {
                gateway: ServiceName::default_ns("ingress"),
                service: ServiceName::new("web", "api"),
                port: 8080,
                protocol: "http".to_string(),
                hosts: vec!["api.example.com".to_string()],
                ..Default::default()
            }]),
        )
        .await;
    settle().await;

    assert!(cache.has_active("discovery-chain:web/api"));

    let leaf_watches = cache.watches_for("leaf");
    let request = leaf_watches
        .last()
        .expect("leaf watch issued")
        .request
        .clone()
        .expect("cache request recorded");
    let CacheRequest::LeafCert { dns_sans, service, .. } = request else {
        panic!("leaf watch must be a leaf-cert request");
    };
    assert_eq!(service, "ingress");
    assert_eq!(
        dns_sans,
        vec![
            "*.ingress.web.consul",
            "*.ingress.web.dc1.consul",
            "*.ingress.web.example.com",
            "*.ingress.web.dc1.example.com",
            "api.example.com",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn ingress_gateway_reissues_leaf_watch_on_host_changes() {
    let cache = FakeCache::new();
    let mut manager = Manager::new(&ingress_registration(), "token", manager_config(&cache))
        .expect("valid registration");
    let mut snapshots = manager.watch().await.expect("watch starts");
    settle().await;

    cache.deliver("roots", UpdateResult::Roots(roots())).await;
    cache
        .deliver(
            "gateway-config",
            UpdateResult::ConfigEntry(Some(ConfigEntry::IngressGateway(IngressGatewayEntry {
                name: "ingress".to_string(),
                tls: GatewayTlsConfig { enabled: true },
            }))),
        )
        .await;

    let web = GatewayService {
        gateway: ServiceName::default_ns("ingress"),
        service: ServiceName::new("web", "api"),
        port: 8080,
        protocol: "http".to_string(),
        hosts: vec!["api.example.com".to_string()],
        ..Default::default()
    };
    cache
        .deliver("gateway-services", UpdateResult::GatewayServices(vec![web.clone()]))
        .await;
    settle().await;

    let first_leaf = cache.watches_for("leaf").last().cloned().expect("leaf watch");

    let mut updated = web;
    updated.hosts.push("api2.example.com".to_string());
    cache
        .deliver("gateway-services", UpdateResult::GatewayServices(vec![updated]))
        .await;
    settle().await;

    assert!(
        first_leaf.token.is_cancelled(),
        "previous leaf watch must be cancelled before the new one"
    );
    let second_leaf = cache.watches_for("leaf").last().cloned().expect("leaf watch");
    let CacheRequest::LeafCert { dns_sans, .. } =
        second_leaf.request.clone().expect("cache request recorded")
    else {
        panic!("leaf watch must be a leaf-cert request");
    };
    assert!(dns_sans.contains(&"api2.example.com".to_string()));

    // Completing the snapshot still works after the re-issue.
    cache
        .deliver("leaf", UpdateResult::Leaf(leaf("ingress")))
        .await;
    cache
        .deliver(
            "discovery-chain:web/api",
            UpdateResult::DiscoveryChain(CompiledDiscoveryChain::single_target("api", "web", "dc1")),
        )
        .await;
    settle().await;

    let snap = tokio::time::timeout(Duration::from_secs(5), snapshots.recv())
        .await
        .expect("snapshot published")
        .expect("channel open");
    assert!(snap.valid());
    let d = snap.ingress_gateway().unwrap();
    assert!(d.tls_enabled);
    assert_eq!(d.hosts, vec!["api.example.com", "api2.example.com"]);
}

// =============================================================================
// Deep-clone property
// =============================================================================

#[tokio::test(start_paused = true)]
async fn published_snapshots_are_independent_clones() {
    let cache = FakeCache::new();
    let mut manager = Manager::new(&sidecar_registration(), "token", manager_config(&cache))
        .expect("valid registration");
    let mut snapshots = manager.watch().await.expect("watch starts");
    settle().await;

    deliver_identity(&cache).await;
    cache
        .deliver(
            "discovery-chain:db",
            UpdateResult::DiscoveryChain(CompiledDiscoveryChain::single_target(
                "db", "default", "dc1",
            )),
        )
        .await;
    settle().await;
    cache
        .deliver(
            "upstream-target:db.default.dc1.internal:db",
            UpdateResult::Endpoints(vec![endpoint("node1", "10.0.0.2", 8080)]),
        )
        .await;

    let first: ConfigSnapshot = tokio::time::timeout(Duration::from_secs(5), snapshots.recv())
        .await
        .expect("snapshot published")
        .expect("channel open");

    // Mutate the internal snapshot by delivering a different endpoint set;
    // the published copy must not change underneath the consumer.
    cache
        .deliver(
            "upstream-target:db.default.dc1.internal:db",
            UpdateResult::Endpoints(vec![
                endpoint("node1", "10.0.0.2", 8080),
                endpoint("node2", "10.0.0.3", 8080),
            ]),
        )
        .await;
    settle().await;

    assert_eq!(
        first.connect_proxy().unwrap().upstreams.watched_upstream_endpoints["db"]
            ["db.default.dc1.internal"]
            .len(),
        1
    );

    let second = manager.current_snapshot().await.expect("valid snapshot");
    assert_eq!(
        second.connect_proxy().unwrap().upstreams.watched_upstream_endpoints["db"]
            ["db.default.dc1.internal"]
            .len(),
        2
    );
}
