//! meshcfg - live proxy configuration for a service-mesh agent
//!
//! For each locally registered mesh-proxy instance (sidecar proxy,
//! terminating gateway, mesh gateway or ingress gateway) this crate
//! maintains a [`ConfigSnapshot`]: the merged view of every remote data
//! source the proxy's data-plane configuration depends on, kept current by
//! long-lived cache subscriptions.
//!
//! - **[`manager`]**: one [`Manager`] per proxy instance; consumes update
//!   events, reshapes child watches as dependencies appear, and publishes
//!   coalesced snapshots once they are valid.
//! - **[`sync`]**: the agent-wide anti-entropy [`sync::StateSyncer`] that
//!   keeps local agent state convergent with the remote authority on a
//!   jittered, cluster-size-aware cadence.
//! - **[`cache`]**: the subscription interfaces the agent's cache/RPC layer
//!   implements; this crate never performs blocking queries itself.
//!
//! # Architecture
//!
//! Every manager owns a root cancellation token; each subscription runs
//! under a child token registered in a handle table, and snapshot maps
//! track subscriptions only by opaque handle ids. The event loop is the
//! sole mutator of its snapshot; consumers get deep clones, either debounced
//! over the watch channel or on demand via
//! [`Manager::current_snapshot`].

pub mod cache;
pub mod error;
mod handlers;
pub mod manager;
pub mod snapshot;
pub mod sync;
pub mod trigger;
pub mod types;
pub mod watch;

pub use error::Error;
pub use manager::{Manager, ManagerConfig, COALESCE_TIMEOUT};
pub use snapshot::{ConfigSnapshot, ServerSniFn};
pub use sync::{ClusterSizeDelayer, Delayer, StateSyncer, SyncState};
pub use trigger::Trigger;
