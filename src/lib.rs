#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! A load-generation and measurement harness for distributed, transactional key-value caches.
//!
//! With `cachebench`, you describe a cluster (which engine, how many nodes, replicated or
//! distributed) and a workload (reader and writer threads, key space, payload size, warm-up and
//! measurement lengths) in TOML. The harness then populates the cache, releases all workers at the
//! same instant, lets the load warm up, resets the counters, measures, and finally reports reads
//! per second and writes per second independently.
//!
//! The cache engine is a black box reached through a narrow interface: [`CacheEngine`] starts
//! nodes, a [`CacheNode`] hands out per-thread [`CacheHandle`]s and reports the cluster membership
//! it sees. Engines are registered by name, so users can benchmark their own engine by implementing
//! the traits, registering a constructor, and calling [`cmdline()`] from their own `main`.
//!
//! A few key design choices include:
//!
//! - The workload mix is realized up front as a split of thread counts: every worker is either a
//!   reader or a writer for its whole lifetime. No per-call coin flips, no shared work pool.
//! - One seeded random source is threaded through the key space, the payloads and the workers.
//!   Given a seed and a single thread per mode, two runs touch exactly the same keys.
//! - Individual operation failures (lock timeouts, failed commits) are counted and absorbed. Only
//!   setup failures abort a run.
//!
//! More detailed usage could be found in the module-level rustdocs:
//!
//! - [`mod@bench`] for the config format of a benchmark and the phases of a run.
//! - [`mod@cluster`] for the config format of a cluster.
//! - [`mod@engines`] for the built-in engines.
//! - [`cmdline()`] for the usage of the default command line interface.

use serde::Deserialize;
use std::sync::Arc;

pub use error::{BenchError, CacheError};

/// How keys are placed on the nodes of a cluster.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    /// Every node holds every key.
    #[default]
    Replicated,
    /// Each key lives on a subset of the nodes.
    Distributed,
}

/// Per-node options handed to [`CacheEngine::start_node`].
#[derive(Clone, Debug, PartialEq)]
pub struct NodeOpt {
    pub mode: ClusterMode,
    /// The number of nodes the cluster is going to have once fully formed.
    pub nodes: usize,
}

/// A cache engine that can start nodes.
///
/// An engine instance is created once per run from the `[cluster]` section of the configuration,
/// and all nodes of the run are started from it. Nodes started from the same engine are expected
/// to form one cluster.
pub trait CacheEngine: Send + Sync {
    /// Start the node with the given index. The node may become a visible member of the cluster
    /// asynchronously; the harness polls [`CacheNode::member_count`] before it starts.
    fn start_node(&self, index: usize, opt: &NodeOpt) -> Result<Arc<dyn CacheNode>, CacheError>;
}

/// A running node of a cache cluster.
///
/// A node is shared by every worker thread bound to it, and each of those threads creates its own
/// [`CacheHandle`]. The node owns nothing of the harness; it only needs to be stopped once.
pub trait CacheNode: Send + Sync + 'static {
    /// The index this node was started with.
    fn id(&self) -> usize;

    /// Create a handle to be used by a single thread.
    fn handle(&self) -> Box<dyn CacheHandle>;

    /// The number of cluster members this node currently sees, itself included.
    fn member_count(&self) -> usize;

    /// Stop the node. Called exactly once by the harness.
    fn stop(&self) -> Result<(), CacheError>;
}

/// A per-thread handle that references a [`CacheNode`].
///
/// The handle is the real object that exposes a key-value interface. Operations issued between
/// [`begin`](CacheHandle::begin) and [`commit`](CacheHandle::commit) or
/// [`rollback`](CacheHandle::rollback) belong to one unit of work; see
/// [`transaction::with_transaction`] for the wrapper the workers use.
pub trait CacheHandle {
    /// Retrieving the value of a key if it exists.
    fn get(&mut self, key: &[u8]) -> Result<Option<Box<[u8]>>, CacheError>;

    /// Adding a new key-value pair or blindly updating an existing key's value.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), CacheError>;

    /// Begin a unit of work. When `force_two_phase` is set, the engine must run the full
    /// prepare/commit protocol even if only a single resource takes part.
    fn begin(&mut self, force_two_phase: bool) -> Result<(), CacheError>;

    /// Commit the active unit of work.
    fn commit(&mut self) -> Result<(), CacheError>;

    /// Discard the active unit of work.
    fn rollback(&mut self) -> Result<(), CacheError>;
}

pub mod bench;
pub mod cluster;
mod cmdline;
pub mod engines;
pub mod error;
pub mod report;
pub mod thread;
pub mod transaction;
pub mod workload;

pub use cmdline::cmdline;

pub extern crate inventory;
pub extern crate toml;
