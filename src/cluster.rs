//! Cache engines, their registry, and the lifecycle of the nodes a run is benchmarking.
//!
//! ## Configuration Format
//!
//! A cluster is described in a dictionary named `cluster`:
//!
//! ```toml
//! [cluster]
//! engine = "..." # name of the registered engine
//! nodes = 2 # number of nodes started, default 2
//! mode = "replicated" # or "distributed", default "replicated"
//! await_timeout = 60.0 # seconds to wait for all nodes to see each other, default 60
//! poll_interval = 0.1 # seconds between membership checks, default 0.1
//! # ... engine-specific options
//! ```
//!
//! Every key other than the ones above is handed to the engine's constructor. The options of the
//! built-in engines can be found in [`crate::engines`].
//!
//! ## Registering New Engines
//!
//! When users would like to benchmark their own cache, first of all, they need to implement
//! [`CacheEngine`], [`CacheNode`] and [`CacheHandle`](crate::CacheHandle) for it. Then, they need
//! to create a constructor function with a signature of
//! `fn(&toml::Table) -> Result<Box<dyn CacheEngine>, CacheError>`.
//!
//! The final step is to register the engine's constructor (along with its name) using
//! [`inventory`]. A minimal example would be: `inventory::submit! { Registry::new("name",
//! constructor_fn) };`.
//!
//! The source code of all built-in engines provide good examples on this process.

use crate::error::{BenchError, Result};
use crate::report::format_duration;
use crate::{CacheEngine, CacheError, CacheNode, ClusterMode, NodeOpt};
use hashbrown::HashMap;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use toml::Table;

/// The signature of an engine constructor.
pub type Constructor = fn(&Table) -> std::result::Result<Box<dyn CacheEngine>, CacheError>;

/// The centralized registry that maps the name of a cache engine to its constructor function.
///
/// A user-defined engine can use the [`inventory::submit!`] macro to register itself to be used
/// in the benchmark framework.
pub struct Registry<'a> {
    pub(crate) name: &'a str,
    constructor: Constructor,
}

impl<'a> Registry<'a> {
    pub const fn new(name: &'a str, constructor: Constructor) -> Self {
        Self { name, constructor }
    }
}

inventory::collect!(Registry<'static>);

fn registry() -> HashMap<&'static str, Constructor> {
    let mut registered: HashMap<&'static str, Constructor> = HashMap::new();
    for r in inventory::iter::<Registry> {
        debug!("Adding supported engine: {}", r.name);
        assert!(
            registered.insert(r.name, r.constructor).is_none(),
            "engine {} is registered twice",
            r.name
        );
    }
    registered
}

/// Names of all registered engines, sorted.
pub fn registered() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = registry().into_keys().collect();
    names.sort_unstable();
    names
}

/// The `[cluster]` section of a configuration.
#[derive(Deserialize, Clone, Debug)]
pub struct ClusterOpt {
    pub engine: String,
    pub nodes: Option<usize>,
    pub mode: Option<ClusterMode>,
    pub await_timeout: Option<f32>,
    pub poll_interval: Option<f32>,
    #[serde(flatten)]
    pub opt: Table,
}

impl ClusterOpt {
    pub fn nodes(&self) -> usize {
        self.nodes.unwrap_or(2)
    }

    pub fn mode(&self) -> ClusterMode {
        self.mode.unwrap_or_default()
    }

    fn timing(&self) -> Result<(Duration, Duration)> {
        let await_timeout = Duration::try_from_secs_f32(self.await_timeout.unwrap_or(60.0))
            .map_err(|_| invalid("await_timeout should be a non-negative number of seconds"))?;
        let poll_interval = Duration::try_from_secs_f32(self.poll_interval.unwrap_or(0.1))
            .map_err(|_| invalid("poll_interval should be a non-negative number of seconds"))?;
        if poll_interval.is_zero() {
            return Err(invalid("poll_interval should be positive"));
        }
        Ok((await_timeout, poll_interval))
    }
}

impl fmt::Display for ClusterOpt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.mode() {
            ClusterMode::Replicated => "replicated",
            ClusterMode::Distributed => "distributed",
        };
        write!(
            f,
            "cluster engine {} nodes {} mode {}",
            self.engine,
            self.nodes(),
            mode
        )
    }
}

fn invalid(msg: &str) -> BenchError {
    BenchError::Invalid(msg.to_string())
}

/// Wait until `node` sees at least `expected` members.
///
/// The poll interval doubles after every miss, up to one second or `poll`, whichever is larger.
/// Fails with [`BenchError::ClusterTimeout`] once `timeout` has passed.
pub fn await_membership(
    expected: usize,
    node: &dyn CacheNode,
    poll: Duration,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    let max_poll = poll.max(Duration::from_secs(1));
    let mut interval = poll;
    loop {
        let seen = node.member_count();
        if seen >= expected {
            debug!("Node {} sees {} members", node.id(), seen);
            return Ok(());
        }
        let waited = start.elapsed();
        if waited >= timeout {
            return Err(BenchError::ClusterTimeout {
                expected,
                seen,
                waited,
            });
        }
        std::thread::sleep(interval.min(timeout - waited));
        interval = (interval * 2).min(max_poll);
    }
}

/// How long a cluster took to start and form.
#[derive(Clone, Debug, PartialEq)]
pub struct Startup {
    pub nodes: usize,
    /// From constructing the engine until every node sees the full cluster.
    pub elapsed: Duration,
}

impl fmt::Display for Startup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "startup nodes {} elapsed {}",
            self.nodes,
            format_duration(self.elapsed)
        )
    }
}

/// The started nodes of a run.
///
/// Every node is stopped exactly once, either by [`Cluster::teardown`] or when the cluster is
/// dropped.
pub struct Cluster {
    nodes: Vec<Arc<dyn CacheNode>>,
    running: Mutex<bool>,
    await_timeout: Duration,
    poll_interval: Duration,
}

impl Cluster {
    /// Use nodes that were started elsewhere.
    pub fn from_nodes(nodes: Vec<Arc<dyn CacheNode>>) -> Self {
        Self {
            nodes,
            running: Mutex::new(true),
            await_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Construct the configured engine and start all nodes from it. If a node fails to start, the
    /// ones already started are stopped again.
    pub fn provision(opt: &ClusterOpt) -> Result<Self> {
        let nodes = opt.nodes();
        if nodes == 0 {
            return Err(invalid("a cluster needs at least one node"));
        }
        let (await_timeout, poll_interval) = opt.timing()?;
        let registered = registry();
        let constructor = registered
            .get(opt.engine.as_str())
            .ok_or_else(|| BenchError::UnknownEngine(opt.engine.clone()))?;
        let engine = constructor(&opt.opt).map_err(BenchError::Provision)?;

        let node_opt = NodeOpt {
            mode: opt.mode(),
            nodes,
        };
        let mut cluster = Self::from_nodes(Vec::with_capacity(nodes));
        cluster.await_timeout = await_timeout;
        cluster.poll_interval = poll_interval;
        for i in 0..nodes {
            let node = engine
                .start_node(i, &node_opt)
                .map_err(BenchError::Provision)?;
            debug!("Started node {} of engine {}", i, opt.engine);
            cluster.nodes.push(node);
        }
        info!("Provisioned {} {} nodes", nodes, opt.engine);
        Ok(cluster)
    }

    /// [`Cluster::provision`] followed by [`Cluster::await_membership`], timed.
    pub fn start(opt: &ClusterOpt) -> Result<(Self, Startup)> {
        let start = quanta::Instant::now();
        let cluster = Self::provision(opt)?;
        cluster.await_membership()?;
        let startup = Startup {
            nodes: cluster.nodes.len(),
            elapsed: start.elapsed(),
        };
        info!("Cluster started in {}", format_duration(startup.elapsed));
        Ok((cluster, startup))
    }

    pub fn nodes(&self) -> &[Arc<dyn CacheNode>] {
        &self.nodes
    }

    /// Block until every node sees the full cluster. The timeout covers all nodes together.
    pub fn await_membership(&self) -> Result<()> {
        let start = Instant::now();
        let expected = self.nodes.len();
        for node in self.nodes.iter() {
            let left = self.await_timeout.saturating_sub(start.elapsed());
            await_membership(expected, node.as_ref(), self.poll_interval, left).map_err(|e| {
                match e {
                    BenchError::ClusterTimeout { expected, seen, .. } => {
                        BenchError::ClusterTimeout {
                            expected,
                            seen,
                            waited: start.elapsed(),
                        }
                    }
                    e => e,
                }
            })?;
        }
        info!("Cluster of {} members formed", expected);
        Ok(())
    }

    /// Stop every node once. Failures are logged and do not stop the remaining nodes from being
    /// stopped. Returns the number of nodes that failed to stop.
    pub fn teardown(&self) -> usize {
        let mut running = self.running.lock();
        if !*running {
            return 0;
        }
        *running = false;
        let mut failed = 0;
        for node in self.nodes.iter() {
            if let Err(e) = node.stop() {
                warn!("Failed to stop node {}: {}", node.id(), e);
                failed += 1;
            }
        }
        debug!("Stopped {} nodes, {} failed", self.nodes.len(), failed);
        failed
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.teardown();
    }
}
