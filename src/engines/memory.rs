//! An in-process cache grid. Each node holds its own sharded [`hashbrown::HashMap`].
//!
//! ## Configuration Format
//!
//! ``` toml
//! [cluster]
//! engine = "memory"
//! shards = 64 # shards of each node's map, default 64
//! lock_stripes = 1024 # number of write locks shared by the grid, default 1024
//! lock_timeout = 1.0 # seconds a write waits for its lock, default 1
//! owners = 2 # copies of each key in distributed mode, default 2
//! join_delay = 0.0 # seconds before a started node becomes a member, default 0
//! ```
//!
//! In replicated mode, a write goes to every member and a read is served by the local node. In
//! distributed mode, a key lives on `owners` consecutive members starting at `hash(key) % members`,
//! and reads go to the first of them.
//!
//! Writes take a striped lock of the grid and give up with [`CacheError::LockTimeout`] after
//! `lock_timeout`. A transaction buffers its writes in the handle. On commit, the stripes of all
//! written keys are taken in ascending order, then every node that holds one of the keys votes in
//! a prepare round if two-phase commit was forced or more than one node takes part, then the
//! writes are applied.

use crate::cluster::Registry;
use crate::*;
use ::hashbrown::{HashMap, HashSet};
use log::debug;
use parking_lot::{Mutex, MutexGuard, RwLock};
use rustc_hash::FxHasher;
use serde::Deserialize;
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Calculate the [`u64`] hash value of a given key using [`FxHasher`].
pub fn hash(key: &[u8]) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(key);
    hasher.finish()
}

fn index(key: &[u8], n: usize) -> usize {
    (hash(key) % n as u64) as usize
}

type BaseHashMap = HashMap<Box<[u8]>, Box<[u8]>>;

#[derive(Deserialize, Clone, Debug, Default)]
pub struct MemoryGridOpt {
    pub shards: Option<usize>,
    pub lock_stripes: Option<usize>,
    pub lock_timeout: Option<f32>,
    pub owners: Option<usize>,
    pub join_delay: Option<f32>,
}

/// The data of one node.
struct Store {
    id: usize,
    shards: Vec<Mutex<BaseHashMap>>,
    visible_at: Instant,
    stopped: AtomicBool,
}

impl Store {
    fn new(id: usize, nr_shards: usize, join_delay: Duration) -> Self {
        let mut shards = Vec::<Mutex<BaseHashMap>>::with_capacity(nr_shards);
        for _ in 0..nr_shards {
            shards.push(Mutex::new(BaseHashMap::new()));
        }
        Self {
            id,
            shards,
            visible_at: Instant::now() + join_delay,
            stopped: AtomicBool::new(false),
        }
    }

    fn is_member(&self, now: Instant) -> bool {
        !self.stopped.load(Ordering::Acquire) && now >= self.visible_at
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn get(&self, key: &[u8]) -> Option<Box<[u8]>> {
        let sid = index(key, self.shards.len());
        self.shards[sid].lock().get(key).cloned()
    }

    fn put(&self, key: &[u8], value: &[u8]) {
        let sid = index(key, self.shards.len());
        self.shards[sid].lock().insert(key.into(), value.into());
    }
}

#[derive(Default)]
struct Stats {
    commits: AtomicU64,
    rollbacks: AtomicU64,
    two_phase: AtomicU64,
}

/// State shared by all nodes started from one engine.
struct Grid {
    nr_shards: usize,
    owners: usize,
    lock_timeout: Duration,
    join_delay: Duration,
    stripes: Vec<Mutex<()>>,
    /// All started nodes, sorted by id. Stopped ones stay but are not members.
    stores: RwLock<Vec<Arc<Store>>>,
    live: AtomicUsize,
    stats: Stats,
}

impl Grid {
    fn members(&self) -> Vec<Arc<Store>> {
        let now = Instant::now();
        self.stores
            .read()
            .iter()
            .filter(|s| s.is_member(now))
            .cloned()
            .collect()
    }

    /// The nodes that hold `key`. Falls back to `local` if there are no members yet.
    fn owners(
        &self,
        mode: ClusterMode,
        key: &[u8],
        members: &[Arc<Store>],
        local: &Arc<Store>,
    ) -> Vec<Arc<Store>> {
        let n = members.len();
        if n == 0 {
            return vec![local.clone()];
        }
        match mode {
            ClusterMode::Replicated => members.to_vec(),
            ClusterMode::Distributed => {
                let primary = index(key, n);
                (0..self.owners.min(n))
                    .map(|i| members[(primary + i) % n].clone())
                    .collect()
            }
        }
    }

    fn lock(&self, stripe: usize) -> Result<MutexGuard<'_, ()>, CacheError> {
        self.stripes[stripe]
            .try_lock_for(self.lock_timeout)
            .ok_or(CacheError::LockTimeout(self.lock_timeout))
    }
}

/// The engine. Nodes started from the same instance form one grid.
pub struct MemoryGrid {
    grid: Arc<Grid>,
}

impl MemoryGrid {
    pub fn new(opt: &MemoryGridOpt) -> Result<Self, CacheError> {
        let positive = |name: &str, v: usize| match v {
            0 => Err(CacheError::Engine(format!("{} should be positive", name))),
            v => Ok(v),
        };
        let secs = |name: &str, v: f32| {
            Duration::try_from_secs_f32(v).map_err(|_| {
                CacheError::Engine(format!("{} should be a non-negative number of seconds", name))
            })
        };
        let nr_shards = positive("shards", opt.shards.unwrap_or(64))?;
        let nr_stripes = positive("lock_stripes", opt.lock_stripes.unwrap_or(1024))?;
        let owners = positive("owners", opt.owners.unwrap_or(2))?;
        let lock_timeout = secs("lock_timeout", opt.lock_timeout.unwrap_or(1.0))?;
        let join_delay = secs("join_delay", opt.join_delay.unwrap_or(0.0))?;
        let stripes = (0..nr_stripes).map(|_| Mutex::new(())).collect();
        let grid = Arc::new(Grid {
            nr_shards,
            owners,
            lock_timeout,
            join_delay,
            stripes,
            stores: RwLock::new(Vec::new()),
            live: AtomicUsize::new(0),
            stats: Stats::default(),
        });
        Ok(Self { grid })
    }

    pub fn new_engine(opt: &toml::Table) -> Result<Box<dyn CacheEngine>, CacheError> {
        let opt: MemoryGridOpt = opt
            .clone()
            .try_into()
            .map_err(|e| CacheError::Engine(format!("invalid memory engine options: {}", e)))?;
        Ok(Box::new(Self::new(&opt)?))
    }
}

impl CacheEngine for MemoryGrid {
    fn start_node(&self, index: usize, opt: &NodeOpt) -> Result<Arc<dyn CacheNode>, CacheError> {
        let store = Arc::new(Store::new(index, self.grid.nr_shards, self.grid.join_delay));
        {
            let mut stores = self.grid.stores.write();
            if stores.iter().any(|s| s.id == index) {
                return Err(CacheError::Engine(format!("node {} is already started", index)));
            }
            stores.push(store.clone());
            stores.sort_by_key(|s| s.id);
        }
        self.grid.live.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(MemoryNode {
            grid: self.grid.clone(),
            store,
            mode: opt.mode,
        }))
    }
}

pub struct MemoryNode {
    grid: Arc<Grid>,
    store: Arc<Store>,
    mode: ClusterMode,
}

impl CacheNode for MemoryNode {
    fn id(&self) -> usize {
        self.store.id
    }

    fn handle(&self) -> Box<dyn CacheHandle> {
        Box::new(MemoryHandle {
            grid: self.grid.clone(),
            store: self.store.clone(),
            mode: self.mode,
            tx: None,
        })
    }

    fn member_count(&self) -> usize {
        self.grid.members().len()
    }

    fn stop(&self) -> Result<(), CacheError> {
        if self.store.stopped.swap(true, Ordering::AcqRel) {
            return Err(CacheError::AlreadyStopped(self.store.id));
        }
        if self.grid.live.fetch_sub(1, Ordering::AcqRel) == 1 {
            let stats = &self.grid.stats;
            debug!(
                "Memory grid stopped after {} commits ({} two-phase) and {} rollbacks",
                stats.commits.load(Ordering::Relaxed),
                stats.two_phase.load(Ordering::Relaxed),
                stats.rollbacks.load(Ordering::Relaxed),
            );
        }
        Ok(())
    }
}

struct Transaction {
    force_two_phase: bool,
    writes: HashMap<Box<[u8]>, Box<[u8]>>,
}

pub struct MemoryHandle {
    grid: Arc<Grid>,
    store: Arc<Store>,
    mode: ClusterMode,
    tx: Option<Transaction>,
}

impl MemoryHandle {
    fn check_running(&self) -> Result<(), CacheError> {
        if self.store.is_stopped() {
            return Err(CacheError::NodeStopped(self.store.id));
        }
        Ok(())
    }

    fn apply(&self, tx: Transaction) -> Result<(), CacheError> {
        let grid = &self.grid;
        let mut stripes: Vec<usize> = tx
            .writes
            .keys()
            .map(|k| index(k, grid.stripes.len()))
            .collect();
        stripes.sort_unstable();
        stripes.dedup();
        let mut guards = Vec::with_capacity(stripes.len());
        for stripe in stripes {
            guards.push(grid.lock(stripe)?);
        }

        let members = grid.members();
        let writes: Vec<(Box<[u8]>, Box<[u8]>, Vec<Arc<Store>>)> = tx
            .writes
            .into_iter()
            .map(|(k, v)| {
                let owners = grid.owners(self.mode, &k, &members, &self.store);
                (k, v, owners)
            })
            .collect();
        let participants: HashSet<usize> = writes
            .iter()
            .flat_map(|(_, _, owners)| owners.iter().map(|s| s.id))
            .collect();

        if tx.force_two_phase || participants.len() > 1 {
            for (_, _, owners) in writes.iter() {
                if let Some(s) = owners.iter().find(|s| s.is_stopped()) {
                    return Err(CacheError::Transaction(format!(
                        "node {} voted no in prepare",
                        s.id
                    )));
                }
            }
            grid.stats.two_phase.fetch_add(1, Ordering::Relaxed);
        }

        for (k, v, owners) in writes.iter() {
            for s in owners.iter() {
                s.put(k, v);
            }
        }
        Ok(())
    }
}

impl CacheHandle for MemoryHandle {
    fn get(&mut self, key: &[u8]) -> Result<Option<Box<[u8]>>, CacheError> {
        self.check_running()?;
        if let Some(v) = self.tx.as_ref().and_then(|tx| tx.writes.get(key)) {
            return Ok(Some(v.clone()));
        }
        let value = match self.mode {
            ClusterMode::Replicated => self.store.get(key),
            ClusterMode::Distributed => {
                let members = self.grid.members();
                let owners = self.grid.owners(self.mode, key, &members, &self.store);
                owners[0].get(key)
            }
        };
        Ok(value)
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), CacheError> {
        self.check_running()?;
        if let Some(tx) = self.tx.as_mut() {
            tx.writes.insert(key.into(), value.into());
            return Ok(());
        }
        let _guard = self.grid.lock(index(key, self.grid.stripes.len()))?;
        let members = self.grid.members();
        for s in self.grid.owners(self.mode, key, &members, &self.store) {
            s.put(key, value);
        }
        Ok(())
    }

    fn begin(&mut self, force_two_phase: bool) -> Result<(), CacheError> {
        self.check_running()?;
        if self.tx.is_some() {
            return Err(CacheError::Transaction(
                "a transaction is already active".to_string(),
            ));
        }
        self.tx = Some(Transaction {
            force_two_phase,
            writes: HashMap::new(),
        });
        Ok(())
    }

    fn commit(&mut self) -> Result<(), CacheError> {
        let tx = self.tx.take().ok_or(CacheError::NoTransaction)?;
        let stats = &self.grid.stats;
        match self.check_running().and_then(|_| self.apply(tx)) {
            Ok(()) => {
                stats.commits.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                stats.rollbacks.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    fn rollback(&mut self) -> Result<(), CacheError> {
        self.tx.take().ok_or(CacheError::NoTransaction)?;
        self.grid.stats.rollbacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

inventory::submit! {
    Registry::new("memory", MemoryGrid::new_engine)
}
