//! Key space, payloads and the unit of cache traffic a worker repeats.
//!
//! Everything here is generated once before any worker starts and never mutated afterwards. All
//! randomness comes from a single seeded [`BenchRng`] that the caller threads through: the key
//! space and the populate payload draw from it directly, and every worker receives its own
//! generator forked from it in a fixed order. Two runs with the same seed therefore produce the
//! same keys, the same payloads and, per worker, the same sequence of selected keys.

use crate::transaction::{with_transaction, TxOutcome};
use crate::{CacheError, CacheHandle};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

/// The random source used across a run.
pub type BenchRng = StdRng;

/// Create the run-wide random source from a seed.
pub fn seeded(seed: u64) -> BenchRng {
    BenchRng::seed_from_u64(seed)
}

/// Derive an independent generator from `rng`, e.g., one per worker.
pub fn fork(rng: &mut BenchRng) -> BenchRng {
    BenchRng::from_rng(rng)
}

/// A shared, immutable sequence of keys.
pub type Keys = Arc<[Box<[u8]>]>;

/// The name of the `i`-th key written through node `node`.
pub fn key_name(node: usize, i: usize) -> String {
    format!("KEY-N{}-NODE{}", i, node)
}

/// Per-node write-key sets and one combined read-key set drawn from all nodes' ranges.
#[derive(Debug)]
pub struct KeySpace {
    write_keys: Vec<Keys>,
    read_keys: Keys,
}

impl KeySpace {
    /// Build `nodes` write-key sets of `keys_per_node` keys each. The read-key set contains every
    /// write key exactly once, in an order shuffled with `rng`.
    pub fn build(nodes: usize, keys_per_node: usize, rng: &mut impl Rng) -> Self {
        let write_keys: Vec<Vec<Box<[u8]>>> = (0..nodes)
            .map(|n| {
                (0..keys_per_node)
                    .map(|i| key_name(n, i).into_bytes().into_boxed_slice())
                    .collect()
            })
            .collect();
        let mut read_keys: Vec<Box<[u8]>> = Vec::with_capacity(nodes * keys_per_node);
        for i in 0..keys_per_node {
            for keys in write_keys.iter() {
                read_keys.push(keys[i].clone());
            }
        }
        read_keys.shuffle(rng);
        Self {
            write_keys: write_keys.into_iter().map(Keys::from).collect(),
            read_keys: Keys::from(read_keys),
        }
    }

    pub fn nodes(&self) -> usize {
        self.write_keys.len()
    }

    pub fn write_keys(&self, node: usize) -> &Keys {
        &self.write_keys[node]
    }

    pub fn read_keys(&self) -> &Keys {
        &self.read_keys
    }
}

/// An opaque value of a fixed length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payload(Box<[u8]>);

impl Payload {
    /// Generate exactly `size` bytes of printable filler.
    pub fn generate(size: usize, rng: &mut impl Rng) -> Self {
        Self((0..size).map(|_| b'A' + rng.random_range(0..26u8)).collect())
    }
}

impl Deref for Payload {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

/// Whether a worker reads or writes, for its whole lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkMode {
    Read,
    Write,
}

impl fmt::Display for WorkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkMode::Read => write!(f, "reader"),
            WorkMode::Write => write!(f, "writer"),
        }
    }
}

/// The split of worker threads between readers and writers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadSplit {
    pub readers: usize,
    pub writers: usize,
}

/// The role of one worker thread, decided before the run starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Assignment {
    /// Global worker index, readers first.
    pub worker: usize,
    pub mode: WorkMode,
    /// The index of the node the worker sends its traffic to.
    pub node: usize,
}

impl ThreadSplit {
    pub fn new(readers: usize, writers: usize) -> Self {
        Self { readers, writers }
    }

    /// Materialize a write percentage over a single pool of `threads` workers.
    pub fn from_percentage(threads: usize, write_perc: u8) -> Self {
        let writers = ((threads as f64) * (write_perc as f64) / 100.0).round() as usize;
        let writers = writers.min(threads);
        Self {
            readers: threads - writers,
            writers,
        }
    }

    pub fn total(&self) -> usize {
        self.readers + self.writers
    }

    /// Bind every worker to a mode and a node. Readers and writers are each spread round-robin
    /// over the nodes, so a single writer still lands on node 0 regardless of the reader count.
    pub fn assign(&self, nodes: usize) -> Vec<Assignment> {
        assert!(nodes > 0, "a cluster has at least one node");
        let readers = (0..self.readers).map(|i| (WorkMode::Read, i % nodes));
        let writers = (0..self.writers).map(|i| (WorkMode::Write, i % nodes));
        readers
            .chain(writers)
            .enumerate()
            .map(|(worker, (mode, node))| Assignment { worker, mode, node })
            .collect()
    }
}

/// What a unit of work does with the key it selected.
#[derive(Debug)]
enum Work {
    Read,
    /// The payload is generated once per writer and reused for every put.
    Write { payload: Payload },
}

/// A single repeatable unit of cache traffic bound to a handle and a key set.
pub struct WorkUnit {
    work: Work,
    keys: Keys,
    handle: Box<dyn CacheHandle>,
    rng: BenchRng,
}

impl WorkUnit {
    pub fn reader(handle: Box<dyn CacheHandle>, keys: Keys, rng: BenchRng) -> Self {
        assert!(!keys.is_empty(), "a reader needs at least one key");
        Self {
            work: Work::Read,
            keys,
            handle,
            rng,
        }
    }

    pub fn writer(
        handle: Box<dyn CacheHandle>,
        keys: Keys,
        payload_size: usize,
        mut rng: BenchRng,
    ) -> Self {
        assert!(!keys.is_empty(), "a writer needs at least one key");
        let payload = Payload::generate(payload_size, &mut rng);
        Self {
            work: Work::Write { payload },
            keys,
            handle,
            rng,
        }
    }

    pub fn mode(&self) -> WorkMode {
        match self.work {
            Work::Read => WorkMode::Read,
            Work::Write { .. } => WorkMode::Write,
        }
    }

    /// Pick the index of the next key uniformly at random.
    pub fn select_key(&mut self) -> usize {
        self.rng.random_range(0..self.keys.len())
    }

    /// Issue one cache call on a freshly selected key. With `transaction` set to
    /// `Some(force_two_phase)`, the call is wrapped in a unit of work.
    ///
    /// An `Err` means the attempt completed but failed; the caller counts it and moves on.
    pub fn execute(&mut self, transaction: Option<bool>) -> Result<(), CacheError> {
        let idx = self.select_key();
        let key = &self.keys[idx];
        let work = &self.work;
        let handle = self.handle.as_mut();
        match transaction {
            None => apply(work, handle, key),
            Some(force_two_phase) => {
                match with_transaction(handle, force_two_phase, |h| apply(work, h, key))? {
                    TxOutcome::Committed(()) => Ok(()),
                    TxOutcome::RolledBack(e) => Err(e),
                }
            }
        }
    }
}

fn apply(work: &Work, handle: &mut dyn CacheHandle, key: &[u8]) -> Result<(), CacheError> {
    match work {
        Work::Read => handle.get(key).map(|_| ()),
        Work::Write { payload } => handle.put(key, payload),
    }
}
