//! Error types of the harness.
//!
//! There are two families. [`CacheError`] is what a cache engine reports for a single operation or
//! node lifecycle call; most of them are absorbed by the workers and only show up as a lower
//! throughput. [`BenchError`] is what stops a run before or around the measurement, and it is
//! surfaced to the operator.

use std::time::Duration;
use thiserror::Error;

/// An error reported by a cache engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Prepare or commit did not go through. The unit of work is rolled back.
    #[error("transaction failed: {0}")]
    Transaction(String),

    /// A lock could not be acquired within the engine's lock timeout.
    #[error("lock acquisition timed out after {0:?}")]
    LockTimeout(Duration),

    /// The node was stopped and does not serve requests anymore.
    #[error("node {0} is stopped")]
    NodeStopped(usize),

    /// `commit` or `rollback` was called without an active transaction.
    #[error("no active transaction")]
    NoTransaction,

    /// `stop` was called on a node that has already been stopped.
    #[error("node {0} has already been stopped")]
    AlreadyStopped(usize),

    /// Anything else that an engine wants to report, e.g., a malformed engine option.
    #[error("{0}")]
    Engine(String),
}

/// A fatal error of the harness itself.
#[derive(Error, Debug)]
pub enum BenchError {
    #[error("failed to parse configuration: {0}")]
    Config(#[from] figment::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("cache engine {0} not found in registry")]
    UnknownEngine(String),

    #[error("failed to provision cache node: {0}")]
    Provision(CacheError),

    #[error("cluster did not converge: expected {expected} members, saw {seen} after {waited:?}")]
    ClusterTimeout {
        expected: usize,
        seen: usize,
        waited: Duration,
    },

    #[error("failed to populate the cache: {0}")]
    Populate(CacheError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BenchError>;
