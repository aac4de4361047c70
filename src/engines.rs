//! Built-in cache engines.
//!
//! ## Built-in Engines
//!
//! - [`null`]: stores nothing and answers immediately. Useful for measuring the overhead of the
//!   harness itself.
//! - [`memory`]: an in-process grid of nodes with replication or distribution, striped write locks
//!   and buffered transactions with a prepare vote.
//!
//! The configuration format of each engine can be found in its module-level documentation. To add
//! an engine from outside of this crate, see [`crate::cluster`].

pub mod memory;
pub mod null;
