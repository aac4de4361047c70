//! An engine that does nothing.
//!
//! ## Configuration Format
//!
//! ``` toml
//! [cluster]
//! engine = "null"
//! ```
//!
//! Every node becomes a member as soon as it is started.

use crate::cluster::Registry;
use crate::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// NullEngine starts nodes that store nothing. It can be used to measure the overhead of the
/// harness.
#[derive(Default)]
pub struct NullEngine {
    live: Arc<AtomicUsize>,
}

impl NullEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_engine(_opt: &toml::Table) -> Result<Box<dyn CacheEngine>, CacheError> {
        Ok(Box::new(Self::new()))
    }
}

impl CacheEngine for NullEngine {
    fn start_node(&self, index: usize, _opt: &NodeOpt) -> Result<Arc<dyn CacheNode>, CacheError> {
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(NullNode {
            id: index,
            live: self.live.clone(),
            stopped: AtomicBool::new(false),
        }))
    }
}

pub struct NullNode {
    id: usize,
    live: Arc<AtomicUsize>,
    stopped: AtomicBool,
}

impl CacheNode for NullNode {
    fn id(&self) -> usize {
        self.id
    }

    fn handle(&self) -> Box<dyn CacheHandle> {
        Box::new(NullHandle)
    }

    fn member_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn stop(&self) -> Result<(), CacheError> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Err(CacheError::AlreadyStopped(self.id));
        }
        self.live.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }
}

#[derive(Clone)]
pub struct NullHandle;

impl CacheHandle for NullHandle {
    fn get(&mut self, _key: &[u8]) -> Result<Option<Box<[u8]>>, CacheError> {
        Ok(None)
    }

    fn put(&mut self, _key: &[u8], _value: &[u8]) -> Result<(), CacheError> {
        Ok(())
    }

    fn begin(&mut self, _force_two_phase: bool) -> Result<(), CacheError> {
        Ok(())
    }

    fn commit(&mut self) -> Result<(), CacheError> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), CacheError> {
        Ok(())
    }
}

inventory::submit! {
    Registry::new("null", NullEngine::new_engine)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn membership_follows_lifecycle() {
        let engine = NullEngine::new();
        let opt = NodeOpt {
            mode: ClusterMode::Replicated,
            nodes: 2,
        };
        let a = engine.start_node(0, &opt).unwrap();
        assert_eq!(a.member_count(), 1);
        let b = engine.start_node(1, &opt).unwrap();
        assert_eq!(a.member_count(), 2);

        let mut h = b.handle();
        h.put(b"foo", b"bar").unwrap();
        assert_eq!(h.get(b"foo"), Ok(None));

        b.stop().unwrap();
        assert_eq!(a.member_count(), 1);
        assert_eq!(b.stop(), Err(CacheError::AlreadyStopped(1)));
        a.stop().unwrap();
    }
}
