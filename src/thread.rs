//! Spawn-join functionality for worker threads.
//!
//! Workers run on [`std::thread`] by default, which is enough for every built-in engine.
//!
//! Some engines are only usable from threads they manage themselves. In that case, one may employ
//! its own implementation of spawn-join: their join handle should implement the [`JoinHandle`]
//! trait and the spawn struct needs to implement [`Thread`], then hand it to
//! [`Driver::with_thread`](crate::bench::Driver::with_thread).
//!
//! Spawned closures return nothing. Workers publish their counts through shared atomics, so a join
//! only tells whether the worker unwound from a panic.

/// A join handle returned by a spawn function.
pub trait JoinHandle: Send {
    /// Join the thread, consume the boxed self. Returns `false` if the thread panicked.
    fn join(self: Box<Self>) -> bool;
}

/// A thread management abstraction.
pub trait Thread: Send + Sync {
    /// Spawn a new thread using a boxed closure.
    fn spawn(&self, f: Box<dyn FnOnce() + Send>) -> Box<dyn JoinHandle>;

    /// Yield the current thread.
    fn yield_now(&self);

    /// Pin the current thread to a certain CPU core.
    fn pin(&self, core: usize);
}

/// A zero-sized wrapper for [`std::thread`] functions.
#[derive(Clone)]
pub struct DefaultThread;

/// A wrapper for [`std::thread::JoinHandle`].
pub struct DefaultJoinHandle(std::thread::JoinHandle<()>);

impl JoinHandle for DefaultJoinHandle {
    fn join(self: Box<Self>) -> bool {
        let handle = self.0;
        handle.join().is_ok()
    }
}

impl Thread for DefaultThread {
    fn spawn(&self, f: Box<dyn FnOnce() + Send>) -> Box<dyn JoinHandle> {
        let handle = std::thread::spawn(f);
        Box::new(DefaultJoinHandle(handle))
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }

    fn pin(&self, core: usize) {
        match core_affinity::get_core_ids() {
            Some(cores) if !cores.is_empty() => {
                core_affinity::set_for_current(cores[core % cores.len()]);
            }
            _ => log::warn!("Core ids are not available, worker {} is not pinned", core),
        }
    }
}
