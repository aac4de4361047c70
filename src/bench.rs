//! The core benchmark functionality.
//!
//! A run goes through a fixed sequence of **phases**, never revisiting one:
//!
//! 1. `populate`: a single thread writes every key of every node's write-key set.
//! 2. `warmup`: all workers are released at the same instant and generate load that is not
//!    measured. At the end of the warm-up, the shared counters are reset.
//! 3. `measure`: the same workers keep running; the coordinator samples the counters periodically
//!    and aborts the run if they stop advancing.
//! 4. `drain`: the quit flag is raised and the coordinator waits, up to a bound, for every worker
//!    to observe it and exit.
//! 5. `done`: the summary is computed and reported.
//!
//! ## Configuration Format
//!
//! A benchmark configuration is formatted in TOML and lives in a dictionary named `benchmark`. It
//! is read together with the cluster configuration (see [`crate::cluster`]), so a complete
//! configuration looks like the following:
//!
//! ```toml
//! [cluster]
//! engine = "memory"
//! nodes = 2
//!
//! [benchmark]
//! reader_threads = 45
//! writer_threads = 5
//! keys_per_node = 100
//! payload_size = 1024
//! transactional = true
//! warmup = 30.0
//! timeout = 300.0
//! seed = 42
//! ```
//!
//! Available options and their usage can be found in [`BenchmarkOpt`].
//!
//! Options can be overwritten via environment variables without changing the content in the TOML
//! file. For example, setting the environment variable `benchmark.seed` overrides `seed`.
//!
//! ## Lengths
//!
//! The warm-up and the measurement are each bounded either by time (`warmup`, `timeout`) or by a
//! number of operations summed over all workers (`warmup_ops`, `ops`). Without `timeout` and
//! `ops`, the measurement runs until interrupted.
//!
//! When the measurement is bounded by `ops`, workers claim a ticket before every operation, and
//! the measured count is exact if the warm-up is bounded by `warmup_ops` as well: a worker that
//! holds a measured ticket waits until the coordinator has switched to `measure`, which it does
//! once exactly `warmup_ops` operations have completed. With a time-bounded warm-up, a few
//! operations in flight at the boundary may be counted in the measurement.

use crate::cluster::{Cluster, ClusterOpt};
use crate::error::{BenchError, Result};
use crate::report::{LatencySummary, ReportMode, Reporter, Summary};
use crate::thread::{DefaultThread, JoinHandle, Thread};
use crate::workload::{fork, seeded, Assignment, BenchRng, KeySpace, Keys, Payload, ThreadSplit};
use crate::workload::{WorkMode, WorkUnit};
use crate::CacheNode;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use hdrhistogram::Histogram;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use quanta::Instant;
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

// {{{ benchmark

/// Length determines when a warm-up or a measurement ends.
#[derive(Clone, Debug, PartialEq)]
pub enum Length {
    /// The phase ends after a wall-clock duration.
    Timeout(Duration),
    /// The phase ends after a number of operations, summed over all workers.
    Count(u64),
    /// The phase only ends when interrupted. Never used for the warm-up.
    Unbounded,
}

impl fmt::Display for Length {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Length::Timeout(d) => write!(f, "{:.2}s", d.as_secs_f64()),
            Length::Count(c) => write!(f, "{}ops", c),
            Length::Unbounded => write!(f, "unbounded"),
        }
    }
}

/// The configuration of a benchmark deserialized from a TOML string.
///
/// The fields are optional to ease parsing from TOML. Missing fields fall back to the defaults
/// documented on each field.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct BenchmarkOpt {
    /// Number of threads that only read.
    ///
    /// Default: 1, unless `threads` is given.
    pub reader_threads: Option<usize>,

    /// Number of threads that only write.
    ///
    /// Default: 1, unless `threads` is given.
    pub writer_threads: Option<usize>,

    /// Size of a single pool of workers, split into readers and writers by `write_perc`. Cannot be
    /// used together with `reader_threads`/`writer_threads`.
    pub threads: Option<usize>,

    /// Percentage of the `threads` pool that writes. The split is made once, before the run.
    ///
    /// Default: 10.
    pub write_perc: Option<u8>,

    /// Number of keys written through each node.
    ///
    /// Default: 100.
    pub keys_per_node: Option<usize>,

    /// Size of a value in bytes.
    ///
    /// Default: 1024.
    pub payload_size: Option<usize>,

    /// Whether each cache call is wrapped in a transaction.
    ///
    /// Default: false.
    pub transactional: Option<bool>,

    /// Whether transactions always go through two-phase commit, even with a single participant.
    /// Only used if `transactional` is true.
    ///
    /// Default: true.
    pub force_two_phase: Option<bool>,

    /// How long the warm-up runs, in seconds. Cannot be used together with `warmup_ops`.
    ///
    /// Note: if both `warmup` and `warmup_ops` are not given, there is no warm-up.
    pub warmup: Option<f32>,

    /// How many operations the warm-up runs, summed over all workers.
    pub warmup_ops: Option<u64>,

    /// How long the measurement runs, in seconds. Cannot be used together with `ops`.
    ///
    /// Note: if both `timeout` and `ops` are not given, the measurement runs until interrupted.
    pub timeout: Option<f32>,

    /// How many operations the measurement runs, summed over all workers.
    pub ops: Option<u64>,

    /// How often progress is sampled, in seconds. A sample that shows no progress at all since the
    /// previous one aborts the run as stalled.
    ///
    /// Default: 10.
    pub sample_interval: Option<f32>,

    /// How long to wait for workers to exit after the measurement, in seconds.
    ///
    /// Default: 43200 (12 hours).
    pub drain_timeout: Option<f32>,

    /// Seed of the random source used for keys, payloads and key selection.
    ///
    /// Default: a random seed, printed in the configuration echo.
    pub seed: Option<u64>,

    /// Report mode:
    ///
    /// - "hidden": not reported.
    /// - "sample": the progress samples are printed.
    /// - "finish": the summary is printed.
    /// - "all": equals to "sample" + "finish".
    ///
    /// Default: "all".
    pub report: Option<String>,

    /// Whether or not to record latency during the measurement. Since measuring time is of extra
    /// cost, enabling latency measurement usually affects the throughput metrics.
    ///
    /// Default: false.
    pub latency: Option<bool>,

    /// Whether worker threads are pinned to CPU cores.
    ///
    /// Default: false.
    pub pin: Option<bool>,
}

/// The configuration of a benchmark, validated and with defaults applied.
#[derive(Debug, PartialEq)]
pub struct Benchmark {
    pub(crate) split: ThreadSplit,
    pub(crate) keys_per_node: usize,
    pub(crate) payload_size: usize,
    pub(crate) transactional: bool,
    pub(crate) force_two_phase: bool,
    pub(crate) warmup: Length,
    pub(crate) measure: Length,
    pub(crate) sample_interval: Duration,
    pub(crate) drain_timeout: Duration,
    pub(crate) seed: u64,
    pub(crate) report: ReportMode,
    pub(crate) latency: bool,
    pub(crate) pin: bool,
}

fn invalid(msg: impl Into<String>) -> BenchError {
    BenchError::Invalid(msg.into())
}

fn secs(name: &str, v: f32) -> Result<Duration> {
    Duration::try_from_secs_f32(v)
        .map_err(|_| invalid(format!("{} should be a non-negative number of seconds", name)))
}

fn length(name: &str, t: Option<f32>, ops_name: &str, c: Option<u64>) -> Result<Option<Length>> {
    match (t, c) {
        (Some(_), Some(_)) => Err(invalid(format!(
            "{} and {} cannot be provided at the same time",
            name, ops_name
        ))),
        (Some(t), None) => Ok(Some(Length::Timeout(secs(name, t)?))),
        (None, Some(c)) => Ok(Some(Length::Count(c))),
        (None, None) => Ok(None),
    }
}

impl Benchmark {
    pub fn new(opt: &BenchmarkOpt) -> Result<Self> {
        let split = match (opt.threads, opt.reader_threads, opt.writer_threads) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                return Err(invalid(
                    "threads and reader_threads/writer_threads cannot be provided at the same time",
                ));
            }
            (Some(threads), None, None) => {
                let write_perc = opt.write_perc.unwrap_or(10);
                if write_perc > 100 {
                    return Err(invalid("write_perc should be between 0 and 100"));
                }
                ThreadSplit::from_percentage(threads, write_perc)
            }
            (None, readers, writers) => {
                if opt.write_perc.is_some() {
                    return Err(invalid("write_perc is only used together with threads"));
                }
                ThreadSplit::new(readers.unwrap_or(1), writers.unwrap_or(1))
            }
        };
        if split.total() == 0 {
            return Err(invalid("number of threads should be positive"));
        }
        let keys_per_node = opt.keys_per_node.unwrap_or(100);
        if keys_per_node == 0 {
            return Err(invalid("keys_per_node should be positive"));
        }
        let warmup = length("warmup", opt.warmup, "warmup_ops", opt.warmup_ops)?
            .unwrap_or(Length::Count(0));
        let measure =
            length("timeout", opt.timeout, "ops", opt.ops)?.unwrap_or(Length::Unbounded);
        let sample_interval = secs("sample_interval", opt.sample_interval.unwrap_or(10.0))?;
        if sample_interval.is_zero() {
            return Err(invalid("sample_interval should be positive"));
        }
        let drain_timeout = secs("drain_timeout", opt.drain_timeout.unwrap_or(43200.0))?;
        let report = ReportMode::parse(opt.report.as_deref().unwrap_or("all"))
            .ok_or_else(|| invalid("report mode should be one of: hidden, sample, finish, all"))?;
        let seed = opt.seed.unwrap_or_else(|| {
            let seed = rand::random::<u64>();
            info!("No seed given, using {}", seed);
            seed
        });
        Ok(Self {
            split,
            keys_per_node,
            payload_size: opt.payload_size.unwrap_or(1024),
            transactional: opt.transactional.unwrap_or(false),
            force_two_phase: opt.force_two_phase.unwrap_or(true),
            warmup,
            measure,
            sample_interval,
            drain_timeout,
            seed,
            report,
            latency: opt.latency.unwrap_or(false),
            pin: opt.pin.unwrap_or(false),
        })
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn report(&self) -> ReportMode {
        self.report
    }

    fn budget(&self) -> Option<Budget> {
        match (&self.warmup, &self.measure) {
            (Length::Count(w), Length::Count(m)) => Some(Budget {
                warmup: *w,
                total: w.saturating_add(*m),
                from_start: true,
            }),
            (_, Length::Count(m)) => Some(Budget {
                warmup: 0,
                total: *m,
                from_start: false,
            }),
            _ => None,
        }
    }
}

impl fmt::Display for Benchmark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "benchmark readers {} writers {} keys_per_node {} payload {} transactional {} \
             force_two_phase {} warmup {} measure {} seed {}",
            self.split.readers,
            self.split.writers,
            self.keys_per_node,
            self.payload_size,
            self.transactional,
            self.force_two_phase,
            self.warmup,
            self.measure,
            self.seed,
        )
    }
}

/// Ticket bounds of an operation-bounded measurement.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Budget {
    /// Tickets below this are warm-up operations.
    warmup: u64,
    /// Tickets from this one on are not executed.
    total: u64,
    /// Whether tickets are claimed from the first operation, or only once measuring.
    from_start: bool,
}

/// The whole configuration of a run as found in the TOML text.
#[derive(Deserialize, Clone, Debug)]
struct RunOpt {
    cluster: ClusterOpt,
    benchmark: BenchmarkOpt,
}

/// Parse the cluster and benchmark configuration from a TOML string, then apply the overrides
/// from the environment.
pub fn init(text: &str) -> Result<(ClusterOpt, Benchmark)> {
    let opt: RunOpt = Figment::new()
        .merge(Toml::string(text))
        .merge(Env::raw().filter(|k| {
            k.as_str().starts_with("cluster.") || k.as_str().starts_with("benchmark.")
        }))
        .extract()?;
    debug!("Creating benchmark with the following configurations: {:?}", opt);
    let benchmark = Benchmark::new(&opt.benchmark)?;
    Ok((opt.cluster, benchmark))
}

// }}} benchmark

// {{{ shared state

/// The phase of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RunPhase {
    Populating = 0,
    WarmingUp = 1,
    Measuring = 2,
    Draining = 3,
    Done = 4,
}

impl RunPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => RunPhase::Populating,
            1 => RunPhase::WarmingUp,
            2 => RunPhase::Measuring,
            3 => RunPhase::Draining,
            _ => RunPhase::Done,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Populating => "populate",
            RunPhase::WarmingUp => "warmup",
            RunPhase::Measuring => "measure",
            RunPhase::Draining => "drain",
            RunPhase::Done => "done",
        };
        write!(f, "{}", s)
    }
}

/// The global phase, written by the coordinator only and read by every worker.
struct PhaseCell(AtomicU8);

impl PhaseCell {
    fn new() -> Self {
        Self(AtomicU8::new(RunPhase::Populating as u8))
    }

    fn get(&self) -> RunPhase {
        RunPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    fn advance(&self, to: RunPhase) {
        let prev = self.0.swap(to as u8, Ordering::AcqRel);
        assert!(
            prev < to as u8,
            "phase can only move forward, from {} to {}",
            RunPhase::from_u8(prev),
            to
        );
    }
}

/// Why workers were asked to stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum QuitReason {
    /// The operation budget is used up.
    Exhausted = 1,
    /// The measurement duration is over.
    Deadline = 2,
    /// Progress stopped between two samples.
    Stalled = 3,
    /// Externally interrupted, e.g., by Ctrl-C.
    Interrupted = 4,
    /// A worker panicked.
    Fault = 5,
    /// A worker returned without being asked to.
    Exited = 6,
}

impl QuitReason {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(QuitReason::Exhausted),
            2 => Some(QuitReason::Deadline),
            3 => Some(QuitReason::Stalled),
            4 => Some(QuitReason::Interrupted),
            5 => Some(QuitReason::Fault),
            6 => Some(QuitReason::Exited),
            _ => None,
        }
    }

    /// The status word used in the summary line.
    pub fn status(&self) -> &'static str {
        match self {
            QuitReason::Exhausted | QuitReason::Deadline | QuitReason::Exited => "completed",
            QuitReason::Stalled => "stalled",
            QuitReason::Interrupted => "interrupted",
            QuitReason::Fault => "fault",
        }
    }
}

/// The cooperative cancellation signal shared by the coordinator and all workers.
///
/// It can be raised from any thread; only the first reason is kept.
#[derive(Clone, Debug)]
pub struct QuitFlag(Arc<AtomicU8>);

impl QuitFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(0)))
    }

    /// Returns `true` if this call raised the flag.
    pub fn raise(&self, reason: QuitReason) -> bool {
        self.0
            .compare_exchange(0, reason as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }

    pub fn reason(&self) -> Option<QuitReason> {
        QuitReason::from_u8(self.0.load(Ordering::Acquire))
    }
}

impl Default for QuitFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// A point-in-time copy of the counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub reads: u64,
    pub writes: u64,
    pub failures: u64,
}

impl Snapshot {
    pub fn total(&self) -> u64 {
        self.reads + self.writes
    }
}

/// Attempted operations, shared by all workers. Workers only ever increment; the coordinator
/// reads, and zeroes once at the end of the warm-up.
#[derive(Debug, Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn record(&self, mode: WorkMode, ok: bool) {
        match mode {
            WorkMode::Read => self.reads.fetch_add(1, Ordering::Relaxed),
            WorkMode::Write => self.writes.fetch_add(1, Ordering::Relaxed),
        };
        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            reads: self.reads.load(Ordering::Acquire),
            writes: self.writes.load(Ordering::Acquire),
            failures: self.failures.load(Ordering::Acquire),
        }
    }

    /// Zero the counters and return what they held, plus the instant the new counting started.
    fn reset(&self) -> (Snapshot, Instant) {
        let snapshot = Snapshot {
            reads: self.reads.swap(0, Ordering::AcqRel),
            writes: self.writes.swap(0, Ordering::AcqRel),
            failures: self.failures.swap(0, Ordering::AcqRel),
        };
        (snapshot, Instant::now())
    }
}

/// Number of workers that have not exited yet.
struct Quiescence {
    running: Mutex<usize>,
    cond: Condvar,
}

impl Quiescence {
    fn new(workers: usize) -> Self {
        Self {
            running: Mutex::new(workers),
            cond: Condvar::new(),
        }
    }

    fn exit(&self) {
        let mut running = self.running.lock();
        *running -= 1;
        if *running == 0 {
            self.cond.notify_all();
        }
    }

    /// Wait until all workers have exited. Returns `false` on timeout.
    fn wait_for(&self, timeout: Duration) -> bool {
        let mut running = self.running.lock();
        let deadline = std::time::Instant::now().checked_add(timeout);
        while *running > 0 {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut running, deadline).timed_out() {
                        return *running == 0;
                    }
                }
                None => self.cond.wait(&mut running),
            }
        }
        true
    }
}

/// Everything the coordinator and the workers of one run share.
struct Shared {
    counters: Counters,
    quit: QuitFlag,
    phase: PhaseCell,
    /// Next operation ticket, only used with an operation budget.
    tickets: AtomicU64,
    running: Quiescence,
    /// Number of workers that panicked.
    faults: AtomicUsize,
    /// Merged latency of all workers, in nanoseconds.
    latency: Mutex<Histogram<u64>>,
}

impl Shared {
    fn new(workers: usize, quit: QuitFlag) -> Self {
        Self {
            counters: Counters::default(),
            quit,
            phase: PhaseCell::new(),
            tickets: AtomicU64::new(0),
            running: Quiescence::new(workers),
            faults: AtomicUsize::new(0),
            latency: Mutex::new(new_histogram()),
        }
    }

    /// The run is ending for a reason other than the operation budget running out.
    fn aborted(&self) -> bool {
        self.faults.load(Ordering::Acquire) > 0
            || matches!(self.quit.reason(), Some(r) if r != QuitReason::Exhausted)
    }
}

fn new_histogram() -> Histogram<u64> {
    Histogram::new(3).expect("3 significant figures is a valid precision")
}

// }}} shared state

// {{{ worker

/// Released when a worker returns or unwinds. A worker that leaves for any reason stops its peers,
/// and a worker that faults before the start barrier still shows up at it.
struct WorkerGuard {
    shared: Arc<Shared>,
    barrier: Option<Arc<Barrier>>,
}

impl WorkerGuard {
    fn arrive(&mut self) {
        if let Some(barrier) = self.barrier.take() {
            barrier.wait();
        }
    }
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.shared.faults.fetch_add(1, Ordering::AcqRel);
            self.shared.quit.raise(QuitReason::Fault);
        } else {
            self.shared.quit.raise(QuitReason::Exited);
        }
        self.arrive();
        self.shared.running.exit();
    }
}

struct WorkerContext {
    /// The benchmark that the current work is referring to
    benchmark: Arc<Benchmark>,

    /// Mode and node of this worker
    assignment: Assignment,

    /// Keys this worker selects from
    keys: Keys,

    /// Forked from the run's random source
    rng: BenchRng,

    shared: Arc<Shared>,

    /// Barrier that releases all workers at once
    barrier: Arc<Barrier>,
}

fn bench_worker(node: Arc<dyn CacheNode>, context: WorkerContext, thread: Arc<dyn Thread>) {
    let WorkerContext {
        benchmark,
        assignment,
        keys,
        rng,
        shared,
        barrier,
    } = context;

    let mut guard = WorkerGuard {
        shared: shared.clone(),
        barrier: Some(barrier),
    };

    if benchmark.pin {
        thread.pin(assignment.worker);
    }

    let handle = node.handle();
    let mut unit = match assignment.mode {
        WorkMode::Read => WorkUnit::reader(handle, keys, rng),
        WorkMode::Write => WorkUnit::writer(handle, keys, benchmark.payload_size, rng),
    };
    let transaction = benchmark.transactional.then_some(benchmark.force_two_phase);
    let budget = benchmark.budget();
    let mut latency = benchmark.latency.then(new_histogram);

    debug!(
        "Worker {} ({}) bound to node {}",
        assignment.worker,
        assignment.mode,
        node.id()
    );

    // start at roughly the same time as everyone else
    guard.arrive();

    'run: loop {
        if shared.quit.is_raised() {
            break;
        }
        if let Some(budget) = budget {
            if budget.from_start || shared.phase.get() >= RunPhase::Measuring {
                let ticket = shared.tickets.fetch_add(1, Ordering::Relaxed);
                if ticket >= budget.total {
                    shared.quit.raise(QuitReason::Exhausted);
                    break;
                }
                // a measured ticket must not run before the counters are reset
                if ticket >= budget.warmup {
                    while shared.phase.get() < RunPhase::Measuring {
                        if shared.aborted() {
                            break 'run;
                        }
                        thread.yield_now();
                    }
                }
            }
        }

        let op_start = match latency {
            Some(_) if shared.phase.get() == RunPhase::Measuring => Some(Instant::now()),
            _ => None,
        };
        let result = unit.execute(transaction);
        if let (Some(hdr), Some(op_start)) = (latency.as_mut(), op_start) {
            hdr.saturating_record(op_start.elapsed().as_nanos() as u64);
        }
        if let Err(ref e) = result {
            debug!("Worker {} swallowed a failed operation: {}", assignment.worker, e);
        }
        shared.counters.record(unit.mode(), result.is_ok());
    }

    if let Some(hdr) = latency {
        if let Err(e) = shared.latency.lock().add(&hdr) {
            warn!("Failed to merge latency of worker {}: {}", assignment.worker, e);
        }
    }
    debug!("Worker {} exits", assignment.worker);
}

/// The fixed set of workers of a run, parked at the start barrier until released.
struct WorkerPool {
    handles: Vec<Box<dyn JoinHandle>>,
    barrier: Arc<Barrier>,
    shared: Arc<Shared>,
}

impl WorkerPool {
    fn spawn(
        nodes: &[Arc<dyn CacheNode>],
        benchmark: &Arc<Benchmark>,
        keys: &KeySpace,
        rng: &mut BenchRng,
        shared: Arc<Shared>,
        thread: &Arc<dyn Thread>,
    ) -> Self {
        let assignments = benchmark.split.assign(nodes.len());
        let barrier = Arc::new(Barrier::new(assignments.len() + 1));
        let mut handles = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let node = nodes[assignment.node].clone();
            let keys = match assignment.mode {
                WorkMode::Read => keys.read_keys().clone(),
                WorkMode::Write => keys.write_keys(assignment.node).clone(),
            };
            let context = WorkerContext {
                benchmark: benchmark.clone(),
                assignment,
                keys,
                rng: fork(rng),
                shared: shared.clone(),
                barrier: barrier.clone(),
            };
            let worker_thread = thread.clone();
            let handle = thread.spawn(Box::new(move || {
                bench_worker(node, context, worker_thread);
            }));
            handles.push(handle);
        }
        Self {
            handles,
            barrier,
            shared,
        }
    }

    fn len(&self) -> usize {
        self.handles.len()
    }

    /// Release all workers at once. Blocks until every worker has arrived at the barrier.
    fn release(&self) {
        self.barrier.wait();
    }

    /// Wait for all workers to exit, up to `timeout`.
    fn drain(&self, timeout: Duration) -> bool {
        self.shared.running.wait_for(timeout)
    }

    /// Join all workers. Only call after a successful drain.
    fn join(self) {
        for handle in self.handles {
            if !handle.join() {
                debug!("A worker has been joined after a panic");
            }
        }
    }
}

// }}} worker

// {{{ coordinator

/// How often the coordinator checks the quit flag and phase conditions.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Write every key of every node's write-key set through that node.
fn populate(nodes: &[Arc<dyn CacheNode>], keys: &KeySpace, payload: &Payload) -> Result<()> {
    for (i, node) in nodes.iter().enumerate() {
        let mut handle = node.handle();
        for key in keys.write_keys(i).iter() {
            handle.put(key, payload).map_err(BenchError::Populate)?;
        }
    }
    Ok(())
}

/// Watch a phase until its length is reached (returns `None`) or it ends early.
fn supervise(
    shared: &Shared,
    reporter: &Reporter,
    phase: RunPhase,
    len: &Length,
    interval: Duration,
    start: Instant,
) -> Option<QuitReason> {
    let deadline = match len {
        Length::Timeout(d) => start.checked_add(*d),
        _ => None,
    };
    let mut next_sample = start + interval;
    let mut last = Snapshot::default();
    loop {
        let now = Instant::now();
        match len {
            Length::Count(c) => {
                if shared.counters.snapshot().total() >= *c {
                    return None;
                }
            }
            Length::Timeout(_) => {
                if deadline.is_some_and(|d| now >= d) {
                    return None;
                }
            }
            Length::Unbounded => {}
        }
        if shared.faults.load(Ordering::Acquire) > 0 {
            return Some(QuitReason::Fault);
        }
        match shared.quit.reason() {
            // with a count, running out of tickets just means the last operations are in flight
            Some(QuitReason::Exhausted) if matches!(len, Length::Count(_)) => {}
            Some(reason) => return Some(reason),
            None => {}
        }
        if now >= next_sample {
            let snapshot = shared.counters.snapshot();
            reporter.sample(phase, now - start, snapshot.reads, snapshot.writes);
            if snapshot.reads == last.reads && snapshot.writes == last.writes {
                warn!(
                    "No progress in {} since the last sample, aborting",
                    crate::report::format_duration(interval)
                );
                return Some(QuitReason::Stalled);
            }
            last = snapshot;
            next_sample = next_sample + interval;
        }
        let mut wake = next_sample;
        if let Some(d) = deadline {
            wake = wake.min(d);
        }
        std::thread::sleep(wake.saturating_duration_since(now).min(POLL_INTERVAL));
    }
}

/// Runs a benchmark against a provisioned cluster.
///
/// A driver runs once. Its quit flag can be handed out before the run, e.g., to a signal handler.
pub struct Driver {
    benchmark: Arc<Benchmark>,
    quit: QuitFlag,
    thread: Arc<dyn Thread>,
}

impl Driver {
    pub fn new(benchmark: Benchmark) -> Self {
        Self {
            benchmark: Arc::new(benchmark),
            quit: QuitFlag::new(),
            thread: Arc::new(DefaultThread),
        }
    }

    /// Use a custom spawn-join implementation for the workers.
    pub fn with_thread(mut self, thread: Arc<dyn Thread>) -> Self {
        self.thread = thread;
        self
    }

    /// The flag that stops the run when raised.
    pub fn quit_flag(&self) -> QuitFlag {
        self.quit.clone()
    }

    pub fn benchmark(&self) -> &Benchmark {
        &self.benchmark
    }

    /// Populate, warm up, measure, drain, and report.
    ///
    /// Errors are only returned for setup failures. Everything that happens once the workers are
    /// released ends up in the returned [`Summary`].
    pub fn run(self, cluster: &Cluster) -> Result<Summary> {
        let benchmark = &self.benchmark;
        let nodes = cluster.nodes();
        if nodes.is_empty() {
            return Err(invalid("the cluster has no nodes"));
        }
        let reporter = Reporter::new(benchmark.report);
        reporter.echo(&benchmark.to_string());

        let mut rng = seeded(benchmark.seed);
        let keys = KeySpace::build(nodes.len(), benchmark.keys_per_node, &mut rng);
        let shared = Arc::new(Shared::new(benchmark.split.total(), self.quit.clone()));

        // populating
        let payload = Payload::generate(benchmark.payload_size, &mut rng);
        info!(
            "Populating {} keys per node with {} payloads",
            benchmark.keys_per_node,
            crate::report::format_bytes(benchmark.payload_size)
        );
        populate(nodes, &keys, &payload)?;

        let pool = WorkerPool::spawn(
            nodes,
            benchmark,
            &keys,
            &mut rng,
            shared.clone(),
            &self.thread,
        );

        // warming up
        shared.phase.advance(RunPhase::WarmingUp);
        pool.release();
        let warmup_start = Instant::now();
        info!("Released {} workers, warming up for {}", pool.len(), benchmark.warmup);
        let early = supervise(
            &shared,
            &reporter,
            RunPhase::WarmingUp,
            &benchmark.warmup,
            benchmark.sample_interval,
            warmup_start,
        );
        if let Some(reason) = early {
            // no worker may start another operation once the counters are reset
            shared.quit.raise(reason);
        }
        let measured = early.is_none();
        let (warmup, start) = shared.counters.reset();
        debug!("Warm-up finished with {:?}", warmup);

        // measuring
        let early = match early {
            None => {
                shared.phase.advance(RunPhase::Measuring);
                info!("Measuring for {}", benchmark.measure);
                supervise(
                    &shared,
                    &reporter,
                    RunPhase::Measuring,
                    &benchmark.measure,
                    benchmark.sample_interval,
                    start,
                )
            }
            Some(reason) => {
                warn!("Warm-up ended early ({:?}), skipping the measurement", reason);
                Some(reason)
            }
        };
        let termination = match early {
            Some(reason) => reason,
            None => match benchmark.measure {
                Length::Count(_) => QuitReason::Exhausted,
                _ => QuitReason::Deadline,
            },
        };

        // draining
        shared.quit.raise(termination);
        shared.phase.advance(RunPhase::Draining);
        info!("Draining {} workers", pool.len());
        let drained = pool.drain(benchmark.drain_timeout);
        let end = Instant::now();
        if drained {
            pool.join();
        } else {
            warn!(
                "Workers did not exit within {}, reporting without them",
                crate::report::format_duration(benchmark.drain_timeout)
            );
            drop(pool);
        }

        shared.phase.advance(RunPhase::Done);
        let faulted_workers = shared.faults.load(Ordering::Acquire);
        if faulted_workers > 0 {
            warn!("{} workers faulted during the run", faulted_workers);
        }
        // operations still in flight when the warm-up ended early are not measurements
        let snapshot = if measured {
            shared.counters.snapshot()
        } else {
            Snapshot::default()
        };
        let latency = if benchmark.latency {
            LatencySummary::from_histogram(&shared.latency.lock())
        } else {
            None
        };
        let summary = Summary {
            reads: snapshot.reads,
            writes: snapshot.writes,
            failures: snapshot.failures,
            elapsed: end - start,
            termination,
            drained,
            faulted_workers,
            latency,
        };
        reporter.summarize(&summary);
        Ok(summary)
    }
}

// }}} coordinator

// {{{ tests

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::rate;
    use crate::{CacheError, CacheHandle};
    use std::sync::atomic::AtomicBool;

    fn benchmark(text: &str) -> Benchmark {
        let opt: BenchmarkOpt = toml::from_str(text).unwrap();
        Benchmark::new(&opt).unwrap()
    }

    fn benchmark_err(text: &str) -> String {
        let opt: BenchmarkOpt = toml::from_str(text).unwrap();
        Benchmark::new(&opt).unwrap_err().to_string()
    }

    #[test]
    fn options_are_applied() {
        let opt = r#"
            [cluster]
            engine = "null"

            [benchmark]
            reader_threads = 45
            writer_threads = 5
            keys_per_node = 200
            payload_size = 10240
            transactional = true
            force_two_phase = false
            warmup = 30.0
            ops = 100000
            sample_interval = 5.0
            drain_timeout = 60.0
            seed = 42
            report = "finish"
            latency = true
            pin = true
        "#;

        let (_, b) = init(opt).unwrap();
        let expected = Benchmark {
            split: ThreadSplit::new(45, 5),
            keys_per_node: 200,
            payload_size: 10240,
            transactional: true,
            force_two_phase: false,
            warmup: Length::Timeout(Duration::from_secs(30)),
            measure: Length::Count(100000),
            sample_interval: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(60),
            seed: 42,
            report: ReportMode::Finish,
            latency: true,
            pin: true,
        };
        assert_eq!(b, expected);
    }

    #[test]
    fn defaults_are_applied() {
        let b = benchmark("seed = 1");
        let expected = Benchmark {
            split: ThreadSplit::new(1, 1),
            keys_per_node: 100,
            payload_size: 1024,
            transactional: false,
            force_two_phase: true,
            warmup: Length::Count(0),
            measure: Length::Unbounded,
            sample_interval: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(43200),
            seed: 1,
            report: ReportMode::All,
            latency: false,
            pin: false,
        };
        assert_eq!(b, expected);
    }

    #[test]
    fn single_pool_split() {
        assert_eq!(benchmark("threads = 50").split, ThreadSplit::new(45, 5));
        assert_eq!(
            benchmark("threads = 8\nwrite_perc = 25").split,
            ThreadSplit::new(6, 2)
        );
        assert_eq!(benchmark("reader_threads = 3").split, ThreadSplit::new(3, 1));
        assert_eq!(
            benchmark("reader_threads = 0\nwriter_threads = 2").split,
            ThreadSplit::new(0, 2)
        );
    }

    #[test]
    fn invalid_options() {
        assert!(benchmark_err("reader_threads = 0\nwriter_threads = 0").contains("should be positive"));
        assert!(benchmark_err("threads = 0").contains("should be positive"));
        assert!(benchmark_err("threads = 4\nreader_threads = 2").contains("at the same time"));
        assert!(benchmark_err("threads = 4\nwrite_perc = 101").contains("between 0 and 100"));
        assert!(benchmark_err("write_perc = 50").contains("only used together"));
        assert!(benchmark_err("keys_per_node = 0").contains("should be positive"));
        assert!(benchmark_err("timeout = 1.0\nops = 10").contains("cannot be provided at the same time"));
        assert!(benchmark_err("warmup = 1.0\nwarmup_ops = 10").contains("cannot be provided at the same time"));
        assert!(benchmark_err("timeout = -1.0").contains("non-negative"));
        assert!(benchmark_err("sample_interval = 0.0").contains("should be positive"));
        assert!(benchmark_err("report = \"repeat\"").contains("report mode should be one of"));
    }

    #[test]
    fn missing_engine() {
        let opt = r#"
            [cluster]
            nodes = 2

            [benchmark]
            ops = 10
        "#;
        assert!(matches!(init(opt), Err(BenchError::Config(_))));
    }

    #[test]
    fn budgets() {
        assert_eq!(
            benchmark("warmup_ops = 10\nops = 100").budget(),
            Some(Budget {
                warmup: 10,
                total: 110,
                from_start: true
            })
        );
        assert_eq!(
            benchmark("ops = 100").budget(),
            Some(Budget {
                warmup: 0,
                total: 100,
                from_start: true
            })
        );
        assert_eq!(
            benchmark("warmup = 1.0\nops = 100").budget(),
            Some(Budget {
                warmup: 0,
                total: 100,
                from_start: false
            })
        );
        assert_eq!(benchmark("timeout = 1.0").budget(), None);
    }

    #[test]
    fn counters_reset() {
        let c = Counters::default();
        for _ in 0..3 {
            c.record(WorkMode::Read, true);
        }
        c.record(WorkMode::Write, false);
        let (before, _) = c.reset();
        assert_eq!(
            before,
            Snapshot {
                reads: 3,
                writes: 1,
                failures: 1
            }
        );
        assert_eq!(c.snapshot(), Snapshot::default());
        c.record(WorkMode::Write, true);
        assert_eq!(c.snapshot().total(), 1);
    }

    #[test]
    fn counters_concurrent() {
        let c = Arc::new(Counters::default());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let c = c.clone();
                std::thread::spawn(move || {
                    let mode = if i % 2 == 0 { WorkMode::Read } else { WorkMode::Write };
                    for _ in 0..10000 {
                        c.record(mode, true);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(
            c.snapshot(),
            Snapshot {
                reads: 20000,
                writes: 20000,
                failures: 0
            }
        );
    }

    #[test]
    fn quit_flag_keeps_first_reason() {
        let q = QuitFlag::new();
        assert!(!q.is_raised());
        assert_eq!(q.reason(), None);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let q = q.clone();
                std::thread::spawn(move || q.raise(QuitReason::Fault))
            })
            .collect();
        let raised = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|r| *r)
            .count();
        assert_eq!(raised, 1);
        assert!(!q.raise(QuitReason::Deadline));
        assert_eq!(q.reason(), Some(QuitReason::Fault));
    }

    #[test]
    fn phase_moves_forward() {
        let p = PhaseCell::new();
        assert_eq!(p.get(), RunPhase::Populating);
        p.advance(RunPhase::WarmingUp);
        p.advance(RunPhase::Draining);
        assert_eq!(p.get(), RunPhase::Draining);
        assert!(p.get() >= RunPhase::Measuring);
    }

    #[test]
    #[should_panic(expected = "can only move forward")]
    fn phase_cannot_go_back() {
        let p = PhaseCell::new();
        p.advance(RunPhase::Measuring);
        p.advance(RunPhase::WarmingUp);
    }

    #[test]
    fn quiescence_times_out() {
        let q = Quiescence::new(1);
        assert!(!q.wait_for(Duration::from_millis(20)));
        q.exit();
        assert!(q.wait_for(Duration::from_millis(20)));
    }

    // {{{ fakes

    #[derive(Clone, Copy, PartialEq)]
    enum Behavior {
        Normal,
        FailCommit,
        PanicAt(u64),
    }

    #[derive(Clone)]
    struct FakeNode {
        behavior: Behavior,
        ops: Arc<AtomicU64>,
        stall_reads: Arc<AtomicBool>,
        touched: Arc<Mutex<Vec<Box<[u8]>>>>,
    }

    impl FakeNode {
        fn new(behavior: Behavior) -> Self {
            Self {
                behavior,
                ops: Arc::new(AtomicU64::new(0)),
                stall_reads: Arc::new(AtomicBool::new(false)),
                touched: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn cluster(&self) -> Cluster {
            Cluster::from_nodes(vec![Arc::new(self.clone()) as Arc<dyn CacheNode>])
        }
    }

    impl CacheNode for FakeNode {
        fn id(&self) -> usize {
            0
        }

        fn handle(&self) -> Box<dyn CacheHandle> {
            Box::new(self.clone())
        }

        fn member_count(&self) -> usize {
            1
        }

        fn stop(&self) -> std::result::Result<(), CacheError> {
            Ok(())
        }
    }

    impl FakeNode {
        fn touch(&self, key: &[u8]) {
            let n = self.ops.fetch_add(1, Ordering::SeqCst) + 1;
            if self.behavior == Behavior::PanicAt(n) {
                panic!("injected worker fault");
            }
            self.touched.lock().push(key.into());
        }
    }

    impl CacheHandle for FakeNode {
        fn get(&mut self, key: &[u8]) -> std::result::Result<Option<Box<[u8]>>, CacheError> {
            while self.stall_reads.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
            self.touch(key);
            Ok(None)
        }

        fn put(&mut self, key: &[u8], _value: &[u8]) -> std::result::Result<(), CacheError> {
            self.touch(key);
            Ok(())
        }

        fn begin(&mut self, _force_two_phase: bool) -> std::result::Result<(), CacheError> {
            Ok(())
        }

        fn commit(&mut self) -> std::result::Result<(), CacheError> {
            match self.behavior {
                Behavior::FailCommit => Err(CacheError::Transaction("prepare voted no".into())),
                _ => Ok(()),
            }
        }

        fn rollback(&mut self) -> std::result::Result<(), CacheError> {
            Ok(())
        }
    }

    // }}} fakes

    #[test]
    fn workers_wait_for_release_and_quit() {
        let node = FakeNode::new(Behavior::Normal);
        let nodes = vec![Arc::new(node.clone()) as Arc<dyn CacheNode>];
        let b = Arc::new(benchmark("reader_threads = 3\nwriter_threads = 2\nseed = 3"));
        let mut rng = seeded(b.seed);
        let keys = KeySpace::build(1, 10, &mut rng);
        let shared = Arc::new(Shared::new(b.split.total(), QuitFlag::new()));
        let thread: Arc<dyn Thread> = Arc::new(DefaultThread);
        let pool = WorkerPool::spawn(&nodes, &b, &keys, &mut rng, shared.clone(), &thread);
        assert_eq!(pool.len(), 5);

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(node.ops.load(Ordering::SeqCst), 0);
        assert_eq!(shared.counters.snapshot().total(), 0);

        shared.phase.advance(RunPhase::WarmingUp);
        pool.release();
        while shared.counters.snapshot().total() < 1000 {
            std::thread::sleep(Duration::from_millis(1));
        }

        assert!(shared.quit.raise(QuitReason::Deadline));
        assert!(pool.drain(Duration::from_secs(10)));
        let stopped = shared.counters.snapshot();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(shared.counters.snapshot(), stopped);
        assert_eq!(node.ops.load(Ordering::SeqCst), stopped.total());
        pool.join();
        assert_eq!(shared.faults.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn exact_operation_budget() {
        let _ = env_logger::try_init();
        let opt = r#"
            [cluster]
            engine = "null"
            nodes = 2

            [benchmark]
            reader_threads = 2
            writer_threads = 1
            warmup_ops = 10
            ops = 100
            transactional = false
            report = "hidden"
            seed = 7
        "#;
        let (copt, b) = init(opt).unwrap();
        let cluster = Cluster::provision(&copt).unwrap();
        cluster.await_membership().unwrap();
        let summary = Driver::new(b).run(&cluster).unwrap();
        assert_eq!(summary.total(), 100);
        assert_eq!(summary.failures, 0);
        assert_eq!(summary.termination, QuitReason::Exhausted);
        assert!(summary.drained);
        assert!(rate(summary.total(), summary.elapsed).unwrap() > 0.0);
        assert_eq!(cluster.teardown(), 0);
    }

    #[test]
    fn failed_commits_are_counted() {
        let node = FakeNode::new(Behavior::FailCommit);
        let b = benchmark(
            r#"
            reader_threads = 1
            writer_threads = 1
            keys_per_node = 5
            warmup_ops = 10
            ops = 100
            transactional = true
            report = "hidden"
            seed = 1
        "#,
        );
        let summary = Driver::new(b).run(&node.cluster()).unwrap();
        assert_eq!(summary.total(), 100);
        assert_eq!(summary.failures, 100);
        assert_eq!(summary.termination, QuitReason::Exhausted);
        assert_eq!(summary.faulted_workers, 0);
        // populate plus every attempted read and write reached the engine
        assert_eq!(node.ops.load(Ordering::SeqCst), 5 + 110);
    }

    #[test]
    fn whole_budget_in_warmup_is_no_data() {
        let node = FakeNode::new(Behavior::Normal);
        let b = benchmark(
            r#"
            reader_threads = 2
            writer_threads = 2
            warmup_ops = 10
            ops = 0
            report = "hidden"
            seed = 1
        "#,
        );
        let summary = Driver::new(b).run(&node.cluster()).unwrap();
        assert!(summary.is_empty());
        assert!(summary.to_string().contains("no data"));
        assert_eq!(summary.termination, QuitReason::Exhausted);
    }

    #[test]
    fn same_seed_same_keys() {
        for split in ["reader_threads = 1\nwriter_threads = 0", "reader_threads = 0\nwriter_threads = 1"] {
            let run = |seed: u64| {
                let node = FakeNode::new(Behavior::Normal);
                let b = benchmark(&format!(
                    "{}\nkeys_per_node = 50\nwarmup_ops = 5\nops = 200\nreport = \"hidden\"\nseed = {}",
                    split, seed
                ));
                let summary = Driver::new(b).run(&node.cluster()).unwrap();
                assert_eq!(summary.total(), 200);
                let touched = node.touched.lock().clone();
                touched
            };
            let a = run(99);
            assert_eq!(a.len(), 50 + 205);
            assert_eq!(a, run(99));
            assert_ne!(a, run(100));
        }
    }

    #[test]
    fn timed_run_on_memory_grid() {
        let opt = r#"
            [cluster]
            engine = "memory"
            nodes = 2
            mode = "distributed"

            [benchmark]
            reader_threads = 2
            writer_threads = 2
            keys_per_node = 50
            payload_size = 64
            transactional = true
            warmup = 0.05
            timeout = 0.2
            sample_interval = 0.1
            latency = true
            report = "hidden"
            seed = 5
        "#;
        let (copt, b) = init(opt).unwrap();
        let cluster = Cluster::provision(&copt).unwrap();
        cluster.await_membership().unwrap();
        let summary = Driver::new(b).run(&cluster).unwrap();
        assert_eq!(summary.termination, QuitReason::Deadline);
        assert!(summary.drained);
        assert!(summary.reads > 0 && summary.writes > 0);
        assert!(summary.elapsed >= Duration::from_millis(200));
        assert!(summary.reads_per_sec().unwrap() > 0.0);
        let latency = summary.latency.clone().unwrap();
        assert!(latency.count > 0 && latency.count <= summary.total());
    }

    #[test]
    fn stalled_run_is_reported() {
        let node = FakeNode::new(Behavior::Normal);
        node.stall_reads.store(true, Ordering::SeqCst);
        let b = benchmark(
            r#"
            reader_threads = 1
            writer_threads = 0
            timeout = 10.0
            sample_interval = 0.05
            drain_timeout = 0.1
            report = "hidden"
            seed = 1
        "#,
        );
        let t = std::time::Instant::now();
        let summary = Driver::new(b).run(&node.cluster()).unwrap();
        assert!(t.elapsed() < Duration::from_secs(5));
        assert_eq!(summary.termination, QuitReason::Stalled);
        assert!(!summary.drained);
        assert!(summary.is_empty());
        assert!(summary.to_string().ends_with("no data drain timed out"));
        // let the stuck reader go
        node.stall_reads.store(false, Ordering::SeqCst);
    }

    #[test]
    fn interrupted_warmup_is_no_data() {
        let node = FakeNode::new(Behavior::Normal);
        let b = benchmark(
            r#"
            reader_threads = 2
            writer_threads = 4
            keys_per_node = 20
            warmup = 10.0
            report = "hidden"
            seed = 1
        "#,
        );
        let driver = Driver::new(b);
        let quit = driver.quit_flag();
        let ops = node.ops.clone();
        let interrupter = std::thread::spawn(move || {
            // interrupt while every worker is busy
            while ops.load(Ordering::SeqCst) < 20 + 1000 {
                std::thread::sleep(Duration::from_millis(1));
            }
            quit.raise(QuitReason::Interrupted)
        });
        let t = std::time::Instant::now();
        let summary = driver.run(&node.cluster()).unwrap();
        assert!(interrupter.join().unwrap());
        assert!(t.elapsed() < Duration::from_secs(5));
        assert_eq!(summary.termination, QuitReason::Interrupted);
        assert!(summary.drained);
        assert!(summary.is_empty(), "{}", summary);
        assert_eq!(summary.failures, 0);
        assert!(summary.latency.is_none());
    }

    #[test]
    fn worker_fault_stops_the_run() {
        let node = FakeNode::new(Behavior::PanicAt(50));
        let b = benchmark(
            r#"
            reader_threads = 2
            writer_threads = 1
            keys_per_node = 4
            timeout = 10.0
            report = "hidden"
            seed = 1
        "#,
        );
        let t = std::time::Instant::now();
        let summary = Driver::new(b).run(&node.cluster()).unwrap();
        assert!(t.elapsed() < Duration::from_secs(5));
        assert_eq!(summary.termination, QuitReason::Fault);
        assert_eq!(summary.faulted_workers, 1);
        assert!(summary.drained);
    }

    #[test]
    fn interrupted_run() {
        let node = FakeNode::new(Behavior::Normal);
        let b = benchmark("reader_threads = 2\nreport = \"hidden\"\nseed = 1");
        let driver = Driver::new(b);
        let quit = driver.quit_flag();
        let interrupter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            quit.raise(QuitReason::Interrupted)
        });
        let summary = driver.run(&node.cluster()).unwrap();
        assert!(interrupter.join().unwrap());
        assert_eq!(summary.termination, QuitReason::Interrupted);
        assert!(summary.total() > 0);
    }

    #[test]
    fn custom_thread_spawns_workers() {
        struct CountingThread(Arc<AtomicUsize>);

        impl Thread for CountingThread {
            fn spawn(&self, f: Box<dyn FnOnce() + Send>) -> Box<dyn JoinHandle> {
                self.0.fetch_add(1, Ordering::SeqCst);
                DefaultThread.spawn(f)
            }

            fn yield_now(&self) {
                std::thread::yield_now();
            }

            fn pin(&self, _core: usize) {}
        }

        let spawned = Arc::new(AtomicUsize::new(0));
        let node = FakeNode::new(Behavior::Normal);
        let b = benchmark("reader_threads = 2\nwriter_threads = 1\nops = 50\npin = true\nreport = \"hidden\"\nseed = 1");
        let summary = Driver::new(b)
            .with_thread(Arc::new(CountingThread(spawned.clone())))
            .run(&node.cluster())
            .unwrap();
        assert_eq!(summary.total(), 50);
        assert_eq!(spawned.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn populate_failure_is_fatal() {
        struct Broken;
        impl CacheNode for Broken {
            fn id(&self) -> usize {
                0
            }
            fn handle(&self) -> Box<dyn CacheHandle> {
                let node = FakeNode::new(Behavior::Normal);
                Box::new(BrokenHandle(node))
            }
            fn member_count(&self) -> usize {
                1
            }
            fn stop(&self) -> std::result::Result<(), CacheError> {
                Ok(())
            }
        }
        struct BrokenHandle(FakeNode);
        impl CacheHandle for BrokenHandle {
            fn get(&mut self, key: &[u8]) -> std::result::Result<Option<Box<[u8]>>, CacheError> {
                self.0.get(key)
            }
            fn put(&mut self, _key: &[u8], _value: &[u8]) -> std::result::Result<(), CacheError> {
                Err(CacheError::NodeStopped(0))
            }
            fn begin(&mut self, f: bool) -> std::result::Result<(), CacheError> {
                self.0.begin(f)
            }
            fn commit(&mut self) -> std::result::Result<(), CacheError> {
                self.0.commit()
            }
            fn rollback(&mut self) -> std::result::Result<(), CacheError> {
                self.0.rollback()
            }
        }
        let cluster = Cluster::from_nodes(vec![Arc::new(Broken) as Arc<dyn CacheNode>]);
        let b = benchmark("ops = 10\nreport = \"hidden\"\nseed = 1");
        assert!(matches!(
            Driver::new(b).run(&cluster),
            Err(BenchError::Populate(CacheError::NodeStopped(0)))
        ));
    }

    const EXAMPLE_BENCH: &str = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/presets/benchmarks/example.toml"
    ));

    fn example(cluster_opt: &str) {
        let _ = env_logger::try_init();
        let opt = cluster_opt.to_string() + "\n" + EXAMPLE_BENCH;
        let (copt, b) = init(&opt).unwrap();
        let cluster = Cluster::provision(&copt).unwrap();
        cluster.await_membership().unwrap();
        let summary = Driver::new(b).run(&cluster).unwrap();
        assert_eq!(summary.total(), 10000);
        assert_eq!(cluster.teardown(), 0);
    }

    #[test]
    fn example_null() {
        const OPT: &str = include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/presets/clusters/null.toml"
        ));
        example(OPT);
    }

    #[test]
    fn example_memory_replicated() {
        const OPT: &str = include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/presets/clusters/memory_replicated.toml"
        ));
        example(OPT);
    }

    #[test]
    fn example_memory_distributed() {
        const OPT: &str = include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/presets/clusters/memory_distributed.toml"
        ));
        example(OPT);
    }

    #[test]
    fn tx_speed_memory_replicated() {
        const CLUSTER: &str = include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/presets/clusters/memory_replicated.toml"
        ));
        const BENCH: &str = include_str!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/presets/benchmarks/tx_speed.toml"
        ));
        let opt = CLUSTER.to_string() + "\n" + BENCH;
        let (copt, b) = init(&opt).unwrap();
        assert!(b.transactional);
        let (cluster, startup) = Cluster::start(&copt).unwrap();
        assert_eq!(startup.nodes, cluster.nodes().len());
        let summary = Driver::new(b).run(&cluster).unwrap();
        assert_eq!(summary.reads, 0);
        assert_eq!(summary.writes, 10000);
        assert_eq!(summary.failures, 0);
        assert_eq!(summary.termination, QuitReason::Exhausted);
    }
}

// }}} tests
