//! Acquisition/upload pipeline.
//!
//! The controller wires a `FrameSource`, a `FrameBuffer` and a
//! `RepositorySink` into periodic workers:
//!
//! - `Combined`: one worker; every cycle fetches, appends, then drains.
//!   The worker owns the buffer outright.
//! - `Split`: a fetch worker and an upload worker on independent periods,
//!   sharing the buffer behind a mutex. Fetch I/O happens outside the lock;
//!   a drain holds it for the whole pass.
//!
//! Lifecycle is `Stopped -> Running -> Stopped`. Workers are joined on
//! `stop()` and a panicking worker is reported as an error there.

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::frame::{BufferItem, DrainOutcome, FrameBuffer, DEFAULT_BUFFER_CAPACITY};
use crate::ingest::{FetchResult, FrameSource};
use crate::schedule::{CycleScheduler, CycleStats, StopSignal};
use crate::upload::RepositorySink;

// ----------------------------------------------------------------------------
// Settings and state
// ----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineShape {
    /// One loop: fetch, append, drain, every `period`.
    Combined { period: Duration },
    /// Two loops on their own periods, sharing the buffer.
    ///
    /// A drain holds the buffer lock for every upload in the pass, so
    /// acquisition stalls while a drain runs. Against an unreachable
    /// repository a full drain can take `capacity * timeout`; size
    /// `upload_period` and the repository timeout with that in mind.
    Split {
        fetch_period: Duration,
        upload_period: Duration,
    },
}

impl PipelineShape {
    /// Longest period of any worker; the upper bound on how long a worker
    /// may sleep before it notices a stop.
    pub fn longest_period(&self) -> Duration {
        match *self {
            PipelineShape::Combined { period } => period,
            PipelineShape::Split {
                fetch_period,
                upload_period,
            } => fetch_period.max(upload_period),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineSettings {
    pub shape: PipelineShape,
    pub buffer_capacity: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            shape: PipelineShape::Combined {
                period: Duration::from_millis(1000),
            },
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Stopped,
    Running,
}

// ----------------------------------------------------------------------------
// Counters
// ----------------------------------------------------------------------------

/// Live pipeline counters, shared with the workers.
#[derive(Debug, Default)]
pub struct PipelineCounters {
    fetched: AtomicU64,
    absent: AtomicU64,
    uploaded: AtomicU64,
    upload_failures: AtomicU64,
    evicted: AtomicU64,
    buffered: AtomicU64,
    cycles_executed: AtomicU64,
    cycles_skipped: AtomicU64,
    overruns: AtomicU64,
}

/// Point-in-time copy of `PipelineCounters`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub fetched: u64,
    pub absent: u64,
    pub uploaded: u64,
    pub upload_failures: u64,
    pub evicted: u64,
    pub buffered: u64,
    pub cycles_executed: u64,
    pub cycles_skipped: u64,
    pub overruns: u64,
}

impl PipelineCounters {
    pub fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            fetched: self.fetched.load(Ordering::Relaxed),
            absent: self.absent.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            upload_failures: self.upload_failures.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            cycles_executed: self.cycles_executed.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
        }
    }

    fn record_buffer(&self, buffer: &FrameBuffer) {
        self.buffered.store(buffer.len() as u64, Ordering::Relaxed);
        self.evicted.store(buffer.evicted(), Ordering::Relaxed);
    }

    fn record_drain(&self, outcome: &DrainOutcome) {
        self.uploaded
            .fetch_add(outcome.uploaded as u64, Ordering::Relaxed);
        self.upload_failures
            .fetch_add(outcome.failed as u64, Ordering::Relaxed);
    }

    /// Fold one scheduler's running totals in, given what was last folded.
    fn record_cycles(&self, previous: &mut CycleStats, current: &CycleStats) {
        self.cycles_executed
            .fetch_add(current.executed - previous.executed, Ordering::Relaxed);
        self.cycles_skipped
            .fetch_add(current.skipped - previous.skipped, Ordering::Relaxed);
        self.overruns
            .fetch_add(current.overruns - previous.overruns, Ordering::Relaxed);
        *previous = *current;
    }
}

// ----------------------------------------------------------------------------
// Cycle steps
// ----------------------------------------------------------------------------

/// Poll `source` once. Absence is counted and swallowed.
pub fn fetch_step<S: FrameSource + ?Sized>(
    source: &mut S,
    counters: &PipelineCounters,
) -> Option<BufferItem> {
    match source.fetch() {
        FetchResult::Frame(frame) => {
            counters.fetched.fetch_add(1, Ordering::Relaxed);
            Some(BufferItem::new(frame))
        }
        absent => {
            counters.absent.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "cycle without frame: {}",
                absent.absence_reason().unwrap_or_default()
            );
            None
        }
    }
}

/// Drain `buffer` into `sink` once and record the outcome.
pub fn upload_step<K: RepositorySink + ?Sized>(
    buffer: &mut FrameBuffer,
    sink: &mut K,
    counters: &PipelineCounters,
) -> DrainOutcome {
    let outcome = buffer.drain_upload(sink);
    counters.record_drain(&outcome);
    counters.record_buffer(buffer);
    if outcome.had_items {
        log::debug!(
            "drain: {} uploaded, {} failed, {} buffered (~{} KB)",
            outcome.uploaded,
            outcome.failed,
            buffer.len(),
            buffer.memory_bytes() / 1024
        );
    }
    outcome
}

/// Work of one combined-shape cycle: fetch, append, drain.
pub struct CombinedCycle<S, K> {
    source: S,
    sink: K,
    buffer: FrameBuffer,
    counters: Arc<PipelineCounters>,
}

impl<S: FrameSource, K: RepositorySink> CombinedCycle<S, K> {
    pub fn new(source: S, sink: K, buffer_capacity: usize, counters: Arc<PipelineCounters>) -> Self {
        Self {
            source,
            sink,
            buffer: FrameBuffer::new(buffer_capacity),
            counters,
        }
    }

    pub fn run_cycle(&mut self) -> DrainOutcome {
        if let Some(item) = fetch_step(&mut self.source, &self.counters) {
            self.buffer.add(item);
            self.counters.record_buffer(&self.buffer);
        }
        upload_step(&mut self.buffer, &mut self.sink, &self.counters)
    }

    pub fn buffer(&self) -> &FrameBuffer {
        &self.buffer
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }
}

// ----------------------------------------------------------------------------
// PipelineController
// ----------------------------------------------------------------------------

struct Worker {
    name: String,
    handle: JoinHandle<CycleStats>,
}

pub struct PipelineController {
    settings: PipelineSettings,
    state: PipelineState,
    stop: StopSignal,
    workers: Vec<Worker>,
    counters: Arc<PipelineCounters>,
}

impl PipelineController {
    pub fn new(settings: PipelineSettings) -> Self {
        Self {
            settings,
            state: PipelineState::Stopped,
            stop: StopSignal::new(),
            workers: Vec::new(),
            counters: Arc::new(PipelineCounters::default()),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Counters of the current (or most recent) run.
    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Connect both services and launch the workers.
    ///
    /// A connect failure leaves the controller `Stopped`.
    pub fn start<S, K>(&mut self, mut source: S, mut sink: K) -> Result<()>
    where
        S: FrameSource + Send + 'static,
        K: RepositorySink + Send + 'static,
    {
        if self.state == PipelineState::Running {
            return Err(anyhow!("pipeline already running"));
        }

        if let Err(err) = source.connect().context("frame source unavailable") {
            log::error!("pipeline not started: {:#}", err);
            return Err(err);
        }
        if let Err(err) = sink.connect().context("repository unavailable") {
            log::error!("pipeline not started: {:#}", err);
            return Err(err);
        }

        self.stop = StopSignal::new();
        self.counters = Arc::new(PipelineCounters::default());
        let capacity = self.settings.buffer_capacity;

        match self.settings.shape {
            PipelineShape::Combined { period } => {
                let cycle = CombinedCycle::new(source, sink, capacity, self.counters.clone());
                let worker = self.spawn_combined(cycle, period)?;
                self.workers.push(worker);
            }
            PipelineShape::Split {
                fetch_period,
                upload_period,
            } => {
                let buffer = Arc::new(Mutex::new(FrameBuffer::new(capacity)));
                let fetcher = self.spawn_fetch(source, buffer.clone(), fetch_period)?;
                self.workers.push(fetcher);
                match self.spawn_upload(sink, buffer, upload_period) {
                    Ok(uploader) => self.workers.push(uploader),
                    Err(err) => {
                        self.stop.raise();
                        self.join_workers();
                        return Err(err);
                    }
                }
            }
        }

        self.state = PipelineState::Running;
        log::info!(
            "pipeline running ({:?}, buffer capacity {})",
            self.settings.shape,
            capacity
        );
        Ok(())
    }

    /// Raise the stop signal and wait for every worker to finish its cycle.
    ///
    /// May block for up to one full period plus any in-flight request.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == PipelineState::Stopped {
            return Ok(());
        }
        self.stop.raise();
        let failures = self.join_workers();
        self.state = PipelineState::Stopped;

        let stats = self.stats();
        log::info!(
            "pipeline stopped: {} fetched, {} uploaded, {} still buffered",
            stats.fetched,
            stats.uploaded,
            stats.buffered
        );
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("pipeline worker(s) panicked: {}", failures.join(", ")))
        }
    }

    /// Join all workers, returning the names of those that panicked.
    fn join_workers(&mut self) -> Vec<String> {
        let mut failures = Vec::new();
        for worker in self.workers.drain(..) {
            match worker.handle.join() {
                Ok(stats) => log::debug!(
                    "{} joined: {} executed, {} skipped, {} overruns",
                    worker.name,
                    stats.executed,
                    stats.skipped,
                    stats.overruns
                ),
                Err(_) => {
                    log::error!("{} panicked", worker.name);
                    failures.push(worker.name);
                }
            }
        }
        failures
    }

    fn spawn_combined<S, K>(&self, mut cycle: CombinedCycle<S, K>, period: Duration) -> Result<Worker>
    where
        S: FrameSource + Send + 'static,
        K: RepositorySink + Send + 'static,
    {
        let stop = self.stop.clone();
        let counters = self.counters.clone();
        spawn_worker("uplink-cycle", move || {
            let mut folded = CycleStats::default();
            CycleScheduler::new("uplink-cycle", period).run(
                &stop,
                |_| {
                    cycle.run_cycle();
                },
                |stats| counters.record_cycles(&mut folded, stats),
            )
        })
    }

    fn spawn_fetch<S>(
        &self,
        mut source: S,
        buffer: Arc<Mutex<FrameBuffer>>,
        period: Duration,
    ) -> Result<Worker>
    where
        S: FrameSource + Send + 'static,
    {
        let stop = self.stop.clone();
        let counters = self.counters.clone();
        spawn_worker("uplink-fetch", move || {
            let mut folded = CycleStats::default();
            CycleScheduler::new("uplink-fetch", period).run(
                &stop,
                |_| {
                    let Some(item) = fetch_step(&mut source, &counters) else {
                        return;
                    };
                    match buffer.lock() {
                        Ok(mut guard) => {
                            guard.add(item);
                            counters.record_buffer(&guard);
                        }
                        Err(_) => {
                            log::error!("uplink-fetch: buffer lock poisoned, stopping");
                            stop.raise();
                        }
                    }
                },
                |stats| counters.record_cycles(&mut folded, stats),
            )
        })
    }

    fn spawn_upload<K>(
        &self,
        mut sink: K,
        buffer: Arc<Mutex<FrameBuffer>>,
        period: Duration,
    ) -> Result<Worker>
    where
        K: RepositorySink + Send + 'static,
    {
        let stop = self.stop.clone();
        let counters = self.counters.clone();
        spawn_worker("uplink-upload", move || {
            let mut folded = CycleStats::default();
            CycleScheduler::new("uplink-upload", period).run(
                &stop,
                |_| match buffer.lock() {
                    Ok(mut guard) => {
                        upload_step(&mut guard, &mut sink, &counters);
                    }
                    Err(_) => {
                        log::error!("uplink-upload: buffer lock poisoned, stopping");
                        stop.raise();
                    }
                },
                |stats| counters.record_cycles(&mut folded, stats),
            )
        })
    }
}

impl Drop for PipelineController {
    fn drop(&mut self) {
        if self.state == PipelineState::Running {
            if let Err(err) = self.stop() {
                log::error!("pipeline stop on drop: {}", err);
            }
        }
    }
}

fn spawn_worker<F>(name: &str, body: F) -> Result<Worker>
where
    F: FnOnce() -> CycleStats + Send + 'static,
{
    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .with_context(|| format!("spawn {} worker", name))?;
    Ok(Worker {
        name: name.to_string(),
        handle,
    })
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
