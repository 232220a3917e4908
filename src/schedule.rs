//! Fixed-period cycle scheduling.
//!
//! `CycleScheduler::run` drives a unit of work on a fixed period until a
//! `StopSignal` is raised:
//!
//! - Logical cycle starts are anchored: cycle k begins at `start + k * period`
//!   no matter how long earlier work took or how late a sleep returned.
//! - If a cycle is already more than `CATCH_UP_TOLERANCE` late when it comes
//!   due, its work is skipped and the scheduler moves to the next boundary.
//! - If work runs longer than the period, the scheduler does not sleep and
//!   the catch-up rule decides the next cycle.
//! - The stop signal is checked at the top of each cycle only. Work in flight
//!   always runs to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Lateness a cycle may accumulate before its work is skipped.
pub const CATCH_UP_TOLERANCE: Duration = Duration::from_millis(10);

// ----------------------------------------------------------------------------
// StopSignal: cooperative cancellation
// ----------------------------------------------------------------------------

/// Shared cancellation flag, polled at cycle boundaries.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    flag: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Clock: time source seam
// ----------------------------------------------------------------------------

/// Time source used by the scheduler.
pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by `Instant::now` and `thread::sleep`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Manually advanced clock. `sleep` advances time by the requested duration
/// plus a configurable oversleep, modelling a late wakeup.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<Instant>>,
    oversleep: Duration,
}

impl ManualClock {
    pub fn new(start: Instant) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
            oversleep: Duration::ZERO,
        }
    }

    pub fn with_oversleep(mut self, oversleep: Duration) -> Self {
        self.oversleep = oversleep;
        self
    }

    /// Move time forward, e.g. to simulate slow work.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += duration;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration + self.oversleep);
    }
}

// ----------------------------------------------------------------------------
// CycleClock: drift-free cycle anchor
// ----------------------------------------------------------------------------

/// Anchor for logical cycle start times.
#[derive(Clone, Copy, Debug)]
pub struct CycleClock {
    period: Duration,
    cycle_begin: Instant,
    index: u64,
}

impl CycleClock {
    pub fn new(period: Duration, start: Instant) -> Self {
        Self {
            period,
            cycle_begin: start,
            index: 0,
        }
    }

    /// Logical start of the current cycle.
    pub fn cycle_begin(&self) -> Instant {
        self.cycle_begin
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    /// Move to the next cycle. Advances by exactly one period.
    pub fn advance(&mut self) {
        self.cycle_begin += self.period;
        self.index += 1;
    }

    /// How far `now` is past the current cycle's logical start.
    pub fn lag(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.cycle_begin)
    }

    /// Time left until the current cycle's logical start, if it is ahead.
    pub fn until_begin(&self, now: Instant) -> Option<Duration> {
        self.cycle_begin
            .checked_duration_since(now)
            .filter(|wait| !wait.is_zero())
    }
}

/// The cycle a unit of work is running for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tick {
    pub index: u64,
    pub cycle_begin: Instant,
}

/// Counters for one scheduler run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub executed: u64,
    pub skipped: u64,
    pub overruns: u64,
}

// ----------------------------------------------------------------------------
// CycleScheduler
// ----------------------------------------------------------------------------

pub struct CycleScheduler<C: Clock = SystemClock> {
    name: String,
    period: Duration,
    tolerance: Duration,
    clock: C,
}

impl CycleScheduler<SystemClock> {
    pub fn new(name: impl Into<String>, period: Duration) -> Self {
        Self::with_clock(name, period, SystemClock)
    }
}

impl<C: Clock> CycleScheduler<C> {
    pub fn with_clock(name: impl Into<String>, period: Duration, clock: C) -> Self {
        Self {
            name: name.into(),
            period,
            tolerance: CATCH_UP_TOLERANCE,
            clock,
        }
    }

    /// Run `work` once per period until `stop` is raised.
    ///
    /// `on_cycle` is called after every cycle (executed or skipped) with the
    /// running totals.
    pub fn run<W, R>(&self, stop: &StopSignal, mut work: W, mut on_cycle: R) -> CycleStats
    where
        W: FnMut(Tick),
        R: FnMut(&CycleStats),
    {
        let mut cycle = CycleClock::new(self.period, self.clock.now());
        let mut stats = CycleStats::default();

        while !stop.is_raised() {
            let now = self.clock.now();
            let lag = cycle.lag(now);

            if lag > self.tolerance {
                stats.skipped += 1;
                log::warn!(
                    "{}: cycle {} skipped, {} ms behind schedule",
                    self.name,
                    cycle.index(),
                    lag.as_millis()
                );
            } else {
                work(Tick {
                    index: cycle.index(),
                    cycle_begin: cycle.cycle_begin(),
                });
                stats.executed += 1;

                let took = self.clock.now().saturating_duration_since(now);
                if took > self.period {
                    stats.overruns += 1;
                    log::warn!(
                        "{}: cycle {} overran its period ({} ms > {} ms)",
                        self.name,
                        cycle.index(),
                        took.as_millis(),
                        self.period.as_millis()
                    );
                }
            }

            on_cycle(&stats);
            cycle.advance();

            if let Some(wait) = cycle.until_begin(self.clock.now()) {
                self.clock.sleep(wait);
            }
        }

        log::debug!(
            "{}: stopped after {} cycles ({} skipped, {} overruns)",
            self.name,
            stats.executed + stats.skipped,
            stats.skipped,
            stats.overruns
        );
        stats
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
