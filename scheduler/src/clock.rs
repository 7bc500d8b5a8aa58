//! The wall clock against which emulated time is paced.
//!
//! A [`WallClock`] tells the scheduler what time it is and lets it
//! wait.  Waits are interruptible: they end early as soon as a
//! command is queued for the device, so a `Close` (or anything else)
//! is never held up behind a pacing or idle wait.
//!
//! [`SystemWallClock`] is the real thing.  [`ManualClock`] only moves
//! when told to, which makes pacing behaviour reproducible in tests
//! and in recorded replays.
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{event, Level};

use super::queue::CommandReceiver;

pub trait WallClock {
    /// Time elapsed since the clock's origin.
    fn now(&self) -> Duration;

    /// Wait for `interval`, or until a command is queued on `queue`,
    /// whichever is sooner.
    fn wait(&mut self, interval: Duration, queue: &CommandReceiver);
}

/// Reads the host's monotonic clock.
#[derive(Debug)]
pub struct SystemWallClock {
    origin: Instant,
    total_cumulative_wait: Duration,
}

impl SystemWallClock {
    pub fn new() -> SystemWallClock {
        SystemWallClock {
            origin: Instant::now(),
            total_cumulative_wait: Duration::ZERO,
        }
    }

    pub fn total_cumulative_wait(&self) -> Duration {
        self.total_cumulative_wait
    }
}

impl Default for SystemWallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl WallClock for SystemWallClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn wait(&mut self, interval: Duration, queue: &CommandReceiver) {
        let then = Instant::now();
        let woken = queue.wait_for_command(interval);
        let waited = then.elapsed();
        self.total_cumulative_wait += waited;
        event!(
            Level::TRACE,
            "wanted to wait for {:?}, actually waited for {:?}{}",
            interval,
            waited,
            if woken { " (woken by a command)" } else { "" }
        );
    }
}

impl Drop for SystemWallClock {
    fn drop(&mut self) {
        event!(
            Level::DEBUG,
            "SystemWallClock: drop: total cumulative wait is {:?}",
            self.total_cumulative_wait
        );
    }
}

#[derive(Debug, Default)]
struct ManualState {
    now: Duration,
    waits: Vec<Duration>,
}

/// A clock which only advances when [`ManualClock::advance`] is
/// called or when the scheduler waits on it.  Clones share the same
/// time, so a test can keep one clone while the scheduler owns
/// another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn new() -> ManualClock {
        ManualClock::default()
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn advance(&self, by: Duration) {
        self.lock().now += by;
    }

    /// Every completed wait, in order.
    pub fn waits(&self) -> Vec<Duration> {
        self.lock().waits.clone()
    }

    pub fn total_waited(&self) -> Duration {
        self.lock().waits.iter().sum()
    }
}

impl WallClock for ManualClock {
    fn now(&self) -> Duration {
        self.lock().now
    }

    /// Waiting takes no real time.  As with the system clock, a
    /// pending command cuts the wait short (here, to nothing).
    fn wait(&mut self, interval: Duration, queue: &CommandReceiver) {
        if queue.has_pending() {
            return;
        }
        let mut state = self.lock();
        state.now += interval;
        state.waits.push(interval);
    }
}

#[test]
fn test_manual_clock_waits_advance_time() {
    let (_tx, rx) = super::queue::command_queue();
    let mut clk = ManualClock::new();
    let observer = clk.clone();
    clk.advance(Duration::from_millis(3));
    clk.wait(Duration::from_millis(7), &rx);
    assert_eq!(observer.now(), Duration::from_millis(10));
    assert_eq!(observer.waits(), vec![Duration::from_millis(7)]);
}

#[test]
fn test_manual_clock_wait_interrupted_by_pending_command() {
    let (tx, rx) = super::queue::command_queue();
    let mut clk = ManualClock::new();
    tx.enqueue(super::command::Command::Run).unwrap();
    clk.wait(Duration::from_millis(7), &rx);
    assert_eq!(clk.now(), Duration::ZERO);
    assert!(clk.waits().is_empty());
}

#[test]
fn test_system_clock_wait_is_cut_short() {
    let (tx, rx) = super::queue::command_queue();
    let mut clk = SystemWallClock::new();
    tx.enqueue(super::command::Command::Run).unwrap();
    clk.wait(Duration::from_secs(30), &rx);
    assert!(clk.total_cumulative_wait() < Duration::from_secs(10));
}
