//! Conversion of speed settings into emulated time, and pacing of
//! emulated time against the wall clock.
//!
//! Each scheduler tick advances the emulation by a quantum of
//! T-states.  The quantum is a fixed fraction of a display frame at
//! the current speed, so a 15MHz device at 100% runs about 292
//! T-states per tick.
//!
//! After each tick the [`Throttle`] compares how much emulated time
//! has passed with how much wall-clock time has passed, both measured
//! from the same anchor point, and says how long to wait so that the
//! two stay in step.  Because both sides are measured from the
//! anchor (rather than accumulated tick by tick) rounding errors do
//! not build up.
use std::time::Duration;

use tracing::{event, Level};

/// Display frames per second.
pub const FPS: u64 = 50;

/// Number of scheduler ticks per display frame.
pub const FRAME_SUBDIVISIONS: u64 = 1024;

/// Computes the number of T-states to execute in one tick.
///
/// `ticks = speed_percent * frequency_hz / fps / 100 / subdivisions`,
/// computed in 128-bit arithmetic.  Zero `fps` or `subdivisions` are
/// treated as 1.
pub fn quantum(speed_percent: u32, frequency_hz: u32, fps: u64, subdivisions: u64) -> u64 {
    let t: u128 = u128::from(speed_percent) * u128::from(frequency_hz)
        / u128::from(fps.max(1))
        / 100
        / u128::from(subdivisions.max(1));
    u64::try_from(t).unwrap_or(u64::MAX)
}

/// The quantum for a device running at `speed_percent` using the
/// standard frame rate and subdivision.
pub fn tick_quantum(speed_percent: u32, frequency_hz: u32) -> u64 {
    quantum(speed_percent, frequency_hz, FPS, FRAME_SUBDIVISIONS)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Anchor {
    wall: Duration,
    emulated: Duration,
}

/// Tracks the point from which pacing is measured.
#[derive(Debug, Default)]
pub struct Throttle {
    anchor: Option<Anchor>,
}

impl Throttle {
    pub fn new() -> Throttle {
        Throttle { anchor: None }
    }

    /// Forget the anchor.  The next call to [`Throttle::pace`] sets
    /// a new one.  This is done whenever the speed changes or the
    /// device starts running, so that time spent stopped (or at
    /// maximum speed) is not "caught up" afterwards.
    pub fn reset(&mut self) {
        self.anchor = None;
    }

    pub fn is_anchored(&self) -> bool {
        self.anchor.is_some()
    }

    /// Returns how long the caller should wait, if at all, so that
    /// emulated time does not run ahead of wall-clock time scaled by
    /// `speed_percent`.  Never asks for a wait when `max_speed` is
    /// set.
    pub fn pace(
        &mut self,
        wall_now: Duration,
        emulated_now: Duration,
        speed_percent: u32,
        max_speed: bool,
    ) -> Option<Duration> {
        let anchor = match self.anchor {
            None => {
                self.anchor = Some(Anchor {
                    wall: wall_now,
                    emulated: emulated_now,
                });
                return None;
            }
            Some(_) if max_speed => {
                return None;
            }
            Some(anchor) => anchor,
        };
        if speed_percent == 0 {
            event!(Level::WARN, "speed is zero percent, not pacing");
            return None;
        }
        let emulated = emulated_now.saturating_sub(anchor.emulated);
        let want: Duration = match emulated.checked_mul(100) {
            Some(scaled) => scaled / speed_percent,
            None => Duration::MAX,
        };
        let actual = wall_now.saturating_sub(anchor.wall);
        if want > actual {
            let behind = want - actual;
            event!(
                Level::TRACE,
                "emulation is {:?} ahead of the wall clock",
                behind
            );
            Some(behind)
        } else {
            None
        }
    }
}

#[test]
fn test_quantum_matches_frame_arithmetic() {
    // 15MHz at 100%: 15_000_000 / 50 / 1024 = 292.
    assert_eq!(tick_quantum(100, 15_000_000), 292);
    assert_eq!(tick_quantum(200, 15_000_000), 585);
    assert_eq!(tick_quantum(25, 6_000_000), 29);
    assert_eq!(quantum(100, 6_000_000, 60, 1), 100_000);
    assert_eq!(quantum(100, 6_000_000, 0, 0), 6_000_000);
    // The widest possible product still fits once divided down.
    assert_eq!(quantum(u32::MAX, u32::MAX, 1, 1), 184_467_440_651_196_170);
}

#[test]
fn test_first_pace_sets_anchor() {
    let mut t = Throttle::new();
    assert!(!t.is_anchored());
    assert_eq!(
        t.pace(Duration::from_secs(5), Duration::from_secs(1), 100, false),
        None
    );
    assert!(t.is_anchored());
}

#[test]
fn test_pace_scales_by_speed() {
    let mut t = Throttle::new();
    t.pace(Duration::ZERO, Duration::ZERO, 50, false);
    // 10ms of emulated time at 50% should take 20ms.
    assert_eq!(
        t.pace(
            Duration::from_millis(5),
            Duration::from_millis(10),
            50,
            false
        ),
        Some(Duration::from_millis(15))
    );
    // Behind the wall clock: no wait.
    assert_eq!(
        t.pace(
            Duration::from_millis(30),
            Duration::from_millis(10),
            50,
            false
        ),
        None
    );
}

#[test]
fn test_max_speed_never_waits() {
    let mut t = Throttle::new();
    t.pace(Duration::ZERO, Duration::ZERO, 100, true);
    for i in 1..100u64 {
        assert_eq!(
            t.pace(Duration::ZERO, Duration::from_secs(i), 100, true),
            None
        );
    }
}

#[test]
fn test_reset_discards_backlog() {
    let mut t = Throttle::new();
    t.pace(Duration::ZERO, Duration::ZERO, 100, false);
    t.reset();
    // After a reset the emulated time already run does not count.
    assert_eq!(
        t.pace(Duration::from_secs(1), Duration::from_secs(60), 100, false),
        None
    );
    assert_eq!(
        t.pace(Duration::from_secs(1), Duration::from_secs(61), 100, false),
        Some(Duration::from_secs(1))
    );
}
