//! Scalable virtual time.
//!
//! Every actor in a simulation shares one [`SimClock`]. The clock maps wall
//! time onto simulated time through a scale factor: `now()` reports elapsed
//! wall time multiplied by the factor, and [`SimClock::wait_for`] suspends
//! the caller for `simulated / scale` wall time on the tokio timer. Two
//! actors holding the same clock therefore observe a consistent elapsed-time
//! ordering, and concurrent waits compose the way real link delays would.
//!
//! The clock is built on `tokio::time`, so tests running under a paused
//! runtime (`start_paused = true`) advance it deterministically: a
//! `wait_for` of 164 simulated milliseconds at scale 1.0 moves `now()`
//! forward by exactly 164ms.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Default simulated-seconds-per-wall-second multiplier.
pub const DEFAULT_SCALE_FACTOR: f64 = 100.0;

/// A point in simulated time, measured from the owning clock's epoch.
///
/// Displays as seconds with millisecond precision, which is the format the
/// event log and the database sink use.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(Duration);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(Duration::ZERO);

    pub fn from_millis(millis: u64) -> Self {
        Timestamp(Duration::from_millis(millis))
    }

    pub fn as_millis(&self) -> u128 {
        self.0.as_millis()
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0.as_secs_f64()
    }
}

impl From<Duration> for Timestamp {
    fn from(elapsed: Duration) -> Self {
        Timestamp(elapsed)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.0.as_secs_f64())
    }
}

/// Scaled wall-clock time source. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct SimClock {
    inner: Arc<ClockInner>,
}

#[derive(Debug)]
struct ClockInner {
    epoch: Mutex<Instant>,
    scale: Mutex<f64>,
}

impl SimClock {
    /// Creates a clock with its epoch bound to "now".
    ///
    /// Panics if `scale_factor` is not strictly positive.
    pub fn new(scale_factor: f64) -> Self {
        assert!(
            scale_factor > 0.0,
            "clock scale factor must be positive, got {scale_factor}"
        );
        SimClock {
            inner: Arc::new(ClockInner {
                epoch: Mutex::new(Instant::now()),
                scale: Mutex::new(scale_factor),
            }),
        }
    }

    /// Simulated time elapsed since the epoch.
    pub fn now(&self) -> Timestamp {
        let elapsed = self.inner.epoch.lock().elapsed();
        let scale = *self.inner.scale.lock();
        Timestamp(elapsed.mul_f64(scale))
    }

    /// Suspends the calling task for `simulated / scale` wall time.
    ///
    /// Only the caller waits; other tasks sharing the clock keep running.
    /// A zero duration returns immediately.
    pub async fn wait_for(&self, simulated: Duration) {
        if simulated.is_zero() {
            return;
        }
        let scale = *self.inner.scale.lock();
        tokio::time::sleep(simulated.div_f64(scale)).await;
    }

    /// Rebinds the epoch to "now"; `now()` restarts from zero.
    pub fn reset(&self) {
        *self.inner.epoch.lock() = Instant::now();
    }

    pub fn scale_factor(&self) -> f64 {
        *self.inner.scale.lock()
    }

    /// Changes the scale factor. Already-elapsed wall time is rescaled too,
    /// so this is meant to be called before the run starts.
    ///
    /// Panics if `scale_factor` is not strictly positive.
    pub fn set_scale_factor(&self, scale_factor: f64) {
        assert!(
            scale_factor > 0.0,
            "clock scale factor must be positive, got {scale_factor}"
        );
        *self.inner.scale.lock() = scale_factor;
    }
}

impl Default for SimClock {
    fn default() -> Self {
        SimClock::new(DEFAULT_SCALE_FACTOR)
    }
}
