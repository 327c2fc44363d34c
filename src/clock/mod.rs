use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Time source for every time-gated structure in the pipeline.
///
/// Queues and discovery state never call `SystemTime::now()` directly so
/// that hold windows can be exercised deterministically.
pub trait Clock: Send + Sync {
    /// Returns the current wall-clock time.
    fn now(&self) -> SystemTime;
}

/// Shared handle to a clock implementation.
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock backed by the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Returns a shared system clock.
pub fn system() -> SharedClock {
    Arc::new(SystemClock)
}

/// Manually advanced clock for tests and replay tooling.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<parking_lot::Mutex<SystemTime>>,
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("now", &*self.now.lock())
            .finish()
    }
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Arc::new(parking_lot::Mutex::new(start)),
        }
    }

    /// Creates a clock frozen `secs` seconds after the Unix epoch.
    pub fn at_secs(secs: u64) -> Self {
        Self::new(SystemTime::UNIX_EPOCH + Duration::from_secs(secs))
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Moves the clock forward by whole seconds.
    pub fn advance_secs(&self, secs: u64) {
        self.advance(Duration::from_secs(secs));
    }

    /// Pins the clock to an absolute time.
    pub fn set(&self, to: SystemTime) {
        *self.now.lock() = to;
    }

    /// Returns this clock as a shared trait object.
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}

/// Elapsed time from `earlier` to `now`, saturating at zero when the clock
/// stepped backwards.
pub fn elapsed_since(now: SystemTime, earlier: SystemTime) -> Duration {
    now.duration_since(earlier).unwrap_or(Duration::ZERO)
}

/// Converts a time to fractional Unix seconds.
pub fn unix_secs(t: SystemTime) -> f64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Converts fractional Unix seconds back to a time. Negative, non-finite
/// and unrepresentable values yield `None`.
pub fn from_unix_secs(secs: f64) -> Option<SystemTime> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    let offset = Duration::try_from_secs_f64(secs).ok()?;
    SystemTime::UNIX_EPOCH.checked_add(offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::at_secs(1000);
        assert_eq!(unix_secs(clock.now()), 1000.0);

        clock.advance_secs(40);
        assert_eq!(unix_secs(clock.now()), 1040.0);
    }

    #[test]
    fn test_shared_handle_observes_advance() {
        let clock = ManualClock::at_secs(5);
        let shared = clock.shared();
        clock.advance(Duration::from_millis(1500));
        assert_eq!(unix_secs(shared.now()), 6.5);
    }

    #[test]
    fn test_elapsed_since_saturates() {
        let later = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        let earlier = SystemTime::UNIX_EPOCH + Duration::from_secs(4);
        assert_eq!(elapsed_since(later, earlier), Duration::from_secs(6));
        assert_eq!(elapsed_since(earlier, later), Duration::ZERO);
    }

    #[test]
    fn test_from_unix_secs_rejects_unrepresentable() {
        assert_eq!(from_unix_secs(0.0), Some(SystemTime::UNIX_EPOCH));
        assert_eq!(from_unix_secs(12.5).map(unix_secs), Some(12.5));
        assert_eq!(from_unix_secs(-5.0), None);
        assert_eq!(from_unix_secs(f64::NAN), None);
        assert_eq!(from_unix_secs(f64::INFINITY), None);
        assert_eq!(from_unix_secs(1e30), None);
    }
}
