use std::fmt::Debug;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Monotonic time capability consumed by the engine. Injected so the whole
/// protocol can run under a simulated clock in tests.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Instant;
}

/// The process clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A manual clock for deterministic simulations.
#[derive(Debug)]
pub struct ManualClock {
    instant: RwLock<Instant>,
}

impl ManualClock {
    pub fn new(start: Instant) -> Self {
        Self {
            instant: RwLock::new(start),
        }
    }

    pub fn set(&self, instant: Instant) {
        *self.instant.write().unwrap() = instant;
    }

    pub fn advance(&self, duration: Duration) {
        *self.instant.write().unwrap() += duration;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.instant.read().unwrap()
    }
}
