use chrono::Utc;
use std::time::Duration;

/// Wall clock seen by the supervisor, in seconds since the Unix epoch.
///
/// The only blocking call in the subsystem (the bounded shutdown wait) goes
/// through `sleep` so tests can advance time instead of waiting.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}
