//! Monotonic wall-clock timer for run diagnostics.

use std::time::{Duration, Instant};

/// Start/stop timer. Used only for logging; never for control flow.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    started: Instant,
    stopped: Option<Instant>,
}

impl Timer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
            stopped: None,
        }
    }

    /// Freeze the duration. Further calls move the stop point.
    pub fn stop(&mut self) {
        self.stopped = Some(Instant::now());
    }

    /// Elapsed time, frozen if [`stop`](Timer::stop) was called.
    pub fn duration(&self) -> Duration {
        self.stopped
            .unwrap_or_else(Instant::now)
            .duration_since(self.started)
    }

    pub fn seconds(&self) -> f64 {
        self.duration().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_freezes_the_duration() {
        let mut timer = Timer::start();
        timer.stop();
        let frozen = timer.duration();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(timer.duration(), frozen);
    }

    #[test]
    fn duration_is_monotone_while_running() {
        let timer = Timer::start();
        let a = timer.duration();
        let b = timer.duration();
        assert!(b >= a);
    }
}
