use std::time::{Duration, Instant};

use tracing::info;

use crate::gauge::SensorStatus;

#[derive(Debug, Clone)]
pub struct Stats {
    /// Samples recorded with status Ok
    pub ok: u64,
    /// Samples recorded with any other sensor status
    pub flagged: u64,
    /// Samples lost to protocol or transport errors
    pub failed: u64,
    pub consecutive_failures: u32,
    t0: Instant,
    last: Instant,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            ok: 0,
            flagged: 0,
            failed: 0,
            consecutive_failures: 0,
            t0: Instant::now(),
            last: Instant::now(),
        }
    }

    pub fn add_reading(&mut self, status: SensorStatus) {
        match status {
            SensorStatus::Ok => self.ok += 1,
            _ => self.flagged += 1,
        }
        self.consecutive_failures = 0;
    }

    pub fn inc_failed(&mut self) {
        self.failed += 1;
        self.consecutive_failures += 1;
    }

    pub fn recorded(&self) -> u64 {
        self.ok + self.flagged
    }

    pub fn maybe_log(&mut self, every: Duration) {
        if self.last.elapsed() >= every {
            let dur = self.t0.elapsed().as_secs_f64().max(1e-3);
            info!(
                target: "acquire",
                "ok={} flagged={} failed={} over {:.1}s => {:.2} samples/s",
                self.ok,
                self.flagged,
                self.failed,
                dur,
                self.recorded() as f64 / dur
            );
            self.last = Instant::now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_resets_failure_streak() {
        let mut s = Stats::new();
        s.inc_failed();
        s.inc_failed();
        assert_eq!(s.consecutive_failures, 2);
        s.add_reading(SensorStatus::Underrange);
        s.add_reading(SensorStatus::Ok);
        assert_eq!(s.consecutive_failures, 0);
        assert_eq!((s.ok, s.flagged, s.failed), (1, 1, 2));
        assert_eq!(s.recorded(), 2);
    }
}
