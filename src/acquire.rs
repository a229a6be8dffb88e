//! Cooperative sampling loop. The host calls [`Acquisition::tick`] from its own
//! loop and sleeps for [`Acquisition::time_until_due`] in between.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use crate::gauge::{Channel, GaugeController, GaugeError, Reading};
use crate::port::Transport;
use crate::record::MeasurementRow;
use crate::stats::Stats;

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("{count} samples in a row failed; last error: {last}")]
    TooManyFailures {
        count: u32,
        #[source]
        last: GaugeError,
    },
}

#[derive(Debug)]
pub enum Tick {
    /// Not due yet.
    Idle,
    Sampled(MeasurementRow),
    /// The read failed; nothing was recorded.
    Skipped(GaugeError),
}

pub struct Acquisition {
    channel: Channel,
    interval: Duration,
    start: DateTime<Utc>,
    next_due: Option<Instant>,
    max_consecutive_failures: u32,
    rows: Vec<MeasurementRow>,
    stats: Stats,
}

impl Acquisition {
    /// `start` is elapsed-time zero for every row. Whether that is the agreed
    /// reference or the local fallback is the caller's choice.
    pub fn new(
        channel: Channel,
        interval: Duration,
        start: DateTime<Utc>,
        max_consecutive_failures: u32,
    ) -> Self {
        Self {
            channel,
            interval,
            start,
            next_due: None,
            max_consecutive_failures,
            rows: Vec::new(),
            stats: Stats::new(),
        }
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn rows(&self) -> &[MeasurementRow] {
        &self.rows
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut Stats {
        &mut self.stats
    }

    pub fn time_until_due(&self, now: Instant) -> Duration {
        self.next_due
            .map(|due| due.saturating_duration_since(now))
            .unwrap_or_default()
    }

    /// Take one sample if one is due at `now`; `wall` stamps the row.
    pub fn tick<T: Transport>(
        &mut self,
        gauge: &mut GaugeController<T>,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Result<Tick, AcquireError> {
        if let Some(due) = self.next_due
            && now < due
        {
            return Ok(Tick::Idle);
        }
        self.schedule_next(now);

        match gauge.read_pressure(self.channel) {
            Ok(resp) => {
                let row = self.record(resp.value, wall);
                Ok(Tick::Sampled(row))
            }
            Err(err) => {
                self.stats.inc_failed();
                let count = self.stats.consecutive_failures;
                if self.max_consecutive_failures > 0 && count >= self.max_consecutive_failures {
                    return Err(AcquireError::TooManyFailures { count, last: err });
                }
                warn!(target: "acquire", "sample skipped ({} in a row): {}", count, err);
                Ok(Tick::Skipped(err))
            }
        }
    }

    fn schedule_next(&mut self, now: Instant) {
        let next = match self.next_due {
            Some(due) => due + self.interval,
            None => now + self.interval,
        };
        // Fell behind by more than one interval: restart the cadence from now.
        self.next_due = Some(if next <= now { now + self.interval } else { next });
    }

    fn record(&mut self, reading: Reading, wall: DateTime<Utc>) -> MeasurementRow {
        let elapsed = wall.signed_duration_since(self.start);
        let row = MeasurementRow {
            absolute_timestamp: wall,
            minutes_since_start: elapsed.num_milliseconds() as f64 / 60_000.0,
            pressure: reading.pressure,
            status: reading.status,
        };
        self.stats.add_reading(reading.status);
        self.rows.push(row.clone());
        row
    }

    pub fn into_rows(self) -> Vec<MeasurementRow> {
        self.rows
    }
}
