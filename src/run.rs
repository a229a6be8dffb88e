use anyhow::{Context, Result};
use chrono::{Local, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use gauge_link::acquire::{Acquisition, Tick};
use gauge_link::config::AppConfig;
use gauge_link::gauge::{Channel, GaugeController};
use gauge_link::port::SerialTransport;
use gauge_link::record;
use gauge_link::sync::{self, SyncBarrier};

use crate::cli::RunOpts;

/// When a run ends on its own. Without either it runs until Ctrl-C, until its
/// rendezvous marker is cleared, or until the gauge stops answering.
#[derive(Debug, Clone, Copy, Default)]
pub struct Limits {
    pub samples: Option<u64>,
    pub duration: Option<Duration>,
}

impl Limits {
    pub fn from_opts(opts: &RunOpts) -> Self {
        Self {
            samples: opts.samples,
            duration: opts
                .duration_min
                .filter(|m| m.is_finite() && *m > 0.0)
                .map(|m| Duration::from_secs_f64(m * 60.0)),
        }
    }
}

/// Why the sampling loop should end now, if it should.
fn stop_reason(
    limits: &Limits,
    recorded: u64,
    elapsed: Duration,
    interrupted: bool,
    marked: bool,
) -> Option<String> {
    if interrupted {
        return Some("interrupted".into());
    }
    if let Some(n) = limits.samples
        && recorded >= n
    {
        return Some(format!("{n} sample(s) recorded"));
    }
    if let Some(d) = limits.duration
        && elapsed >= d
    {
        return Some(format!("ran for {d:?}"));
    }
    if !marked {
        return Some("ready marker cleared".into());
    }
    None
}

pub fn run(cfg: &AppConfig, limits: Limits) -> Result<()> {
    info!(target: "run", "config: {:?}", cfg);
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&interrupted);
        ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed))
            .context("install Ctrl-C handler")?;
    }
    let started = Local::now();
    let transport = SerialTransport::open(&cfg.serial)
        .with_context(|| format!("open {}", cfg.serial.port))?;
    let mut gauge = GaugeController::new(transport, &cfg.serial);

    let mut slot = None;
    let outcome = session(cfg, &mut gauge, limits, &interrupted, &mut slot);

    // ---- Shutdown: always close, withdraw and write the record ----
    gauge.close();
    if cfg.sync.enabled
        && let Err(e) = sync::withdraw(&cfg.sync)
    {
        warn!(target: "sync", "withdraw marker: {}", e);
    }
    let rows = slot.map(Acquisition::into_rows).unwrap_or_default();
    let saved = record::save(
        &cfg.acquisition.output_dir,
        started,
        &cfg.sync.identity,
        &rows,
    );
    match &saved {
        Ok(path) => info!(target: "run", "{} row(s) written to {}", rows.len(), path.display()),
        Err(e) => error!(target: "run", "record not written: {}", e),
    }

    outcome?;
    saved.context("write measurement record")?;
    Ok(())
}

fn session(
    cfg: &AppConfig,
    gauge: &mut GaugeController<SerialTransport>,
    limits: Limits,
    interrupted: &Arc<AtomicBool>,
    slot: &mut Option<Acquisition>,
) -> Result<()> {
    gauge
        .initialize(&cfg.gauge)
        .context("initialize gauge")?;
    let ids = gauge.gauge_identity().context("read gauge identity")?;
    let cal = gauge.get_calibration().context("read calibration")?;
    info!(
        target: "gauge",
        "sensors {} / {}, calibration {:.3} / {:.3}",
        ids[0], ids[1], cal[0], cal[1]
    );

    let start = if cfg.sync.enabled {
        let result = SyncBarrier::new(&cfg.sync)?
            .with_cancel(Arc::clone(interrupted))
            .wait()
            .context("rendezvous")?;
        if result.synchronized {
            info!(target: "sync", "using agreed start {}", result.reference_start_time.to_rfc3339());
        } else {
            warn!(
                target: "sync",
                "using local start {} (missing: {})",
                result.local_time.to_rfc3339(),
                result.missing.join(", ")
            );
        }
        result.reference_start_time
    } else {
        let now = Utc::now();
        info!(target: "run", "rendezvous disabled, local start {}", now.to_rfc3339());
        now
    };

    let channel = Channel::try_from(cfg.acquisition.channel)?;
    let acq = slot.insert(Acquisition::new(
        channel,
        cfg.acquisition.interval(),
        start,
        cfg.acquisition.max_consecutive_failures,
    ));
    let stats_every = Duration::from_secs_f64(cfg.acquisition.stats_interval_s.max(0.1));
    let t0 = Instant::now();

    info!(target: "run", "sampling channel {} every {:?}", channel, cfg.acquisition.interval());
    loop {
        let marked = !cfg.sync.enabled || sync::still_marked(&cfg.sync);
        if let Some(why) = stop_reason(
            &limits,
            acq.stats().recorded(),
            t0.elapsed(),
            interrupted.load(Ordering::Relaxed),
            marked,
        ) {
            info!(target: "run", "{}, stopping", why);
            break;
        }

        if let Tick::Sampled(row) = acq.tick(gauge, Instant::now(), Utc::now())? {
            debug!(
                target: "run",
                "t={:.4} min p={:.3e} {}",
                row.minutes_since_start, row.pressure, row.status
            );
        }
        acq.stats_mut().maybe_log(stats_every);
        // Short naps so Ctrl-C is noticed even with a slow sampling interval.
        thread::sleep(acq.time_until_due(Instant::now()).min(Duration::from_millis(200)));
    }
    Ok(())
}
