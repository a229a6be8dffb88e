use anyhow::{Context, Result, bail};

use gauge_link::config::AppConfig;
use gauge_link::gauge::{Channel, GaugeController};
use gauge_link::port::{self, SerialTransport};
use gauge_link::sync::{self, SyncBarrier};

use crate::cli::{CalCmd, Cmd};

/// One-shot commands. Each opens the port, does its exchange and closes again.
pub fn run(cmd: Cmd, cfg: &AppConfig) -> Result<()> {
    match cmd {
        Cmd::Ports => {
            let ports = port::list_ports().context("list serial ports")?;
            if ports.is_empty() {
                println!("no serial ports found");
            }
            for p in ports {
                println!("{p}");
            }
            Ok(())
        }
        Cmd::Sync(opts) if opts.clear => {
            let n = sync::clear_markers(&cfg.sync)?;
            println!("removed {n} marker(s) from {}", cfg.sync.dir.display());
            Ok(())
        }
        Cmd::Sync(_) => {
            let result = SyncBarrier::new(&cfg.sync)?.wait()?;
            println!(
                "synchronized={} reference_start={} local={}",
                result.synchronized,
                result.reference_start_time.to_rfc3339(),
                result.local_time.to_rfc3339()
            );
            for p in &result.peers {
                println!("  {} ready at {}", p.name, p.observed_at.to_rfc3339());
            }
            for m in &result.missing {
                println!("  {m} missing");
            }
            Ok(())
        }
        other => with_gauge(cfg, |g| device(g, other)),
    }
}

fn with_gauge<F>(cfg: &AppConfig, f: F) -> Result<()>
where
    F: FnOnce(&mut GaugeController<SerialTransport>) -> Result<()>,
{
    let transport = SerialTransport::open(&cfg.serial)
        .with_context(|| format!("open {}", cfg.serial.port))?;
    let mut gauge = GaugeController::new(transport, &cfg.serial);
    let out = f(&mut gauge);
    gauge.close();
    out
}

fn device(g: &mut GaugeController<SerialTransport>, cmd: Cmd) -> Result<()> {
    match cmd {
        Cmd::Read { channel } => {
            let channels = match channel {
                Some(n) => vec![Channel::try_from(n)?],
                None => Channel::BOTH.to_vec(),
            };
            for ch in channels {
                let r = g
                    .read_pressure(ch)
                    .with_context(|| format!("read channel {ch}"))?
                    .value;
                println!("channel {ch}: {:.3e} ({})", r.pressure, r.status);
            }
        }
        Cmd::Ident => {
            let [a, b] = g.gauge_identity()?;
            println!("channel 1: {a}\nchannel 2: {b}");
        }
        Cmd::Cal(CalCmd::Get) => {
            let [a, b] = g.get_calibration()?;
            println!("calibration {a:.3} / {b:.3}");
        }
        Cmd::Cal(CalCmd::Set { channel, value }) => {
            let ch = Channel::try_from(channel)?;
            let factor = g.set_calibration(ch, value)?;
            println!("channel {ch} calibration {:.3}", factor.value());
        }
        Cmd::Unit { value } => {
            let unit = match value {
                Some(code) => g.set_unit(code)?,
                None => g.get_unit()?,
            };
            println!("unit {unit}");
        }
        Cmd::Filter { value } => {
            let [a, b] = match value {
                Some(code) => g.set_filter(code)?,
                None => g.get_filter()?,
            };
            println!("filter {a} / {b}");
        }
        Cmd::Resolution { value } => {
            let res = match value {
                Some(digits) => g.set_resolution(digits)?,
                None => g.get_resolution()?,
            };
            println!("resolution {res}");
        }
        other @ (Cmd::Run(_) | Cmd::Sync(_) | Cmd::Ports) => {
            bail!("{other:?} does not talk to the gauge")
        }
    }
    Ok(())
}
