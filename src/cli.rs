use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use gauge_link::config::AppConfig;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "gauge-link",
    about = "Two-channel vacuum gauge driver with startup rendezvous and CSV logging"
)]
pub struct Cli {
    /// TOML configuration file (defaults apply when omitted)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,
    /// More log output (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
    #[command(flatten)]
    pub ser: SerialOpts,
    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Cmd {
    /// Initialize the gauge, rendezvous with peers and log pressure to CSV
    Run(RunOpts),
    /// Read pressure and sensor status once
    Read {
        /// Channel 1 or 2 (both when omitted)
        #[arg(long)]
        channel: Option<u8>,
    },
    /// Report the sensor type on each channel
    Ident,
    /// Calibration factors
    #[command(subcommand)]
    Cal(CalCmd),
    /// Show or set the pressure unit (0 mbar, 1 Torr, 2 Pa)
    Unit { value: Option<u8> },
    /// Show or set the filter level on both channels (0 fast, 1 medium, 2 slow)
    Filter { value: Option<u8> },
    /// Show or set the display resolution in digits (2 or 3)
    Resolution { value: Option<u8> },
    /// Run only the rendezvous, or clear stale markers
    Sync(SyncOpts),
    /// List serial ports
    Ports,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CalCmd {
    /// Read both calibration factors
    Get,
    /// Set one channel's factor, leaving the other untouched
    Set { channel: u8, value: f64 },
}

/// Overrides for the `[serial]` section.
#[derive(Args, Debug, Clone, Default)]
pub struct SerialOpts {
    /// Serial device path
    #[arg(long, global = true)]
    pub dev: Option<String>,
    /// Baud rate
    #[arg(long, global = true)]
    pub baud: Option<u32>,
    /// Retries after the first attempt of each command
    #[arg(long, global = true)]
    pub retries: Option<u32>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct RunOpts {
    /// Identity on the rendezvous roster
    #[arg(long)]
    pub identity: Option<String>,
    /// Skip the rendezvous and start on the local clock
    #[arg(long, default_value_t = false)]
    pub no_sync: bool,
    /// Stop after this many recorded samples
    #[arg(long)]
    pub samples: Option<u64>,
    /// Stop after this many minutes
    #[arg(long)]
    pub duration_min: Option<f64>,
    /// Directory for the CSV record
    #[arg(long)]
    pub output_dir: Option<PathBuf>,
    /// Sampling interval in milliseconds
    #[arg(long)]
    pub interval_ms: Option<u64>,
    /// Channel to sample (1 or 2)
    #[arg(long)]
    pub channel: Option<u8>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct SyncOpts {
    #[arg(long)]
    pub identity: Option<String>,
    /// Shared rendezvous directory
    #[arg(long)]
    pub dir: Option<PathBuf>,
    /// Give up waiting after this many milliseconds
    #[arg(long)]
    pub budget_ms: Option<u64>,
    /// Remove every roster member's marker and exit
    #[arg(long, default_value_t = false)]
    pub clear: bool,
}

/* ---------- overrides ---------- */

impl SerialOpts {
    pub fn apply(&self, cfg: &mut AppConfig) {
        if let Some(dev) = &self.dev {
            cfg.serial.port = dev.clone();
        }
        if let Some(baud) = self.baud {
            cfg.serial.baud = baud;
        }
        if let Some(retries) = self.retries {
            cfg.serial.max_retries = retries;
        }
    }
}

impl RunOpts {
    pub fn apply(&self, cfg: &mut AppConfig) {
        if let Some(id) = &self.identity {
            cfg.sync.identity = id.clone();
        }
        if self.no_sync {
            cfg.sync.enabled = false;
        }
        if let Some(dir) = &self.output_dir {
            cfg.acquisition.output_dir = dir.clone();
        }
        if let Some(ms) = self.interval_ms {
            cfg.acquisition.interval_ms = ms;
        }
        if let Some(ch) = self.channel {
            cfg.acquisition.channel = ch;
        }
    }
}

impl SyncOpts {
    pub fn apply(&self, cfg: &mut AppConfig) {
        // This subcommand is the rendezvous, whatever the file says.
        cfg.sync.enabled = true;
        if let Some(id) = &self.identity {
            cfg.sync.identity = id.clone();
        }
        if let Some(dir) = &self.dir {
            cfg.sync.dir = dir.clone();
        }
        if let Some(ms) = self.budget_ms {
            cfg.sync.wait_budget_ms = ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_serial_flags_override_config() {
        let cli = Cli::parse_from([
            "gauge-link",
            "read",
            "--channel",
            "2",
            "--dev",
            "COM23",
            "--retries",
            "1",
        ]);
        let mut cfg = AppConfig::default();
        cli.ser.apply(&mut cfg);
        assert_eq!(cfg.serial.port, "COM23");
        assert_eq!(cfg.serial.max_retries, 1);
        assert_eq!(cfg.serial.baud, 9600);
        assert!(matches!(cli.cmd, Cmd::Read { channel: Some(2) }));
    }

    #[test]
    fn run_flags_override_config() {
        let cli = Cli::parse_from([
            "gauge-link",
            "-vv",
            "run",
            "--identity",
            "heater_controller",
            "--no-sync",
            "--interval-ms",
            "250",
        ]);
        assert_eq!(cli.verbose, 2);
        let Cmd::Run(opts) = cli.cmd else {
            panic!("expected run");
        };
        let mut cfg = AppConfig::default();
        opts.apply(&mut cfg);
        assert_eq!(cfg.sync.identity, "heater_controller");
        assert!(!cfg.sync.enabled);
        assert_eq!(cfg.acquisition.interval_ms, 250);
    }

    #[test]
    fn cal_set_parses_channel_and_value() {
        let cli = Cli::parse_from(["gauge-link", "cal", "set", "2", "1.25"]);
        match cli.cmd {
            Cmd::Cal(CalCmd::Set { channel, value }) => {
                assert_eq!(channel, 2);
                assert_eq!(value, 1.25);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
