use anyhow::{Context, Result};
use clap::Parser;

use gauge_link::config::AppConfig;
use gauge_link::logging;

mod cli;
mod query;
mod run;

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    logging::init_tracing(args.verbose)?;

    let mut cfg = AppConfig::load(args.config.as_deref()).context("load configuration")?;
    args.ser.apply(&mut cfg);
    match &args.cmd {
        cli::Cmd::Run(opts) => opts.apply(&mut cfg),
        cli::Cmd::Sync(opts) => opts.apply(&mut cfg),
        _ => {}
    }
    cfg.validate().context("invalid configuration")?;

    match args.cmd {
        cli::Cmd::Run(opts) => run::run(&cfg, run::Limits::from_opts(&opts)),
        other => query::run(other, &cfg),
    }
}
