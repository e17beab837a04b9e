use anyhow::Context;
use clap::Parser;

use hive_broker::{Broker, BrokerConfig};

/// Starts a broker on the current machine.
#[derive(Parser, Debug)]
#[command(name = "hive-broker", version, about)]
struct Opts {
    /// Port of the task socket; 0 picks a free port.
    #[arg(long, default_value_t = 0)]
    task_port: u16,

    /// Port of the info socket; 0 picks a free port.
    #[arg(long, default_value_t = 0)]
    info_port: u16,

    /// Interface to bind both sockets on.
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Run the pool without an attached console.
    #[arg(long)]
    headless: bool,

    /// Queue depth at which tasks spill to cluster peers.
    #[arg(long, default_value_t = 1024)]
    spill_at: usize,

    /// Increase verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    let level = match opts.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env().filter_level(level).init();

    let config = BrokerConfig { headless: opts.headless, spill_at: opts.spill_at };
    let broker = Broker::bind(
        config,
        &format!("{}:{}", opts.bind, opts.task_port),
        &format!("{}:{}", opts.bind, opts.info_port),
    )
    .context("binding broker sockets")?;

    // The launcher scrapes the chosen ports from the first stdout line.
    let (task_port, info_port) = broker.ports();
    println!("{task_port},{info_port}");

    broker.run().context("broker run loop")?;
    Ok(())
}
