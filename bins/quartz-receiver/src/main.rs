use anyhow::Context;
use clap::Parser;
use quartz_config::{ConfigArgs, Role};
use tracing_subscriber::EnvFilter;

/// Receiving side of a transfer benchmark run. Attaches to the sender's
/// region, listens for the stream transport, connects for the queue.
#[derive(Parser, Debug)]
#[command(name = "quartz-receiver", version, about)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.config.resolve().context("invalid configuration")?;
    init_tracing(&config.log_level);

    let report = quartz_engine::run_role(&config, Role::Receiver)
        .with_context(|| format!("{} receiver failed", config.transport))?;
    tracing::debug!(?report, "receiver exiting");
    Ok(())
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
