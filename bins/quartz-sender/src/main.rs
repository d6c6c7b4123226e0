use anyhow::Context;
use clap::Parser;
use quartz_config::{ConfigArgs, Role};
use tracing_subscriber::EnvFilter;

/// Sending side of a transfer benchmark run. Creates the shared region for
/// the shared-memory transports and binds for the queue transport.
#[derive(Parser, Debug)]
#[command(name = "quartz-sender", version, about)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.config.resolve().context("invalid configuration")?;
    init_tracing(&config.log_level);

    let report = quartz_engine::run_role(&config, Role::Sender)
        .with_context(|| format!("{} sender failed", config.transport))?;
    tracing::debug!(?report, "sender exiting");
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
