//! Runs every transport end to end and collects the results.
//!
//! For each transport the role that owns the rendezvous starts first, the
//! other follows, and both must exit cleanly before the timeout. Each run's
//! metrics files land in `results/<timestamp>/<transport>/`; a throughput and
//! peak-memory table is printed and `summary.json` is written next to them.

use anyhow::{Context, bail};
use clap::Parser;
use quartz_config::{BenchConfig, ConfigArgs, Role, TransportKind};
use quartz_metrics::MetricsRecord;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Gives the owner a head start; the other side retries anyway.
const OWNER_HEAD_START: Duration = Duration::from_millis(200);

const POLL: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(name = "quartz-suite", version, about)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    /// Transports to run, comma separated. Defaults to all of them.
    #[arg(long, value_delimiter = ',')]
    only: Vec<TransportKind>,

    /// Root under which the timestamped run directory is created.
    #[arg(long, default_value = "results")]
    results_dir: PathBuf,

    /// Directory holding quartz-sender and quartz-receiver. Defaults to the
    /// directory of this executable.
    #[arg(long)]
    bin_dir: Option<PathBuf>,

    /// Seconds both processes get before they are killed.
    #[arg(long, default_value_t = 600)]
    timeout_secs: u64,
}

#[derive(Serialize, Debug)]
struct RoleSummary {
    role: &'static str,
    #[serde(flatten)]
    record: MetricsRecord,
    active_mib_per_sec: f64,
    wall_mib_per_sec: f64,
    wall_gbit_per_sec: f64,
}

impl RoleSummary {
    fn new(role: Role, r: &MetricsRecord) -> Self {
        Self {
            role: role.as_str(),
            record: *r,
            active_mib_per_sec: r.mib_per_sec(r.active_time_sec),
            wall_mib_per_sec: r.mib_per_sec(r.wall_time_sec),
            wall_gbit_per_sec: r.gbit_per_sec(r.wall_time_sec),
        }
    }
}

#[derive(Serialize, Debug)]
struct TransportSummary {
    transport: TransportKind,
    ok: bool,
    error: Option<String>,
    roles: Vec<RoleSummary>,
}

#[derive(Serialize, Debug)]
struct SuiteSummary {
    timestamp: String,
    chunk_size: usize,
    total_size: u64,
    runs: Vec<TransportSummary>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let base = cli.config.resolve().context("invalid configuration")?;
    init_tracing(&base.log_level);

    let bin_dir = match &cli.bin_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_exe()
            .context("cannot locate own executable")?
            .parent()
            .map(Path::to_path_buf)
            .context("executable has no parent directory")?,
    };
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let run_root = cli.results_dir.join(&timestamp);
    let transports = if cli.only.is_empty() {
        TransportKind::ALL.to_vec()
    } else {
        cli.only.clone()
    };
    let timeout = Duration::from_secs(cli.timeout_secs);

    let mut runs = Vec::new();
    for transport in transports {
        let run_dir = run_root.join(transport.as_str());
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("failed to create '{}'", run_dir.display()))?;

        info!(%transport, dir = %run_dir.display(), "running");
        let summary = match run_pair(&cli, &bin_dir, transport, &run_dir, timeout) {
            Ok(()) => collect(&base, transport, &run_dir),
            Err(e) => {
                error!(%transport, error = format!("{e:#}"), "run failed");
                TransportSummary {
                    transport,
                    ok: false,
                    error: Some(format!("{e:#}")),
                    roles: Vec::new(),
                }
            }
        };
        runs.push(summary);
    }

    let summary = SuiteSummary {
        timestamp,
        chunk_size: base.chunk_size,
        total_size: base.total_size,
        runs,
    };
    print_table(&summary);

    let json_path = run_root.join("summary.json");
    let json = serde_json::to_string_pretty(&summary).context("failed to encode summary")?;
    std::fs::write(&json_path, json)
        .with_context(|| format!("failed to write '{}'", json_path.display()))?;
    info!(path = %json_path.display(), "summary written");

    let failed = summary.runs.iter().filter(|r| !r.ok).count();
    if failed > 0 {
        bail!("{failed} transport run(s) failed");
    }
    Ok(())
}

fn role_command(
    cli: &Cli,
    bin_dir: &Path,
    role: Role,
    transport: TransportKind,
    run_dir: &Path,
) -> Command {
    let mut cmd = Command::new(bin_dir.join(format!("quartz-{role}")));
    if let Some(config) = &cli.config.config {
        cmd.arg("--config").arg(config);
    }
    cmd.arg("--transport").arg(transport.as_str());
    cmd.arg("--metrics-dir").arg(run_dir);
    if let Some(n) = cli.config.chunk_size {
        cmd.arg("--chunk-size").arg(n.to_string());
    }
    if let Some(n) = cli.config.total_size {
        cmd.arg("--total-size").arg(n.to_string());
    }
    if let Some(ms) = cli.config.wait_timeout_ms {
        cmd.arg("--wait-timeout-ms").arg(ms.to_string());
    }
    cmd
}

fn spawn(
    cli: &Cli,
    bin_dir: &Path,
    role: Role,
    transport: TransportKind,
    run_dir: &Path,
) -> anyhow::Result<Child> {
    role_command(cli, bin_dir, role, transport, run_dir)
        .spawn()
        .with_context(|| format!("failed to start quartz-{role} from '{}'", bin_dir.display()))
}

fn run_pair(
    cli: &Cli,
    bin_dir: &Path,
    transport: TransportKind,
    run_dir: &Path,
    timeout: Duration,
) -> anyhow::Result<()> {
    let owner = transport.rendezvous_owner();
    let other = match owner {
        Role::Sender => Role::Receiver,
        Role::Receiver => Role::Sender,
    };

    let mut first = spawn(cli, bin_dir, owner, transport, run_dir)?;
    std::thread::sleep(OWNER_HEAD_START);
    let mut second = match spawn(cli, bin_dir, other, transport, run_dir) {
        Ok(child) => child,
        Err(e) => {
            kill(&mut first, owner);
            return Err(e);
        }
    };

    let deadline = Instant::now() + timeout;
    let mut first_status: Option<ExitStatus> = None;
    let mut second_status: Option<ExitStatus> = None;
    while first_status.is_none() || second_status.is_none() {
        if first_status.is_none() {
            first_status = first.try_wait()?;
        }
        if second_status.is_none() {
            second_status = second.try_wait()?;
        }
        if Instant::now() >= deadline {
            warn!(%transport, ?timeout, "timed out, killing both roles");
            kill(&mut first, owner);
            kill(&mut second, other);
            bail!("{transport} did not finish within {timeout:?}");
        }
        std::thread::sleep(POLL);
    }

    for (role, status) in [(owner, first_status), (other, second_status)] {
        if let Some(status) = status.filter(|s| !s.success()) {
            bail!("quartz-{role} exited with {status}");
        }
    }
    Ok(())
}

fn kill(child: &mut Child, role: Role) {
    if let Err(e) = child.kill() {
        warn!(%role, error = %e, "kill failed");
    }
    let _ = child.wait();
}

fn collect(base: &BenchConfig, transport: TransportKind, run_dir: &Path) -> TransportSummary {
    let run = BenchConfig {
        transport,
        metrics_dir: run_dir.to_path_buf(),
        ..base.clone()
    };
    let mut roles = Vec::new();
    let mut error = None;
    for role in [Role::Sender, Role::Receiver] {
        let path = run.metrics_path(role);
        let parsed = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read '{}'", path.display()))
            .and_then(|text| {
                MetricsRecord::last_in_csv(&text)?
                    .with_context(|| format!("'{}' has no data rows", path.display()))
            });
        match parsed {
            Ok(record) => roles.push(RoleSummary::new(role, &record)),
            Err(e) => error = Some(format!("{e:#}")),
        }
    }
    TransportSummary {
        transport,
        ok: error.is_none(),
        error,
        roles,
    }
}

fn print_table(summary: &SuiteSummary) {
    println!("\n{}", "─".repeat(90));
    println!(
        "  chunk {} B, total {} B, {}",
        summary.chunk_size, summary.total_size, summary.timestamp
    );
    println!("{}", "─".repeat(90));
    println!(
        "  {:<10} {:<9} {:>12} {:>12} {:>12} {:>10} {:>12}",
        "transport", "role", "active s", "wall s", "MiB/s wall", "Gbit/s", "peak RSS MB"
    );
    println!("  {}", "─".repeat(86));
    for run in &summary.runs {
        if let Some(err) = &run.error {
            println!("  {:<10} FAILED: {err}", run.transport.as_str());
        }
        for r in &run.roles {
            println!(
                "  {:<10} {:<9} {:>12.3} {:>12.3} {:>12.1} {:>10.2} {:>12.1}",
                run.transport.as_str(),
                r.role,
                r.record.active_time_sec,
                r.record.wall_time_sec,
                r.wall_mib_per_sec,
                r.wall_gbit_per_sec,
                r.record.peak_rss_mb
            );
        }
    }
    println!();
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_summary_json_carries_record_columns() {
        let record = MetricsRecord {
            active_time_sec: 1.0,
            wall_time_sec: 2.0,
            bytes: 4 * 1024 * 1024,
            peak_rss_mb: 12.5,
        };
        let json = serde_json::to_value(RoleSummary::new(Role::Receiver, &record)).unwrap();
        assert_eq!(json["role"], "receiver");
        assert_eq!(json["bytes"], 4 * 1024 * 1024);
        assert_eq!(json["wall_time_sec"], 2.0);
        assert_eq!(json["peak_rss_mb"], 12.5);
        assert_eq!(json["active_mib_per_sec"], 4.0);
        assert_eq!(json["wall_mib_per_sec"], 2.0);
    }
}
