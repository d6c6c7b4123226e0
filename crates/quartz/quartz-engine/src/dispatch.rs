use crate::driver::{BenchmarkDriver, RunReport};
use crate::error::DriverError;
use crate::plan::TransferPlan;
use quartz_chunk::Role;
use quartz_config::{BenchConfig, TransportKind};
use quartz_metrics::{Cadence, CsvSink};
use quartz_transport::{
    HandshakeTransport, QueueTransport, RingSlotTransport, ShmEndpoint, SocketEndpoint,
    StreamTransport, Transport,
};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use tracing::info;

pub fn shm_endpoint(config: &BenchConfig) -> ShmEndpoint {
    let mut ep = ShmEndpoint::new(&config.shm_name, config.chunk_size, config.total_size)
        .with_attach_timeout(config.attach_timeout())
        .with_wait_timeout(config.wait_timeout());
    ep.reclaim_stale = config.reclaim_stale;
    ep
}

pub fn stream_endpoint(config: &BenchConfig) -> SocketEndpoint {
    SocketEndpoint::new(&config.stream_bind, &config.stream_connect, config.chunk_size)
        .with_connect_timeout(config.attach_timeout())
}

pub fn queue_endpoint(config: &BenchConfig) -> SocketEndpoint {
    SocketEndpoint::new(&config.queue_bind, &config.queue_connect, config.chunk_size)
        .with_connect_timeout(config.attach_timeout())
}

/// The queue variant reports on a wall-clock interval, everything else every
/// N cycles.
pub fn metrics_cadence(config: &BenchConfig) -> Cadence {
    match config.transport {
        TransportKind::Queue => Cadence::Interval(config.queue_report_interval()),
        _ => Cadence::EveryCycles(config.sample_every_cycles),
    }
}

/// Runs `role` of the configured transport to completion, writing
/// `{metrics_dir}/{transport}_{role}_metrics.csv`.
pub fn run_role(config: &BenchConfig, role: Role) -> Result<RunReport, DriverError> {
    config.validate()?;
    std::fs::create_dir_all(&config.metrics_dir).map_err(|source| DriverError::MetricsDir {
        path: config.metrics_dir.display().to_string(),
        source,
    })?;
    let metrics_path = config.metrics_path(role);
    info!(
        transport = %config.transport,
        %role,
        metrics = %metrics_path.display(),
        "starting"
    );

    let plan = TransferPlan::new(config.total_size, config.chunk_size);
    let cadence = metrics_cadence(config);
    let path = metrics_path.as_path();
    match config.transport {
        TransportKind::Handshake => {
            drive::<HandshakeTransport>(role, &shm_endpoint(config), plan, path, cadence)
        }
        TransportKind::RingSlot => {
            drive::<RingSlotTransport>(role, &shm_endpoint(config), plan, path, cadence)
        }
        TransportKind::Stream => {
            drive::<StreamTransport>(role, &stream_endpoint(config), plan, path, cadence)
        }
        TransportKind::Queue => {
            drive::<QueueTransport>(role, &queue_endpoint(config), plan, path, cadence)
        }
    }
}

fn drive<T: Transport>(
    role: Role,
    endpoint: &T::Endpoint,
    plan: TransferPlan,
    metrics_path: &Path,
    cadence: Cadence,
) -> Result<RunReport, DriverError> {
    let sink = || CsvSink::create(metrics_path);
    BenchmarkDriver::<T, BufWriter<File>>::open(role, endpoint, plan, sink, cadence)?.run()
}
