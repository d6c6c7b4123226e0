//! End-to-end two-process runs of every transport.
//!
//! Same self-spawning pattern for each test: the test binary re-invokes itself
//! once per role with `QUARTZ_E2E_ROLE` set, the two children run a full
//! `run_role` against each other, and the parent checks exit codes and both
//! metrics files.
//!
//! ```text
//! [parent] ──spawn──► [owner role]    creates region / binds
//!          ──spawn──► [other role]    attaches / connects (retries)
//!          ◄─wait───  both exit 0, both CSVs report 4096 bytes
//! ```
//!
//! ```bash
//! cargo test -p quartz-engine --test e2e_two_process -- --nocapture
//! ```

use quartz_config::{BenchConfig, Role, TransportKind};
use quartz_engine::run_role;
use quartz_metrics::MetricsRecord;
use std::env;
use std::io::Write;
use std::net::TcpListener;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

macro_rules! log {
    ($($arg:tt)*) => {{
        let _ = writeln!(std::io::stderr(), $($arg)*);
        let _ = std::io::stderr().flush();
    }};
}

const ENV_ROLE: &str = "QUARTZ_E2E_ROLE";
const ENV_DIR: &str = "QUARTZ_E2E_DIR";
const ENV_PORT: &str = "QUARTZ_E2E_PORT";
const ENV_PARENT: &str = "QUARTZ_E2E_PARENT";

const CHUNK: usize = 1024;
const TOTAL: u64 = 4096;

fn config(transport: TransportKind, dir: &Path, port: u16, parent: &str) -> BenchConfig {
    BenchConfig {
        transport,
        chunk_size: CHUNK,
        total_size: TOTAL,
        shm_name: format!("/qz_e2e_{}_{parent}", transport.as_str()),
        stream_bind: format!("127.0.0.1:{port}"),
        stream_connect: format!("127.0.0.1:{port}"),
        queue_bind: format!("127.0.0.1:{port}"),
        queue_connect: format!("127.0.0.1:{port}"),
        metrics_dir: dir.to_path_buf(),
        sample_every_cycles: 2,
        queue_report_interval_ms: 1,
        wait_timeout_ms: Some(10_000),
        ..BenchConfig::default()
    }
}

/// Child side. Returns true when this process is a spawned role.
fn run_child(transport: TransportKind) -> bool {
    let Ok(role) = env::var(ENV_ROLE) else {
        return false;
    };
    let role = match role.as_str() {
        "sender" => Role::Sender,
        "receiver" => Role::Receiver,
        other => panic!("unknown role: {other}"),
    };
    let dir = env::var(ENV_DIR).expect("QUARTZ_E2E_DIR not set");
    let port: u16 = env::var(ENV_PORT).unwrap().parse().unwrap();
    let parent = env::var(ENV_PARENT).unwrap();
    let cfg = config(transport, Path::new(&dir), port, &parent);

    log!("[{role}] {transport} starting");
    let report =
        run_role(&cfg, role).unwrap_or_else(|e| panic!("[{role}] {transport} failed: {e:?}"));
    log!("[{role}] {transport} done: {:?}", report.record);

    assert_eq!(report.record.bytes, TOTAL);
    assert_eq!(report.cycles, TOTAL / CHUNK as u64);
    true
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn orchestrate(test_name: &str, transport: TransportKind) {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let parent = std::process::id().to_string();
    let exe = env::current_exe().expect("Failed to get current executable path");

    let spawn = |role: Role| {
        Command::new(&exe)
            .arg("--exact")
            .arg(test_name)
            .arg("--nocapture")
            .env(ENV_ROLE, role.as_str())
            .env(ENV_DIR, dir.path())
            .env(ENV_PORT, port.to_string())
            .env(ENV_PARENT, &parent)
            .stderr(Stdio::inherit())
            .spawn()
            .unwrap_or_else(|e| panic!("Failed to spawn {role}: {e}"))
    };

    log!("[ORCHESTRATOR] {transport}: {TOTAL} bytes in {CHUNK}-byte chunks");
    let owner = transport.rendezvous_owner();
    let other = match owner {
        Role::Sender => Role::Receiver,
        Role::Receiver => Role::Sender,
    };
    let mut first = spawn(owner);
    std::thread::sleep(Duration::from_millis(20));
    let mut second = spawn(other);

    let first_status = first.wait().expect("wait for first child");
    let second_status = second.wait().expect("wait for second child");
    log!("[ORCHESTRATOR] {owner}: {first_status}, {other}: {second_status}");
    assert!(first_status.success(), "{owner} failed: {first_status}");
    assert!(second_status.success(), "{other} failed: {second_status}");

    let cfg = config(transport, dir.path(), port, &parent);
    for role in [Role::Sender, Role::Receiver] {
        let text = std::fs::read_to_string(cfg.metrics_path(role)).unwrap();
        let record = MetricsRecord::last_in_csv(&text).unwrap().unwrap();
        assert_eq!(record.bytes, TOTAL, "{role}");
        assert!(record.active_time_sec <= record.wall_time_sec, "{role}: {record:?}");
        assert!(record.peak_rss_mb > 0.0);
    }
}

#[test]
#[cfg(target_os = "linux")]
fn e2e_handshake() {
    if !run_child(TransportKind::Handshake) {
        orchestrate("e2e_handshake", TransportKind::Handshake);
    }
}

#[test]
fn e2e_ring_slot() {
    if !run_child(TransportKind::RingSlot) {
        orchestrate("e2e_ring_slot", TransportKind::RingSlot);
    }
}

#[test]
fn e2e_stream() {
    if !run_child(TransportKind::Stream) {
        orchestrate("e2e_stream", TransportKind::Stream);
    }
}

#[test]
fn e2e_queue() {
    if !run_child(TransportKind::Queue) {
        orchestrate("e2e_queue", TransportKind::Queue);
    }
}
