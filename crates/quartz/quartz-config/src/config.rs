use quartz_chunk::{DEFAULT_CHUNK_SIZE, DEFAULT_TOTAL_SIZE, Role, SENTINEL};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Longest accepted shm name. Leaves room for the `_empty`/`_full` suffixes
/// and the platform's semaphore prefix under NAME_MAX.
const MAX_SHM_NAME: usize = 200;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Handshake,
    RingSlot,
    Stream,
    Queue,
}

impl TransportKind {
    pub const ALL: [TransportKind; 4] = [
        TransportKind::Handshake,
        TransportKind::RingSlot,
        TransportKind::Stream,
        TransportKind::Queue,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Handshake => "handshake",
            TransportKind::RingSlot => "ring_slot",
            TransportKind::Stream => "stream",
            TransportKind::Queue => "queue",
        }
    }

    /// The role that creates the rendezvous and must start first.
    pub fn rendezvous_owner(self) -> Role {
        match self {
            TransportKind::Stream => Role::Receiver,
            _ => Role::Sender,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().replace('-', "_");
        TransportKind::ALL
            .into_iter()
            .find(|k| k.as_str() == wanted)
            .ok_or_else(|| ConfigError::Invalid {
                field: "transport",
                reason: format!(
                    "unknown transport '{s}' (expected one of handshake, ring_slot, stream, queue)"
                ),
            })
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct BenchConfig {
    #[serde(default)]
    pub transport: TransportKind,
    #[serde(default = "defaults::chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "defaults::total_size")]
    pub total_size: u64,
    #[serde(default = "defaults::shm_name")]
    pub shm_name: String,
    #[serde(default = "defaults::stream_bind")]
    pub stream_bind: String,
    #[serde(default = "defaults::stream_connect")]
    pub stream_connect: String,
    #[serde(default = "defaults::queue_bind")]
    pub queue_bind: String,
    #[serde(default = "defaults::queue_connect")]
    pub queue_connect: String,
    #[serde(default = "defaults::metrics_dir")]
    pub metrics_dir: PathBuf,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default = "defaults::sample_every_cycles")]
    pub sample_every_cycles: u64,
    #[serde(default = "defaults::queue_report_interval_ms")]
    pub queue_report_interval_ms: u64,
    #[serde(default = "defaults::attach_timeout_ms")]
    pub attach_timeout_ms: u64,
    /// Unset: every semaphore wait blocks forever.
    #[serde(default)]
    pub wait_timeout_ms: Option<u64>,
    #[serde(default = "defaults::reclaim_stale")]
    pub reclaim_stale: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

mod defaults {
    use std::path::PathBuf;

    pub fn chunk_size() -> usize {
        super::DEFAULT_CHUNK_SIZE
    }

    pub fn total_size() -> u64 {
        super::DEFAULT_TOTAL_SIZE
    }

    pub fn shm_name() -> String {
        "/quartz_shm".into()
    }

    pub fn stream_bind() -> String {
        "0.0.0.0:5000".into()
    }

    pub fn stream_connect() -> String {
        "127.0.0.1:5000".into()
    }

    pub fn queue_bind() -> String {
        "0.0.0.0:5555".into()
    }

    pub fn queue_connect() -> String {
        "127.0.0.1:5555".into()
    }

    pub fn metrics_dir() -> PathBuf {
        PathBuf::from(".")
    }

    pub fn log_level() -> String {
        "info".into()
    }

    pub fn sample_every_cycles() -> u64 {
        100
    }

    pub fn queue_report_interval_ms() -> u64 {
        100
    }

    pub fn attach_timeout_ms() -> u64 {
        5_000
    }

    pub fn reclaim_stale() -> bool {
        true
    }
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::default(),
            chunk_size: defaults::chunk_size(),
            total_size: defaults::total_size(),
            shm_name: defaults::shm_name(),
            stream_bind: defaults::stream_bind(),
            stream_connect: defaults::stream_connect(),
            queue_bind: defaults::queue_bind(),
            queue_connect: defaults::queue_connect(),
            metrics_dir: defaults::metrics_dir(),
            log_level: defaults::log_level(),
            sample_every_cycles: defaults::sample_every_cycles(),
            queue_report_interval_ms: defaults::queue_report_interval_ms(),
            attach_timeout_ms: defaults::attach_timeout_ms(),
            wait_timeout_ms: None,
            reclaim_stale: defaults::reclaim_stale(),
        }
    }
}

impl BenchConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: BenchConfig = toml::from_str(&toml_to_str)?;
        Ok(config)
    }

    /// Rejects settings that would make the run ambiguous or impossible.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: String| Err(ConfigError::Invalid { field, reason });

        if self.chunk_size <= SENTINEL.len() {
            return invalid(
                "chunk_size",
                format!(
                    "{} bytes; must exceed the {}-byte end-of-stream marker",
                    self.chunk_size,
                    SENTINEL.len()
                ),
            );
        }
        if self.total_size == 0 {
            return invalid("total_size", "must be greater than zero".into());
        }
        let name = self.shm_name.as_str();
        if !name.starts_with('/') || name.len() < 2 || name[1..].contains('/') {
            return invalid(
                "shm_name",
                format!("'{name}' must be a single '/'-prefixed component"),
            );
        }
        if name.len() > MAX_SHM_NAME {
            return invalid("shm_name", format!("longer than {MAX_SHM_NAME} bytes"));
        }
        if name.contains('\0') {
            return invalid("shm_name", "contains a NUL byte".into());
        }
        if self.sample_every_cycles == 0 {
            return invalid("sample_every_cycles", "must be at least 1".into());
        }
        if self.queue_report_interval_ms == 0 {
            return invalid("queue_report_interval_ms", "must be at least 1".into());
        }
        Ok(())
    }

    /// `{transport}_{role}_metrics.csv`
    pub fn metrics_file_name(&self, role: Role) -> String {
        format!("{}_{}_metrics.csv", self.transport, role)
    }

    pub fn metrics_path(&self, role: Role) -> PathBuf {
        self.metrics_dir.join(self.metrics_file_name(role))
    }

    pub fn attach_timeout(&self) -> Duration {
        Duration::from_millis(self.attach_timeout_ms)
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn queue_report_interval(&self) -> Duration {
        Duration::from_millis(self.queue_report_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let cfg: BenchConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, BenchConfig::default());
        assert_eq!(cfg.transport, TransportKind::Handshake);
        assert_eq!(cfg.chunk_size, 16 * 1024 * 1024);
        assert_eq!(cfg.total_size, 10 * 1024 * 1024 * 1024);
        assert_eq!(cfg.wait_timeout(), None);
        cfg.validate().unwrap();
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let cfg: BenchConfig = toml::from_str(
            r#"
            transport = "ring_slot"
            chunk_size = 1024
            wait_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(cfg.transport, TransportKind::RingSlot);
        assert_eq!(cfg.chunk_size, 1024);
        assert_eq!(cfg.wait_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(cfg.shm_name, "/quartz_shm");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<BenchConfig>("chunk = 4").is_err());
    }

    #[test]
    fn transport_names_round_trip() {
        for kind in TransportKind::ALL {
            assert_eq!(kind.as_str().parse::<TransportKind>().unwrap(), kind);
        }
        assert_eq!("ring-slot".parse::<TransportKind>().unwrap(), TransportKind::RingSlot);
        assert!("zmq".parse::<TransportKind>().is_err());
    }

    #[test]
    fn validate_rejects_bad_geometry_and_names() {
        let base = BenchConfig::default();

        let bad = |f: fn(&mut BenchConfig)| {
            let mut c = base.clone();
            f(&mut c);
            c.validate().unwrap_err()
        };

        assert!(matches!(
            bad(|c| c.chunk_size = 4),
            ConfigError::Invalid { field: "chunk_size", .. }
        ));
        assert!(matches!(
            bad(|c| c.total_size = 0),
            ConfigError::Invalid { field: "total_size", .. }
        ));
        for name in ["quartz", "/", "/a/b"] {
            let mut c = base.clone();
            c.shm_name = name.into();
            assert!(c.validate().is_err(), "{name}");
        }

        let mut ok = base.clone();
        ok.chunk_size = 5;
        ok.validate().unwrap();
    }

    #[test]
    fn derived_names() {
        let mut cfg = BenchConfig::default();
        cfg.transport = TransportKind::Queue;
        cfg.metrics_dir = PathBuf::from("/tmp/run");
        assert_eq!(
            cfg.metrics_path(Role::Receiver),
            PathBuf::from("/tmp/run/queue_receiver_metrics.csv")
        );
    }

    #[test]
    fn rendezvous_owner_per_transport() {
        assert_eq!(TransportKind::Stream.rendezvous_owner(), Role::Receiver);
        assert_eq!(TransportKind::Queue.rendezvous_owner(), Role::Sender);
    }
}
