use crate::config::{BenchConfig, ConfigError, TransportKind};
use clap::Args;
use std::path::PathBuf;

/// Command-line flags shared by both role binaries. Flags win over the file.
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// TOML config file; every key is optional.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// handshake, ring_slot, stream or queue.
    #[arg(long)]
    pub transport: Option<TransportKind>,

    /// Bytes moved per cycle.
    #[arg(long, value_name = "BYTES")]
    pub chunk_size: Option<usize>,

    /// Bytes moved per run.
    #[arg(long, value_name = "BYTES")]
    pub total_size: Option<u64>,

    /// Where the metrics CSV is written.
    #[arg(long, value_name = "DIR")]
    pub metrics_dir: Option<PathBuf>,

    /// Bound every semaphore wait instead of blocking forever.
    #[arg(long, value_name = "MS")]
    pub wait_timeout_ms: Option<u64>,
}

impl ConfigArgs {
    /// Loads the file (or defaults), applies the flags and validates.
    pub fn resolve(&self) -> Result<BenchConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => BenchConfig::load(path.display().to_string())?,
            None => BenchConfig::default(),
        };
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn apply(&self, config: &mut BenchConfig) {
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.chunk_size = chunk_size;
        }
        if let Some(total_size) = self.total_size {
            config.total_size = total_size;
        }
        if let Some(dir) = &self.metrics_dir {
            config.metrics_dir = dir.clone();
        }
        if let Some(ms) = self.wait_timeout_ms {
            config.wait_timeout_ms = Some(ms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        config: ConfigArgs,
    }

    #[test]
    fn flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "transport = \"stream\"\nchunk_size = 2048\ntotal_size = 8192").unwrap();

        let cli = Cli::parse_from([
            "quartz",
            "--config",
            file.path().to_str().unwrap(),
            "--chunk-size",
            "1024",
            "--wait-timeout-ms",
            "10",
        ]);
        let cfg = cli.config.resolve().unwrap();
        assert_eq!(cfg.transport, TransportKind::Stream);
        assert_eq!(cfg.chunk_size, 1024);
        assert_eq!(cfg.total_size, 8192);
        assert_eq!(cfg.wait_timeout_ms, Some(10));
    }

    #[test]
    fn transport_flag_is_parsed() {
        let cli = Cli::parse_from(["quartz", "--transport", "ring_slot"]);
        assert_eq!(cli.config.transport, Some(TransportKind::RingSlot));
        assert!(Cli::try_parse_from(["quartz", "--transport", "pipe"]).is_err());
    }

    #[test]
    fn resolve_validates_after_overrides() {
        let args = ConfigArgs {
            chunk_size: Some(3),
            ..Default::default()
        };
        assert!(matches!(
            args.resolve(),
            Err(ConfigError::Invalid { field: "chunk_size", .. })
        ));
    }

    #[test]
    fn missing_file_names_the_path() {
        let args = ConfigArgs {
            config: Some(PathBuf::from("/nonexistent/quartz.toml")),
            ..Default::default()
        };
        let err = args.resolve().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/quartz.toml"));
    }
}
