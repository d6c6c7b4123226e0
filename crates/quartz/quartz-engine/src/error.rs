use quartz_config::ConfigError;
use quartz_metrics::MetricsError;
use quartz_transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("failed to create metrics directory '{path}'")]
    MetricsDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("stream ended after {received} of {expected} bytes")]
    Incomplete { expected: u64, received: u64 },
}

impl DriverError {
    /// True when the run failed before any byte moved.
    pub fn is_setup(&self) -> bool {
        match self {
            DriverError::Config(_) | DriverError::MetricsDir { .. } => true,
            DriverError::Transport(e) => e.is_setup(),
            DriverError::Metrics(MetricsError::Create { .. }) => true,
            DriverError::Metrics(_) | DriverError::Incomplete { .. } => false,
        }
    }
}
