mod args;
mod config;

pub use args::ConfigArgs;
pub use config::{BenchConfig, ConfigError, TransportKind};
pub use quartz_chunk::Role;
