//! Drives one role of a transfer benchmark run.
//!
//! A run is a [`BenchmarkDriver`] over one [`Transport`](quartz_transport::Transport):
//! `Idle -> Transferring -> Finished`. [`run_role`] builds the transport and
//! metrics sink a [`BenchConfig`](quartz_config::BenchConfig) describes and
//! runs the driver to completion.

mod dispatch;
mod driver;
mod error;
mod plan;

pub use dispatch::{metrics_cadence, queue_endpoint, run_role, shm_endpoint, stream_endpoint};
pub use driver::{BenchmarkDriver, RunReport};
pub use error::DriverError;
pub use plan::{Phase, TransferPlan, TransferState};
