//! Per-run accounting for the transfer benchmark.
//!
//! A [`MetricsRecorder`] accumulates active time and bytes cycle by cycle,
//! keeps a running maximum of resident memory and writes [`MetricsRecord`]
//! rows to a CSV sink: one row at the end of the run, or one row per sampling
//! interval plus a final row when driven by a wall-clock cadence.

mod memory;
mod record;
mod recorder;
mod sink;

pub use memory::{MegabytesF64, sample_resident_memory};
pub use record::{CSV_HEADER, MetricsRecord};
pub use recorder::{Cadence, MetricsRecorder};
pub use sink::CsvSink;

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to create metrics file '{path}'")]
    Create {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write metrics")]
    Write(#[from] std::io::Error),

    #[error("malformed metrics row '{line}': {reason}")]
    Parse { line: String, reason: String },
}
