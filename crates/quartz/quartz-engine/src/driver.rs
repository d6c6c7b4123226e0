use crate::error::DriverError;
use crate::plan::{Phase, TransferPlan, TransferState};
use quartz_chunk::{Chunk, Role};
use quartz_metrics::{Cadence, CsvSink, MetricsError, MetricsRecord, MetricsRecorder};
use quartz_transport::{Cycle, Transport};
use std::io::Write;
use tracing::{debug, info};

/// Byte every sent chunk is filled with.
const FILL_BYTE: u8 = b'A';

/// Result of one role's completed run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunReport {
    pub transport: &'static str,
    pub role: Role,
    pub cycles: u64,
    pub record: MetricsRecord,
}

impl RunReport {
    fn log(&self) {
        let r = &self.record;
        info!(
            transport = self.transport,
            role = %self.role,
            cycles = self.cycles,
            bytes = r.bytes,
            active_sec = r.active_time_sec,
            wall_sec = r.wall_time_sec,
            peak_rss_mb = r.peak_rss_mb,
            "run complete"
        );
        info!(
            active_mib_s = %format!("{:.1}", r.mib_per_sec(r.active_time_sec)),
            active_gbit_s = %format!("{:.2}", r.gbit_per_sec(r.active_time_sec)),
            wall_mib_s = %format!("{:.1}", r.mib_per_sec(r.wall_time_sec)),
            wall_gbit_s = %format!("{:.2}", r.gbit_per_sec(r.wall_time_sec)),
            "throughput"
        );
    }
}

/// Runs one side of a transfer over an open transport.
///
/// A sender moves exactly `plan.total_bytes`, then sends end of stream. A
/// receiver loops until end of stream and fails if the byte count disagrees
/// with the plan. Any transport error aborts the run; nothing is retried.
pub struct BenchmarkDriver<T: Transport, W: Write> {
    transport: T,
    plan: TransferPlan,
    state: TransferState,
    recorder: MetricsRecorder<W>,
    chunk: Chunk,
}

impl<T: Transport, W: Write> BenchmarkDriver<T, W> {
    /// Opens the transport for `role`, then the metrics sink. A transport that
    /// fails to open leaves no metrics file behind. The metrics wall clock
    /// starts once the peer is connected.
    pub fn open(
        role: Role,
        endpoint: &T::Endpoint,
        plan: TransferPlan,
        sink: impl FnOnce() -> Result<CsvSink<W>, MetricsError>,
        cadence: Cadence,
    ) -> Result<Self, DriverError> {
        debug!(transport = T::KIND, %role, phase = ?Phase::Idle, "opening transport");
        let mut transport = match role {
            Role::Sender => T::open_as_sender(endpoint)?,
            Role::Receiver => T::open_as_receiver(endpoint)?,
        };
        match sink() {
            Ok(sink) => Ok(Self::with_transport(transport, plan, sink, cadence)),
            Err(e) => {
                transport.close();
                Err(e.into())
            }
        }
    }

    pub fn with_transport(
        transport: T,
        plan: TransferPlan,
        sink: CsvSink<W>,
        cadence: Cadence,
    ) -> Self {
        let chunk = match transport.role() {
            Role::Sender => Chunk::filled(plan.chunk_size, FILL_BYTE),
            Role::Receiver => Chunk::zeroed(plan.chunk_size),
        };
        Self {
            transport,
            plan,
            state: TransferState {
                phase: Phase::Transferring,
                ..TransferState::default()
            },
            recorder: MetricsRecorder::new(sink, cadence),
            chunk,
        }
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.transport.role()
    }

    /// Performs one cycle, or the end-of-stream step once the target is met.
    pub fn step(&mut self) -> Result<Phase, DriverError> {
        if self.state.phase == Phase::Finished {
            return Ok(Phase::Finished);
        }
        match self.transport.role() {
            Role::Sender => self.send_step(),
            Role::Receiver => self.recv_step(),
        }
    }

    fn send_step(&mut self) -> Result<Phase, DriverError> {
        let Some(len) = self.plan.next_len(self.state.bytes_moved) else {
            self.transport.finish()?;
            self.state.phase = Phase::Finished;
            return Ok(Phase::Finished);
        };
        let cycle = self.transport.send_chunk(&self.chunk.as_slice()[..len])?;
        self.account(cycle)?;
        Ok(Phase::Transferring)
    }

    fn recv_step(&mut self) -> Result<Phase, DriverError> {
        match self.transport.recv_chunk(&mut self.chunk)? {
            Some(cycle) => {
                self.account(cycle)?;
                Ok(Phase::Transferring)
            }
            None => {
                self.state.phase = Phase::Finished;
                Ok(Phase::Finished)
            }
        }
    }

    fn account(&mut self, cycle: Cycle) -> Result<(), DriverError> {
        self.state.advance(cycle.bytes);
        self.recorder.record_cycle(cycle.bytes as u64, cycle.active);
        self.recorder.sample_memory_if_due()?;
        Ok(())
    }

    /// Steps until finished, closes the transport and writes the final metrics
    /// row.
    pub fn run(mut self) -> Result<RunReport, DriverError> {
        let role = self.transport.role();
        info!(
            transport = T::KIND,
            %role,
            total_bytes = self.plan.total_bytes,
            chunk_size = self.plan.chunk_size,
            expected_cycles = self.plan.cycles(),
            "transfer started"
        );

        let outcome = loop {
            match self.step() {
                Ok(Phase::Finished) => break Ok(()),
                Ok(_) => {}
                Err(e) => break Err(e),
            }
        };
        self.transport.close();
        outcome?;

        if role == Role::Receiver && self.state.bytes_moved != self.plan.total_bytes {
            return Err(DriverError::Incomplete {
                expected: self.plan.total_bytes,
                received: self.state.bytes_moved,
            });
        }

        let record = self.recorder.finalize()?;
        let report = RunReport {
            transport: T::KIND,
            role,
            cycles: self.state.cycles,
            record,
        };
        report.log();
        Ok(report)
    }
}
