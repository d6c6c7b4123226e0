/// Where a driver is in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Transport not open yet.
    Idle,
    Transferring,
    /// End of stream sent or received.
    Finished,
}

/// What a run moves: `total_bytes` in cycles of at most `chunk_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    pub total_bytes: u64,
    pub chunk_size: usize,
}

impl TransferPlan {
    pub fn new(total_bytes: u64, chunk_size: usize) -> Self {
        Self {
            total_bytes,
            chunk_size,
        }
    }

    /// Payload length of the next send after `moved` bytes, or `None` once the
    /// target is reached. The last cycle carries the remainder.
    pub fn next_len(&self, moved: u64) -> Option<usize> {
        let left = self.total_bytes.checked_sub(moved).filter(|&n| n > 0)?;
        Some(left.min(self.chunk_size as u64) as usize)
    }

    pub fn cycles(&self) -> u64 {
        self.total_bytes.div_ceil(self.chunk_size.max(1) as u64)
    }
}

/// Progress of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferState {
    pub phase: Phase,
    pub bytes_moved: u64,
    pub cycles: u64,
}

impl Default for TransferState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            bytes_moved: 0,
            cycles: 0,
        }
    }
}

impl TransferState {
    pub fn advance(&mut self, bytes: usize) {
        self.bytes_moved += bytes as u64;
        self.cycles += 1;
    }
}
