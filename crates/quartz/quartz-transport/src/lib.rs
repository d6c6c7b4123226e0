//! Interchangeable bulk-transfer transports between two processes.
//!
//! Every transport moves one chunk per cycle and ends the stream with the
//! 4-byte `DONE` sentinel sent through the same channel as the data:
//!
//! - [`HandshakeTransport`]: one shared slot guarded by three embedded
//!   semaphores (mutual exclusion plus a two-way rendezvous).
//! - [`RingSlotTransport`]: one shared slot as a capacity-1 bounded buffer with
//!   two named semaphores.
//! - [`StreamTransport`]: length-prefixed frames over a TCP connection.
//! - [`QueueTransport`]: push/pull binary messages over a WebSocket.

mod error;
mod handshake;
mod net;
mod queue;
mod ring_slot;
mod shm_layout;
mod shm_region;
mod stream;

pub use error::TransportError;
pub use handshake::HandshakeTransport;
pub use net::SocketEndpoint;
pub use queue::{QueueListener, QueueTransport};
pub use ring_slot::RingSlotTransport;
pub use shm_layout::{Protocol, REGION_MAGIC, REGION_VERSION, RegionLayout};
pub use shm_region::ShmEndpoint;
pub use stream::{StreamListener, StreamTransport};

use quartz_chunk::{Chunk, Role};
use std::time::Duration;

/// One completed transfer cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cycle {
    /// Payload bytes moved.
    pub bytes: usize,
    /// Time spent moving them, excluding synchronisation waits where the
    /// transport can tell the two apart.
    pub active: Duration,
}

/// The contract every transport fulfils.
///
/// A transport is opened for one role and stays in it: `send_chunk` and
/// `finish` are sender-only, `recv_chunk` is receiver-only.
pub trait Transport: Sized {
    /// Rendezvous description both peers are configured with.
    type Endpoint;

    /// Short lowercase name used in logs and file names.
    const KIND: &'static str;

    fn open_as_sender(endpoint: &Self::Endpoint) -> Result<Self, TransportError>;

    fn open_as_receiver(endpoint: &Self::Endpoint) -> Result<Self, TransportError>;

    fn role(&self) -> Role;

    /// Moves one payload of at most the configured chunk size.
    fn send_chunk(&mut self, payload: &[u8]) -> Result<Cycle, TransportError>;

    /// Receives one payload into `into`. Returns `None` once the sender's
    /// end-of-stream sentinel arrives; the sentinel itself is never returned as
    /// data.
    fn recv_chunk(&mut self, into: &mut Chunk) -> Result<Option<Cycle>, TransportError>;

    /// Sends the end-of-stream sentinel. Calling it again does nothing.
    fn finish(&mut self) -> Result<(), TransportError>;

    /// Releases OS resources. The owning side also removes names it created.
    /// Calling it again does nothing.
    fn close(&mut self);

    fn is_closed(&self) -> bool;
}

pub(crate) fn require_role(
    actual: Role,
    expected: Role,
    op: &'static str,
) -> Result<(), TransportError> {
    if actual == expected {
        Ok(())
    } else {
        Err(TransportError::WrongRole { op, role: actual })
    }
}
