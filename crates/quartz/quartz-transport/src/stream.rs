//! Length-prefixed frames over one TCP connection.
//!
//! Frame: `u64` little-endian payload length, then the payload. The receiver
//! listens; the sender connects.

use crate::error::TransportError;
use crate::net::{SocketEndpoint, connect_with_retry, reuse_listener};
use crate::{Cycle, Transport, require_role};
use quartz_chunk::{Chunk, Role, SENTINEL, is_sentinel};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::time::Instant;
use tracing::{info, trace};

const LEN_PREFIX: usize = size_of::<u64>();

/// Bound, not yet connected, receiving side. Splitting bind from accept lets a
/// caller learn the port before the sender starts.
pub struct StreamListener {
    listener: TcpListener,
    chunk_size: usize,
}

impl StreamListener {
    pub fn bind(ep: &SocketEndpoint) -> Result<Self, TransportError> {
        Ok(Self {
            listener: reuse_listener(&ep.bind)?,
            chunk_size: ep.chunk_size,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Blocks until the sender connects.
    pub fn accept(self) -> Result<StreamTransport, TransportError> {
        let (stream, peer) = self
            .listener
            .accept()
            .map_err(|e| TransportError::setup("accept stream peer", e))?;
        stream.set_nodelay(true)?;
        info!(%peer, "stream receiver accepted sender");
        Ok(StreamTransport::new(stream, Role::Receiver, self.chunk_size))
    }
}

pub struct StreamTransport {
    stream: Option<TcpStream>,
    role: Role,
    chunk_size: usize,
    finished: bool,
}

impl StreamTransport {
    fn new(stream: TcpStream, role: Role, chunk_size: usize) -> Self {
        Self {
            stream: Some(stream),
            role,
            chunk_size,
            finished: false,
        }
    }

    fn stream(&mut self) -> Result<&mut TcpStream, TransportError> {
        self.stream.as_mut().ok_or(TransportError::Closed)
    }

    fn write_frame(&mut self, payload: &[u8]) -> Result<Cycle, TransportError> {
        if payload.len() > self.chunk_size {
            return Err(TransportError::FrameTooLarge {
                len: payload.len(),
                capacity: self.chunk_size,
            });
        }
        let stream = self.stream()?;
        let start = Instant::now();
        stream.write_all(&(payload.len() as u64).to_le_bytes())?;
        stream.write_all(payload)?;
        let active = start.elapsed();
        trace!(bytes = payload.len(), "stream frame sent");
        Ok(Cycle {
            bytes: payload.len(),
            active,
        })
    }
}

/// Reads a frame header. `None` on a clean close before its first byte.
fn read_len(stream: &mut TcpStream) -> Result<Option<u64>, TransportError> {
    let mut prefix = [0u8; LEN_PREFIX];
    let mut filled = 0;
    while filled < LEN_PREFIX {
        match stream.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside a frame header",
                )
                .into());
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Some(u64::from_le_bytes(prefix)))
}

impl Transport for StreamTransport {
    type Endpoint = SocketEndpoint;

    const KIND: &'static str = "stream";

    fn open_as_sender(ep: &SocketEndpoint) -> Result<Self, TransportError> {
        let stream = connect_with_retry(ep)?;
        Ok(Self::new(stream, Role::Sender, ep.chunk_size))
    }

    fn open_as_receiver(ep: &SocketEndpoint) -> Result<Self, TransportError> {
        StreamListener::bind(ep)?.accept()
    }

    fn role(&self) -> Role {
        self.role
    }

    fn send_chunk(&mut self, payload: &[u8]) -> Result<Cycle, TransportError> {
        require_role(self.role, Role::Sender, "send_chunk")?;
        if self.finished {
            return Err(TransportError::Closed);
        }
        self.write_frame(payload)
    }

    fn recv_chunk(&mut self, into: &mut Chunk) -> Result<Option<Cycle>, TransportError> {
        require_role(self.role, Role::Receiver, "recv_chunk")?;
        if self.finished {
            return Ok(None);
        }
        let capacity = self.chunk_size.min(into.capacity());
        let stream = self.stream()?;

        let Some(len) = read_len(stream)? else {
            info!("stream sender closed the connection");
            self.finished = true;
            return Ok(None);
        };
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        if len > capacity {
            return Err(TransportError::FrameTooLarge { len, capacity });
        }

        let start = Instant::now();
        stream.read_exact(&mut into.as_mut_slice()[..len])?;
        let active = start.elapsed();

        if is_sentinel(into.head(len)) {
            info!("stream receiver saw end of stream");
            self.finished = true;
            return Ok(None);
        }
        trace!(bytes = len, "stream frame received");
        Ok(Some(Cycle { bytes: len, active }))
    }

    fn finish(&mut self) -> Result<(), TransportError> {
        require_role(self.role, Role::Sender, "finish")?;
        if self.finished {
            return Ok(());
        }
        self.write_frame(SENTINEL)?;
        self.stream()?.flush()?;
        self.finished = true;
        info!("stream sender sent end of stream");
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            // The peer may already be gone.
            let _ = stream.shutdown(Shutdown::Both);
            info!(role = %self.role, "stream closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.close();
    }
}
