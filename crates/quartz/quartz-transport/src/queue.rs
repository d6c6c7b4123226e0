//! Push/pull message queue over a WebSocket.
//!
//! The push side (sender) binds and accepts exactly one pull peer (receiver).
//! Each chunk is one binary message, so message boundaries are the frame
//! boundaries and the `DONE` sentinel is simply a 4-byte message.

use crate::error::TransportError;
use crate::net::{SocketEndpoint, connect_with_retry, reuse_listener};
use crate::{Cycle, Transport, require_role};
use quartz_chunk::{Chunk, Role, SENTINEL, is_sentinel};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use tungstenite::protocol::WebSocketConfig;
use tungstenite::{Message, WebSocket};

/// Bounds the wait for the peer's close frame during `close`.
const CLOSE_DRAIN: Duration = Duration::from_secs(1);

/// Headroom over the chunk size for WebSocket framing.
const FRAME_SLACK: usize = 64;

fn ws_config(chunk_size: usize) -> WebSocketConfig {
    let mut cfg = WebSocketConfig::default();
    cfg.max_message_size = Some(chunk_size + FRAME_SLACK);
    cfg.max_frame_size = Some(chunk_size + FRAME_SLACK);
    cfg
}

/// Bound push side waiting for its pull peer.
pub struct QueueListener {
    listener: TcpListener,
    chunk_size: usize,
}

impl QueueListener {
    pub fn bind(ep: &SocketEndpoint) -> Result<Self, TransportError> {
        Ok(Self {
            listener: reuse_listener(&ep.bind)?,
            chunk_size: ep.chunk_size,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Blocks until a pull peer connects and completes the WebSocket upgrade.
    pub fn accept(self) -> Result<QueueTransport, TransportError> {
        let (stream, peer) = self
            .listener
            .accept()
            .map_err(|e| TransportError::setup("accept queue peer", e))?;
        stream.set_nodelay(true)?;
        let ws = tungstenite::accept_with_config(stream, Some(ws_config(self.chunk_size)))
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        info!(%peer, "queue push side accepted pull peer");
        Ok(QueueTransport::new(ws, Role::Sender, self.chunk_size))
    }
}

pub struct QueueTransport {
    ws: Option<WebSocket<TcpStream>>,
    role: Role,
    chunk_size: usize,
    finished: bool,
}

impl QueueTransport {
    fn new(ws: WebSocket<TcpStream>, role: Role, chunk_size: usize) -> Self {
        Self {
            ws: Some(ws),
            role,
            chunk_size,
            finished: false,
        }
    }

    fn ws(&mut self) -> Result<&mut WebSocket<TcpStream>, TransportError> {
        self.ws.as_mut().ok_or(TransportError::Closed)
    }

    fn push(&mut self, payload: &[u8]) -> Result<Cycle, TransportError> {
        if payload.len() > self.chunk_size {
            return Err(TransportError::FrameTooLarge {
                len: payload.len(),
                capacity: self.chunk_size,
            });
        }
        let ws = self.ws()?;
        let start = Instant::now();
        ws.send(Message::binary(payload.to_vec()))?;
        let active = start.elapsed();
        trace!(bytes = payload.len(), "queue message pushed");
        Ok(Cycle {
            bytes: payload.len(),
            active,
        })
    }
}

impl Transport for QueueTransport {
    type Endpoint = SocketEndpoint;

    const KIND: &'static str = "queue";

    fn open_as_sender(ep: &SocketEndpoint) -> Result<Self, TransportError> {
        QueueListener::bind(ep)?.accept()
    }

    fn open_as_receiver(ep: &SocketEndpoint) -> Result<Self, TransportError> {
        let stream = connect_with_retry(ep)?;
        let url = format!("ws://{}/", ep.connect);
        let config = Some(ws_config(ep.chunk_size));
        let (ws, _) = tungstenite::client::client_with_config(url.as_str(), stream, config)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        info!(peer = %ep.connect, "queue pull side connected");
        Ok(Self::new(ws, Role::Receiver, ep.chunk_size))
    }

    fn role(&self) -> Role {
        self.role
    }

    fn send_chunk(&mut self, payload: &[u8]) -> Result<Cycle, TransportError> {
        require_role(self.role, Role::Sender, "send_chunk")?;
        if self.finished {
            return Err(TransportError::Closed);
        }
        self.push(payload)
    }

    fn recv_chunk(&mut self, into: &mut Chunk) -> Result<Option<Cycle>, TransportError> {
        require_role(self.role, Role::Receiver, "recv_chunk")?;
        if self.finished {
            return Ok(None);
        }
        let capacity = self.chunk_size.min(into.capacity());
        let ws = self.ws()?;

        loop {
            let start = Instant::now();
            let data = match ws.read() {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Close(_)) | Err(tungstenite::Error::ConnectionClosed) => {
                    info!("queue push side closed");
                    self.finished = true;
                    return Ok(None);
                }
                Ok(other) => {
                    debug!(kind = ?other, "ignoring non-binary queue message");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            if data.len() > capacity {
                return Err(TransportError::FrameTooLarge {
                    len: data.len(),
                    capacity,
                });
            }
            into.as_mut_slice()[..data.len()].copy_from_slice(&data);
            let active = start.elapsed();

            if is_sentinel(into.head(data.len())) {
                info!("queue receiver saw end of stream");
                self.finished = true;
                return Ok(None);
            }
            trace!(bytes = data.len(), "queue message pulled");
            return Ok(Some(Cycle {
                bytes: data.len(),
                active,
            }));
        }
    }

    fn finish(&mut self) -> Result<(), TransportError> {
        require_role(self.role, Role::Sender, "finish")?;
        if self.finished {
            return Ok(());
        }
        self.push(SENTINEL)?;
        self.finished = true;
        info!("queue sender sent end of stream");
        Ok(())
    }

    /// Starts the closing handshake and waits a bounded time for the peer to
    /// answer, so queued messages are not cut off.
    fn close(&mut self) {
        let Some(mut ws) = self.ws.take() else {
            return;
        };
        if let Err(e) = ws.get_ref().set_read_timeout(Some(CLOSE_DRAIN)) {
            warn!(error = %e, "could not bound queue close wait");
        }
        if ws.close(None).is_ok() {
            loop {
                match ws.read() {
                    Ok(_) => {}
                    Err(tungstenite::Error::ConnectionClosed) => break,
                    Err(e) => {
                        debug!(error = %e, "queue close ended without clean handshake");
                        break;
                    }
                }
            }
        }
        info!(role = %self.role, "queue closed");
    }

    fn is_closed(&self) -> bool {
        self.ws.is_none()
    }
}

impl Drop for QueueTransport {
    fn drop(&mut self) {
        self.close();
    }
}
