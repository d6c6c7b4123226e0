//! TCP plumbing shared by the stream and queue transports.

use crate::error::TransportError;
use std::io;
use std::mem::{size_of, zeroed};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const LISTEN_BACKLOG: libc::c_int = 1;

/// Where a socket-based transport listens and connects.
#[derive(Debug, Clone)]
pub struct SocketEndpoint {
    /// Listening side, e.g. `0.0.0.0:5000`. Port 0 picks a free port.
    pub bind: String,
    /// Connecting side, e.g. `127.0.0.1:5000`.
    pub connect: String,
    /// Largest payload a single frame or message may carry.
    pub chunk_size: usize,
    /// How long the connecting side keeps retrying.
    pub connect_timeout: Duration,
}

impl SocketEndpoint {
    pub fn new(bind: impl Into<String>, connect: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            bind: bind.into(),
            connect: connect.into(),
            chunk_size,
            connect_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Same endpoint, connecting to `addr` instead.
    pub fn connecting_to(&self, addr: SocketAddr) -> Self {
        Self {
            connect: addr.to_string(),
            ..self.clone()
        }
    }
}

fn resolve(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("'{addr}' resolves to no address"),
        )
    })
}

fn set_flag(fd: &OwnedFd, option: libc::c_int) -> io::Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            option,
            &on as *const libc::c_int as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: all-zero is a valid sockaddr_storage; the family-specific view
    // is written through a pointer into it.
    let mut storage: libc::sockaddr_storage = unsafe { zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(a.ip().octets());
            size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_flowinfo = a.flowinfo();
            sin6.sin6_addr.s6_addr = a.ip().octets();
            sin6.sin6_scope_id = a.scope_id();
            size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Listening socket with `SO_REUSEADDR` and, where the platform allows,
/// `SO_REUSEPORT`.
pub(crate) fn reuse_listener(bind: &str) -> Result<TcpListener, TransportError> {
    let what = || format!("listen on '{bind}'");
    let addr = resolve(bind).map_err(|e| TransportError::setup(what(), e))?;
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let raw = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if raw < 0 {
        return Err(TransportError::setup(what(), io::Error::last_os_error()));
    }
    // SAFETY: `raw` is a freshly created descriptor nobody else owns.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    set_flag(&fd, libc::SO_REUSEADDR).map_err(|e| TransportError::setup(what(), e))?;
    if let Err(e) = set_flag(&fd, libc::SO_REUSEPORT) {
        warn!(bind, error = %e, "SO_REUSEPORT unavailable");
    }

    let (storage, len) = sockaddr_of(&addr);
    let rc = unsafe {
        libc::bind(
            fd.as_raw_fd(),
            &storage as *const libc::sockaddr_storage as *const libc::sockaddr,
            len,
        )
    };
    if rc != 0 {
        return Err(TransportError::setup(what(), io::Error::last_os_error()));
    }
    if unsafe { libc::listen(fd.as_raw_fd(), LISTEN_BACKLOG) } != 0 {
        return Err(TransportError::setup(what(), io::Error::last_os_error()));
    }

    let listener = TcpListener::from(fd);
    info!(bind, local = ?listener.local_addr().ok(), "listening");
    Ok(listener)
}

/// Connects to `ep.connect`, retrying refused or unreachable attempts until
/// `ep.connect_timeout` elapses.
pub(crate) fn connect_with_retry(ep: &SocketEndpoint) -> Result<TcpStream, TransportError> {
    let deadline = Instant::now() + ep.connect_timeout;
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match TcpStream::connect(&ep.connect) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                info!(peer = %ep.connect, attempts, "connected");
                return Ok(stream);
            }
            Err(e) if is_retryable(&e) && Instant::now() < deadline => {
                debug!(peer = %ep.connect, error = %e, "peer not listening yet");
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) if is_retryable(&e) => {
                return Err(TransportError::PeerUnavailable {
                    endpoint: ep.connect.clone(),
                    waited: ep.connect_timeout,
                });
            }
            Err(e) => {
                return Err(TransportError::setup(format!("connect to '{}'", ep.connect), e));
            }
        }
    }
}

fn is_retryable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
    )
}
