use quartz_chunk::Role;
use std::io;
use std::time::Duration;

/// Everything a transport can fail with.
///
/// Setup failures happen before the first byte moves (names taken, permission
/// denied, bind or connect failure, incompatible region). Everything else is a
/// transfer failure. Neither kind is retried.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to {what}")]
    Setup {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("shared region '{region}' is incompatible: {reason}")]
    Incompatible { region: String, reason: String },

    #[error("peer at '{endpoint}' did not appear within {waited:?}")]
    PeerUnavailable { endpoint: String, waited: Duration },

    #[error("handshake with peer failed: {0}")]
    Handshake(String),

    #[error("transfer failed")]
    Io(#[from] io::Error),

    #[error("message transfer failed")]
    Message(#[source] Box<tungstenite::Error>),

    #[error("timed out after {after:?} waiting on {semaphore}")]
    Timeout {
        semaphore: &'static str,
        after: Duration,
    },

    #[error("payload of {len} bytes exceeds chunk capacity of {capacity} bytes")]
    FrameTooLarge { len: usize, capacity: usize },

    #[error("{op} is not available on the {role} side")]
    WrongRole { op: &'static str, role: Role },

    #[error("transport is closed")]
    Closed,
}

impl TransportError {
    pub(crate) fn setup(what: impl Into<String>, source: io::Error) -> Self {
        TransportError::Setup {
            what: what.into(),
            source,
        }
    }

    /// True for failures that happen before any transfer begins.
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            TransportError::Setup { .. }
                | TransportError::Incompatible { .. }
                | TransportError::PeerUnavailable { .. }
                | TransportError::Handshake(_)
        )
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(e: tungstenite::Error) -> Self {
        TransportError::Message(Box::new(e))
    }
}
