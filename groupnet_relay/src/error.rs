// Error taxonomy for both halves of the relay.
//
// `ClientError` is what a peer sees from `PeerClient::connect` and the two
// pump calls. `ConnectionError` is internal to the relay: it explains why a
// connection handler closed and is only ever logged, because one
// connection's failure never reaches the server as a whole.

use std::io;

use groupnet_protocol::RejectReason;
use thiserror::Error;

/// Errors surfaced to the peer-side caller.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The relay refused the handshake. Retry with different parameters.
    #[error("handshake rejected: {0}")]
    Rejected(RejectReason),
    /// Read/write failure or the relay closed the socket.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    /// The relay sent bytes that do not decode as a protocol message, or a
    /// length prefix over `MAX_MESSAGE_SIZE`.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// The relay answered the handshake with something other than
    /// `Welcome` or `Rejected`.
    #[error("unexpected handshake response: {0}")]
    UnexpectedResponse(String),
    /// The connection already failed or was closed; call `connect` again.
    #[error("not connected")]
    NotConnected,
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedFrame(e.to_string())
    }
}

impl ClientError {
    /// Classify a failed frame read: `InvalidData` means the bytes were
    /// unusable, anything else is the socket.
    pub(crate) fn from_read(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::InvalidData {
            Self::MalformedFrame(e.to_string())
        } else {
            Self::Transport(e)
        }
    }

    /// The rejection reason, if the relay refused the handshake.
    pub fn rejection(&self) -> Option<RejectReason> {
        match self {
            Self::Rejected(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Reasons a relay-side connection handler stops.
#[derive(Debug, Error)]
pub(crate) enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("expected Hello as first message")]
    HandshakeRequired,
    #[error("handshake rejected: {0}")]
    Rejected(RejectReason),
}

impl From<serde_json::Error> for ConnectionError {
    fn from(e: serde_json::Error) -> Self {
        Self::MalformedFrame(e.to_string())
    }
}

impl ConnectionError {
    /// Same split as `ClientError::from_read`.
    pub(crate) fn from_read(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::InvalidData {
            Self::MalformedFrame(e.to_string())
        } else {
            Self::Transport(e)
        }
    }
}
