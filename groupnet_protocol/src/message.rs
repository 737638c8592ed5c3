// Protocol messages for client-relay communication.
//
// Two enums define the full protocol vocabulary:
// - `ClientMessage`: sent by peers to the relay.
// - `ServerMessage`: sent by the relay to peers.
//
// `MessageRecord` is the application-level unit carried in both directions
// inside `Batch` messages. Its payload is an opaque JSON value: the relay
// forwards it untouched, and only the receiving application gives it meaning.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{Destination, RejectReason};

/// Messages sent by a peer to the relay.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Join a group (handshake). An empty `name` asks the relay to assign one.
    Hello {
        protocol_version: u32,
        group: String,
        name: String,
    },
    /// Every record buffered since the previous flush.
    Batch { records: Vec<MessageRecord> },
    /// Keep-alive sent when the peer has nothing else to say.
    Heartbeat,
    /// Ask the relay for the current membership of our group.
    ListPeers,
    /// Peer is leaving gracefully.
    Goodbye,
}

/// Messages sent by the relay to a peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Handshake accepted. `name` is the name the peer now holds, which
    /// differs from the requested one only when the request was empty.
    Welcome { name: String, peers: Vec<String> },
    /// Handshake rejected; the relay closes the socket after sending this.
    Rejected { reason: RejectReason },
    /// Records forwarded from other peers of the same group.
    Batch { records: Vec<MessageRecord> },
    /// Current membership of the group (sent on every join and leave, and in
    /// answer to `ListPeers`).
    Peers { names: Vec<String> },
}

/// A single application message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub source: String,
    pub destination: Destination,
    pub title: String,
    pub payload: Value,
    /// Queued records accumulate at the receiver; non-queued ones overwrite.
    pub queue: bool,
}
