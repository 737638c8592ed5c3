// Addressing types for the relay protocol.
//
// Peers are addressed by the name they hold inside their group. A record's
// destination is either one such name or the broadcast token
// (`Destination::All`), which the relay expands to every other member of the
// sender's group. Keeping the token as an enum variant rather than a magic
// string means no peer name can ever collide with it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a `MessageRecord` should be delivered.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Destination {
    /// Every other peer in the sender's group.
    All,
    /// The single peer holding this name in the sender's group.
    Peer(String),
}

impl Destination {
    /// Shorthand for `Destination::Peer(name.into())`.
    pub fn peer(name: impl Into<String>) -> Self {
        Self::Peer(name.into())
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::All)
    }
}

impl From<&str> for Destination {
    fn from(name: &str) -> Self {
        Self::Peer(name.to_owned())
    }
}

impl From<String> for Destination {
    fn from(name: String) -> Self {
        Self::Peer(name)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("<all>"),
            Self::Peer(name) => f.write_str(name),
        }
    }
}

/// Why the relay refused a handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The requested group is not one the relay was configured with.
    UnknownGroup,
    /// Another live connection already holds the requested name in the group.
    NameTaken,
    /// The client speaks a different protocol version.
    ProtocolMismatch,
    /// The relay could not find a free name to assign.
    NamesExhausted,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::UnknownGroup => "unknown group",
            Self::NameTaken => "name already taken",
            Self::ProtocolMismatch => "protocol version mismatch",
            Self::NamesExhausted => "no free name available",
        };
        f.write_str(text)
    }
}
