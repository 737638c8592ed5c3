// groupnet_protocol: wire protocol for the groupnet message relay.
//
// This crate defines the message types, framing, and serialization used by the
// relay (`groupnet_relay::server`) and peers (`groupnet_relay::client`) to
// communicate over TCP. It is shared between both sides and knows nothing
// about groups, registries or mailboxes.
//
// Module overview:
// - `types.rs`:    Addressing (`Destination`, including the broadcast token)
//                  and handshake rejection reasons.
// - `message.rs`:  Client-to-relay and relay-to-client message enums, plus
//                  the `MessageRecord` carried inside batches.
// - `framing.rs`:  Length-delimited framing: blocking helpers for
//                  `Read`/`Write` streams and a reassembly buffer for
//                  non-blocking sockets.
//
// Design decisions:
// - **JSON serialization.** Payloads are arbitrary JSON values, so structured
//   application data round-trips without a schema shared with the relay.
// - **No async runtime.** Framing works on `std::io` traits, compatible with
//   blocking streams, buffered wrappers and non-blocking sockets alike.

pub mod framing;
pub mod message;
pub mod types;

pub use framing::{
    FrameBuffer, MAX_MESSAGE_SIZE, encode_frame, encode_message, read_message, write_message,
};
pub use message::{ClientMessage, MessageRecord, ServerMessage};
pub use types::{Destination, RejectReason};

/// TCP port the relay listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 65042;

/// Bumped whenever the message vocabulary changes incompatibly.
pub const PROTOCOL_VERSION: u32 = 1;
