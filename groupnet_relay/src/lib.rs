// groupnet_relay: group message relay and frame-driven peer client.
//
// The relay is a thin message broker: it accepts TCP connections from game
// peers, places each in a named group under a unique name, and forwards
// batches of application records between peers of the same group. It never
// looks inside payloads; all game logic stays on the peers.
//
// Module overview:
// - `registry.rs`:   Shared group -> name -> connection map. Name claiming,
//                    random name assignment, membership pushes, dispatch.
// - `names.rs`:      Candidate names for peers that do not pick their own.
// - `connection.rs`: Per-socket handler: handshake, read loop, writer thread,
//                    exactly-once unregistration.
// - `server.rs`:     TCP listener, `RelayConfig`, `RelayHandle`.
// - `client.rs`:     `PeerClient`, the non-blocking pump a game calls once per
//                    frame (`process_send` / `process_recv`).
// - `mailbox.rs`:    Transient and queued mailbox slots behind `get_msg`.
// - `config.rs`:     Group and name list files.
// - `error.rs`:      `ClientError` and the relay's internal `ConnectionError`.
//
// Dependencies: `groupnet_protocol` (shared message types and framing).
//
// The relay can run as a standalone binary (`main.rs`) or be embedded in a
// game process via the library API (`start_relay`), for instance when the
// host machine also plays.

pub mod client;
pub mod config;
pub mod connection;
mod error;
pub mod mailbox;
pub mod names;
pub mod registry;
pub mod server;

pub use client::{ClientState, PeerClient};
pub use error::ClientError;
pub use server::{RelayConfig, RelayHandle, start_relay};
