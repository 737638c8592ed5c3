// Relay-side handler for one accepted socket.
//
// Each accepted connection runs on its own thread and walks a fixed state
// machine:
//
//   Accepted -> AwaitingHandshake -> Active -> Closed
//
// - **AwaitingHandshake**: the first frame must be `Hello`, read under
//   `handshake_timeout`. A version mismatch or a registry refusal is answered
//   with `Rejected` and the socket is closed. Nothing else is accepted first.
// - **Active**: the handler owns the read half. Each `Batch` goes straight to
//   `Registry::dispatch`. Writes happen on a companion writer thread that
//   drains this connection's bounded outbound queue, so a slow socket only
//   blocks its own writer.
// - **Closed**: reached on `Goodbye`, EOF, read error, idle timeout or a
//   malformed frame. The `Registration` guard unregisters the name exactly
//   once, whichever way the handler exits.

use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use groupnet_protocol::PROTOCOL_VERSION;
use groupnet_protocol::framing::{encode_message, read_message};
use groupnet_protocol::message::{ClientMessage, ServerMessage};
use groupnet_protocol::types::RejectReason;
use tracing::{debug, info, trace, warn};

use crate::error::ConnectionError;
use crate::registry::{ConnectionId, Frame, PeerLink, Registry};

/// Smallest outbound queue a connection gets; `Welcome` and the first
/// `Peers` update must both fit before the writer thread starts.
const MIN_OUTBOUND_QUEUE: usize = 4;

/// Lifecycle of a relay-side connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    AwaitingHandshake,
    Active,
    Closed,
}

/// Per-connection timeouts and queue bounds, copied out of `RelayConfig`.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionLimits {
    pub handshake_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub outbound_queue_limit: usize,
}

/// Holds a name in the registry and gives it back when dropped.
struct Registration {
    registry: Arc<Registry>,
    group: String,
    name: String,
    id: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.group, &self.name, self.id);
    }
}

pub(crate) struct Connection {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    stream: TcpStream,
    state: ConnectionState,
    registry: Arc<Registry>,
    limits: ConnectionLimits,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        stream: TcpStream,
        registry: Arc<Registry>,
        limits: ConnectionLimits,
    ) -> Self {
        Self {
            id,
            peer_addr: stream.peer_addr().ok(),
            stream,
            state: ConnectionState::Accepted,
            registry,
            limits,
        }
    }

    /// Serve the connection until it closes. Never panics on peer
    /// misbehavior; every failure ends only this connection.
    pub(crate) fn run(mut self) -> ConnectionState {
        let addr = self.peer_addr;
        match self.serve() {
            Ok(()) => info!(connection = self.id, ?addr, "peer said goodbye"),
            Err(ConnectionError::Transport(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                info!(connection = self.id, ?addr, "peer closed connection");
            }
            Err(ConnectionError::Transport(e))
                if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                if self.state == ConnectionState::AwaitingHandshake {
                    info!(connection = self.id, ?addr, "no hello before handshake timeout, closing");
                } else {
                    info!(connection = self.id, ?addr, "peer idle too long, closing");
                }
            }
            Err(ConnectionError::Rejected(reason)) => {
                info!(connection = self.id, ?addr, %reason, "handshake rejected");
            }
            Err(e) => warn!(connection = self.id, ?addr, error = %e, "closing connection"),
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        self.transition(ConnectionState::Closed);
        self.state
    }

    fn transition(&mut self, next: ConnectionState) {
        trace!(connection = self.id, from = ?self.state, to = ?next, "connection state");
        self.state = next;
    }

    fn serve(&mut self) -> Result<(), ConnectionError> {
        self.transition(ConnectionState::AwaitingHandshake);
        let (registration, outbound) = self.handshake()?;
        self.transition(ConnectionState::Active);

        let writer = spawn_writer(self.id, self.stream.try_clone()?, outbound)?;
        let result = self.read_loop(&registration);

        // Unregistering drops the registry's sender, which ends the writer.
        drop(registration);
        let _ = self.stream.shutdown(Shutdown::Both);
        let _ = writer.join();
        result
    }

    /// Read `Hello`, claim a name, and return the registration together with
    /// the receiving end of this connection's outbound queue.
    fn handshake(&mut self) -> Result<(Registration, Receiver<Frame>), ConnectionError> {
        self.stream
            .set_read_timeout(Some(self.limits.handshake_timeout))?;
        let bytes = read_message(&mut self.stream).map_err(ConnectionError::from_read)?;
        let ClientMessage::Hello {
            protocol_version,
            group,
            name,
        } = serde_json::from_slice::<ClientMessage>(&bytes)?
        else {
            return Err(ConnectionError::HandshakeRequired);
        };

        if protocol_version != PROTOCOL_VERSION {
            return Err(self.reject(RejectReason::ProtocolMismatch));
        }

        let capacity = self.limits.outbound_queue_limit.max(MIN_OUTBOUND_QUEUE);
        let (tx, rx) = mpsc::sync_channel(capacity);
        let link = PeerLink::new(self.id, tx, self.stream.try_clone().ok());
        match self.registry.register(&group, &name, link) {
            Ok(assigned) => {
                debug!(connection = self.id, group = %group, requested = %name, assigned = %assigned, "handshake complete");
                let registration = Registration {
                    registry: Arc::clone(&self.registry),
                    group,
                    name: assigned,
                    id: self.id,
                };
                Ok((registration, rx))
            }
            Err(reason) => Err(self.reject(reason)),
        }
    }

    /// Best-effort `Rejected` reply; the caller closes the socket afterwards.
    fn reject(&mut self, reason: RejectReason) -> ConnectionError {
        if let Ok(frame) = encode_message(&ServerMessage::Rejected { reason }) {
            let _ = self.stream.write_all(&frame);
            let _ = self.stream.flush();
        }
        ConnectionError::Rejected(reason)
    }

    fn read_loop(&self, registration: &Registration) -> Result<(), ConnectionError> {
        self.stream.set_read_timeout(self.limits.idle_timeout)?;
        let mut reader = BufReader::new(self.stream.try_clone()?);
        loop {
            let bytes = read_message(&mut reader).map_err(ConnectionError::from_read)?;
            match serde_json::from_slice::<ClientMessage>(&bytes)? {
                ClientMessage::Batch { records } => {
                    self.registry
                        .dispatch(&registration.group, &registration.name, records);
                }
                ClientMessage::Heartbeat => {}
                ClientMessage::ListPeers => {
                    self.registry
                        .send_peer_list(&registration.group, &registration.name);
                }
                ClientMessage::Goodbye => return Ok(()),
                ClientMessage::Hello { .. } => return Err(ConnectionError::HandshakeRequired),
            }
        }
    }
}

fn spawn_writer(
    id: ConnectionId,
    stream: TcpStream,
    outbound: Receiver<Frame>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("relay-writer-{id}"))
        .spawn(move || writer_loop(stream, outbound))
}

/// Write queued frames until the queue's sender is dropped or the socket
/// fails. Frames already queued are coalesced into one flush.
fn writer_loop(stream: TcpStream, outbound: Receiver<Frame>) {
    let mut writer = BufWriter::new(stream);
    while let Ok(frame) = outbound.recv() {
        let mut result = writer.write_all(&frame);
        while result.is_ok() {
            match outbound.try_recv() {
                Ok(frame) => result = writer.write_all(&frame),
                Err(_) => break,
            }
        }
        if result.and_then(|()| writer.flush()).is_err() {
            // Wake the reader so the handler notices and unregisters.
            let _ = writer.get_ref().shutdown(Shutdown::Both);
            break;
        }
    }
}
