// Frame-driven peer client for the relay.
//
// `PeerClient` is built to be pumped from a game loop, once per frame:
//
//   client.send_msg("host", "controls", "up", false); // buffer only
//   client.process_send()?;                           // one batched write
//   client.process_recv()?;                           // drain + demultiplex
//   let v = client.get_msg("host", "state");          // mailbox read
//
// Only `process_send` and `process_recv` touch the network, and after the
// handshake the socket is non-blocking, so neither ever waits for data.
// Architecture:
// - `connect()` performs TCP connect + Hello handshake on the calling thread
//   with a timeout, then switches the socket to non-blocking mode.
// - Outbound: `send_msg` appends to `outbox`. `process_send` encodes the
//   outbox as one `Batch` frame onto `out_buf` and writes as much as the
//   socket accepts; the rest stays in `out_buf` for the next call.
// - Inbound: `process_recv` reads whatever is available into a
//   `FrameBuffer`, decodes complete frames, and files records into the
//   `Mailbox` (see `mailbox.rs`) and membership updates into the peer set.
//
// Any transport error or malformed frame is fatal: the client moves to
// `ClientState::Failed`, discards its mailbox and peer set, and refuses
// further pumping. There is no automatic reconnect; the caller builds a new
// client with `connect`.

use std::collections::BTreeSet;
use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use groupnet_protocol::PROTOCOL_VERSION;
use groupnet_protocol::framing::{FrameBuffer, encode_message, read_message, write_message};
use groupnet_protocol::message::{ClientMessage, MessageRecord, ServerMessage};
use groupnet_protocol::types::Destination;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::error::ClientError;
use crate::mailbox::Mailbox;

/// How long `connect` waits for the relay to answer the handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// `process_send` sends a heartbeat when nothing else went out for this long.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 16 * 1024;

/// Upper bound on bytes read by one `process_recv`, so a flood cannot stall
/// a frame.
const MAX_RECV_PER_CYCLE: usize = 4 * 1024 * 1024;

/// Connection state of a `PeerClient`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    Connected,
    /// A transport error or malformed frame ended the connection.
    Failed,
    /// `disconnect` was called.
    Closed,
}

/// Peer-side mailbox and network pump.
pub struct PeerClient {
    stream: TcpStream,
    name: String,
    group: String,
    state: ClientState,
    outbox: Vec<MessageRecord>,
    out_buf: Vec<u8>,
    inbound: FrameBuffer,
    mailbox: Mailbox,
    peers: BTreeSet<String>,
    last_sent: Instant,
}

impl PeerClient {
    /// Connect to a relay and join `group` as `name`. An empty `name` asks
    /// the relay to assign one; read it back with `name()`.
    pub fn connect(
        addr: impl ToSocketAddrs,
        name: &str,
        group: &str,
    ) -> Result<Self, ClientError> {
        Self::connect_with_timeout(addr, name, group, HANDSHAKE_TIMEOUT)
    }

    /// `connect` with an explicit timeout, applied both to establishing the
    /// TCP connection (per resolved address) and to the handshake reply.
    pub fn connect_with_timeout(
        addr: impl ToSocketAddrs,
        name: &str,
        group: &str,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let mut stream = open_stream(addr, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;

        let hello = ClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            group: group.into(),
            name: name.into(),
        };
        write_message(&mut stream, &serde_json::to_vec(&hello)?)?;

        // Read straight from the socket so no bytes past the response get
        // buffered and lost.
        let bytes = read_message(&mut stream).map_err(ClientError::from_read)?;
        let response: ServerMessage = serde_json::from_slice(&bytes)?;
        let (assigned, peers) = match response {
            ServerMessage::Welcome { name, peers } => (name, peers),
            ServerMessage::Rejected { reason } => return Err(ClientError::Rejected(reason)),
            other => return Err(ClientError::UnexpectedResponse(format!("{other:?}"))),
        };

        stream.set_read_timeout(None)?;
        stream.set_nonblocking(true)?;
        debug!(group, name = %assigned, "connected to relay");

        Ok(Self {
            stream,
            name: assigned,
            group: group.into(),
            state: ClientState::Connected,
            outbox: Vec::new(),
            out_buf: Vec::new(),
            inbound: FrameBuffer::new(),
            mailbox: Mailbox::new(),
            peers: peers.into_iter().collect(),
            last_sent: Instant::now(),
        })
    }

    /// The name this peer holds in its group.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    /// Buffer a record for `destination` (a peer name or `Destination::All`).
    /// Nothing touches the network until `process_send`. Records buffered
    /// after the connection failed are discarded.
    pub fn send_msg(
        &mut self,
        destination: impl Into<Destination>,
        title: &str,
        payload: impl Into<Value>,
        queue: bool,
    ) {
        if !self.is_connected() {
            return;
        }
        self.outbox.push(MessageRecord {
            source: self.name.clone(),
            destination: destination.into(),
            title: title.into(),
            payload: payload.into(),
            queue,
        });
    }

    /// `send_msg` for any serializable value.
    pub fn send_value<T: Serialize>(
        &mut self,
        destination: impl Into<Destination>,
        title: &str,
        value: &T,
        queue: bool,
    ) -> Result<(), serde_json::Error> {
        let payload = serde_json::to_value(value)?;
        self.send_msg(destination, title, payload, queue);
        Ok(())
    }

    /// Ask the relay for a fresh member list; the answer updates the peer set
    /// during a later `process_recv`.
    pub fn request_peers(&mut self) {
        if self.is_connected() {
            self.queue_control(&ClientMessage::ListPeers);
        }
    }

    /// Flush buffered records as a single batch. Cheap when nothing is
    /// pending. Bytes the socket does not take now are retried next call.
    pub fn process_send(&mut self) -> Result<(), ClientError> {
        self.ensure_connected()?;

        if !self.outbox.is_empty() {
            let batch = ClientMessage::Batch {
                records: std::mem::take(&mut self.outbox),
            };
            match encode_message(&batch) {
                Ok(frame) => self.out_buf.extend_from_slice(&frame),
                Err(e) => return Err(self.fail(e)),
            }
        } else if self.out_buf.is_empty() && self.last_sent.elapsed() >= HEARTBEAT_INTERVAL {
            self.queue_control(&ClientMessage::Heartbeat);
        }

        self.flush_out_buf()
    }

    /// Drain whatever the socket has, decode complete frames, and update the
    /// mailbox and peer set. Transient slots are emptied first, so they only
    /// hold values that arrived during this call.
    pub fn process_recv(&mut self) -> Result<(), ClientError> {
        self.mailbox.begin_cycle();
        self.ensure_connected()?;

        let mut closed = None;
        let mut chunk = [0u8; READ_CHUNK];
        let mut received = 0;
        while received < MAX_RECV_PER_CYCLE {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    closed = Some(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        "relay closed the connection",
                    ));
                    break;
                }
                Ok(n) => {
                    self.inbound.extend(&chunk[..n]);
                    received += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    closed = Some(e);
                    break;
                }
            }
        }

        // A closed connection discards everything, decoded or not.
        if let Some(e) = closed {
            return Err(self.fail(e));
        }

        loop {
            let frame = match self.inbound.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    self.fail_quietly("oversized frame from relay");
                    return Err(ClientError::from_read(e));
                }
            };
            match serde_json::from_slice::<ServerMessage>(&frame) {
                Ok(msg) => self.apply(msg),
                Err(e) => {
                    self.fail_quietly("malformed frame from relay");
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Read the value for (`source`, `title`). Queued values are consumed
    /// oldest first; a transient value stays readable for the rest of the
    /// receive cycle.
    pub fn get_msg(&mut self, source: &str, title: &str) -> Option<Value> {
        self.mailbox.take(source, title)
    }

    /// `get_msg` without consuming anything.
    pub fn peek_msg(&self, source: &str, title: &str) -> Option<&Value> {
        self.mailbox.peek(source, title)
    }

    /// Everything readable for the key: the queued backlog (consumed) and the
    /// current transient value.
    pub fn get_all_msgs(&mut self, source: &str, title: &str) -> Vec<Value> {
        self.mailbox.take_all(source, title)
    }

    /// `get_msg` deserialized into `T`.
    pub fn get_value<T: DeserializeOwned>(
        &mut self,
        source: &str,
        title: &str,
    ) -> Result<Option<T>, serde_json::Error> {
        self.get_msg(source, title)
            .map(serde_json::from_value)
            .transpose()
    }

    /// How many values `get_msg` can currently return for the key.
    pub fn available(&self, source: &str, title: &str) -> usize {
        self.mailbox.available(source, title)
    }

    /// Names present in this peer's group (including this peer), as last
    /// reported by the relay.
    pub fn get_peers(&self) -> &BTreeSet<String> {
        &self.peers
    }

    /// Say goodbye and close the socket. Anything still unsent that does not
    /// fit into the socket right now is dropped, as are the mailbox and the
    /// peer set.
    pub fn disconnect(&mut self) {
        if !self.is_connected() {
            return;
        }
        self.queue_control(&ClientMessage::Goodbye);
        let _ = self.flush_out_buf();
        self.close(ClientState::Closed);
        debug!(group = %self.group, name = %self.name, "disconnected from relay");
    }

    fn apply(&mut self, msg: ServerMessage) {
        match msg {
            ServerMessage::Batch { records } => {
                trace!(count = records.len(), "received batch");
                for record in records {
                    self.mailbox.deliver(record);
                }
            }
            ServerMessage::Peers { names } => {
                self.peers = names.into_iter().collect();
            }
            ServerMessage::Welcome { .. } | ServerMessage::Rejected { .. } => {
                debug!("ignoring handshake message after handshake");
            }
        }
    }

    fn queue_control(&mut self, msg: &ClientMessage) {
        match encode_message(msg) {
            Ok(frame) => self.out_buf.extend_from_slice(&frame),
            Err(e) => warn!(error = %e, "failed to encode control message"),
        }
    }

    fn flush_out_buf(&mut self) -> Result<(), ClientError> {
        while !self.out_buf.is_empty() {
            match self.stream.write(&self.out_buf) {
                Ok(0) => return Err(self.fail(ErrorKind::WriteZero.into())),
                Ok(n) => {
                    self.out_buf.drain(..n);
                    self.last_sent = Instant::now();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(self.fail(e)),
            }
        }
        Ok(())
    }

    fn ensure_connected(&self) -> Result<(), ClientError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    /// Mark the connection failed and wrap the cause.
    fn fail(&mut self, e: io::Error) -> ClientError {
        self.fail_quietly(&e.to_string());
        ClientError::Transport(e)
    }

    fn fail_quietly(&mut self, reason: &str) {
        warn!(group = %self.group, name = %self.name, reason, "relay connection failed");
        self.close(ClientState::Failed);
    }

    /// Shut the socket and drop all per-connection state.
    fn close(&mut self, state: ClientState) {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.state = state;
        self.outbox.clear();
        self.out_buf.clear();
        self.inbound.clear();
        self.mailbox.clear();
        self.peers.clear();
    }
}

/// `TcpStream::connect_timeout` over every address `addr` resolves to,
/// returning the first that answers.
fn open_stream(addr: impl ToSocketAddrs, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(ErrorKind::InvalidInput, "address resolved to nothing")
    }))
}
