// Group registry and message dispatcher for the relay.
//
// `Registry` is the one structure shared by every connection thread. It maps
// group name -> peer name -> `PeerLink`, where a `PeerLink` is the relay's
// handle to one connection's outbound queue. Groups are fixed when the relay
// starts; only their membership changes.
//
// Locking discipline: all state sits behind a single `Mutex`, and every public
// method takes it exactly once for its whole duration. That makes register,
// unregister, dispatch and peer listing atomic with respect to one another,
// so name uniqueness can be checked and claimed in one step and a dispatch
// never sees a half-updated group.
//
// Dispatch never writes to a socket. It serializes one `ServerMessage::Batch`
// per destination and hands it to that destination's bounded queue with
// `try_send`; the connection's own writer thread does the blocking write. A
// destination whose queue is full gets its socket shut down (its handler
// then unregisters it), so a stalled peer only ever hurts itself.
//
// Membership pushes: every successful register and every unregister sends a
// fresh `ServerMessage::Peers` to all members of the affected group, which is
// how peers keep their peer sets current.

use std::collections::BTreeMap;
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use groupnet_protocol::framing::encode_message;
use groupnet_protocol::message::{MessageRecord, ServerMessage};
use groupnet_protocol::types::{Destination, RejectReason};
use tracing::{debug, info, trace, warn};

use crate::names::NameGenerator;

/// Relay-assigned identifier for one accepted socket.
pub type ConnectionId = u64;

/// An encoded, length-prefixed frame ready for a connection's writer.
pub type Frame = Arc<[u8]>;

type Members = BTreeMap<String, PeerLink>;

/// The registry's handle to one live connection.
pub struct PeerLink {
    id: ConnectionId,
    outbound: SyncSender<Frame>,
    socket: Option<TcpStream>,
}

impl PeerLink {
    /// `socket` is used only to shut the connection down when its outbound
    /// queue overflows.
    pub fn new(id: ConnectionId, outbound: SyncSender<Frame>, socket: Option<TcpStream>) -> Self {
        Self {
            id,
            outbound,
            socket,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame without blocking. Returns false if the frame was not
    /// queued.
    fn push(&self, frame: Frame) -> bool {
        match self.outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(connection = self.id, "outbound queue full, closing slow peer");
                self.close();
                false
            }
            // Writer thread already gone; the handler will unregister us.
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    fn close(&self) {
        if let Some(socket) = &self.socket {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }
}

/// Shared name registry and dispatcher for all groups.
pub struct Registry {
    groups: Mutex<BTreeMap<String, Members>>,
    names: NameGenerator,
}

impl Registry {
    /// Create a registry recognizing exactly `groups`.
    pub fn new(groups: impl IntoIterator<Item = String>, names: NameGenerator) -> Self {
        let groups = groups
            .into_iter()
            .map(|group| (group, Members::new()))
            .collect();
        Self {
            groups: Mutex::new(groups),
            names,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Members>> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Names of all recognized groups.
    pub fn group_names(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Claim a name in `group` for `link`. An empty `requested_name` gets a
    /// generated one. On success the link has already been sent its
    /// `Welcome`, and every member (the new one included) a `Peers` update.
    pub fn register(
        &self,
        group: &str,
        requested_name: &str,
        link: PeerLink,
    ) -> Result<String, RejectReason> {
        let mut groups = self.lock();
        let members = groups.get_mut(group).ok_or(RejectReason::UnknownGroup)?;

        let name = if requested_name.is_empty() {
            self.names
                .pick(|candidate| members.contains_key(candidate))
                .ok_or(RejectReason::NamesExhausted)?
        } else if members.contains_key(requested_name) {
            return Err(RejectReason::NameTaken);
        } else {
            requested_name.to_owned()
        };

        info!(group, peer = %name, connection = link.id, "peer registered");
        members.insert(name.clone(), link);

        let welcome = ServerMessage::Welcome {
            name: name.clone(),
            peers: member_names(members, None),
        };
        if let (Some(link), Some(frame)) = (members.get(&name), encode(&welcome)) {
            link.push(frame);
        }
        push_peer_list(members);
        Ok(name)
    }

    /// Release `name` in `group` if it is still held by connection `id`.
    /// Returns whether anything was removed; calling it again is harmless.
    pub fn unregister(&self, group: &str, name: &str, id: ConnectionId) -> bool {
        let mut groups = self.lock();
        let Some(members) = groups.get_mut(group) else {
            return false;
        };
        if members.get(name).is_none_or(|link| link.id != id) {
            return false;
        }
        members.remove(name);
        info!(group, peer = name, connection = id, "peer unregistered");
        push_peer_list(members);
        true
    }

    /// Route a batch of records sent by `source` in `group`.
    ///
    /// The relay stamps `source` onto every record, so a peer cannot speak
    /// for another. Broadcast records go to every other member; addressed
    /// records go to the named member if present and are otherwise dropped.
    pub fn dispatch(&self, group: &str, source: &str, records: Vec<MessageRecord>) {
        let groups = self.lock();
        let Some(members) = groups.get(group) else {
            return;
        };

        let mut outgoing: BTreeMap<&str, Vec<MessageRecord>> = BTreeMap::new();
        for mut record in records {
            if record.source != source {
                debug!(group, source, claimed = %record.source, "correcting forged source");
                record.source = source.to_owned();
            }
            let targets: Vec<&str> = match &record.destination {
                Destination::All => members
                    .keys()
                    .map(String::as_str)
                    .filter(|name| *name != source)
                    .collect(),
                Destination::Peer(name) => members
                    .get_key_value(name.as_str())
                    .map(|(key, _)| key.as_str())
                    .into_iter()
                    .collect(),
            };
            if targets.is_empty() {
                trace!(group, source, destination = %record.destination, "no recipient, dropping record");
            }
            for target in targets {
                outgoing.entry(target).or_default().push(record.clone());
            }
        }

        for (target, records) in outgoing {
            let Some(link) = members.get(target) else {
                continue;
            };
            trace!(group, source, recipient = target, count = records.len(), "forwarding batch");
            if let Some(frame) = encode(&ServerMessage::Batch { records }) {
                link.push(frame);
            }
        }
    }

    /// Snapshot of the members of `group`, sorted, optionally leaving one out.
    /// Unknown groups have no members.
    pub fn peer_names(&self, group: &str, excluding: Option<&str>) -> Vec<String> {
        self.lock()
            .get(group)
            .map(|members| member_names(members, excluding))
            .unwrap_or_default()
    }

    /// Answer a `ListPeers` request from `name`.
    pub fn send_peer_list(&self, group: &str, name: &str) {
        let groups = self.lock();
        let Some(members) = groups.get(group) else {
            return;
        };
        if let Some(link) = members.get(name) {
            let peers = ServerMessage::Peers {
                names: member_names(members, None),
            };
            if let Some(frame) = encode(&peers) {
                link.push(frame);
            }
        }
    }
}

/// Send the current member list to every member.
fn push_peer_list(members: &Members) {
    let peers = ServerMessage::Peers {
        names: member_names(members, None),
    };
    if let Some(frame) = encode(&peers) {
        for link in members.values() {
            link.push(Arc::clone(&frame));
        }
    }
}

/// Sorted member names, optionally leaving one out.
fn member_names(members: &Members, excluding: Option<&str>) -> Vec<String> {
    members
        .keys()
        .filter(|name| Some(name.as_str()) != excluding)
        .cloned()
        .collect()
}

fn encode(msg: &ServerMessage) -> Option<Frame> {
    match encode_message(msg) {
        Ok(bytes) => Some(Frame::from(bytes)),
        Err(e) => {
            warn!(error = %e, "failed to encode relay message, dropping it");
            None
        }
    }
}
