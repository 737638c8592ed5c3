// TCP listener and lifecycle for the relay.
//
// Architecture: thread-per-connection around one shared `Registry`.
//
// - **Listener thread** (`TcpListener::accept()` loop): accepts new TCP
//   connections and spawns a handler thread for each (see `connection.rs`).
//   The listener is non-blocking so it can notice `keep_running` going false.
// - **Handler threads**: one per connection, reading frames and calling into
//   the registry. Each handler also owns a writer thread for its socket.
// - **Registry** (`registry.rs`): the only state shared between handlers,
//   behind a single mutex.
//
// Shutdown: `RelayHandle::stop` clears `keep_running`, joins the listener,
// and shuts down every socket a handler is still serving, whether or not it
// has finished its handshake, so handlers exit promptly.

use std::collections::BTreeMap;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use groupnet_protocol::DEFAULT_PORT;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionLimits};
use crate::names::NameGenerator;
use crate::registry::{ConnectionId, Registry};

/// How long the listener sleeps when no connection is pending.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Sockets whose handler thread is still running, keyed by connection.
#[derive(Default)]
struct OpenSockets {
    sockets: Mutex<BTreeMap<ConnectionId, TcpStream>>,
}

impl OpenSockets {
    fn insert(&self, id: ConnectionId, socket: TcpStream) {
        self.lock().insert(id, socket);
    }

    fn remove(&self, id: ConnectionId) {
        self.lock().remove(&id);
    }

    fn shutdown_all(&self) -> usize {
        let sockets = self.lock();
        for socket in sockets.values() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        sockets.len()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ConnectionId, TcpStream>> {
        self.sockets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle returned by `start_relay` to control the running server.
pub struct RelayHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    registry: Arc<Registry>,
    open: Arc<OpenSockets>,
}

impl RelayHandle {
    /// The registry shared by all connections (for status reporting).
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Signal the relay to stop, wait for the listener to exit, and close
    /// every live connection.
    pub fn stop(mut self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        let closed = self.open.shutdown_all();
        info!(closed, "relay stopped");
    }
}

/// Configuration for starting a relay server.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Interface address to bind.
    pub host: String,
    pub port: u16,
    /// Groups peers may join. Fixed for the lifetime of the relay.
    pub groups: Vec<String>,
    /// Candidate names for peers that do not choose one; `None` uses the
    /// built-in list.
    pub name_pool: Option<Vec<String>>,
    pub handshake_timeout: Duration,
    /// Close connections silent for this long. `None` disables the check.
    pub idle_timeout: Option<Duration>,
    /// Frames a connection may have waiting for its writer before it is
    /// considered too slow and closed.
    pub outbound_queue_limit: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            groups: Vec::new(),
            name_pool: None,
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(5)),
            outbound_queue_limit: 1024,
        }
    }
}

impl RelayConfig {
    fn limits(&self) -> ConnectionLimits {
        ConnectionLimits {
            handshake_timeout: self.handshake_timeout,
            idle_timeout: self.idle_timeout,
            outbound_queue_limit: self.outbound_queue_limit,
        }
    }
}

/// Start the relay server on a background thread. Returns a handle for
/// stopping it and the actual bound address (useful when port 0 is used
/// to let the OS pick a free port).
pub fn start_relay(config: RelayConfig) -> std::io::Result<(RelayHandle, SocketAddr)> {
    let listener = TcpListener::bind((config.host.as_str(), config.port))?;
    let addr = listener.local_addr()?;
    // Set the listener to non-blocking so the accept thread can check
    // keep_running periodically.
    listener.set_nonblocking(true)?;

    let names = match config.name_pool.clone() {
        Some(pool) => NameGenerator::new(pool),
        None => NameGenerator::builtin(),
    };
    let registry = Arc::new(Registry::new(config.groups.clone(), names));
    let keep_running = Arc::new(AtomicBool::new(true));
    let open = Arc::new(OpenSockets::default());

    let thread = {
        let registry = Arc::clone(&registry);
        let keep_running = Arc::clone(&keep_running);
        let open = Arc::clone(&open);
        let limits = config.limits();
        thread::Builder::new()
            .name("relay-listener".into())
            .spawn(move || accept_loop(listener, registry, open, limits, keep_running))?
    };

    info!(%addr, groups = ?config.groups, "relay listening");
    Ok((
        RelayHandle {
            keep_running,
            thread: Some(thread),
            registry,
            open,
        },
        addr,
    ))
}

/// Accept connections until `keep_running` is set to false.
fn accept_loop(
    listener: TcpListener,
    registry: Arc<Registry>,
    open: Arc<OpenSockets>,
    limits: ConnectionLimits,
    keep_running: Arc<AtomicBool>,
) {
    let mut next_id: ConnectionId = 0;
    while keep_running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                next_id += 1;
                let id = next_id;
                debug!(connection = id, %peer_addr, "accepted connection");
                if let Err(e) = stream.set_nonblocking(false) {
                    warn!(connection = id, error = %e, "could not configure socket, dropping");
                    continue;
                }
                let _ = stream.set_nodelay(true);
                match stream.try_clone() {
                    Ok(socket) => open.insert(id, socket),
                    Err(e) => {
                        warn!(connection = id, error = %e, "could not track socket, dropping");
                        continue;
                    }
                }
                let registry = Arc::clone(&registry);
                let handler_open = Arc::clone(&open);
                let spawned = thread::Builder::new()
                    .name(format!("relay-conn-{id}"))
                    .spawn(move || {
                        Connection::new(id, stream, registry, limits).run();
                        handler_open.remove(id);
                    });
                if let Err(e) = spawned {
                    warn!(connection = id, error = %e, "could not spawn handler, dropping");
                    open.remove(id);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            // Per-connection accept failures (aborted handshakes, fd limits)
            // must not take the listener down.
            Err(e) => {
                warn!(error = %e, "accept failed");
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }
}
