// Test-only game peer for multiplayer integration tests.
//
// Wraps the real `PeerClient` (from `groupnet_relay::client`) to provide a
// synchronous, test-friendly API for exercising the full path:
// peer -> relay -> peer -> mailbox.
//
// The only test-specific code here is the polling wrappers (loops around
// `process_recv()` with a deadline). All networking uses the same code paths
// as a real game calling `process_send`/`process_recv` once per frame.
//
// See also: `tests/relay_scenarios.rs` for the integration test scenarios.

use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use groupnet_protocol::types::Destination;
use groupnet_relay::client::{ClientState, PeerClient};
use groupnet_relay::server::{RelayConfig, RelayHandle, start_relay};
use groupnet_relay::ClientError;
use serde_json::Value;

/// Default timeout for blocking poll operations.
const POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep duration between poll attempts, roughly one game frame.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Start a relay on localhost with an OS-assigned port serving `groups`.
pub fn start_test_relay(groups: &[&str]) -> (RelayHandle, SocketAddr) {
    start_relay(test_config(groups)).expect("failed to start relay")
}

/// `start_test_relay` with a custom idle timeout.
pub fn start_test_relay_with_idle_timeout(
    groups: &[&str],
    idle_timeout: Duration,
) -> (RelayHandle, SocketAddr) {
    let config = RelayConfig {
        idle_timeout: Some(idle_timeout),
        ..test_config(groups)
    };
    start_relay(config).expect("failed to start relay")
}

fn test_config(groups: &[&str]) -> RelayConfig {
    RelayConfig {
        host: "127.0.0.1".into(),
        port: 0,
        groups: groups.iter().map(|g| (*g).to_owned()).collect(),
        ..RelayConfig::default()
    }
}

/// A test peer wrapping a real PeerClient.
pub struct TestPeer {
    client: PeerClient,
}

impl TestPeer {
    /// Connect and join `group` as `name`, panicking on refusal.
    pub fn connect(addr: SocketAddr, name: &str, group: &str) -> Self {
        Self::try_connect(addr, name, group).expect("TestPeer::connect failed")
    }

    pub fn try_connect(addr: SocketAddr, name: &str, group: &str) -> Result<Self, ClientError> {
        PeerClient::connect(addr, name, group).map(|client| Self { client })
    }

    /// Keep retrying a connect until the relay accepts it. Used after a
    /// disconnect, since the relay releases the name asynchronously.
    pub fn connect_when_free(addr: SocketAddr, name: &str, group: &str) -> Self {
        let start = Instant::now();
        loop {
            match Self::try_connect(addr, name, group) {
                Ok(peer) => return peer,
                Err(e) => assert!(
                    start.elapsed() < POLL_TIMEOUT,
                    "name {name} never became free: {e}"
                ),
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn name(&self) -> &str {
        self.client.name()
    }

    /// Direct access to the wrapped client for mailbox reads.
    pub fn client(&mut self) -> &mut PeerClient {
        &mut self.client
    }

    /// Buffer one record and flush it immediately.
    pub fn send_now(
        &mut self,
        destination: impl Into<Destination>,
        title: &str,
        payload: impl Into<Value>,
        queue: bool,
    ) {
        self.client.send_msg(destination, title, payload, queue);
        self.flush();
    }

    /// Push everything buffered onto the socket.
    pub fn flush(&mut self) {
        self.client.process_send().expect("process_send failed");
    }

    /// One receive cycle.
    pub fn pump(&mut self) {
        self.client.process_recv().expect("process_recv failed");
    }

    /// Run receive cycles for `duration`, as an idle game loop would.
    pub fn pump_for(&mut self, duration: Duration) {
        let start = Instant::now();
        while start.elapsed() < duration {
            self.pump();
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Run a game loop with nothing to say for `duration`: flush then
    /// receive, once per frame.
    pub fn run_frames(&mut self, duration: Duration) {
        let start = Instant::now();
        while start.elapsed() < duration {
            self.flush();
            self.pump();
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Blocking poll until a value for (`source`, `title`) is readable.
    /// Returns it; a transient value stays readable until the next `pump`.
    pub fn poll_until_msg(&mut self, source: &str, title: &str) -> Value {
        let start = Instant::now();
        loop {
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "{} timed out waiting for {source}/{title}",
                self.name()
            );
            self.pump();
            if let Some(value) = self.client.get_msg(source, title) {
                return value;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Blocking poll until at least `count` values are readable for the key.
    pub fn poll_until_available(&mut self, source: &str, title: &str, count: usize) {
        let start = Instant::now();
        while self.client.available(source, title) < count {
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "{} timed out waiting for {count} values of {source}/{title}",
                self.name()
            );
            self.pump();
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Blocking poll until the peer set is exactly `expected`.
    pub fn poll_until_peers(&mut self, expected: &[&str]) {
        let start = Instant::now();
        loop {
            let peers: Vec<&str> = self.client.get_peers().iter().map(String::as_str).collect();
            if peers == expected {
                return;
            }
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "{} timed out waiting for peers {expected:?}, have {peers:?}",
                self.name()
            );
            self.pump();
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Blocking poll until the connection fails. Returns the error that
    /// ended it.
    pub fn poll_until_failed(&mut self) -> ClientError {
        let start = Instant::now();
        loop {
            assert!(
                start.elapsed() < POLL_TIMEOUT,
                "{} never noticed the relay going away",
                self.name()
            );
            let sent = self.client.process_send();
            let result = sent.and_then(|()| self.client.process_recv());
            if let Err(e) = result {
                assert_eq!(self.client.state(), ClientState::Failed);
                return e;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn disconnect(mut self) {
        self.client.disconnect();
    }
}
