// End-to-end integration tests for groups of peers talking through a relay.
//
// Each test starts a real relay server, connects real PeerClient instances
// (via TestPeer), and checks what a game would observe through its mailbox:
// delivery, transient vs queued slots, broadcast, group isolation, naming,
// membership, and failure when the relay goes away.

use std::collections::BTreeSet;
use std::thread;
use std::time::Duration;

use groupnet_protocol::types::{Destination, RejectReason};
use groupnet_relay::ClientError;
use multiplayer_tests::{TestPeer, start_test_relay, start_test_relay_with_idle_timeout};
use serde_json::json;

const GROUPS: &[&str] = &["demo", "red", "blue"];

/// How long a peer keeps pumping to show that nothing arrives.
const QUIET_PERIOD: Duration = Duration::from_millis(200);

#[test]
fn host_receives_controls_from_player() {
    let (relay, addr) = start_test_relay(GROUPS);
    let mut host = TestPeer::connect(addr, "host", "demo");
    let mut p1 = TestPeer::connect(addr, "p1", "demo");

    p1.send_now("host", "controls", "up", false);

    assert_eq!(host.poll_until_msg("p1", "controls"), json!("up"));
    // Reading a transient value does not consume it within the cycle.
    assert_eq!(host.client().get_msg("p1", "controls"), Some(json!("up")));

    // Next cycle with nothing new: the slot is empty again.
    host.pump();
    assert_eq!(host.client().get_msg("p1", "controls"), None);

    relay.stop();
}

#[test]
fn latest_transient_value_wins() {
    let (relay, addr) = start_test_relay(GROUPS);
    let mut host = TestPeer::connect(addr, "host", "demo");
    let mut p1 = TestPeer::connect(addr, "p1", "demo");

    p1.client().send_msg("host", "controls", "up", false);
    p1.client().send_msg("host", "controls", "down", false);
    p1.flush();

    assert_eq!(host.poll_until_msg("p1", "controls"), json!("down"));
    host.pump();
    assert_eq!(host.client().get_msg("p1", "controls"), None);

    relay.stop();
}

#[test]
fn queued_values_arrive_in_order() {
    let (relay, addr) = start_test_relay(GROUPS);
    let mut host = TestPeer::connect(addr, "host", "demo");
    let mut p1 = TestPeer::connect(addr, "p1", "demo");

    for n in 1..=3 {
        p1.send_now("host", "events", n, true);
    }

    host.poll_until_available("p1", "events", 3);
    // Queued values survive further receive cycles.
    host.pump();
    let client = host.client();
    assert_eq!(client.get_msg("p1", "events"), Some(json!(1)));
    assert_eq!(client.get_msg("p1", "events"), Some(json!(2)));
    assert_eq!(client.get_msg("p1", "events"), Some(json!(3)));
    assert_eq!(client.get_msg("p1", "events"), None);

    relay.stop();
}

#[test]
fn broadcast_reaches_everyone_but_the_sender() {
    let (relay, addr) = start_test_relay(GROUPS);
    let mut host = TestPeer::connect(addr, "host", "demo");
    let mut p1 = TestPeer::connect(addr, "p1", "demo");
    let mut p2 = TestPeer::connect(addr, "p2", "demo");
    host.poll_until_peers(&["host", "p1", "p2"]);

    host.send_now(Destination::All, "tick", 42, true);

    assert_eq!(p1.poll_until_msg("host", "tick"), json!(42));
    assert_eq!(p2.poll_until_msg("host", "tick"), json!(42));
    host.pump_for(QUIET_PERIOD);
    assert_eq!(host.client().available("host", "tick"), 0);

    relay.stop();
}

#[test]
fn explicit_self_address_is_delivered() {
    let (relay, addr) = start_test_relay(GROUPS);
    let mut host = TestPeer::connect(addr, "host", "demo");

    host.send_now("host", "note", "to self", true);
    assert_eq!(host.poll_until_msg("host", "note"), json!("to self"));

    relay.stop();
}

#[test]
fn groups_are_isolated() {
    let (relay, addr) = start_test_relay(GROUPS);
    let mut red_alice = TestPeer::connect(addr, "alice", "red");
    let mut blue_alice = TestPeer::connect(addr, "alice", "blue");
    let mut bob = TestPeer::connect(addr, "bob", "blue");

    bob.send_now("alice", "hello", "blue only", true);
    bob.send_now(Destination::All, "all", "blue only", true);

    assert_eq!(blue_alice.poll_until_msg("bob", "hello"), json!("blue only"));
    assert_eq!(blue_alice.poll_until_msg("bob", "all"), json!("blue only"));

    red_alice.pump_for(QUIET_PERIOD);
    assert_eq!(red_alice.client().available("bob", "hello"), 0);
    assert_eq!(red_alice.client().available("bob", "all"), 0);
    red_alice.poll_until_peers(&["alice"]);

    relay.stop();
}

#[test]
fn unknown_destination_is_dropped_quietly() {
    let (relay, addr) = start_test_relay(GROUPS);
    let mut host = TestPeer::connect(addr, "host", "demo");
    let mut p1 = TestPeer::connect(addr, "p1", "demo");

    p1.client().send_msg("ghost", "controls", "up", false);
    p1.client().send_msg("host", "controls", "left", false);
    p1.flush();

    assert_eq!(host.poll_until_msg("p1", "controls"), json!("left"));
    p1.pump();
    assert!(p1.client().is_connected());

    relay.stop();
}

#[test]
fn duplicate_name_is_rejected_until_released() {
    let (relay, addr) = start_test_relay(GROUPS);
    let host = TestPeer::connect(addr, "host", "demo");

    let err = TestPeer::try_connect(addr, "host", "demo").err().unwrap();
    assert_eq!(err.rejection(), Some(RejectReason::NameTaken));

    host.disconnect();
    let again = TestPeer::connect_when_free(addr, "host", "demo");
    assert_eq!(again.name(), "host");

    relay.stop();
}

#[test]
fn unknown_group_is_rejected() {
    let (relay, addr) = start_test_relay(GROUPS);

    let err = TestPeer::try_connect(addr, "host", "green").err().unwrap();
    assert_eq!(err.rejection(), Some(RejectReason::UnknownGroup));

    relay.stop();
}

#[test]
fn concurrent_unnamed_peers_get_distinct_names() {
    let (relay, addr) = start_test_relay(GROUPS);

    let joins: Vec<_> = (0..8)
        .map(|_| thread::spawn(move || TestPeer::connect(addr, "", "demo")))
        .collect();
    let peers: Vec<TestPeer> = joins.into_iter().map(|j| j.join().unwrap()).collect();

    let names: BTreeSet<&str> = peers.iter().map(TestPeer::name).collect();
    assert_eq!(names.len(), peers.len(), "names must be unique: {names:?}");
    assert!(names.iter().all(|n| !n.is_empty()));

    relay.stop();
}

#[test]
fn peer_set_follows_joins_and_leaves() {
    let (relay, addr) = start_test_relay(GROUPS);
    let mut host = TestPeer::connect(addr, "host", "demo");
    let p1 = TestPeer::connect(addr, "p1", "demo");

    host.poll_until_peers(&["host", "p1"]);
    p1.disconnect();
    host.poll_until_peers(&["host"]);

    relay.stop();
}

#[test]
fn request_peers_refreshes_the_list() {
    let (relay, addr) = start_test_relay(GROUPS);
    let mut host = TestPeer::connect(addr, "host", "demo");
    let _p1 = TestPeer::connect(addr, "p1", "demo");

    host.client().request_peers();
    host.flush();
    host.poll_until_peers(&["host", "p1"]);

    relay.stop();
}

#[test]
fn relay_shutdown_fails_the_client() {
    let (relay, addr) = start_test_relay(GROUPS);
    let mut host = TestPeer::connect(addr, "host", "demo");
    let mut p1 = TestPeer::connect(addr, "p1", "demo");
    p1.send_now("host", "events", "before", true);
    host.poll_until_available("p1", "events", 1);

    relay.stop();

    host.poll_until_failed();
    // Further pumping is refused and the connection's state is gone.
    assert!(matches!(
        host.client().process_recv(),
        Err(ClientError::NotConnected)
    ));
    assert!(matches!(
        host.client().process_send(),
        Err(ClientError::NotConnected)
    ));
    assert_eq!(host.client().get_msg("p1", "events"), None);
    assert!(host.client().get_peers().is_empty());
}

#[test]
fn heartbeats_keep_a_quiet_peer_connected() {
    // Above the client's heartbeat interval, well below the test length.
    let idle = Duration::from_secs(2);
    let (relay, addr) = start_test_relay_with_idle_timeout(GROUPS, idle);
    let mut host = TestPeer::connect(addr, "host", "demo");

    host.run_frames(idle * 2);
    assert!(host.client().is_connected());

    let mut p1 = TestPeer::connect(addr, "p1", "demo");
    p1.send_now("host", "controls", "up", false);
    assert_eq!(host.poll_until_msg("p1", "controls"), json!("up"));
    host.poll_until_peers(&["host", "p1"]);

    relay.stop();
}
