// Integration smoke test for the relay server.
//
// Starts a relay on localhost and talks to it with plain TCP sockets using
// the protocol crate's framing and message types, no `PeerClient` involved.
// This pins down the wire-level behavior: handshake replies, membership
// pushes, routing, source stamping, and connection teardown.

use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use groupnet_protocol::framing::{read_message, write_message};
use groupnet_protocol::message::{ClientMessage, MessageRecord, ServerMessage};
use groupnet_protocol::types::{Destination, RejectReason};
use groupnet_protocol::PROTOCOL_VERSION;
use groupnet_relay::server::{RelayConfig, start_relay};
use serde_json::json;

fn test_config() -> RelayConfig {
    RelayConfig {
        host: "127.0.0.1".into(),
        port: 0, // OS picks a free port
        groups: vec!["demo".into(), "other".into()],
        ..RelayConfig::default()
    }
}

/// Helper: send a ClientMessage over a framed TCP stream.
fn send(writer: &mut BufWriter<TcpStream>, msg: &ClientMessage) {
    let json = serde_json::to_vec(msg).unwrap();
    write_message(writer, &json).unwrap();
}

/// Helper: receive a ServerMessage from a framed TCP stream.
fn recv(reader: &mut BufReader<TcpStream>) -> ServerMessage {
    let bytes = read_message(reader).unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn open(addr: SocketAddr) -> (BufReader<TcpStream>, BufWriter<TcpStream>) {
    let stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let reader_stream = stream.try_clone().unwrap();
    (BufReader::new(reader_stream), BufWriter::new(stream))
}

fn hello(group: &str, name: &str) -> ClientMessage {
    ClientMessage::Hello {
        protocol_version: PROTOCOL_VERSION,
        group: group.into(),
        name: name.into(),
    }
}

/// Connect, handshake, and consume the Welcome and the first Peers push.
fn join(
    addr: SocketAddr,
    group: &str,
    name: &str,
) -> (BufReader<TcpStream>, BufWriter<TcpStream>, String) {
    let (mut reader, mut writer) = open(addr);
    send(&mut writer, &hello(group, name));
    let assigned = match recv(&mut reader) {
        ServerMessage::Welcome { name, .. } => name,
        other => panic!("expected Welcome, got {other:?}"),
    };
    match recv(&mut reader) {
        ServerMessage::Peers { names } => assert!(names.contains(&assigned)),
        other => panic!("expected Peers, got {other:?}"),
    }
    (reader, writer, assigned)
}

/// Read messages until a Batch arrives, skipping membership pushes.
fn recv_batch(reader: &mut BufReader<TcpStream>) -> Vec<MessageRecord> {
    for _ in 0..20 {
        if let ServerMessage::Batch { records } = recv(reader) {
            return records;
        }
    }
    panic!("no Batch within 20 messages");
}

/// Read messages until a Peers push with exactly `expected` arrives.
fn wait_for_peers(reader: &mut BufReader<TcpStream>, expected: &[&str]) {
    for _ in 0..20 {
        if let ServerMessage::Peers { names } = recv(reader) {
            if names == expected {
                return;
            }
        }
    }
    panic!("never saw peers {expected:?}");
}

fn record(destination: Destination, title: &str, payload: serde_json::Value) -> MessageRecord {
    MessageRecord {
        source: String::new(),
        destination,
        title: title.into(),
        payload,
        queue: false,
    }
}

#[test]
fn handshake_routing_and_goodbye() {
    let (handle, addr) = start_relay(test_config()).unwrap();

    let (mut host_r, _host_w, host) = join(addr, "demo", "host");
    assert_eq!(host, "host");
    let (mut p1_r, mut p1_w, _) = join(addr, "demo", "p1");

    // Host learns about p1 through a membership push.
    wait_for_peers(&mut host_r, &["host", "p1"]);

    // p1 addresses host directly; the relay fills in the source.
    send(
        &mut p1_w,
        &ClientMessage::Batch {
            records: vec![record(Destination::peer("host"), "controls", json!("up"))],
        },
    );
    let records = recv_batch(&mut host_r);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].source, "p1");
    assert_eq!(records[0].payload, json!("up"));

    // Explicit peer list request is answered to the requester.
    send(&mut p1_w, &ClientMessage::ListPeers);
    wait_for_peers(&mut p1_r, &["host", "p1"]);

    // Goodbye releases the name and the host is told.
    send(&mut p1_w, &ClientMessage::Goodbye);
    wait_for_peers(&mut host_r, &["host"]);

    handle.stop();
}

#[test]
fn rejections_name_the_reason() {
    let (handle, addr) = start_relay(test_config()).unwrap();
    let (_host_r, _host_w, _) = join(addr, "demo", "host");

    let (mut reader, mut writer) = open(addr);
    send(&mut writer, &hello("demo", "host"));
    assert_eq!(
        recv(&mut reader),
        ServerMessage::Rejected {
            reason: RejectReason::NameTaken
        }
    );

    let (mut reader, mut writer) = open(addr);
    send(&mut writer, &hello("nowhere", "host"));
    assert_eq!(
        recv(&mut reader),
        ServerMessage::Rejected {
            reason: RejectReason::UnknownGroup
        }
    );

    // Same name in a different group is fine.
    let (_r, _w, name) = join(addr, "other", "host");
    assert_eq!(name, "host");

    handle.stop();
}

#[test]
fn forged_sources_are_rewritten() {
    let (handle, addr) = start_relay(test_config()).unwrap();
    let (mut host_r, _host_w, _) = join(addr, "demo", "host");
    let (_p1_r, mut p1_w, _) = join(addr, "demo", "p1");

    let mut forged = record(Destination::peer("host"), "cmd", json!("shutdown"));
    forged.source = "admin".into();
    send(&mut p1_w, &ClientMessage::Batch { records: vec![forged] });

    let records = recv_batch(&mut host_r);
    assert_eq!(records[0].source, "p1");

    handle.stop();
}

#[test]
fn silent_peer_is_dropped_after_idle_timeout() {
    let config = RelayConfig {
        idle_timeout: Some(Duration::from_millis(500)),
        ..test_config()
    };
    let (handle, addr) = start_relay(config).unwrap();

    let (mut host_r, mut host_w, _) = join(addr, "demo", "host");
    let (mut quiet_r, _quiet_w, _) = join(addr, "demo", "quiet");
    wait_for_peers(&mut host_r, &["host", "quiet"]);

    // Host keeps heartbeating; the quiet peer says nothing.
    for _ in 0..10 {
        send(&mut host_w, &ClientMessage::Heartbeat);
        std::thread::sleep(Duration::from_millis(100));
    }
    wait_for_peers(&mut host_r, &["host"]);

    // The quiet peer's socket was closed by the relay.
    let mut closed = false;
    for _ in 0..20 {
        if read_message(&mut quiet_r).is_err() {
            closed = true;
            break;
        }
    }
    assert!(closed, "relay should close an idle connection");

    handle.stop();
}

#[test]
fn stop_closes_live_connections() {
    let (handle, addr) = start_relay(test_config()).unwrap();
    let (mut host_r, _host_w, _) = join(addr, "demo", "host");

    handle.stop();

    let mut closed = false;
    for _ in 0..20 {
        if read_message(&mut host_r).is_err() {
            closed = true;
            break;
        }
    }
    assert!(closed);
}

#[test]
fn stop_closes_connections_still_in_handshake() {
    let config = RelayConfig {
        handshake_timeout: Duration::from_secs(30),
        ..test_config()
    };
    let (handle, addr) = start_relay(config).unwrap();

    // Connected but silent: the handler is waiting for Hello.
    let (mut reader, _writer) = open(addr);
    std::thread::sleep(Duration::from_millis(200));

    let start = std::time::Instant::now();
    handle.stop();

    let err = read_message(&mut reader).unwrap_err();
    assert!(
        !matches!(
            err.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        ),
        "socket stayed open after stop: {err}"
    );
    assert!(start.elapsed() < Duration::from_secs(5));
}
