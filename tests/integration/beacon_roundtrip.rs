//! UDP beacon transport, exercised over the loopback interface.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use posttroll::beacon::{BeaconReceiver, BeaconSender};
use posttroll::config::update_config;
use posttroll::message::{Body, Message};
use pt_test_utils::free_tcp_port;

#[test]
fn multicast_roundtrip_on_loopback() {
    // Pin multicast to loopback so the datagram loops straight back to the
    // joined receiver.
    update_config(|cfg| cfg.multicast_interface = Some(Ipv4Addr::LOCALHOST));

    let port = free_tcp_port();
    let receiver = BeaconReceiver::new(port, Some("225.0.0.212")).unwrap();
    receiver.set_timeout(Some(Duration::from_millis(500))).unwrap();
    let sender = BeaconSender::new(port, Some("225.0.0.212")).unwrap();

    let beacon = Message::new(
        "/address/roundtrip",
        "info",
        Body::Json(serde_json::json!({"URI": "tcp://127.0.0.1:9999", "service": ["roundtrip"]})),
    )
    .unwrap();
    let encoded = beacon.encode();

    let deadline = Instant::now() + Duration::from_secs(5);
    let received = loop {
        sender.send(&encoded).unwrap();
        match receiver.recv() {
            Ok((data, from)) => {
                assert!(from.ip().is_loopback() || !data.is_empty());
                break data;
            }
            Err(_) if Instant::now() < deadline => continue,
            Err(e) => panic!("no multicast datagram came back: {e}"),
        }
    };
    assert_eq!(received, encoded);

    let decoded = Message::decode(&received).unwrap();
    assert_eq!(decoded, beacon);

    receiver.close();
    sender.close();
}

#[test]
fn broadcast_send_does_not_error() {
    let port = free_tcp_port();
    let sender = BeaconSender::new(port, Some("255.255.255.255")).unwrap();
    // Reception of broadcast depends on the host network setup; sending must
    // work regardless.
    sender.send("pytroll beacon probe").unwrap();
    sender.close();
}

#[test]
fn receiver_sees_nothing_without_a_sender() {
    let port = free_tcp_port();
    let receiver = BeaconReceiver::new(port, Some("225.0.0.213")).unwrap();
    receiver.set_timeout(Some(Duration::from_millis(100))).unwrap();
    assert!(receiver.recv().is_err());
    receiver.close();
}
