//! End-to-end pub/sub over local TCP, no discovery involved.

use std::time::{Duration, Instant};

use posttroll::message::{Body, Message};
use posttroll::publisher::Publisher;
use posttroll::subscriber::Subscriber;
use pt_test_utils::free_tcp_port;

/// Publish `/warmup` probes until one comes back, so the subscription
/// handshake is over before the interesting messages fly.  SUB sockets
/// silently drop everything sent before the handshake (the slow-joiner
/// problem), which would make counting assertions flaky.
fn warm_up(publisher: &Publisher, subscriber: &Subscriber) {
    let probe = Message::new("/warmup", "info", Body::Empty).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        publisher.send(&probe.encode()).unwrap();
        for received in subscriber.recv(Some(Duration::from_millis(200))) {
            match received {
                Some(received) if received.subject == "/warmup" => return,
                Some(_) => continue,
                None => break,
            }
        }
    }
    panic!("subscription handshake never completed");
}

/// Drain everything the subscriber has to offer within `window`.
fn drain(subscriber: &Subscriber, window: Duration) -> Vec<Message> {
    let mut received = Vec::new();
    let deadline = Instant::now() + window;
    for msg in subscriber.recv(Some(Duration::from_millis(200))) {
        if let Some(msg) = msg {
            if msg.subject != "/warmup" {
                received.push(msg);
            }
        }
        if Instant::now() > deadline {
            subscriber.stop();
        }
    }
    received
}

#[test]
fn five_messages_arrive_in_order() {
    let port = free_tcp_port();
    let mut publisher = Publisher::new(&format!("tcp://*:{port}"), "counter_provider");
    publisher.start().unwrap();

    let sub = Subscriber::new(
        &[format!("tcp://127.0.0.1:{port}")],
        &["/counter".into(), "/warmup".into()],
        false,
    )
    .unwrap();
    warm_up(&publisher, &sub);

    for i in 0..5 {
        let msg = Message::new("/counter", "info", Body::Text(i.to_string())).unwrap();
        publisher.send(&msg.encode()).unwrap();
    }

    let received = drain(&sub, Duration::from_secs(2));
    let bodies: Vec<_> = received.iter().map(|m| m.body.clone()).collect();
    let expected: Vec<_> = (0..5).map(|i| Body::Text(i.to_string())).collect();
    assert_eq!(bodies, expected);
    for msg in &received {
        assert_eq!(msg.subject, "/counter");
        assert_eq!(msg.kind, "info");
    }

    sub.close();
    publisher.stop();
}

#[test]
fn prefix_filter_excludes_other_subjects() {
    let port = free_tcp_port();
    let mut publisher = Publisher::new(&format!("tcp://*:{port}"), "filter_provider");
    publisher.start().unwrap();

    let sub = Subscriber::new(
        &[format!("tcp://127.0.0.1:{port}")],
        &["/counter".into(), "/warmup".into()],
        false,
    )
    .unwrap();
    warm_up(&publisher, &sub);

    let noise = Message::new("/other/subject", "info", Body::Text("noise".into())).unwrap();
    let wanted = Message::new("/counter/sub", "info", Body::Text("wanted".into())).unwrap();
    publisher.send(&noise.encode()).unwrap();
    publisher.send(&wanted.encode()).unwrap();

    let received = drain(&sub, Duration::from_secs(1));
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].subject, "/counter/sub");
    assert_eq!(received[0].body, Body::Text("wanted".into()));

    sub.close();
    publisher.stop();
}

#[test]
fn heartbeat_is_throttled() {
    let port = free_tcp_port();
    let mut publisher = Publisher::new(&format!("tcp://*:{port}"), "beating");
    publisher.start().unwrap();

    let sub = Subscriber::new(
        &[format!("tcp://127.0.0.1:{port}")],
        &["/heartbeat".into(), "/warmup".into()],
        false,
    )
    .unwrap();
    warm_up(&publisher, &sub);

    // A tight loop of heartbeat calls must emit at most one beat per
    // interval.
    for _ in 0..20 {
        publisher.heartbeat(Duration::from_secs(10)).unwrap();
        std::thread::sleep(Duration::from_millis(10));
    }

    let beats = drain(&sub, Duration::from_secs(1));
    assert_eq!(beats.len(), 1);
    assert_eq!(beats[0].subject, "/heartbeat/beating");
    assert_eq!(beats[0].kind, "beat");
    let body = beats[0].body.as_json().unwrap();
    assert_eq!(body["min_interval"], serde_json::json!(10.0));

    sub.close();
    publisher.stop();
}

#[test]
fn translate_mode_rewrites_sender_host() {
    let port = free_tcp_port();
    let mut publisher = Publisher::new(&format!("tcp://*:{port}"), "translated");
    publisher.start().unwrap();

    let sub = Subscriber::new(
        &[format!("tcp://127.0.0.1:{port}")],
        &[String::new()],
        true,
    )
    .unwrap();
    warm_up(&publisher, &sub);

    let msg = Message::new("/translated/data", "info", Body::Text("payload".into())).unwrap();
    publisher.send(&msg.encode()).unwrap();

    let received = drain(&sub, Duration::from_secs(1));
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].host(), "127.0.0.1");
    assert_eq!(received[0].user(), msg.user());

    sub.close();
    publisher.stop();
}

#[test]
fn random_port_binding_respects_the_range() {
    // Repeat across the tiny range to tolerate one of the ports being
    // occupied by another process.
    let mut seen = Vec::new();
    for _ in 0..6 {
        let mut publisher =
            Publisher::new("tcp://*:0", "ranged").with_port_range(Some(50000), Some(50001));
        let port = publisher.start().unwrap();
        assert!(
            port == 50000 || port == 50001,
            "port {port} outside the requested range"
        );
        seen.push(port);
        publisher.stop();
    }
    assert!(!seen.is_empty());
}
