//! Wire-level compatibility of the nameserver with older clients.

use std::time::{Duration, Instant};

use posttroll::broadcaster::AddressBroadcaster;
use posttroll::config::{set_config, Config};
use posttroll::message::Message;
use posttroll::ns::{get_pub_address, NameServer};
use posttroll::socket::{client_socket, close_socket, poll_readable, recv_text, SocketKind};
use pt_test_utils::free_tcp_port;

#[test]
fn v101_request_gets_v101_reply() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    set_config(Config {
        nameserver_port: free_tcp_port(),
        broadcast_port: free_tcp_port(),
        address_publish_port: free_tcp_port(),
        ..Config::default()
    });
    let cfg = posttroll::config();

    let ns = NameServer::new(Some(Duration::from_secs(600)), false, false);
    let ns_handle = ns.clone();
    let ns_thread = std::thread::spawn(move || ns_handle.run(None));

    let up = Instant::now() + Duration::from_secs(10);
    while Instant::now() < up {
        if get_pub_address("", Duration::from_millis(500), "localhost").is_ok() {
            break;
        }
    }

    // Register a service through the designated-receiver path.
    let mut broadcaster = AddressBroadcaster::new(
        "cool_service",
        "tcp://10.1.2.3:9999",
        &[],
        Duration::from_millis(100),
        vec!["localhost".into()],
    )
    .unwrap();
    broadcaster.start().unwrap();
    let registered = Instant::now() + Duration::from_secs(10);
    loop {
        let records = get_pub_address("cool_service", Duration::from_secs(1), "localhost")
            .unwrap_or_default();
        if !records.is_empty() {
            break;
        }
        assert!(Instant::now() < registered, "service never registered");
        std::thread::sleep(Duration::from_millis(100));
    }

    // A raw v1.01 request, exactly as an old client would put it on the
    // wire.
    let request = "pytroll://oper/ns request ras@hawaii 2008-04-11T22:13:22.123000 v1.01 \
                   application/json {\"service\": \"cool_service\"}";
    let sock = client_socket(
        SocketKind::Req,
        &format!("tcp://localhost:{}", cfg.nameserver_port),
    )
    .unwrap();
    sock.send(request.as_bytes(), 0).unwrap();
    assert!(poll_readable(&sock, Some(Duration::from_secs(5))).unwrap());
    let raw_reply = recv_text(&sock, 0).unwrap();
    close_socket(&sock);

    // The version token is echoed back so the old client can parse the
    // reply.
    let version_token = raw_reply.split(' ').nth(4).unwrap();
    assert_eq!(version_token, "v1.01");

    // And v1.01 means no UTC offsets anywhere, including inside the JSON
    // body.
    assert!(!raw_reply.contains("+00:00"), "offset leaked into {raw_reply}");

    let reply = Message::decode(raw_reply.trim()).unwrap();
    assert_eq!(reply.subject, "/oper/ns");
    assert_eq!(reply.kind, "info");
    assert_eq!(reply.version, "v1.01");
    let body = reply.body.as_json().expect("reply must carry records");
    let uris: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|record| record["URI"].as_str())
        .collect();
    assert_eq!(uris, vec!["tcp://10.1.2.3:9999"]);

    broadcaster.stop();
    ns.stop();
    ns_thread.join().unwrap().unwrap();
}
