//! Discovery-plane lifecycle: registration, lookup, TTL eviction and
//! subscriber auto-reconnection, all over TCP (multicast disabled, the
//! publisher announces straight to the nameserver host).

use std::time::{Duration, Instant};

use posttroll::config::{set_config, Config};
use posttroll::message::{Body, Message};
use posttroll::ns::{get_pub_address, get_pub_addresses, NameServer};
use posttroll::publisher::NoisyPublisher;
use posttroll::subscriber::{NsSubscriber, Subscriber};
use pt_test_utils::free_tcp_port;

const MAX_AGE: Duration = Duration::from_secs(2);
const BROADCAST_INTERVAL: Duration = Duration::from_millis(100);

fn wait_for<F: FnMut() -> bool>(deadline: Duration, mut check: F) -> bool {
    let until = Instant::now() + deadline;
    while Instant::now() < until {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    false
}

/// Run one short receive pass so hook callbacks (the address listener) get
/// a chance to fire; hooks are dispatched on the receive loop only.
fn pump_hooks(subscriber: &Subscriber) {
    let mut iter = subscriber.recv(Some(Duration::from_millis(100)));
    let _ = iter.next();
}

/// Pump the publisher until the subscriber yields one message.
fn publish_until_received(publisher: &NoisyPublisher, subscriber: &Subscriber) -> Option<Message> {
    let msg = Message::new("/counter", "info", Body::Text("ping".into())).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        publisher.send(&msg.encode()).unwrap();
        for received in subscriber.recv(Some(Duration::from_millis(300))) {
            match received {
                Some(received) => return Some(received),
                None => break,
            }
        }
    }
    None
}

#[test]
fn discovery_lifecycle() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    set_config(Config {
        nameserver_port: free_tcp_port(),
        broadcast_port: free_tcp_port(),
        address_publish_port: free_tcp_port(),
        ..Config::default()
    });

    // Nameserver + address receiver, fed over REQ/REP.
    let ns = NameServer::new(Some(MAX_AGE), false, false);
    let ns_handle = ns.clone();
    let ns_thread = std::thread::spawn(move || ns_handle.run(None));
    assert!(
        wait_for(Duration::from_secs(10), || {
            get_pub_address("", Duration::from_millis(500), "localhost").is_ok()
        }),
        "nameserver did not come up"
    );

    // A noisy publisher announcing to the local nameserver.
    let mut publisher = NoisyPublisher::new(
        "data_provider",
        0,
        vec!["this_data".into()],
        vec!["localhost".into()],
    )
    .unwrap()
    .with_broadcast_interval(BROADCAST_INTERVAL);
    let first_port = publisher.start().unwrap();

    // Scenario: the service becomes discoverable by name and by alias.
    let records = get_pub_addresses(
        &["this_data".into()],
        Duration::from_secs(5),
        "localhost",
    );
    assert_eq!(records.len(), 1, "expected exactly one record: {records:?}");
    let record = &records[0];
    assert!(record.uri.ends_with(&format!(":{first_port}")));
    assert_eq!(record.service_names, vec!["data_provider", "this_data"]);
    assert!(record.status);
    let first_uri = record.uri.clone();

    // A nameserver-backed subscriber with the address listener on.
    let subscriber = NsSubscriber::new(
        vec!["data_provider".into()],
        vec!["/counter".into()],
        true,
        vec![],
        Duration::from_secs(5),
        false,
        "localhost",
    )
    .start()
    .unwrap();
    assert!(subscriber.addresses().contains(&first_uri));
    std::thread::sleep(Duration::from_millis(300));
    assert!(
        publish_until_received(&publisher, &subscriber).is_some(),
        "no message delivered through the discovered connection"
    );

    // Watch the receiver's address feed for the eviction notice.
    let cfg = posttroll::config();
    let events = Subscriber::new(
        &[format!("tcp://localhost:{}", cfg.address_publish_port)],
        &["/address".into()],
        false,
    )
    .unwrap();
    std::thread::sleep(Duration::from_millis(300));

    // Scenario: the publisher goes away and is swept out within 3 x max_age,
    // with exactly one status=false notice.
    publisher.stop();
    let mut removals = 0;
    let deadline = Instant::now() + 3 * MAX_AGE + Duration::from_secs(2);
    for event in events.recv(Some(Duration::from_millis(500))) {
        if let Some(event) = event {
            let body = event.body.as_json().cloned().unwrap_or_default();
            if body["URI"] == serde_json::json!(first_uri.clone())
                && body["status"] == serde_json::json!(false)
            {
                removals += 1;
            }
        }
        if Instant::now() > deadline {
            events.stop();
        }
    }
    assert_eq!(removals, 1, "expected exactly one removal notice");
    events.close();

    let leftover = get_pub_address("this_data", Duration::from_secs(2), "localhost").unwrap();
    assert!(leftover.is_empty(), "registry still holds {leftover:?}");
    assert!(
        wait_for(Duration::from_secs(5), || {
            pump_hooks(&subscriber);
            !subscriber.addresses().contains(&first_uri)
        }),
        "address listener did not drop the dead uri"
    );

    // Scenario: the publisher comes back on a fresh random port and the
    // subscriber reconnects without a manual add.
    let mut publisher = NoisyPublisher::new(
        "data_provider",
        0,
        vec!["this_data".into()],
        vec!["localhost".into()],
    )
    .unwrap()
    .with_broadcast_interval(BROADCAST_INTERVAL);
    let second_port = publisher.start().unwrap();
    let second_suffix = format!(":{second_port}");
    assert!(
        wait_for(Duration::from_secs(10), || {
            pump_hooks(&subscriber);
            subscriber
                .addresses()
                .iter()
                .any(|uri| uri.ends_with(&second_suffix))
        }),
        "address listener did not pick up the restarted publisher"
    );
    std::thread::sleep(Duration::from_millis(300));
    assert!(
        publish_until_received(&publisher, &subscriber).is_some(),
        "no message delivered after the reconnect"
    );

    publisher.stop();
    subscriber.close();
    ns.stop();
    ns_thread.join().unwrap().unwrap();
}

/// With several services asked for, missing ones are skipped, not fatal.
#[test]
fn absent_services_are_skipped() {
    // This test talks to no nameserver at all: the lookup times out and the
    // subscriber starts empty.
    let subscriber = NsSubscriber::new(
        vec!["no_such_service".into()],
        vec!["/counter".into()],
        false,
        vec![],
        Duration::from_millis(300),
        false,
        "localhost",
    )
    .start()
    .unwrap();
    assert!(subscriber.addresses().is_empty());
    subscriber.close();
}
