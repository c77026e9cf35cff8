//! CURVE-authenticated pub/sub over ipc endpoints.

use std::time::{Duration, Instant};

use posttroll::auth::{z85_encode, Certificate};
use posttroll::config::{set_config, update_config, Backend, Config};
use posttroll::message::{Body, Message};
use posttroll::publisher::Publisher;
use posttroll::subscriber::Subscriber;
use pt_test_utils::write_curve_certificates;

/// Pump the publisher until the subscriber yields a message or the deadline
/// passes; rides out the subscription handshake.
fn pump(publisher: &Publisher, subscriber: &Subscriber, msg: &Message, timeout: Duration) -> Option<Message> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        publisher.send(&msg.encode()).unwrap();
        for received in subscriber.recv(Some(Duration::from_millis(200))) {
            match received {
                Some(received) => return Some(received),
                None => break,
            }
        }
    }
    None
}

#[test]
fn keyed_subscriber_receives_keyless_one_does_not() {
    let dir = tempfile::tempdir().unwrap();
    let keys = write_curve_certificates(dir.path()).unwrap();

    set_config(Config {
        backend: Backend::SecureZmq,
        server_secret_key_file: Some(keys.server_secret_key_file.clone()),
        clients_public_keys_directory: Some(keys.clients_public_keys_directory.clone()),
        client_secret_key_file: Some(keys.client_secret_key_file.clone()),
        server_public_key_file: Some(keys.server_public_key_file.clone()),
        ..Config::default()
    });

    let endpoint = format!("ipc://{}/s", dir.path().display());
    let mut publisher = Publisher::new(&endpoint, "sensitive_service");
    publisher.start().unwrap();

    let msg = Message::new("/secret", "info", Body::Text("very sensitive message".into()))
        .unwrap();

    // The authorized subscriber holds the client secret key and the
    // server's public key.
    let good = Subscriber::new(&[endpoint.clone()], &[String::new()], false).unwrap();
    let received =
        pump(&publisher, &good, &msg, Duration::from_secs(10)).expect("authorized subscriber starved");
    assert_eq!(received.body, Body::Text("very sensitive message".into()));
    assert_eq!(received.subject, "/secret");
    good.close();

    // A subscriber with a keypair the server has never heard of gets
    // nothing within a second.
    let rogue_pair = zmq::CurveKeyPair::new().unwrap();
    let rogue_key_file = dir.path().join("rogue.key_secret");
    Certificate {
        public: z85_encode(&rogue_pair.public_key).unwrap(),
        secret: Some(z85_encode(&rogue_pair.secret_key).unwrap()),
    }
    .store(&rogue_key_file)
    .unwrap();
    update_config(|cfg| cfg.client_secret_key_file = Some(rogue_key_file.clone()));

    let rogue = Subscriber::new(&[endpoint.clone()], &[String::new()], false).unwrap();
    assert!(
        pump(&publisher, &rogue, &msg, Duration::from_secs(1)).is_none(),
        "unauthorized subscriber saw the message"
    );
    rogue.close();

    publisher.stop();
}
