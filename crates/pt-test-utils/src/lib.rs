//! Deterministic, in-process test doubles and fixtures.
//!
//! - [`RecordingPublisher`]: captures everything "sent" instead of touching
//!   a socket.
//! - [`CannedSubscriber`]: replays a fixed message sequence, honoring the
//!   stop flag like the real receive loop.
//! - [`write_curve_certificates`]: a full set of CURVE key files for
//!   secure-backend tests.
//! - [`free_tcp_port`]: a port the OS considers free right now.

use std::collections::VecDeque;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use posttroll::auth::{z85_encode, AuthError, Certificate};
use posttroll::message::Message;
use posttroll::publisher::MessageSender;
use posttroll::socket::TransportError;

/// A publisher that records instead of publishing.
///
/// Sending before `start` is an error, like on the real thing.
#[derive(Default)]
pub struct RecordingPublisher {
    started: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        RecordingPublisher::default()
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

impl MessageSender for RecordingPublisher {
    fn send_raw(&self, raw: &str) -> Result<(), TransportError> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(TransportError::NotStarted);
        }
        self.sent.lock().unwrap().push(raw.to_owned());
        Ok(())
    }
}

/// A subscriber stand-in yielding a canned message sequence.
///
/// The iterator ends when the messages run out or [`stop`](Self::stop) is
/// called, whichever comes first.
pub struct CannedSubscriber {
    messages: Mutex<VecDeque<Message>>,
    running: AtomicBool,
}

impl CannedSubscriber {
    pub fn new(messages: Vec<Message>) -> Self {
        CannedSubscriber {
            messages: Mutex::new(messages.into()),
            running: AtomicBool::new(false),
        }
    }

    pub fn recv(&self) -> impl Iterator<Item = Option<Message>> + '_ {
        self.running.store(true, Ordering::SeqCst);
        std::iter::from_fn(move || {
            if !self.running.load(Ordering::SeqCst) {
                return None;
            }
            self.messages.lock().unwrap().pop_front().map(Some)
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Paths to a generated set of CURVE key files.
pub struct CurveTestKeys {
    pub server_secret_key_file: PathBuf,
    pub server_public_key_file: PathBuf,
    pub client_secret_key_file: PathBuf,
    pub clients_public_keys_directory: PathBuf,
}

/// Generate a server and a client keypair under `dir`, laid out the way the
/// secure backend expects them.
pub fn write_curve_certificates(dir: &Path) -> Result<CurveTestKeys, AuthError> {
    let server = zmq::CurveKeyPair::new()?;
    let client = zmq::CurveKeyPair::new()?;

    let server_secret_key_file = dir.join("server.key_secret");
    Certificate {
        public: z85_encode(&server.public_key)?,
        secret: Some(z85_encode(&server.secret_key)?),
    }
    .store(&server_secret_key_file)?;

    let server_public_key_file = dir.join("server.key");
    Certificate {
        public: z85_encode(&server.public_key)?,
        secret: None,
    }
    .store(&server_public_key_file)?;

    let client_secret_key_file = dir.join("client.key_secret");
    Certificate {
        public: z85_encode(&client.public_key)?,
        secret: Some(z85_encode(&client.secret_key)?),
    }
    .store(&client_secret_key_file)?;

    let clients_public_keys_directory = dir.join("authorized_clients");
    std::fs::create_dir_all(&clients_public_keys_directory)?;
    Certificate {
        public: z85_encode(&client.public_key)?,
        secret: None,
    }
    .store(&clients_public_keys_directory.join("client.key"))?;

    Ok(CurveTestKeys {
        server_secret_key_file,
        server_public_key_file,
        client_secret_key_file,
        clients_public_keys_directory,
    })
}

/// A TCP port that was free at the time of asking.
pub fn free_tcp_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("binding an ephemeral port");
    listener.local_addr().expect("reading the bound address").port()
}

#[cfg(test)]
mod tests {
    use super::*;
    use posttroll::message::Body;

    #[test]
    fn recording_publisher_captures_sends() {
        let publisher = RecordingPublisher::new();
        assert!(publisher.send_raw("too early").is_err());

        publisher.start();
        publisher.send_raw("first").unwrap();
        publisher.send_raw("second").unwrap();
        assert_eq!(publisher.sent(), vec!["first", "second"]);
    }

    #[test]
    fn canned_subscriber_respects_stop() {
        let messages: Vec<Message> = (0..3)
            .map(|i| {
                Message::new("/counter", "info", Body::Text(i.to_string())).unwrap()
            })
            .collect();
        let subscriber = CannedSubscriber::new(messages);

        let mut received = Vec::new();
        for msg in subscriber.recv() {
            received.push(msg.unwrap());
            if received.len() == 2 {
                subscriber.stop();
            }
        }
        assert_eq!(received.len(), 2);
        assert!(!subscriber.is_running());
    }

    #[test]
    fn free_port_is_bindable() {
        let port = free_tcp_port();
        assert!(port > 0);
    }
}
