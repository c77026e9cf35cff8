//! Periodic message broadcasting for the discovery plane.
//!
//! The broadcaster worker emits one message every interval, normally as a
//! UDP beacon.  When designated receivers are configured (multicast
//! disabled), the message instead goes over REQ/REP straight to every
//! receiver, which acknowledges with the literal `ok`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use serde_json::json;

use crate::beacon::BeaconSender;
use crate::config::config;
use crate::message::{Body, Message, MessageError};
use crate::socket::{client_socket, close_socket, poll_readable, recv_text, SocketKind, TransportError};

/// How long a designated receiver gets to acknowledge a message.
const ACK_TIMEOUT: Duration = Duration::from_secs(10);
/// Granularity of the shutdown check while waiting for an ack.
const ACK_POLL: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Designated receivers
// ---------------------------------------------------------------------------

/// Sends a message to each configured receiver over REQ/REP.
pub struct DesignatedReceiversSender {
    default_port: u16,
    receivers: Vec<String>,
    shutdown: Arc<AtomicBool>,
}

impl DesignatedReceiversSender {
    pub fn new(default_port: u16, receivers: Vec<String>, shutdown: Arc<AtomicBool>) -> Self {
        DesignatedReceiversSender {
            default_port,
            receivers,
            shutdown,
        }
    }

    /// Send `data` to all receivers, waiting for each ack in turn.
    pub fn send(&self, data: &str) -> Result<(), TransportError> {
        for receiver in &self.receivers {
            self.send_to(receiver, data)?;
        }
        Ok(())
    }

    fn send_to(&self, address: &str, data: &str) -> Result<(), TransportError> {
        let endpoint = if address.contains(':') {
            format!("tcp://{address}")
        } else {
            format!("tcp://{address}:{}", self.default_port)
        };
        let sock = client_socket(SocketKind::Req, &endpoint)?;
        let result = (|| {
            sock.set_linger(ACK_TIMEOUT.as_millis() as i32)?;
            sock.send(data.as_bytes(), 0)?;
            while !self.shutdown.load(Ordering::SeqCst) {
                if poll_readable(&sock, Some(ACK_POLL))? {
                    let reply = recv_text(&sock, zmq::DONTWAIT)?;
                    if reply != "ok" {
                        tracing::warn!(%reply, %endpoint, "invalid acknowledge received");
                    }
                    break;
                }
            }
            Ok(())
        })();
        close_socket(&sock);
        result
    }

    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

enum Sender {
    Beacon(BeaconSender),
    Designated(DesignatedReceiversSender),
}

impl Sender {
    fn send(&self, data: &str) -> Result<(), TransportError> {
        match self {
            Sender::Beacon(beacon) => beacon.send(data).map_err(TransportError::from),
            Sender::Designated(designated) => designated.send(data),
        }
    }

    fn close(self) {
        match self {
            Sender::Beacon(beacon) => beacon.close(),
            Sender::Designated(designated) => designated.close(),
        }
    }
}

// ---------------------------------------------------------------------------
// Broadcaster
// ---------------------------------------------------------------------------

struct Worker {
    stop_tx: mpsc::Sender<()>,
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Broadcasts a fixed message every `interval`.
///
/// A zero interval disables broadcasting entirely.  `start` and `stop` are
/// reentrant; `stop` returns only after the worker has exited.
pub struct MessageBroadcaster {
    message: String,
    port: u16,
    interval: Duration,
    designated_receivers: Vec<String>,
    worker: Option<Worker>,
}

impl MessageBroadcaster {
    pub fn new(
        message: String,
        port: u16,
        interval: Duration,
        designated_receivers: Vec<String>,
    ) -> Self {
        MessageBroadcaster {
            message,
            port,
            interval,
            designated_receivers,
            worker: None,
        }
    }

    /// Start the broadcast worker.  Bind/setup failures propagate here.
    pub fn start(&mut self) -> Result<(), TransportError> {
        if self.interval.is_zero() || self.worker.is_some() {
            return Ok(());
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let sender = if self.designated_receivers.is_empty() {
            Sender::Beacon(BeaconSender::new(self.port, None)?)
        } else {
            Sender::Designated(DesignatedReceiversSender::new(
                self.port,
                self.designated_receivers.clone(),
                Arc::clone(&shutdown),
            ))
        };
        let (stop_tx, stop_rx) = mpsc::channel();
        let message = self.message.clone();
        let interval = self.interval;
        let handle = std::thread::Builder::new()
            .name("message-broadcaster".into())
            .spawn(move || broadcast_loop(sender, &message, interval, &stop_rx))?;
        self.worker = Some(Worker {
            stop_tx,
            shutdown,
            handle,
        });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Stop broadcasting; joins the worker.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.shutdown.store(true, Ordering::SeqCst);
            let _ = worker.stop_tx.send(());
            let _ = worker.handle.join();
        }
    }
}

impl Drop for MessageBroadcaster {
    fn drop(&mut self) {
        self.stop();
    }
}

fn broadcast_loop(
    sender: Sender,
    message: &str,
    interval: Duration,
    stop_rx: &mpsc::Receiver<()>,
) {
    let mut network_fail = false;
    loop {
        match sender.send(message) {
            Ok(()) => {
                if network_fail {
                    tracing::info!("network connection re-established");
                    network_fail = false;
                }
            }
            Err(TransportError::Io(e)) if e.kind() == std::io::ErrorKind::NetworkUnreachable => {
                tracing::error!(
                    "network unreachable, trying again in {} s",
                    interval.as_secs_f64()
                );
                network_fail = true;
            }
            Err(e) => {
                tracing::error!("broadcast failed: {e}");
                break;
            }
        }
        match stop_rx.recv_timeout(interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            _ => break,
        }
    }
    sender.close();
}

// ---------------------------------------------------------------------------
// Address broadcasting
// ---------------------------------------------------------------------------

/// Build the address-advertisement beacon for a service.
pub fn beacon_message(name: &str, uri: &str, aliases: &[String]) -> Result<Message, MessageError> {
    let mut services = vec![name.to_owned()];
    services.extend(aliases.iter().cloned());
    Message::new(
        &format!("/address/{name}"),
        "info",
        Body::Json(json!({"URI": uri, "service": services})),
    )
}

/// Periodically announces a service name and its transport URI.
pub struct AddressBroadcaster {
    inner: MessageBroadcaster,
}

impl AddressBroadcaster {
    /// A non-empty `nameservers` list switches from UDP beacons to direct
    /// REQ/REP announcements.
    pub fn new(
        name: &str,
        uri: &str,
        aliases: &[String],
        interval: Duration,
        nameservers: Vec<String>,
    ) -> Result<Self, MessageError> {
        let message = beacon_message(name, uri, aliases)?.encode();
        Ok(AddressBroadcaster {
            inner: MessageBroadcaster::new(
                message,
                config().broadcast_port,
                interval,
                nameservers,
            ),
        })
    }

    pub fn start(&mut self) -> Result<(), TransportError> {
        self.inner.start()
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    pub fn stop(&mut self) {
        self.inner.stop();
    }
}
