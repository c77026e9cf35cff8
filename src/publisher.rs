//! High-level tools to publish messages on a port.
//!
//! [`Publisher`] wraps a PUB socket; [`NoisyPublisher`] additionally
//! announces its own name and address on the discovery plane.  The
//! [`create_publisher_from_settings`] factory picks between them the same
//! way the `Publish` context does: an explicit port with discovery turned
//! off yields a bare publisher with no side effects, everything else is
//! noisy.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::broadcaster::AddressBroadcaster;
use crate::config::{config, ConfigError};
use crate::message::{Body, Message};
use crate::socket::{
    close_socket, parse_endpoint, server_socket, BoundSocket, SocketKind, TransportError,
};

/// Anything that can emit an encoded message; lets callers swap a live
/// publisher for a recording one in tests.
pub trait MessageSender {
    fn send_raw(&self, raw: &str) -> Result<(), TransportError>;
}

/// The host's outward-facing IP address.
///
/// Uses the connected-UDP trick; no packet is sent.  Falls back to the
/// loopback address when there is no route at all.
pub fn get_own_ip() -> IpAddr {
    let probed = UdpSocket::bind("0.0.0.0:0").and_then(|sock| {
        sock.connect("8.8.8.8:80")?;
        Ok(sock.local_addr()?.ip())
    });
    probed.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Heartbeat throttling: at most one beat per interval.
struct BeatThrottle {
    last: Option<Instant>,
}

impl BeatThrottle {
    fn due(&mut self, min_interval: Duration) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if !min_interval.is_zero() && now.duration_since(last) < min_interval => {
                false
            }
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// A PUB socket bound to an address like `tcp://*:1234`.
///
/// Port 0 binds to a random free port, restricted to the configured range
/// or to an explicit one given with [`with_port_range`](Self::with_port_range).
///
/// ```rust,no_run
/// use posttroll::message::{Body, Message};
/// use posttroll::publisher::Publisher;
///
/// let mut publisher = Publisher::new("tcp://*:0", "my_service");
/// let port = publisher.start().unwrap();
/// println!("publishing on port {port}");
/// let msg = Message::new("/counter", "info", Body::Text("1".into())).unwrap();
/// publisher.send(&msg.encode()).unwrap();
/// publisher.stop();
/// ```
pub struct Publisher {
    destination: String,
    name: String,
    min_port: Option<u16>,
    max_port: Option<u16>,
    state: Mutex<Option<BoundSocket>>,
    throttle: Mutex<BeatThrottle>,
}

impl Publisher {
    pub fn new(address: &str, name: &str) -> Self {
        Publisher {
            destination: address.to_owned(),
            name: name.to_owned(),
            min_port: None,
            max_port: None,
            state: Mutex::new(None),
            throttle: Mutex::new(BeatThrottle { last: None }),
        }
    }

    /// Restrict the random-port range used when the address has port 0.
    pub fn with_port_range(mut self, min_port: Option<u16>, max_port: Option<u16>) -> Self {
        self.min_port = min_port;
        self.max_port = max_port;
        self
    }

    /// Bind the socket; returns the port it landed on.
    pub fn start(&mut self) -> Result<u16, TransportError> {
        let cfg = config();
        let range = (
            self.min_port.unwrap_or(cfg.pub_min_port),
            self.max_port.unwrap_or(cfg.pub_max_port),
        );
        let bound = server_socket(SocketKind::Pub, &self.destination, Some(range))?;
        let port = bound.port;

        let rebound = match parse_endpoint(&self.destination) {
            Ok(ep) if ep.port == Some(0) => Some(format!("{}://{}:{port}", ep.scheme, ep.host)),
            _ => None,
        };
        if let Some(dest) = rebound {
            self.destination = dest;
        }

        tracing::info!(destination = %self.destination, port, "publisher started");
        *self.state.lock().unwrap() = Some(bound);
        Ok(port)
    }

    /// The destination, with the chosen port filled in after `start`.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound port, when started.
    pub fn port_number(&self) -> Option<u16> {
        self.state.lock().unwrap().as_ref().map(|b| b.port)
    }

    /// Send an encoded message.
    ///
    /// Serialized by the publisher lock so concurrent callers cannot
    /// interleave frames.
    pub fn send(&self, msg: &str) -> Result<(), TransportError> {
        let guard = self.state.lock().unwrap();
        let bound = guard.as_ref().ok_or(TransportError::NotStarted)?;
        bound.sock.send(msg.as_bytes(), 0)?;
        Ok(())
    }

    /// Send a heartbeat, but only if `min_interval` has passed since the
    /// last one.
    pub fn heartbeat(&self, min_interval: Duration) -> Result<(), TransportError> {
        if !self.throttle.lock().unwrap().due(min_interval) {
            return Ok(());
        }
        tracing::debug!(min_interval = min_interval.as_secs_f64(), "publishing heartbeat");
        let msg = Message::new(
            &format!("/heartbeat/{}", self.name),
            "beat",
            Body::Json(json!({"min_interval": min_interval.as_secs_f64()})),
        )?;
        self.send(&msg.encode())
    }

    /// Close the socket (linger 1); in secure mode the authenticator handle
    /// is released with it.
    pub fn stop(&self) {
        if let Some(bound) = self.state.lock().unwrap().take() {
            close_socket(&bound.sock);
        }
    }
}

impl MessageSender for Publisher {
    fn send_raw(&self, raw: &str) -> Result<(), TransportError> {
        self.send(raw)
    }
}

// ---------------------------------------------------------------------------
// NoisyPublisher
// ---------------------------------------------------------------------------

/// A publisher that also broadcasts its own name and address.
///
/// A meaningful `name` matters: it is what subscribers search for on the
/// nameserver.  With a non-empty `nameservers` list, multicast is bypassed
/// and the publisher registers on those hosts only.
pub struct NoisyPublisher {
    name: String,
    port: u16,
    aliases: Vec<String>,
    broadcast_interval: Duration,
    nameservers: Vec<String>,
    min_port: Option<u16>,
    max_port: Option<u16>,
    publisher: Option<Publisher>,
    broadcaster: Option<AddressBroadcaster>,
}

impl NoisyPublisher {
    pub fn new(
        name: &str,
        port: u16,
        aliases: Vec<String>,
        nameservers: Vec<String>,
    ) -> Result<Self, ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::MissingName);
        }
        Ok(NoisyPublisher {
            name: name.to_owned(),
            port,
            aliases,
            broadcast_interval: Duration::from_secs(2),
            nameservers,
            min_port: None,
            max_port: None,
            publisher: None,
            broadcaster: None,
        })
    }

    pub fn with_broadcast_interval(mut self, interval: Duration) -> Self {
        self.broadcast_interval = interval;
        self
    }

    pub fn with_port_range(mut self, min_port: Option<u16>, max_port: Option<u16>) -> Self {
        self.min_port = min_port;
        self.max_port = max_port;
        self
    }

    /// Start the publisher, then announce `tcp://<own-ip>:<port>`.
    pub fn start(&mut self) -> Result<u16, TransportError> {
        let mut publisher = Publisher::new(&format!("tcp://*:{}", self.port), &self.name)
            .with_port_range(self.min_port, self.max_port);
        let port = publisher.start()?;
        tracing::debug!(destination = %publisher.destination(), "entering publish");

        let uri = format!("tcp://{}:{port}", get_own_ip());
        let mut broadcaster = AddressBroadcaster::new(
            &self.name,
            &uri,
            &self.aliases,
            self.broadcast_interval,
            self.nameservers.clone(),
        )?;
        broadcaster.start()?;

        self.publisher = Some(publisher);
        self.broadcaster = Some(broadcaster);
        Ok(port)
    }

    pub fn port_number(&self) -> Option<u16> {
        self.publisher.as_ref().and_then(Publisher::port_number)
    }

    pub fn send(&self, msg: &str) -> Result<(), TransportError> {
        self.publisher
            .as_ref()
            .ok_or(TransportError::NotStarted)?
            .send(msg)
    }

    pub fn heartbeat(&self, min_interval: Duration) -> Result<(), TransportError> {
        self.publisher
            .as_ref()
            .ok_or(TransportError::NotStarted)?
            .heartbeat(min_interval)
    }

    /// Stop announcing, then stop publishing.
    pub fn stop(&mut self) {
        tracing::debug!("exiting publish");
        if let Some(mut broadcaster) = self.broadcaster.take() {
            broadcaster.stop();
        }
        if let Some(publisher) = self.publisher.take() {
            publisher.stop();
        }
    }
}

impl MessageSender for NoisyPublisher {
    fn send_raw(&self, raw: &str) -> Result<(), TransportError> {
        self.send(raw)
    }
}

impl Drop for NoisyPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// The Publish factory
// ---------------------------------------------------------------------------

/// How a publisher registers on the discovery plane.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NameserverMode {
    /// Announce over UDP multicast (the default).
    #[default]
    Multicast,
    /// No discovery at all.
    Disabled,
    /// Announce over REQ/REP to these nameserver hosts.
    Designated(Vec<String>),
}

/// Settings for [`create_publisher_from_settings`].
#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub name: String,
    pub port: u16,
    pub aliases: Vec<String>,
    pub broadcast_interval: Duration,
    pub nameservers: NameserverMode,
    pub min_port: Option<u16>,
    pub max_port: Option<u16>,
}

impl Default for PublishSettings {
    fn default() -> Self {
        PublishSettings {
            name: String::new(),
            port: 0,
            aliases: Vec::new(),
            broadcast_interval: Duration::from_secs(2),
            nameservers: NameserverMode::default(),
            min_port: None,
            max_port: None,
        }
    }
}

/// Either kind of publisher, behind one start/send/stop surface.
pub enum AnyPublisher {
    Bare(Publisher),
    Noisy(NoisyPublisher),
}

impl AnyPublisher {
    pub fn start(&mut self) -> Result<u16, TransportError> {
        match self {
            AnyPublisher::Bare(p) => p.start(),
            AnyPublisher::Noisy(p) => p.start(),
        }
    }

    pub fn send(&self, msg: &str) -> Result<(), TransportError> {
        match self {
            AnyPublisher::Bare(p) => p.send(msg),
            AnyPublisher::Noisy(p) => p.send(msg),
        }
    }

    pub fn heartbeat(&self, min_interval: Duration) -> Result<(), TransportError> {
        match self {
            AnyPublisher::Bare(p) => p.heartbeat(min_interval),
            AnyPublisher::Noisy(p) => p.heartbeat(min_interval),
        }
    }

    pub fn port_number(&self) -> Option<u16> {
        match self {
            AnyPublisher::Bare(p) => p.port_number(),
            AnyPublisher::Noisy(p) => p.port_number(),
        }
    }

    pub fn stop(&mut self) {
        match self {
            AnyPublisher::Bare(p) => p.stop(),
            AnyPublisher::Noisy(p) => p.stop(),
        }
    }
}

impl MessageSender for AnyPublisher {
    fn send_raw(&self, raw: &str) -> Result<(), TransportError> {
        self.send(raw)
    }
}

/// Pick a publisher from the settings.
///
/// An explicit port with discovery disabled yields a bare [`Publisher`]
/// with no discovery side effects; every other combination yields a
/// [`NoisyPublisher`] and therefore requires a name.
pub fn create_publisher_from_settings(
    settings: PublishSettings,
) -> Result<AnyPublisher, ConfigError> {
    if settings.port > 0 && settings.nameservers == NameserverMode::Disabled {
        let publisher = Publisher::new(&format!("tcp://*:{}", settings.port), &settings.name)
            .with_port_range(settings.min_port, settings.max_port);
        return Ok(AnyPublisher::Bare(publisher));
    }
    let nameservers = match settings.nameservers {
        NameserverMode::Designated(hosts) => hosts,
        _ => Vec::new(),
    };
    let noisy = NoisyPublisher::new(&settings.name, settings.port, settings.aliases, nameservers)?
        .with_broadcast_interval(settings.broadcast_interval)
        .with_port_range(settings.min_port, settings.max_port);
    Ok(AnyPublisher::Noisy(noisy))
}
