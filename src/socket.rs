//! Thin socket layer over zmq.
//!
//! One pair of entry points (`server_socket`, `client_socket`) hides the
//! backend choice: the unsecure backend hands out plain sockets, the secure
//! backend adds CURVE encryption and the shared ZAP authenticator.  TCP
//! keepalive knobs from the configuration are applied to every socket
//! created here.
//!
//! Binding to port 0 picks a random free port within the configured range
//! and reports the chosen port back.

use std::io;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;

use crate::auth::{acquire_authenticator, AuthError, AuthHandle, Certificate};
use crate::beacon::BeaconError;
use crate::config::{config, Backend, Config, ConfigError};
use crate::context;
use crate::message::{Message, MessageError};

/// How many random candidates to try before giving up on a port range.
const RANDOM_BIND_ATTEMPTS: u32 = 100;

/// Socket roles offered by the layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
    Pub,
    Sub,
    Req,
    Rep,
    Push,
    Pull,
}

impl SocketKind {
    fn to_zmq(self) -> zmq::SocketType {
        match self {
            SocketKind::Pub => zmq::PUB,
            SocketKind::Sub => zmq::SUB,
            SocketKind::Req => zmq::REQ,
            SocketKind::Rep => zmq::REP,
            SocketKind::Push => zmq::PUSH,
            SocketKind::Pull => zmq::PULL,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("operation timed out")]
    Timeout,
    #[error("transport: {0}")]
    Zmq(#[from] zmq::Error),
    #[error("transport: {0}")]
    Io(#[from] io::Error),
    #[error("authentication: {0}")]
    Auth(#[from] AuthError),
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("invalid endpoint '{0}'")]
    Endpoint(String),
    #[error("no free port in range {0}..={1}")]
    NoFreePort(u16, u16),
    #[error("socket is not started")]
    NotStarted,
}

impl From<BeaconError> for TransportError {
    fn from(e: BeaconError) -> Self {
        match e {
            BeaconError::Timeout => TransportError::Timeout,
            BeaconError::Io(io) => TransportError::Io(io),
            BeaconError::InvalidGroup(g) => TransportError::Endpoint(g),
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoint handling
// ---------------------------------------------------------------------------

/// A split `scheme://host[:port]` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint<'a> {
    pub scheme: &'a str,
    pub host: &'a str,
    pub port: Option<u16>,
}

/// Split an endpoint string; only `tcp` endpoints carry a port.
pub fn parse_endpoint(endpoint: &str) -> Result<Endpoint<'_>, TransportError> {
    let (scheme, rest) = endpoint
        .split_once("://")
        .ok_or_else(|| TransportError::Endpoint(endpoint.to_owned()))?;
    if scheme != "tcp" {
        return Ok(Endpoint {
            scheme,
            host: rest,
            port: None,
        });
    }
    match rest.rfind(':') {
        Some(idx) => {
            let host = &rest[..idx];
            let port = rest[idx + 1..]
                .parse()
                .map_err(|_| TransportError::Endpoint(endpoint.to_owned()))?;
            if host.is_empty() {
                return Err(TransportError::Endpoint(endpoint.to_owned()));
            }
            Ok(Endpoint {
                scheme,
                host,
                port: Some(port),
            })
        }
        None => Ok(Endpoint {
            scheme,
            host: rest,
            port: None,
        }),
    }
}

// ---------------------------------------------------------------------------
// Socket creation
// ---------------------------------------------------------------------------

/// A bound server socket with the port it landed on.
pub struct BoundSocket {
    pub sock: zmq::Socket,
    pub port: u16,
    /// Present in the secure backend; dropping the last handle stops the
    /// process-wide authenticator.
    pub auth: Option<AuthHandle>,
}

/// Create and bind a server socket.
///
/// A `tcp` endpoint with port 0 is bound to a random free port inside
/// `port_range` (configured publisher range when `None`); the chosen port is
/// returned in the [`BoundSocket`].
pub fn server_socket(
    kind: SocketKind,
    endpoint: &str,
    port_range: Option<(u16, u16)>,
) -> Result<BoundSocket, TransportError> {
    let cfg = config();
    let (sock, auth) = match cfg.backend {
        Backend::UnsecureZmq => (context().socket(kind.to_zmq())?, None),
        Backend::SecureZmq => {
            let (sock, auth) = secure_server_socket(kind, &cfg)?;
            (sock, Some(auth))
        }
    };
    apply_tcp_keepalive(&sock, &cfg)?;

    let parsed = parse_endpoint(endpoint)?;
    let port = match parsed.port {
        Some(0) => {
            let range = port_range.unwrap_or((cfg.pub_min_port, cfg.pub_max_port));
            bind_to_random_port(&sock, &parsed, range)?
        }
        Some(port) => {
            sock.bind(endpoint)?;
            port
        }
        None => {
            // ipc, inproc and friends have no port to report.
            sock.bind(endpoint)?;
            0
        }
    };
    Ok(BoundSocket { sock, port, auth })
}

/// Create and connect a client socket.
pub fn client_socket(kind: SocketKind, endpoint: &str) -> Result<zmq::Socket, TransportError> {
    let cfg = config();
    let sock = match cfg.backend {
        Backend::UnsecureZmq => context().socket(kind.to_zmq())?,
        Backend::SecureZmq => secure_client_socket(kind, &cfg)?,
    };
    apply_tcp_keepalive(&sock, &cfg)?;
    sock.connect(endpoint)?;
    Ok(sock)
}

/// Close a socket without lingering on unsent messages.
pub fn close_socket(sock: &zmq::Socket) {
    let _ = sock.set_linger(1);
}

fn secure_server_socket(
    kind: SocketKind,
    cfg: &Config,
) -> Result<(zmq::Socket, AuthHandle), TransportError> {
    // The authenticator must be listening on the ZAP endpoint before the
    // first CURVE socket starts handshaking.
    let auth = acquire_authenticator()?;

    let key_file = cfg
        .server_secret_key_file
        .as_ref()
        .ok_or(AuthError::MissingKey("server_secret_key_file"))?;
    let cert = Certificate::load(key_file)?;

    let sock = context().socket(kind.to_zmq())?;
    sock.set_curve_server(true)?;
    sock.set_curve_publickey(&cert.public_bytes()?)?;
    sock.set_curve_secretkey(&cert.secret_bytes()?)?;
    Ok((sock, auth))
}

fn secure_client_socket(kind: SocketKind, cfg: &Config) -> Result<zmq::Socket, TransportError> {
    let client_key_file = cfg
        .client_secret_key_file
        .as_ref()
        .ok_or(AuthError::MissingKey("client_secret_key_file"))?;
    let server_key_file = cfg
        .server_public_key_file
        .as_ref()
        .ok_or(AuthError::MissingKey("server_public_key_file"))?;

    let client_cert = Certificate::load(client_key_file)?;
    // The client must know the server's public key to make a CURVE
    // connection.
    let server_cert = Certificate::load(server_key_file)?;

    let sock = context().socket(kind.to_zmq())?;
    sock.set_curve_publickey(&client_cert.public_bytes()?)?;
    sock.set_curve_secretkey(&client_cert.secret_bytes()?)?;
    sock.set_curve_serverkey(&server_cert.public_bytes()?)?;
    Ok(sock)
}

fn apply_tcp_keepalive(sock: &zmq::Socket, cfg: &Config) -> Result<(), TransportError> {
    if let Some(v) = cfg.tcp_keepalive {
        sock.set_tcp_keepalive(v)?;
    }
    if let Some(v) = cfg.tcp_keepalive_cnt {
        sock.set_tcp_keepalive_cnt(v)?;
    }
    if let Some(v) = cfg.tcp_keepalive_idle {
        sock.set_tcp_keepalive_idle(v)?;
    }
    if let Some(v) = cfg.tcp_keepalive_intvl {
        sock.set_tcp_keepalive_intvl(v)?;
    }
    Ok(())
}

fn bind_to_random_port(
    sock: &zmq::Socket,
    endpoint: &Endpoint<'_>,
    (min_port, max_port): (u16, u16),
) -> Result<u16, TransportError> {
    let (min_port, max_port) = if min_port <= max_port {
        (min_port, max_port)
    } else {
        (max_port, min_port)
    };
    let mut rng = rand::thread_rng();
    for _ in 0..RANDOM_BIND_ATTEMPTS {
        let port = rng.gen_range(min_port..=max_port);
        let dest = format!("{}://{}:{}", endpoint.scheme, endpoint.host, port);
        match sock.bind(&dest) {
            Ok(()) => return Ok(port),
            Err(zmq::Error::EADDRINUSE) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(TransportError::NoFreePort(min_port, max_port))
}

// ---------------------------------------------------------------------------
// Receiving
// ---------------------------------------------------------------------------

/// Convert an optional duration to zmq poll milliseconds (`-1` blocks).
pub(crate) fn poll_ms(timeout: Option<Duration>) -> i64 {
    match timeout {
        Some(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
        None => -1,
    }
}

/// Receive one text frame, tolerating non-UTF-8 payloads.
pub fn recv_text(sock: &zmq::Socket, flags: i32) -> Result<String, TransportError> {
    match sock.recv_string(flags)? {
        Ok(s) => Ok(s),
        Err(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
    }
}

/// Poll `sock` for readability.
pub fn poll_readable(sock: &zmq::Socket, timeout: Option<Duration>) -> Result<bool, TransportError> {
    Ok(sock.poll(zmq::POLLIN, poll_ms(timeout))? > 0)
}

/// Poll a set of sockets and decode one message from every readable one.
///
/// Returns `(message, index)` pairs in socket order, or
/// [`TransportError::Timeout`] when nothing arrived in time.  A payload that
/// fails to decode aborts the call with the decode error; ingest loops log
/// and keep going.
pub fn receive_from(
    socks: &[&zmq::Socket],
    timeout: Option<Duration>,
) -> Result<Vec<(Message, usize)>, TransportError> {
    if socks.is_empty() {
        return Err(TransportError::Timeout);
    }
    let mut items: Vec<zmq::PollItem<'_>> =
        socks.iter().map(|s| s.as_poll_item(zmq::POLLIN)).collect();
    if zmq::poll(&mut items, poll_ms(timeout))? == 0 {
        return Err(TransportError::Timeout);
    }

    let mut received = Vec::new();
    for (idx, item) in items.iter().enumerate() {
        if !item.is_readable() {
            continue;
        }
        let raw = match socks[idx].recv_string(zmq::DONTWAIT) {
            Ok(Ok(s)) => s,
            Ok(Err(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(zmq::Error::EAGAIN) => continue,
            Err(e) => return Err(e.into()),
        };
        received.push((Message::decode(&raw)?, idx));
    }
    if received.is_empty() {
        return Err(TransportError::Timeout);
    }
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        let ep = parse_endpoint("tcp://localhost:5557").unwrap();
        assert_eq!(ep.scheme, "tcp");
        assert_eq!(ep.host, "localhost");
        assert_eq!(ep.port, Some(5557));

        let ep = parse_endpoint("tcp://*:0").unwrap();
        assert_eq!(ep.host, "*");
        assert_eq!(ep.port, Some(0));

        let ep = parse_endpoint("ipc:///tmp/some.socket").unwrap();
        assert_eq!(ep.scheme, "ipc");
        assert_eq!(ep.host, "/tmp/some.socket");
        assert_eq!(ep.port, None);

        assert!(parse_endpoint("no-scheme-here").is_err());
        assert!(parse_endpoint("tcp://host:notaport").is_err());
    }

    #[test]
    fn server_socket_reports_fixed_port() {
        let bound = server_socket(SocketKind::Pub, "tcp://127.0.0.1:0", Some((40000, 50000)))
            .unwrap();
        assert!((40000..=50000).contains(&bound.port));
        close_socket(&bound.sock);
    }

    #[test]
    fn random_bind_skips_occupied_ports() {
        let first = server_socket(SocketKind::Pub, "tcp://127.0.0.1:0", Some((41000, 41001)))
            .unwrap();
        let second = server_socket(SocketKind::Pub, "tcp://127.0.0.1:0", Some((41000, 41001)))
            .unwrap();
        assert_ne!(first.port, second.port);
        assert!((41000..=41001).contains(&first.port));
        assert!((41000..=41001).contains(&second.port));
        close_socket(&first.sock);
        close_socket(&second.sock);
    }

    #[test]
    fn receive_from_times_out_without_traffic() {
        let bound = server_socket(SocketKind::Pull, "tcp://127.0.0.1:0", Some((42000, 43000)))
            .unwrap();
        let err = receive_from(&[&bound.sock], Some(Duration::from_millis(50))).unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
        close_socket(&bound.sock);
    }

    #[test]
    fn push_pull_delivery() {
        let bound = server_socket(SocketKind::Pull, "tcp://127.0.0.1:0", Some((42000, 43000)))
            .unwrap();
        let push = client_socket(SocketKind::Push, &format!("tcp://127.0.0.1:{}", bound.port))
            .unwrap();
        let msg = Message::new("/test", "info", crate::message::Body::Text("hi".into())).unwrap();
        push.send(msg.encode().as_bytes(), 0).unwrap();

        let received = receive_from(&[&bound.sock], Some(Duration::from_secs(5))).unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].0, msg);
        assert_eq!(received[0].1, 0);
        close_socket(&push);
        close_socket(&bound.sock);
    }
}
