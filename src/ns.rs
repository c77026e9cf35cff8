//! The nameserver: translate service names into publisher addresses.
//!
//! Server side, a single-threaded REP loop answers `/oper/ns` requests from
//! the address receiver's registry.  Replies reuse the request's protocol
//! version, so an older client always receives a wire form it can parse.
//!
//! Client side, [`get_pub_address`] performs one REQ round-trip and
//! [`get_pub_addresses`] retries until something shows up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use thiserror::Error;

use crate::address_receiver::{AddressReceiver, AddressReceiverSettings, AddressRecord};
use crate::config::config;
use crate::message::{is_version_token, Body, Message, MessageError};
use crate::socket::{
    client_socket, close_socket, poll_readable, recv_text, server_socket, SocketKind,
    TransportError,
};

/// Poll interval of the request loop; bounds how long `stop` can take.
const REQUEST_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum NsError {
    #[error("didn't get an address after {0} seconds")]
    Timeout(u64),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error("unexpected nameserver response: {0}")]
    BadResponse(String),
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Ask one nameserver for the addresses of the publishers named `name`
/// (every publisher when empty).
pub fn get_pub_address(
    name: &str,
    timeout: Duration,
    nameserver: &str,
) -> Result<Vec<AddressRecord>, NsError> {
    let port = config().nameserver_port;
    let endpoint = format!("tcp://{nameserver}:{port}");
    let sock = client_socket(SocketKind::Req, &endpoint).map_err(TransportError::from)?;
    let result = (|| {
        sock.set_linger(timeout.as_millis() as i32)
            .map_err(TransportError::from)?;
        tracing::debug!(%endpoint, "connecting to nameserver");

        let request = Message::new("/oper/ns", "request", Body::Json(json!({"service": name})))?;
        sock.send(request.encode().as_bytes(), 0)
            .map_err(TransportError::from)?;

        if !poll_readable(&sock, Some(timeout))? {
            return Err(NsError::Timeout(timeout.as_secs()));
        }
        let raw = recv_text(&sock, zmq::DONTWAIT)?;
        let reply = Message::decode(&raw)?;
        records_from_body(&reply.body)
    })();
    close_socket(&sock);
    result
}

/// Get addresses for several service names, retrying each until the
/// deadline.  Names that never resolve are simply absent from the result.
pub fn get_pub_addresses(
    names: &[String],
    timeout: Duration,
    nameserver: &str,
) -> Vec<AddressRecord> {
    let names = if names.is_empty() {
        vec![String::new()]
    } else {
        names.to_vec()
    };
    let pause = timeout / 20;
    let mut records = Vec::new();
    for name in &names {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match get_pub_address(name, timeout, nameserver) {
                Ok(found) if !found.is_empty() => {
                    records.extend(found);
                    break;
                }
                Ok(_) => {}
                Err(e) => tracing::debug!(%name, "nameserver query failed: {e}"),
            }
            std::thread::sleep(pause);
        }
    }
    records
}

fn records_from_body(body: &Body) -> Result<Vec<AddressRecord>, NsError> {
    match body {
        Body::Empty => Ok(Vec::new()),
        Body::Text(s) if s.is_empty() => Ok(Vec::new()),
        Body::Json(value) => serde_json::from_value(value.clone())
            .map_err(|e| NsError::BadResponse(e.to_string())),
        other => Err(NsError::BadResponse(format!("{other:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// Build the reply for a `name` lookup against the receiver's registry.
pub fn get_active_address(
    name: &str,
    arec: &AddressReceiver,
    version: &str,
) -> Result<Message, MessageError> {
    let records = arec.get(name);
    let body = if records.is_empty() {
        Body::Empty
    } else {
        Body::Json(serde_json::to_value(records).expect("serializing records cannot fail"))
    };
    Message::with_version("/oper/ns", "info", body, version)
}

/// The nameserver.
///
/// `run` owns its address receiver unless one is passed in, binds the REP
/// socket and serves until [`stop`](Self::stop).  Cloning yields another
/// handle on the same stop flag, so one clone can serve while another
/// stops it.
#[derive(Clone)]
pub struct NameServer {
    max_age: Duration,
    multicast_enabled: bool,
    restrict_to_localhost: bool,
    stop_flag: Arc<AtomicBool>,
}

impl NameServer {
    pub fn new(
        max_age: Option<Duration>,
        multicast_enabled: bool,
        restrict_to_localhost: bool,
    ) -> Self {
        NameServer {
            max_age: max_age.unwrap_or(Duration::from_secs(600)),
            multicast_enabled,
            restrict_to_localhost,
            stop_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Launch an address receiver and serve requests until stopped.
    ///
    /// `nameserver_address` overrides the default `tcp://*:<port>` endpoint
    /// (any zmq scheme works, which tests use with `ipc://`).
    pub fn run(&self, nameserver_address: Option<&str>) -> Result<(), TransportError> {
        let mut arec = AddressReceiver::new(AddressReceiverSettings {
            max_age: self.max_age,
            multicast_enabled: self.multicast_enabled,
            restrict_to_localhost: self.restrict_to_localhost,
            ..Default::default()
        });
        arec.start()?;
        let result = self.run_with_receiver(&arec, nameserver_address);
        arec.stop();
        result
    }

    /// Serve requests against an externally-owned address receiver.
    pub fn run_with_receiver(
        &self,
        arec: &AddressReceiver,
        nameserver_address: Option<&str>,
    ) -> Result<(), TransportError> {
        self.stop_flag.store(false, Ordering::SeqCst);
        let default_endpoint = format!("tcp://*:{}", config().nameserver_port);
        let endpoint = nameserver_address.unwrap_or(&default_endpoint);
        let bound = server_socket(SocketKind::Rep, endpoint, None)?;
        tracing::debug!(%endpoint, "nameserver listening");

        let result = self.serve(&bound.sock, arec);
        close_socket(&bound.sock);
        // Dropping `bound` releases the authenticator handle in secure mode.
        result
    }

    fn serve(&self, sock: &zmq::Socket, arec: &AddressReceiver) -> Result<(), TransportError> {
        let default_version = config().message_version;
        while !self.stop_flag.load(Ordering::SeqCst) {
            if !poll_readable(sock, Some(REQUEST_POLL))? {
                continue;
            }
            let raw = recv_text(sock, 0)?;
            tracing::debug!(request = %raw, "replying to request");

            // Strict REQ/REP pairing: every received request gets exactly
            // one reply, even an undecodable one.
            let reply = match Message::decode(&raw) {
                Ok(request) => {
                    let version = if is_version_token(&request.version) {
                        request.version.clone()
                    } else {
                        default_version.clone()
                    };
                    let service = request
                        .body
                        .as_json()
                        .and_then(|body| body.get("service"))
                        .and_then(|service| service.as_str())
                        .unwrap_or("")
                        .to_owned();
                    get_active_address(&service, arec, &version)
                }
                Err(e) => {
                    tracing::warn!("undecodable nameserver request: {e}");
                    get_active_address("", arec, &default_version)
                }
            };
            match reply {
                Ok(reply) => sock.send(reply.encode().as_bytes(), 0)?,
                Err(e) => {
                    tracing::error!("could not build nameserver reply: {e}");
                    sock.send("", 0)?;
                }
            }
        }
        Ok(())
    }

    /// Ask the request loop to exit after its current poll.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_yields_empty_body() {
        let arec = AddressReceiver::new(AddressReceiverSettings::default());
        let reply = get_active_address("anything", &arec, "v1.2").unwrap();
        assert_eq!(reply.subject, "/oper/ns");
        assert_eq!(reply.kind, "info");
        assert_eq!(reply.body, Body::Empty);
        assert_eq!(reply.version, "v1.2");
    }

    #[test]
    fn reply_carries_requested_version() {
        let arec = AddressReceiver::new(AddressReceiverSettings::default());
        let reply = get_active_address("", &arec, "v1.01").unwrap();
        assert_eq!(reply.version, "v1.01");
        assert!(reply.encode().contains(" v1.01"));
    }

    #[test]
    fn records_from_body_handles_all_shapes() {
        assert!(records_from_body(&Body::Empty).unwrap().is_empty());
        assert!(records_from_body(&Body::Text(String::new())).unwrap().is_empty());

        let body = Body::Json(json!([
            {"URI": "tcp://10.0.0.1:40000", "service": ["svc"], "status": true,
             "receive_time": "2024-05-01T10:00:00.000000+00:00", "name": "svc"}
        ]));
        let records = records_from_body(&body).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].uri, "tcp://10.0.0.1:40000");

        assert!(records_from_body(&Body::Json(json!("garbage"))).is_err());
    }
}
