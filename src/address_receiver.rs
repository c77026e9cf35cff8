//! Aggregate broadcasted addresses into a registry of live publishers.
//!
//! Beacons look like:
//!
//! ```text
//! pytroll://address/<name> info ... application/json {"URI": "tcp://host:port", "service": [...]}
//! ```
//!
//! The receiver ingests them from UDP multicast (or, with multicast
//! disabled, from a REQ/REP simple receiver on the broadcast port), stamps
//! each entry with a receive time, and republishes add events on a local
//! PUB socket.  Entries older than `max_age` are swept out, emitting exactly
//! one `status=false` notice each.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::beacon::{BeaconError, BeaconReceiver};
use crate::config::config;
use crate::message::{Body, Message};
use crate::publisher::{create_publisher_from_settings, AnyPublisher, PublishSettings};
use crate::socket::{
    close_socket, poll_readable, recv_text, server_socket, BoundSocket, SocketKind, TransportError,
};

/// Beacon poll timeout; bounds how long `stop` can take.
const RECV_TIMEOUT: Duration = Duration::from_secs(2);
/// Heartbeat pacing of the local publisher.
const HEARTBEAT_MIN_INTERVAL: Duration = Duration::from_secs(29);
/// Retries for a multicast bind that fails with ENODEV.
const BIND_RETRIES: u32 = 3;
const BIND_RETRY_WAIT: Duration = Duration::from_secs(10);

#[cfg(unix)]
const ENODEV: i32 = 19;

fn default_receive_time() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// One live publisher known to the discovery plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressRecord {
    #[serde(rename = "URI")]
    pub uri: String,
    /// The primary name plus aliases.
    #[serde(rename = "service", default)]
    pub service_names: Vec<String>,
    #[serde(default = "default_true")]
    pub status: bool,
    /// When the last beacon for this uri arrived.
    #[serde(default = "default_receive_time")]
    pub receive_time: DateTime<Utc>,
    /// Label from the beacon subject (`/address/<name>`).
    #[serde(default)]
    pub name: String,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Simple receiver (no-multicast mode)
// ---------------------------------------------------------------------------

/// REQ/REP listener for directly-sent address messages.
///
/// Every received message is acknowledged with the literal `ok`.
pub struct SimpleReceiver {
    bound: BoundSocket,
}

impl SimpleReceiver {
    /// Bind on `port`, defaulting to the address-publish port.
    pub fn new(port: Option<u16>) -> Result<Self, TransportError> {
        let port = port.unwrap_or_else(|| config().address_publish_port);
        let bound = server_socket(SocketKind::Rep, &format!("tcp://*:{port}"), None)?;
        Ok(SimpleReceiver { bound })
    }

    pub fn recv(&self, timeout: Duration) -> Result<String, TransportError> {
        if !poll_readable(&self.bound.sock, Some(timeout))? {
            return Err(TransportError::Timeout);
        }
        let data = recv_text(&self.bound.sock, 0)?;
        self.bound.sock.send("ok", 0)?;
        Ok(data)
    }

    pub fn port(&self) -> u16 {
        self.bound.port
    }

    pub fn close(&self) {
        close_socket(&self.bound.sock);
    }
}

enum BeaconSource {
    Multicast(BeaconReceiver),
    Simple(SimpleReceiver),
}

impl BeaconSource {
    fn recv(&self, timeout: Duration) -> Result<(String, Option<SocketAddr>), TransportError> {
        match self {
            BeaconSource::Multicast(receiver) => {
                let (data, from) = receiver.recv()?;
                Ok((data, Some(from)))
            }
            BeaconSource::Simple(receiver) => Ok((receiver.recv(timeout)?, None)),
        }
    }

    fn close(&self) {
        match self {
            BeaconSource::Multicast(receiver) => receiver.close(),
            BeaconSource::Simple(receiver) => receiver.close(),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry logic
// ---------------------------------------------------------------------------

type Registry = HashMap<String, AddressRecord>;

/// Ingest one beacon message.  Returns the add notice to republish when the
/// uri is new to the registry.
fn apply_beacon(registry: &mut Registry, msg: &Message, now: DateTime<Utc>) -> Option<Message> {
    if msg.kind != "info" || !msg.subject.to_lowercase().starts_with("/address") {
        return None;
    }
    let body = msg.body.as_json()?;
    let uri = body.get("URI")?.as_str()?.to_owned();
    let service_names = body
        .get("service")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();
    let name = msg.subject.split('/').nth(2).unwrap_or("").to_owned();

    let record = AddressRecord {
        uri: uri.clone(),
        service_names,
        status: true,
        receive_time: now,
        name,
    };
    tracing::debug!(%uri, name = %record.name, "receiving address");

    let is_new = !registry.contains_key(&uri);
    registry.insert(uri, record);
    if !is_new {
        return None;
    }

    let mut body = body.clone();
    body["status"] = Value::Bool(true);
    let mut notice = msg.clone();
    notice.body = Body::Json(body);
    Some(notice)
}

/// Remove entries older than `max_age`; returns one `status=false` notice
/// per evicted entry.
fn sweep_registry(registry: &mut Registry, max_age: Duration, now: DateTime<Utc>) -> Vec<Message> {
    let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
    let stale: Vec<String> = registry
        .iter()
        .filter(|(_, record)| now - record.receive_time > max_age)
        .map(|(uri, _)| uri.clone())
        .collect();

    let mut notices = Vec::new();
    for uri in stale {
        let Some(record) = registry.remove(&uri) else {
            continue;
        };
        let body = serde_json::json!({
            "URI": record.uri,
            "service": record.service_names,
            "status": false,
        });
        match Message::new(&format!("/address/{}", record.name), "info", Body::Json(body)) {
            Ok(notice) => {
                tracing::info!(%uri, "publish remove '{notice}'");
                notices.push(notice);
            }
            Err(e) => tracing::error!(%uri, "could not build removal notice: {e}"),
        }
    }
    notices
}

fn matches_name(record: &AddressRecord, name: &str) -> bool {
    name.is_empty() || record.service_names.iter().any(|s| s.contains(name))
}

// ---------------------------------------------------------------------------
// AddressReceiver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AddressReceiverSettings {
    /// Default name filter applied by [`AddressReceiver::get`].
    pub name: String,
    pub max_age: Duration,
    /// Port of the local PUB socket; address-publish port when `None`.
    pub port: Option<u16>,
    pub do_heartbeat: bool,
    pub multicast_enabled: bool,
    pub restrict_to_localhost: bool,
}

impl Default for AddressReceiverSettings {
    fn default() -> Self {
        AddressReceiverSettings {
            name: String::new(),
            max_age: Duration::from_secs(600),
            port: None,
            do_heartbeat: true,
            multicast_enabled: true,
            restrict_to_localhost: false,
        }
    }
}

struct Shared {
    registry: Mutex<Registry>,
    stop: AtomicBool,
    running: AtomicBool,
}

/// Worker aggregating broadcasted addresses; see the module docs.
pub struct AddressReceiver {
    settings: AddressReceiverSettings,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl AddressReceiver {
    pub fn new(settings: AddressReceiverSettings) -> Self {
        AddressReceiver {
            settings,
            shared: Arc::new(Shared {
                registry: Mutex::new(HashMap::new()),
                stop: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
            worker: None,
        }
    }

    /// Bind the beacon source and the local PUB socket, then start the
    /// ingest worker.  Bind failures propagate.
    pub fn start(&mut self) -> Result<(), TransportError> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.shared.stop.store(false, Ordering::SeqCst);

        let source = create_source(&self.settings)?;
        let publisher = local_publisher(&self.settings)?;

        let shared = Arc::clone(&self.shared);
        let settings = self.settings.clone();
        let handle = std::thread::Builder::new()
            .name("address-receiver".into())
            .spawn(move || run(&shared, &source, &publisher, &settings))?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Signal the worker and wait for it to exit.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Snapshot the known addresses, filtered by substring over any service
    /// name (the receiver's default filter when `name` is empty).
    pub fn get(&self, name: &str) -> Vec<AddressRecord> {
        let name = if name.is_empty() {
            self.settings.name.as_str()
        } else {
            name
        };
        let registry = self.shared.registry.lock().unwrap();
        let mut records: Vec<AddressRecord> = registry
            .values()
            .filter(|record| matches_name(record, name))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.uri.cmp(&b.uri));
        tracing::debug!(count = records.len(), "returning addresses");
        records
    }
}

impl Drop for AddressReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn create_source(settings: &AddressReceiverSettings) -> Result<BeaconSource, TransportError> {
    let port = config().broadcast_port;
    if !settings.multicast_enabled {
        return Ok(BeaconSource::Simple(SimpleReceiver::new(Some(port))?));
    }
    let mut retries = 0;
    loop {
        match BeaconReceiver::new(port, None) {
            Ok(receiver) => {
                receiver.set_timeout(Some(RECV_TIMEOUT))?;
                return Ok(BeaconSource::Multicast(receiver));
            }
            Err(e) if is_enodev(&e) && retries < BIND_RETRIES => {
                retries += 1;
                tracing::warn!(retries, "no multicast device yet, retrying: {e}");
                std::thread::sleep(BIND_RETRY_WAIT);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn is_enodev(e: &BeaconError) -> bool {
    matches!(e, BeaconError::Io(io) if io.raw_os_error() == Some(ENODEV))
}

#[cfg(not(unix))]
fn is_enodev(_e: &BeaconError) -> bool {
    false
}

fn local_publisher(settings: &AddressReceiverSettings) -> Result<AnyPublisher, TransportError> {
    let port = settings.port.unwrap_or_else(|| config().address_publish_port);
    let mut publisher = create_publisher_from_settings(PublishSettings {
        name: "address_receiver".into(),
        port,
        aliases: vec!["addresses".into()],
        ..Default::default()
    })?;
    publisher.start()?;
    Ok(publisher)
}

fn run(
    shared: &Shared,
    source: &BeaconSource,
    publisher: &AnyPublisher,
    settings: &AddressReceiverSettings,
) {
    shared.running.store(true, Ordering::SeqCst);
    let mut last_sweep: Option<Instant> = None;
    let sweep_interval = settings.max_age / 20;

    while !shared.stop.load(Ordering::SeqCst) {
        let packet = source.recv(RECV_TIMEOUT);

        // Age out stale entries and keep the local publisher beating no
        // matter whether a beacon arrived.
        if last_sweep.is_none_or(|t| t.elapsed() > sweep_interval) {
            last_sweep = Some(Instant::now());
            let notices = {
                let mut registry = shared.registry.lock().unwrap();
                sweep_registry(&mut registry, settings.max_age, Utc::now())
            };
            for notice in notices {
                if let Err(e) = publisher.send(&notice.encode()) {
                    tracing::error!("could not publish removal notice: {e}");
                }
            }
        }
        if settings.do_heartbeat {
            if let Err(e) = publisher.heartbeat(HEARTBEAT_MIN_INTERVAL) {
                tracing::error!("address receiver heartbeat failed: {e}");
            }
        }

        let (data, fromaddr) = match packet {
            Ok(received) => received,
            Err(TransportError::Timeout) => continue,
            Err(e) => {
                if !shared.stop.load(Ordering::SeqCst) {
                    tracing::error!("beacon receive failed: {e}");
                }
                continue;
            }
        };

        if settings.restrict_to_localhost && !from_local_host(fromaddr) {
            continue;
        }

        let msg = match Message::decode(&data) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!("dropping undecodable beacon: {e}");
                continue;
            }
        };

        let notice = {
            let mut registry = shared.registry.lock().unwrap();
            apply_beacon(&mut registry, &msg, Utc::now())
        };
        if let Some(notice) = notice {
            tracing::info!("publish add '{notice}'");
            if let Err(e) = publisher.send(&notice.encode()) {
                tracing::error!("could not publish add notice: {e}");
            }
        }
    }

    source.close();
    shared.running.store(false, Ordering::SeqCst);
}

/// `true` when the datagram came from one of this host's own addresses.
///
/// Packets with no source (the simple receiver) always pass.
fn from_local_host(fromaddr: Option<SocketAddr>) -> bool {
    let Some(addr) = fromaddr else {
        return true;
    };
    local_addresses().contains(&addr.ip())
}

fn local_addresses() -> Vec<IpAddr> {
    let mut addrs = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
    for iface in netdev::get_interfaces() {
        for net in &iface.ipv4 {
            addrs.push(IpAddr::V4(net.addr()));
        }
        for net in &iface.ipv6 {
            addrs.push(IpAddr::V6(net.addr()));
        }
    }
    addrs
}
