//! Subscribe to message streams.
//!
//! A [`Subscriber`] multiplexes any number of SUB connections, filtered by
//! subject prefix on the publishing side.  Connections can be added and
//! removed at any time, also from hook callbacks running on the receive
//! loop.  [`NsSubscriber`] resolves service names through the nameserver
//! first, and can keep itself up to date via the address-listener hook.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use posttroll::subscriber::Subscriber;
//!
//! let sub = Subscriber::new(&["tcp://127.0.0.1:40000".into()], &["/counter".into()], false)
//!     .unwrap();
//! for msg in sub.recv(Some(Duration::from_secs(2))) {
//!     match msg {
//!         Some(msg) => println!("consumer got {msg}"),
//!         None => break, // timeout: a chance to check for shutdown
//!     }
//! }
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::config::config;
use crate::message::{Message, MAGIC};
use crate::ns::get_pub_address;
use crate::socket::{client_socket, close_socket, parse_endpoint, SocketKind, TransportError};

/// Upper bound on one poll slice; the subscriber lock is never held longer,
/// so `add`/`remove`/`stop` from other threads stay prompt.
const POLL_SLICE: Duration = Duration::from_millis(100);

/// A callback fed by a hook socket on the receive thread.
pub type HookCallback = Box<dyn FnMut(Message) + Send>;

/// Prefix topics with the magic word where it is missing.
///
/// The filter is a byte prefix of the whole encoded message, so a topic
/// `/counter` has to become `pytroll://counter`.  An empty topic means all
/// messages: the bare magic prefix.
pub fn magickfy_topics(topics: &[String]) -> Vec<String> {
    topics.iter().map(|t| magickfy(t)).collect()
}

fn magickfy(topic: &str) -> String {
    if topic.starts_with(MAGIC) {
        topic.to_owned()
    } else if topic.is_empty() {
        MAGIC.to_owned()
    } else if topic.starts_with('/') {
        format!("{MAGIC}{topic}")
    } else {
        format!("{MAGIC}/{topic}")
    }
}

struct SockEntry {
    id: u64,
    uri: String,
    sock: zmq::Socket,
    is_hook: bool,
}

#[derive(Default)]
struct Inner {
    entries: Vec<SockEntry>,
    /// Stream sockets only, keyed by uri.
    by_uri: HashMap<String, u64>,
}

enum PollPass {
    Messages(Vec<Message>),
    Timeout,
    Stopped,
}

/// Multiplexing SUB-socket consumer; see the module docs.
pub struct Subscriber {
    topics: Vec<String>,
    translate: bool,
    inner: Mutex<Inner>,
    callbacks: Mutex<HashMap<u64, HookCallback>>,
    next_id: AtomicU64,
    running: AtomicBool,
}

impl Subscriber {
    /// Connect to `addresses`, subscribed to `topics` (normalized with the
    /// magic prefix).  `translate` rewrites each message's sender host to
    /// the host of the uri it arrived from.
    pub fn new(
        addresses: &[String],
        topics: &[String],
        translate: bool,
    ) -> Result<Self, TransportError> {
        let subscriber = Subscriber {
            topics: magickfy_topics(topics),
            translate,
            inner: Mutex::new(Inner::default()),
            callbacks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            running: AtomicBool::new(false),
        };
        for address in addresses {
            subscriber.add(address, None)?;
        }
        Ok(subscriber)
    }

    /// Connect a SUB socket to `address`.  Adding a known address is a
    /// no-op; `topics` of `None` (or empty) uses the subscriber's topics.
    pub fn add(&self, address: &str, topics: Option<&[String]>) -> Result<(), TransportError> {
        let topics = match topics {
            Some(t) if !t.is_empty() => magickfy_topics(t),
            _ => self.topics.clone(),
        };
        let mut inner = self.inner.lock().unwrap();
        if inner.by_uri.contains_key(address) {
            return Ok(());
        }
        tracing::info!(%address, ?topics, "subscriber adding address");
        let sock = sub_socket(address, &topics)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        inner.entries.push(SockEntry {
            id,
            uri: address.to_owned(),
            sock,
            is_hook: false,
        });
        inner.by_uri.insert(address.to_owned(), id);
        Ok(())
    }

    /// Disconnect from `address`; unknown addresses are ignored.
    pub fn remove(&self, address: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(id) = inner.by_uri.remove(address) else {
            return;
        };
        tracing::info!(%address, "subscriber removing address");
        if let Some(pos) = inner.entries.iter().position(|e| e.id == id) {
            let entry = inner.entries.remove(pos);
            close_socket(&entry.sock);
        }
    }

    /// Reconcile the connection set with `addresses`; returns whether
    /// anything changed.
    pub fn update(&self, addresses: &[String]) -> Result<bool, TransportError> {
        let current: HashSet<String> = {
            let inner = self.inner.lock().unwrap();
            inner.by_uri.keys().cloned().collect()
        };
        let wanted: HashSet<String> = addresses.iter().cloned().collect();
        let mut changed = false;
        for address in current.difference(&wanted) {
            self.remove(address);
            changed = true;
        }
        for address in wanted.difference(&current) {
            self.add(address, None)?;
            changed = true;
        }
        Ok(changed)
    }

    /// Register a SUB hook: messages arriving on it go to `callback` on the
    /// receive thread instead of being yielded.
    ///
    /// Good for operations that must run on the same thread as the receive
    /// loop, like touching the subscriber's own connection set.
    pub fn add_hook_sub(
        &self,
        address: &str,
        topics: &[String],
        callback: HookCallback,
    ) -> Result<(), TransportError> {
        let topics = magickfy_topics(topics);
        tracing::info!(%address, ?topics, "subscriber adding SUB hook");
        let sock = sub_socket(address, &topics)?;
        self.add_hook(address, sock, callback);
        Ok(())
    }

    /// Register a PULL hook.  Good for pushed `inproc` messages from
    /// another thread.
    pub fn add_hook_pull(
        &self,
        address: &str,
        callback: HookCallback,
    ) -> Result<(), TransportError> {
        tracing::info!(%address, "subscriber adding PULL hook");
        let sock = client_socket(SocketKind::Pull, address)?;
        self.add_hook(address, sock, callback);
        Ok(())
    }

    fn add_hook(&self, address: &str, sock: zmq::Socket, callback: HookCallback) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.callbacks.lock().unwrap().insert(id, callback);
        self.inner.lock().unwrap().entries.push(SockEntry {
            id,
            uri: address.to_owned(),
            sock,
            is_hook: true,
        });
    }

    /// The currently connected stream addresses.
    pub fn addresses(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.by_uri.keys().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Receive messages until stopped.
    ///
    /// The iterator yields `Some(message)` for every stream message and
    /// `None` each time `timeout` expires with nothing to read, giving the
    /// caller a heartbeat to check for shutdown.  After [`stop`](Self::stop)
    /// the iterator ends.  A `timeout` of `None` never yields `None`.
    pub fn recv(&self, timeout: Option<Duration>) -> RecvIter<'_> {
        self.running.store(true, Ordering::SeqCst);
        RecvIter {
            subscriber: self,
            timeout,
            pending: VecDeque::new(),
        }
    }

    /// Make the receive loop exit at its next iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Stop, then close every owned socket.
    pub fn close(&self) {
        self.stop();
        let mut inner = self.inner.lock().unwrap();
        for entry in inner.entries.drain(..) {
            close_socket(&entry.sock);
        }
        inner.by_uri.clear();
        self.callbacks.lock().unwrap().clear();
    }

    /// Run one bounded poll over all sockets.  Hook traffic is dispatched
    /// here; stream messages are returned.
    fn poll_pass(&self, timeout: Option<Duration>) -> PollPass {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if !self.is_running() {
                return PollPass::Stopped;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return PollPass::Timeout;
                    }
                    remaining.min(POLL_SLICE)
                }
                None => POLL_SLICE,
            };

            let harvested = self.poll_slice(slice);

            let mut stream_messages = Vec::new();
            for (id, is_hook, uri, msg) in harvested {
                if is_hook {
                    self.dispatch_hook(id, msg);
                } else {
                    stream_messages.push(self.translate_message(&uri, msg));
                }
            }
            if !stream_messages.is_empty() {
                return PollPass::Messages(stream_messages);
            }
        }
    }

    /// Poll all sockets once, holding the lock for at most `slice`.
    fn poll_slice(&self, slice: Duration) -> Vec<(u64, bool, String, Message)> {
        let inner = self.inner.lock().unwrap();
        if inner.entries.is_empty() {
            drop(inner);
            std::thread::sleep(slice);
            return Vec::new();
        }

        let mut items: Vec<zmq::PollItem<'_>> = inner
            .entries
            .iter()
            .map(|e| e.sock.as_poll_item(zmq::POLLIN))
            .collect();
        let ready = match zmq::poll(&mut items, slice.as_millis() as i64) {
            Ok(n) => n,
            Err(e) => {
                if self.is_running() {
                    tracing::error!("receive failed: {e}");
                }
                return Vec::new();
            }
        };
        if ready == 0 {
            return Vec::new();
        }

        let mut harvested = Vec::new();
        for (idx, item) in items.iter().enumerate() {
            if !item.is_readable() {
                continue;
            }
            let entry = &inner.entries[idx];
            let raw = match entry.sock.recv_string(zmq::DONTWAIT) {
                Ok(Ok(s)) => s,
                Ok(Err(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
                Err(zmq::Error::EAGAIN) => continue,
                Err(e) => {
                    if self.is_running() {
                        tracing::error!(uri = %entry.uri, "receive failed: {e}");
                    }
                    continue;
                }
            };
            match Message::decode(&raw) {
                Ok(msg) => harvested.push((entry.id, entry.is_hook, entry.uri.clone(), msg)),
                Err(e) => tracing::warn!(uri = %entry.uri, "dropping undecodable message: {e}"),
            }
        }
        harvested
    }

    /// Run a hook callback outside the socket lock, so it may call
    /// `add`/`remove`/`update` on this subscriber.
    fn dispatch_hook(&self, id: u64, msg: Message) {
        let callback = self.callbacks.lock().unwrap().remove(&id);
        if let Some(mut callback) = callback {
            callback(msg);
            self.callbacks.lock().unwrap().insert(id, callback);
        }
    }

    fn translate_message(&self, uri: &str, mut msg: Message) -> Message {
        if self.translate {
            if let Ok(endpoint) = parse_endpoint(uri) {
                msg.sender = format!("{}@{}", msg.user(), endpoint.host);
            }
        }
        msg
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.close();
    }
}

fn sub_socket(address: &str, topics: &[String]) -> Result<zmq::Socket, TransportError> {
    let sock = client_socket(SocketKind::Sub, address)?;
    for topic in topics {
        sock.set_subscribe(topic.as_bytes())?;
    }
    Ok(sock)
}

/// Iterator returned by [`Subscriber::recv`].
pub struct RecvIter<'a> {
    subscriber: &'a Subscriber,
    timeout: Option<Duration>,
    pending: VecDeque<Message>,
}

impl Iterator for RecvIter<'_> {
    type Item = Option<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(msg) = self.pending.pop_front() {
            return Some(Some(msg));
        }
        if !self.subscriber.is_running() {
            return None;
        }
        match self.subscriber.poll_pass(self.timeout) {
            PollPass::Messages(messages) => {
                self.pending.extend(messages);
                self.pending.pop_front().map(Some)
            }
            PollPass::Timeout => Some(None),
            PollPass::Stopped => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Address listener
// ---------------------------------------------------------------------------

/// Hook the subscriber to a nameserver's address feed: added services show
/// up as new connections, removed ones are dropped.
pub fn add_address_listener(
    subscriber: &Arc<Subscriber>,
    services: Vec<String>,
    nameserver: &str,
) -> Result<(), TransportError> {
    let address = format!("tcp://{nameserver}:{}", config().address_publish_port);
    let weak: Weak<Subscriber> = Arc::downgrade(subscriber);
    let callback: HookCallback = Box::new(move |msg| {
        if let Some(subscriber) = weak.upgrade() {
            handle_address_message(&subscriber, &services, &msg);
        }
    });
    subscriber.add_hook_sub(&address, &["/address".to_owned()], callback)
}

fn handle_address_message(subscriber: &Subscriber, services: &[String], msg: &Message) {
    let Some(body) = msg.body.as_json() else {
        return;
    };
    let Some(uri) = body.get("URI").and_then(Value::as_str) else {
        return;
    };
    let status = body.get("status").and_then(Value::as_bool).unwrap_or(true);
    if !status {
        tracing::debug!(%uri, "removing address");
        subscriber.remove(uri);
        return;
    }

    let msg_services: Vec<&str> = body
        .get("service")
        .and_then(Value::as_array)
        .map(|names| names.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();
    let wanted = services.is_empty()
        || services
            .iter()
            .any(|service| service.is_empty() || msg_services.contains(&service.as_str()));
    if wanted {
        tracing::debug!(%uri, "adding address");
        if let Err(e) = subscriber.add(uri, None) {
            tracing::error!(%uri, "could not add address: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Nameserver-backed subscription
// ---------------------------------------------------------------------------

/// Subscribe to services by name, resolving addresses via the nameserver.
///
/// An empty service name means every service.  With `addr_listener` the
/// subscriber keeps tracking services as they come and go on the network.
pub struct NsSubscriber {
    services: Vec<String>,
    topics: Vec<String>,
    addr_listener: bool,
    addresses: Vec<String>,
    timeout: Duration,
    translate: bool,
    nameserver: String,
    subscriber: Option<Arc<Subscriber>>,
}

impl NsSubscriber {
    pub fn new(
        services: Vec<String>,
        topics: Vec<String>,
        addr_listener: bool,
        addresses: Vec<String>,
        timeout: Duration,
        translate: bool,
        nameserver: &str,
    ) -> Self {
        NsSubscriber {
            services,
            topics,
            addr_listener,
            addresses,
            timeout,
            translate,
            nameserver: nameserver.to_owned(),
            subscriber: None,
        }
    }

    /// Resolve the configured services and return the ready subscriber.
    ///
    /// Services with no address by the deadline are logged and skipped; the
    /// subscriber runs with whatever it has and, with the address listener
    /// on, picks them up later.
    pub fn start(&mut self) -> Result<Arc<Subscriber>, TransportError> {
        tracing::debug!(topics = ?self.topics, "subscribing to topics");
        let subscriber = Arc::new(Subscriber::new(
            &self.addresses,
            &self.topics,
            self.translate,
        )?);

        if self.addr_listener {
            add_address_listener(&subscriber, self.services.clone(), &self.nameserver)?;
        }

        for service in &self.services {
            let addresses = get_addr_loop(service, self.timeout, &self.nameserver);
            if addresses.is_empty() {
                tracing::warn!(%service, "can't get any address for service");
                continue;
            }
            tracing::debug!(%service, ?addresses, "got addresses");
            for address in addresses {
                subscriber.add(&address, None)?;
            }
        }

        self.subscriber = Some(Arc::clone(&subscriber));
        Ok(subscriber)
    }

    /// Close the underlying subscriber.
    pub fn stop(&mut self) {
        if let Some(subscriber) = self.subscriber.take() {
            subscriber.close();
        }
    }
}

/// Poll the nameserver for `service` every second until the deadline.
fn get_addr_loop(service: &str, timeout: Duration, nameserver: &str) -> Vec<String> {
    let deadline = Instant::now() + timeout;
    loop {
        match get_pub_address(service, Duration::from_secs(1), nameserver) {
            Ok(records) if !records.is_empty() => {
                return records.into_iter().map(|r| r.uri).collect();
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(%service, "nameserver not answering yet: {e}"),
        }
        if Instant::now() >= deadline {
            return Vec::new();
        }
        std::thread::sleep(Duration::from_secs(1));
    }
}

// ---------------------------------------------------------------------------
// The Subscribe factory
// ---------------------------------------------------------------------------

/// Where to find the nameserver, if at all.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum NameserverHost {
    /// `localhost` (the default).
    #[default]
    Localhost,
    Host(String),
    /// No nameserver: connect only to explicitly given addresses.
    Disabled,
}

/// Settings for [`create_subscriber_from_settings`].
#[derive(Debug, Clone)]
pub struct SubscribeSettings {
    pub services: Vec<String>,
    pub topics: Vec<String>,
    pub addr_listener: bool,
    pub addresses: Vec<String>,
    pub timeout: Duration,
    pub translate: bool,
    pub nameserver: NameserverHost,
}

impl Default for SubscribeSettings {
    fn default() -> Self {
        SubscribeSettings {
            services: Vec::new(),
            // One empty topic: subscribe to everything.
            topics: vec![String::new()],
            addr_listener: false,
            addresses: Vec::new(),
            timeout: Duration::from_secs(10),
            translate: false,
            nameserver: NameserverHost::default(),
        }
    }
}

/// Pick and start a subscriber from the settings.
///
/// Explicit addresses with the nameserver disabled yield a plain
/// [`Subscriber`] and no discovery traffic; everything else goes through
/// [`NsSubscriber`].
pub fn create_subscriber_from_settings(
    settings: SubscribeSettings,
) -> Result<Arc<Subscriber>, TransportError> {
    if !settings.addresses.is_empty() && settings.nameserver == NameserverHost::Disabled {
        return Ok(Arc::new(Subscriber::new(
            &settings.addresses,
            &settings.topics,
            settings.translate,
        )?));
    }
    let nameserver = match &settings.nameserver {
        NameserverHost::Host(host) => host.clone(),
        _ => "localhost".to_owned(),
    };
    NsSubscriber::new(
        settings.services,
        settings.topics,
        settings.addr_listener,
        settings.addresses,
        settings.timeout,
        settings.translate,
        &nameserver,
    )
    .start()
}
