//! posttroll: lightweight pub/sub messaging with network service discovery.
//!
//! Publishers advertise streams of subject-addressed messages; subscribers
//! consume them filtered by subject prefix.  A discovery plane (UDP beacons
//! aggregated by an address receiver and queried through a nameserver) lets
//! subscribers locate publishers by logical service name without knowing
//! hosts or ports up front.
//!
//! The transport is ZeroMQ.  All workers are plain threads cooperating
//! through locked state and bounded socket polls, so `stop()` always takes
//! effect promptly.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use posttroll::message::{Body, Message};
//! use posttroll::publisher::Publisher;
//!
//! let mut publisher = Publisher::new("tcp://*:9000", "my_service");
//! publisher.start().unwrap();
//! let msg = Message::new("/counter", "info", Body::Text("0".into())).unwrap();
//! publisher.send(&msg.encode()).unwrap();
//! publisher.stop();
//! ```

use std::sync::Mutex;

pub mod address_receiver;
pub mod auth;
pub mod beacon;
pub mod broadcaster;
pub mod config;
pub mod message;
pub mod ns;
pub mod publisher;
pub mod socket;
pub mod subscriber;

pub use address_receiver::{AddressReceiver, AddressRecord};
pub use config::{config, set_config, Config};
pub use message::{Body, Message, MessageError};
pub use ns::{get_pub_address, get_pub_addresses, NameServer};
pub use publisher::{create_publisher_from_settings, NoisyPublisher, Publisher};
pub use subscriber::{create_subscriber_from_settings, NsSubscriber, Subscriber};

/// The process-wide zmq context, keyed by PID.
///
/// libzmq contexts do not survive a fork; callers in a forked child get a
/// fresh context transparently.
static CONTEXT: Mutex<Option<(u32, zmq::Context)>> = Mutex::new(None);

/// Return the zmq context for this process, creating it on first use or
/// after a detected fork.
pub fn context() -> zmq::Context {
    let pid = std::process::id();
    let mut guard = CONTEXT.lock().unwrap();
    match guard.as_ref() {
        Some((owner, ctx)) if *owner == pid => ctx.clone(),
        _ => {
            let ctx = zmq::Context::new();
            *guard = Some((pid, ctx.clone()));
            tracing::debug!(pid, "created zmq context");
            ctx
        }
    }
}
