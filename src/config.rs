//! Process-wide runtime configuration.
//!
//! Every knob has a built-in default and a `POSTTROLL_*` environment
//! override, read once when the configuration is first touched.  Tests and
//! embedding applications can replace the whole configuration with
//! [`set_config`] or adjust single fields with [`update_config`].
//!
//! Two legacy variables (`PYTROLL_MC_GROUP`, `NAMESERVER_PORT`) are still
//! honored; using them logs a deprecation warning.

use std::env;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{OnceLock, RwLock};

use thiserror::Error;

pub const DEFAULT_MC_GROUP: &str = "225.0.0.212";
pub const DEFAULT_BROADCAST_PORT: u16 = 21200;
pub const DEFAULT_ADDRESS_PUBLISH_PORT: u16 = 16543;
pub const DEFAULT_NAMESERVER_PORT: u16 = 5557;
pub const DEFAULT_PUB_MIN_PORT: u16 = 49152;
pub const DEFAULT_PUB_MAX_PORT: u16 = 65535;
pub const DEFAULT_MESSAGE_VERSION: &str = "v1.2";

/// Errors from configuration handling and the publish/subscribe factories.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("a service name is required when discovery is enabled")]
    MissingName,
    #[error("unknown backend '{0}' (expected 'unsecure_zmq' or 'secure_zmq')")]
    UnknownBackend(String),
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("missing required setting '{0}'")]
    MissingKey(&'static str),
}

/// Which socket backend to use for every zmq socket in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    #[default]
    UnsecureZmq,
    SecureZmq,
}

impl Backend {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "unsecure_zmq" => Ok(Backend::UnsecureZmq),
            "secure_zmq" => Ok(Backend::SecureZmq),
            other => Err(ConfigError::UnknownBackend(other.to_owned())),
        }
    }
}

/// The full set of process-wide settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: Backend,
    /// Multicast group for beacons; `0.0.0.0` or `255.255.255.255` selects
    /// plain broadcast.
    pub mc_group: String,
    /// Local IPv4 address of the interface to use for multicast.
    pub multicast_interface: Option<Ipv4Addr>,
    pub broadcast_port: u16,
    pub address_publish_port: u16,
    pub nameserver_port: u16,
    /// Inclusive random-port range for publishers bound to port 0.
    pub pub_min_port: u16,
    pub pub_max_port: u16,
    pub tcp_keepalive: Option<i32>,
    pub tcp_keepalive_cnt: Option<i32>,
    pub tcp_keepalive_idle: Option<i32>,
    pub tcp_keepalive_intvl: Option<i32>,
    pub server_secret_key_file: Option<PathBuf>,
    pub clients_public_keys_directory: Option<PathBuf>,
    pub client_secret_key_file: Option<PathBuf>,
    pub server_public_key_file: Option<PathBuf>,
    pub authorized_client_addresses: Vec<String>,
    pub message_version: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend: Backend::UnsecureZmq,
            mc_group: DEFAULT_MC_GROUP.to_owned(),
            multicast_interface: None,
            broadcast_port: DEFAULT_BROADCAST_PORT,
            address_publish_port: DEFAULT_ADDRESS_PUBLISH_PORT,
            nameserver_port: DEFAULT_NAMESERVER_PORT,
            pub_min_port: DEFAULT_PUB_MIN_PORT,
            pub_max_port: DEFAULT_PUB_MAX_PORT,
            tcp_keepalive: None,
            tcp_keepalive_cnt: None,
            tcp_keepalive_idle: None,
            tcp_keepalive_intvl: None,
            server_secret_key_file: None,
            clients_public_keys_directory: None,
            client_secret_key_file: None,
            server_public_key_file: None,
            authorized_client_addresses: Vec::new(),
            message_version: DEFAULT_MESSAGE_VERSION.to_owned(),
        }
    }
}

impl Config {
    /// Build a configuration from the environment on top of the defaults.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        if let Some(backend) = env_str("POSTTROLL_BACKEND") {
            match Backend::parse(&backend) {
                Ok(b) => cfg.backend = b,
                Err(e) => tracing::warn!(%backend, "ignoring POSTTROLL_BACKEND: {e}"),
            }
        }

        if let Some(group) = env_str("POSTTROLL_MC_GROUP") {
            cfg.mc_group = group;
        } else if let Some(group) = env_str("PYTROLL_MC_GROUP") {
            tracing::warn!(
                "PYTROLL_MC_GROUP is deprecated, please use POSTTROLL_MC_GROUP instead"
            );
            cfg.mc_group = group;
        }

        if let Some(iface) = env_str("POSTTROLL_MULTICAST_INTERFACE") {
            match iface.parse() {
                Ok(addr) => cfg.multicast_interface = Some(addr),
                Err(_) => {
                    tracing::warn!(%iface, "POSTTROLL_MULTICAST_INTERFACE is not an IPv4 address");
                }
            }
        }

        env_parse("POSTTROLL_BROADCAST_PORT", &mut cfg.broadcast_port);
        env_parse("POSTTROLL_ADDRESS_PUBLISH_PORT", &mut cfg.address_publish_port);

        if let Some(port) = env_str("POSTTROLL_NAMESERVER_PORT") {
            parse_into("POSTTROLL_NAMESERVER_PORT", &port, &mut cfg.nameserver_port);
        } else if let Some(port) = env_str("NAMESERVER_PORT") {
            tracing::warn!(
                "NAMESERVER_PORT is deprecated, please use POSTTROLL_NAMESERVER_PORT instead"
            );
            parse_into("NAMESERVER_PORT", &port, &mut cfg.nameserver_port);
        }

        env_parse("POSTTROLL_PUB_MIN_PORT", &mut cfg.pub_min_port);
        env_parse("POSTTROLL_PUB_MAX_PORT", &mut cfg.pub_max_port);

        cfg.tcp_keepalive = env_opt_parse("POSTTROLL_TCP_KEEPALIVE");
        cfg.tcp_keepalive_cnt = env_opt_parse("POSTTROLL_TCP_KEEPALIVE_CNT");
        cfg.tcp_keepalive_idle = env_opt_parse("POSTTROLL_TCP_KEEPALIVE_IDLE");
        cfg.tcp_keepalive_intvl = env_opt_parse("POSTTROLL_TCP_KEEPALIVE_INTVL");

        cfg.server_secret_key_file = env_str("POSTTROLL_SERVER_SECRET_KEY_FILE").map(PathBuf::from);
        cfg.clients_public_keys_directory =
            env_str("POSTTROLL_CLIENTS_PUBLIC_KEYS_DIRECTORY").map(PathBuf::from);
        cfg.client_secret_key_file = env_str("POSTTROLL_CLIENT_SECRET_KEY_FILE").map(PathBuf::from);
        cfg.server_public_key_file = env_str("POSTTROLL_SERVER_PUBLIC_KEY_FILE").map(PathBuf::from);

        if let Some(addrs) = env_str("POSTTROLL_AUTHORIZED_CLIENT_ADDRESSES") {
            cfg.authorized_client_addresses = addrs
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
        }

        if let Some(version) = env_str("POSTTROLL_MESSAGE_VERSION") {
            cfg.message_version = version;
        }

        cfg
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &'static str, slot: &mut T) {
    if let Some(raw) = env_str(key) {
        parse_into(key, &raw, slot);
    }
}

fn parse_into<T: std::str::FromStr>(key: &str, raw: &str, slot: &mut T) {
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(%key, %raw, "ignoring unparseable setting"),
    }
}

fn env_opt_parse<T: std::str::FromStr>(key: &'static str) -> Option<T> {
    let raw = env_str(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(%key, %raw, "ignoring unparseable setting");
            None
        }
    }
}

fn global() -> &'static RwLock<Config> {
    static GLOBAL: OnceLock<RwLock<Config>> = OnceLock::new();
    GLOBAL.get_or_init(|| RwLock::new(Config::from_env()))
}

/// Snapshot of the current process-wide configuration.
pub fn config() -> Config {
    global().read().unwrap().clone()
}

/// Replace the process-wide configuration.
pub fn set_config(cfg: Config) {
    *global().write().unwrap() = cfg;
}

/// Adjust single fields of the process-wide configuration in place.
pub fn update_config(f: impl FnOnce(&mut Config)) {
    f(&mut global().write().unwrap());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.backend, Backend::UnsecureZmq);
        assert_eq!(cfg.mc_group, "225.0.0.212");
        assert_eq!(cfg.broadcast_port, 21200);
        assert_eq!(cfg.address_publish_port, 16543);
        assert_eq!(cfg.nameserver_port, 5557);
        assert_eq!(cfg.pub_min_port, 49152);
        assert_eq!(cfg.pub_max_port, 65535);
        assert_eq!(cfg.message_version, "v1.2");
        assert!(cfg.tcp_keepalive.is_none());
        assert!(cfg.authorized_client_addresses.is_empty());
    }

    #[test]
    fn backend_parsing() {
        assert_eq!(Backend::parse("unsecure_zmq").unwrap(), Backend::UnsecureZmq);
        assert_eq!(Backend::parse("secure_zmq").unwrap(), Backend::SecureZmq);
        assert!(matches!(
            Backend::parse("carrier_pigeon"),
            Err(ConfigError::UnknownBackend(_))
        ));
    }

    #[test]
    fn parse_into_keeps_slot_on_garbage() {
        let mut port: u16 = 4242;
        parse_into("SOME_PORT", "not-a-port", &mut port);
        assert_eq!(port, 4242);
        parse_into("SOME_PORT", "5000", &mut port);
        assert_eq!(port, 5000);
    }
}
