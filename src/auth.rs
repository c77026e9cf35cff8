//! CURVE key material and the process-wide ZAP authenticator.
//!
//! Server sockets in the secure backend load a server certificate and turn
//! CURVE on; client sockets load a client certificate plus the server's
//! public key.  One authenticator thread per process answers libzmq's ZAP
//! requests (`inproc://zeromq.zap.01`) against a directory of authorized
//! client public keys and an additive address allow-list.
//!
//! Certificates are stored in the conventional two-file form: `name.key`
//! holds the public key, `name.key_secret` both keys.

use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use thiserror::Error;

use crate::config::config;
use crate::context;

const ZAP_ENDPOINT: &str = "inproc://zeromq.zap.01";
const ZAP_VERSION: &[u8] = b"1.0";
/// Poll granularity of the ZAP loop; bounds how long `stop` can take.
const ZAP_POLL_MS: i64 = 100;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("zmq: {0}")]
    Zmq(#[from] zmq::Error),
    #[error("malformed certificate file '{0}'")]
    Malformed(String),
    #[error("bad z85 key encoding: {0}")]
    Key(String),
    #[error("missing key material: {0}")]
    MissingKey(&'static str),
}

// ---------------------------------------------------------------------------
// Certificates
// ---------------------------------------------------------------------------

/// A CURVE certificate: z85-encoded public key, optionally the secret key.
#[derive(Debug, Clone)]
pub struct Certificate {
    pub public: String,
    pub secret: Option<String>,
}

impl Certificate {
    /// Load a certificate file (`*.key` or `*.key_secret`).
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        let text = fs::read_to_string(path)?;
        let mut public = None;
        let mut secret = None;
        for line in text.lines() {
            if let Some(value) = parse_key_line(line, "public-key") {
                public = Some(value);
            } else if let Some(value) = parse_key_line(line, "secret-key") {
                secret = Some(value);
            }
        }
        let public =
            public.ok_or_else(|| AuthError::Malformed(path.display().to_string()))?;
        Ok(Certificate { public, secret })
    }

    /// Write this certificate to `path`.
    pub fn store(&self, path: &Path) -> Result<(), AuthError> {
        let mut text = String::from("#   ****  Generated certificate  ****\nmetadata\ncurve\n");
        text.push_str(&format!("    public-key = \"{}\"\n", self.public));
        if let Some(secret) = &self.secret {
            text.push_str(&format!("    secret-key = \"{secret}\"\n"));
        }
        fs::write(path, text)?;
        Ok(())
    }

    /// The raw 32-byte public key.
    pub fn public_bytes(&self) -> Result<Vec<u8>, AuthError> {
        z85_decode(&self.public)
    }

    /// The raw 32-byte secret key, failing when this is a public-only
    /// certificate.
    pub fn secret_bytes(&self) -> Result<Vec<u8>, AuthError> {
        let secret = self
            .secret
            .as_deref()
            .ok_or(AuthError::MissingKey("secret key"))?;
        z85_decode(secret)
    }
}

fn parse_key_line(line: &str, key: &str) -> Option<String> {
    let trimmed = line.trim();
    let rest = trimmed.strip_prefix(key)?.trim_start();
    let rest = rest.strip_prefix('=')?.trim();
    let value = rest.strip_prefix('"')?.strip_suffix('"')?;
    Some(value.to_owned())
}

pub fn z85_decode(key: &str) -> Result<Vec<u8>, AuthError> {
    zmq::z85_decode(key).map_err(|e| AuthError::Key(format!("{e:?}")))
}

pub fn z85_encode(key: &[u8]) -> Result<String, AuthError> {
    zmq::z85_encode(key).map_err(|e| AuthError::Key(format!("{e:?}")))
}

/// Load every `*.key` certificate in `dir` and return the raw public keys.
fn load_public_keys(dir: &Path) -> Result<HashSet<Vec<u8>>, AuthError> {
    let mut keys = HashSet::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("key") {
            continue;
        }
        match Certificate::load(&path).and_then(|cert| cert.public_bytes()) {
            Ok(key) => {
                keys.insert(key);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "skipping unreadable certificate: {e}");
            }
        }
    }
    Ok(keys)
}

// ---------------------------------------------------------------------------
// ZAP authenticator
// ---------------------------------------------------------------------------

struct AuthState {
    allowed_keys: Mutex<HashSet<Vec<u8>>>,
    allowed_addrs: Mutex<HashSet<String>>,
}

impl AuthState {
    fn authorize(&self, address: &[u8], mechanism: &[u8], credential: Option<&[u8]>) -> bool {
        let addrs = self.allowed_addrs.lock().unwrap();
        if !addrs.is_empty() {
            let address = String::from_utf8_lossy(address);
            if !addrs.contains(address.as_ref()) {
                return false;
            }
        }
        drop(addrs);

        match mechanism {
            b"CURVE" => match credential {
                Some(key) => self.allowed_keys.lock().unwrap().contains(key),
                None => false,
            },
            // NULL connections carry no credentials; the address check above
            // is all there is.
            b"NULL" => true,
            _ => false,
        }
    }
}

/// The ZAP authenticator thread, shared by all server sockets of the
/// process.
pub struct Authenticator {
    state: Arc<AuthState>,
    stop_flag: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Authenticator {
    /// Start the authenticator on the process context.
    fn start() -> Result<Self, AuthError> {
        let state = Arc::new(AuthState {
            allowed_keys: Mutex::new(HashSet::new()),
            allowed_addrs: Mutex::new(HashSet::new()),
        });
        let stop_flag = Arc::new(AtomicBool::new(false));

        let socket = context().socket(zmq::REP)?;
        socket.bind(ZAP_ENDPOINT)?;

        let thread_state = Arc::clone(&state);
        let thread_stop = Arc::clone(&stop_flag);
        let handle = std::thread::Builder::new()
            .name("zap-authenticator".into())
            .spawn(move || zap_loop(&socket, &thread_state, &thread_stop))?;

        tracing::debug!("ZAP authenticator started");
        Ok(Authenticator {
            state,
            stop_flag,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Add addresses to the allow-list; additive, an empty list allows all.
    pub fn allow<I, S>(&self, addrs: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut allowed = self.state.allowed_addrs.lock().unwrap();
        for addr in addrs {
            allowed.insert(addr.into());
        }
    }

    /// (Re)load the authorized client public keys from a certificate
    /// directory.
    pub fn configure_curve(&self, directory: &Path) -> Result<(), AuthError> {
        let keys = load_public_keys(directory)?;
        tracing::debug!(count = keys.len(), dir = %directory.display(), "authorized client keys");
        *self.state.allowed_keys.lock().unwrap() = keys;
        Ok(())
    }

    /// Stop the thread and unbind the ZAP endpoint.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn zap_loop(socket: &zmq::Socket, state: &AuthState, stop: &AtomicBool) {
    while !stop.load(Ordering::SeqCst) {
        match socket.poll(zmq::POLLIN, ZAP_POLL_MS) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(e) => {
                tracing::error!("ZAP poll failed: {e}");
                break;
            }
        }
        let frames = match socket.recv_multipart(0) {
            Ok(frames) => frames,
            Err(e) => {
                tracing::error!("ZAP receive failed: {e}");
                break;
            }
        };
        // Request: version, request id, domain, address, identity,
        // mechanism, credentials...
        if frames.len() < 6 {
            tracing::warn!(len = frames.len(), "short ZAP request dropped");
            continue;
        }
        let request_id = frames[1].clone();
        let address = &frames[3];
        let mechanism = &frames[5];
        let credential = frames.get(6).map(Vec::as_slice);

        let ok = state.authorize(address, mechanism, credential);
        let (status, text): (&[u8], &[u8]) = if ok {
            (b"200", b"OK")
        } else {
            (b"400", b"Not authorized")
        };
        let reply: [&[u8]; 6] = [ZAP_VERSION, &request_id, status, text, b"", b""];
        if let Err(e) = socket.send_multipart(reply, 0) {
            tracing::error!("ZAP reply failed: {e}");
            break;
        }
    }
    let _ = socket.set_linger(1);
}

// ---------------------------------------------------------------------------
// Process-wide sharing
// ---------------------------------------------------------------------------

struct Shared {
    auth: Option<Arc<Authenticator>>,
    users: usize,
}

static SHARED: Mutex<Shared> = Mutex::new(Shared {
    auth: None,
    users: 0,
});

/// Handle on the shared authenticator; dropping the last handle stops it.
pub struct AuthHandle {
    auth: Arc<Authenticator>,
}

impl AuthHandle {
    pub fn authenticator(&self) -> &Authenticator {
        &self.auth
    }
}

impl Drop for AuthHandle {
    fn drop(&mut self) {
        let mut shared = SHARED.lock().unwrap();
        shared.users = shared.users.saturating_sub(1);
        if shared.users == 0 {
            if let Some(auth) = shared.auth.take() {
                auth.stop();
                tracing::debug!("ZAP authenticator stopped");
            }
        }
    }
}

/// Acquire the process-wide authenticator, starting and configuring it from
/// the current configuration on first use.
pub fn acquire_authenticator() -> Result<AuthHandle, AuthError> {
    let mut shared = SHARED.lock().unwrap();
    if shared.auth.is_none() {
        let cfg = config();
        let dir = cfg
            .clients_public_keys_directory
            .ok_or(AuthError::MissingKey("clients_public_keys_directory"))?;
        let auth = Authenticator::start()?;
        if let Err(e) = auth.configure_curve(&dir) {
            auth.stop();
            return Err(e);
        }
        auth.allow(cfg.authorized_client_addresses);
        shared.auth = Some(Arc::new(auth));
    }
    shared.users += 1;
    let auth = Arc::clone(shared.auth.as_ref().unwrap());
    Ok(AuthHandle { auth })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn certificate_store_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let keypair = zmq::CurveKeyPair::new().unwrap();
        let cert = Certificate {
            public: z85_encode(&keypair.public_key).unwrap(),
            secret: Some(z85_encode(&keypair.secret_key).unwrap()),
        };
        let path = dir.path().join("server.key_secret");
        cert.store(&path).unwrap();

        let loaded = Certificate::load(&path).unwrap();
        assert_eq!(loaded.public, cert.public);
        assert_eq!(loaded.secret, cert.secret);
        assert_eq!(loaded.public_bytes().unwrap(), keypair.public_key.to_vec());
        assert_eq!(loaded.secret_bytes().unwrap(), keypair.secret_key.to_vec());
    }

    #[test]
    fn public_only_certificate_has_no_secret() {
        let dir = tempfile::tempdir().unwrap();
        let keypair = zmq::CurveKeyPair::new().unwrap();
        let cert = Certificate {
            public: z85_encode(&keypair.public_key).unwrap(),
            secret: None,
        };
        let path = dir.path().join("client.key");
        cert.store(&path).unwrap();

        let loaded = Certificate::load(&path).unwrap();
        assert!(loaded.secret.is_none());
        assert!(matches!(
            loaded.secret_bytes(),
            Err(AuthError::MissingKey(_))
        ));
    }

    #[test]
    fn key_directory_only_reads_key_files() {
        let dir = tempfile::tempdir().unwrap();
        let keypair = zmq::CurveKeyPair::new().unwrap();
        let cert = Certificate {
            public: z85_encode(&keypair.public_key).unwrap(),
            secret: None,
        };
        cert.store(&dir.path().join("client.key")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a certificate").unwrap();

        let keys = load_public_keys(dir.path()).unwrap();
        assert_eq!(keys.len(), 1);
        assert!(keys.contains(&keypair.public_key.to_vec()));
    }

    #[test]
    fn authorize_checks_addresses_and_keys() {
        let state = AuthState {
            allowed_keys: Mutex::new(HashSet::from([vec![1u8; 32]])),
            allowed_addrs: Mutex::new(HashSet::new()),
        };
        assert!(state.authorize(b"127.0.0.1", b"CURVE", Some(&[1u8; 32])));
        assert!(!state.authorize(b"127.0.0.1", b"CURVE", Some(&[2u8; 32])));
        assert!(!state.authorize(b"127.0.0.1", b"CURVE", None));

        state.allowed_addrs.lock().unwrap().insert("10.0.0.1".into());
        assert!(!state.authorize(b"127.0.0.1", b"CURVE", Some(&[1u8; 32])));
        assert!(state.authorize(b"10.0.0.1", b"CURVE", Some(&[1u8; 32])));
    }

    #[test]
    fn malformed_certificate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.key");
        std::fs::write(&path, "metadata\ncurve\n").unwrap();
        assert!(matches!(
            Certificate::load(&path),
            Err(AuthError::Malformed(_))
        ));
    }
}
