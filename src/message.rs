//! The textual wire envelope.
//!
//! A message is a single UTF-8 line:
//!
//! ```text
//! pytroll://<subject> <kind> <user@host> <ISO-timestamp> v<MAJ.MIN>[ <mime> <body>]
//! ```
//!
//! The first six tokens are separated by single spaces; the body, when
//! present, is the remainder of the line and is never split.  Subject-prefix
//! filtering on the subscriber side compares byte prefixes of the whole
//! encoded string, so `pytroll:/` + subject is the filterable prefix.
//!
//! Protocol versions: `v1.01` serializes timestamps (header and inside JSON
//! bodies) without a UTC offset, `v1.2` and later with one.  The decoder
//! accepts both forms.
//!
//! Not optimized for big messages.

use std::env;
use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::config::config;

/// The magic word introducing every wire message.
pub const MAGIC: &str = "pytroll:/";

const MIME_TEXT: &str = "text/ascii";
const MIME_JSON: &str = "application/json";
const MIME_BINARY: &str = "binary/octet-stream";

/// How much of an offending payload is quoted in decode errors.
const ERR_SNIPPET: usize = 36;

/// Message decode/validation failures.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("this is not a '{MAGIC}' message (wrong magic word)")]
    InvalidMagic,
    #[error("could not decode raw string: '{0} ...'")]
    Format(String),
    #[error("invalid message version: '{0}'")]
    Version(String),
    #[error("JSON decode failed on '{0} ...'")]
    Json(String),
    #[error("unknown mime-type '{0}'")]
    Mime(String),
    #[error("invalid {field}: '{value}'")]
    Field { field: &'static str, value: String },
}

/// A message body, tagged by mime on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// No body; no mime/body slots are emitted.
    Empty,
    /// `text/ascii`
    Text(String),
    /// `application/json`
    Json(Value),
    /// `binary/octet-stream`
    Binary(Vec<u8>),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Body::Binary(_))
    }

    /// The JSON value, if this is a JSON body.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// A subject-addressed, typed message.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Non-empty, starts with `/`.
    pub subject: String,
    /// Non-empty, e.g. `info`, `file`, `request`, `beat`.
    pub kind: String,
    /// `user@host`; filled at creation, overwritten in translate mode.
    pub sender: String,
    /// Microsecond precision.
    pub time: DateTime<Utc>,
    /// `vMAJ.MIN`.
    pub version: String,
    pub body: Body,
}

impl Message {
    /// Create a message with the process default protocol version.
    ///
    /// Sender and timestamp are filled in.
    pub fn new(subject: &str, kind: &str, body: Body) -> Result<Self, MessageError> {
        let version = config().message_version;
        Self::with_version(subject, kind, body, &version)
    }

    /// Create a message with an explicit protocol version.
    pub fn with_version(
        subject: &str,
        kind: &str,
        body: Body,
        version: &str,
    ) -> Result<Self, MessageError> {
        Self::from_parts(subject, kind, &local_sender(), now_micros(), version, body)
    }

    /// Create a message from fully explicit parts.
    pub fn from_parts(
        subject: &str,
        kind: &str,
        sender: &str,
        time: DateTime<Utc>,
        version: &str,
        body: Body,
    ) -> Result<Self, MessageError> {
        if subject.is_empty() || !subject.starts_with('/') {
            return Err(MessageError::Field {
                field: "subject",
                value: subject.to_owned(),
            });
        }
        validate_token("type", kind)?;
        validate_token("sender", sender)?;
        validate_token("version", version)?;
        Ok(Message {
            subject: subject.to_owned(),
            kind: kind.to_owned(),
            sender: sender.to_owned(),
            time,
            version: version.to_owned(),
            body: normalize_body(body),
        })
    }

    /// Decode a raw wire string.
    pub fn decode(rawstr: &str) -> Result<Self, MessageError> {
        let rest = rawstr.strip_prefix(MAGIC).ok_or(MessageError::InvalidMagic)?;
        let parts = split_wire(rest);
        if parts.len() < 5 {
            return Err(MessageError::Format(snippet(rawstr)));
        }

        let version = parts[4];
        if !is_compatible_version(version) {
            return Err(MessageError::Version(version.to_owned()));
        }

        let subject = parts[0].trim();
        let kind = parts[1].trim();
        let sender = parts[2].trim();
        if subject.is_empty() {
            return Err(MessageError::Field {
                field: "subject",
                value: subject.to_owned(),
            });
        }
        validate_token("type", kind)?;
        validate_token("sender", sender)?;

        let time = parse_iso_instant(parts[3].trim())
            .ok_or_else(|| MessageError::Format(snippet(parts[3])))?;

        let body = match parts.get(5) {
            None => Body::Empty,
            Some(mime) => {
                let raw_body = *parts.get(6).ok_or_else(|| MessageError::Format(snippet(rawstr)))?;
                match mime.to_ascii_lowercase().as_str() {
                    MIME_JSON => Body::Json(
                        serde_json::from_str(raw_body)
                            .map_err(|_| MessageError::Json(snippet(raw_body)))?,
                    ),
                    MIME_TEXT => Body::Text(raw_body.to_owned()),
                    MIME_BINARY => Body::Binary(raw_body.as_bytes().to_vec()),
                    other => return Err(MessageError::Mime(other.to_owned())),
                }
            }
        };

        Ok(Message {
            subject: subject.to_owned(),
            kind: kind.to_owned(),
            sender: sender.to_owned(),
            time,
            version: version.to_owned(),
            body: normalize_body(body),
        })
    }

    /// Encode to the wire form.
    pub fn encode(&self) -> String {
        let mut out = self.head();
        match &self.body {
            Body::Empty => {}
            Body::Text(s) => {
                out.push(' ');
                out.push_str(MIME_TEXT);
                out.push(' ');
                out.push_str(s);
            }
            Body::Json(v) => {
                out.push(' ');
                out.push_str(MIME_JSON);
                out.push(' ');
                out.push_str(&encode_json_body(v, &self.version));
            }
            Body::Binary(b) => {
                out.push(' ');
                out.push_str(MIME_BINARY);
                out.push(' ');
                out.push_str(&String::from_utf8_lossy(b));
            }
        }
        out
    }

    /// The header of the message: everything but the mime/body slots.
    pub fn head(&self) -> String {
        format!(
            "{MAGIC}{} {} {} {} {}",
            self.subject,
            self.kind,
            self.sender,
            format_instant(&self.time, &self.version),
            self.version
        )
    }

    /// The user part of the sender, or `""`.
    pub fn user(&self) -> &str {
        self.sender.split_once('@').map_or("", |(user, _)| user)
    }

    /// The host part of the sender, or `""`.
    pub fn host(&self) -> &str {
        self.sender.split_once('@').map_or("", |(_, host)| host)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// `true` when `version` is parseable by this process (not newer than the
/// configured protocol version).
pub fn is_compatible_version(version: &str) -> bool {
    version.starts_with('v') && version <= config().message_version.as_str()
}

/// `true` when `token` has the `vMAJ.MIN` shape.
pub fn is_version_token(token: &str) -> bool {
    match token.strip_prefix('v').and_then(|rest| rest.split_once('.')) {
        Some((major, minor)) => {
            !major.is_empty()
                && !minor.is_empty()
                && major.bytes().all(|b| b.is_ascii_digit())
                && minor.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

/// Parse an ISO-8601 instant, with or without a UTC offset.
///
/// Offset-free strings are taken as UTC.
pub fn parse_iso_instant(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Current time truncated to microseconds, the wire precision.
pub(crate) fn now_micros() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
}

fn format_instant(time: &DateTime<Utc>, version: &str) -> String {
    if version <= "v1.01" {
        time.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
    } else {
        time.format("%Y-%m-%dT%H:%M:%S%.6f%:z").to_string()
    }
}

fn encode_json_body(value: &Value, version: &str) -> String {
    let rendered = if version <= "v1.01" {
        let mut stripped = value.clone();
        strip_json_offsets(&mut stripped);
        serde_json::to_string(&stripped)
    } else {
        serde_json::to_string(value)
    };
    rendered.expect("serializing a JSON value cannot fail")
}

/// Rewrite every ISO-8601-with-offset string in the tree to its offset-free
/// wall-clock form (the `v1.01` convention).
fn strip_json_offsets(value: &mut Value) {
    match value {
        Value::String(s) => {
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                *s = dt.naive_local().format("%Y-%m-%dT%H:%M:%S%.6f").to_string();
            }
        }
        Value::Array(items) => items.iter_mut().for_each(strip_json_offsets),
        Value::Object(map) => map.values_mut().for_each(strip_json_offsets),
        _ => {}
    }
}

/// Split the post-magic part of a wire string into at most seven fields.
///
/// The seventh field is the raw remainder of the line (the body), internal
/// whitespace preserved.
fn split_wire(rest: &str) -> Vec<&str> {
    let mut parts = Vec::with_capacity(7);
    let mut rest = rest;
    while parts.len() < 6 {
        match rest.find(char::is_whitespace) {
            Some(idx) => {
                parts.push(&rest[..idx]);
                rest = rest[idx..].trim_start();
            }
            None => {
                if !rest.is_empty() || parts.is_empty() {
                    parts.push(rest);
                }
                return parts;
            }
        }
    }
    parts.push(rest);
    parts
}

fn normalize_body(body: Body) -> Body {
    match body {
        Body::Text(s) if s.is_empty() => Body::Empty,
        Body::Json(Value::Null) => Body::Empty,
        other => other,
    }
}

fn validate_token(field: &'static str, value: &str) -> Result<(), MessageError> {
    if value.is_empty() {
        return Err(MessageError::Field {
            field,
            value: value.to_owned(),
        });
    }
    Ok(())
}

fn snippet(s: &str) -> String {
    s.chars().take(ERR_SNIPPET).collect()
}

/// The `user@host` identity of this process.
pub fn local_sender() -> String {
    let user = env::var("USER")
        .or_else(|_| env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_owned());
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_owned());
    format!("{user}@{host}")
}
