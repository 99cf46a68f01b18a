//! WireGuard UAPI configuration text.
//!
//! The format is line oriented `key=value`. Interface keys come first; every
//! `public_key=` line opens a new peer section that runs until the next one.
//!
//! ```text
//! private_key=e84b5a6d2717c1003a13b431570353dbaca9146cf150c5f8575680feba52027a
//! listen_port=51820
//! public_key=b85996fecc9c7f1fc6d2572a76eda11d59bcd20be8e543b15ce4bd85a8e75a33
//! endpoint=192.0.2.10:51820
//! allowed_ip=10.0.0.0/24
//! ```
//!
//! A *set* document ([`ConfigUpdate`]) is a delta applied to the running
//! device. A *get* document ([`DeviceSnapshot`]) is the full device state,
//! including the read-only runtime keys.

use ipnet::IpNet;
use std::fmt::{self, Write as _};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use super::key::Key;

/// Result type for codec operations.
pub type UapiResult<T> = Result<T, UapiError>;

/// Keys only a get document may carry.
const READ_ONLY_KEYS: &[&str] = &[
    "last_handshake_time_sec",
    "last_handshake_time_nsec",
    "rx_bytes",
    "tx_bytes",
];

/// Section of a configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Interface,
    Peer,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Section::Interface => write!(f, "interface"),
            Section::Peer => write!(f, "peer"),
        }
    }
}

/// Errors produced while decoding configuration text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UapiError {
    /// Line is not a `key=value` pair
    #[error("line {line}: expected key=value, got {text:?}")]
    Malformed { line: usize, text: String },

    /// Key is not supported in this section
    #[error("line {line}: unknown {section} key {key:?}")]
    UnknownKey {
        line: usize,
        section: Section,
        key: String,
    },

    /// Runtime key sent in a set document
    #[error("line {line}: {key} is read-only")]
    ReadOnly { line: usize, key: String },

    /// Value could not be decoded
    #[error("line {line}: invalid value for {key}: {message}")]
    InvalidValue {
        line: usize,
        key: String,
        message: String,
    },

    /// wg-quick section header that is neither `[Interface]` nor `[Peer]`
    #[error("line {line}: unknown section [{name}]")]
    UnknownSection { line: usize, name: String },

    /// Document structure problem (missing or repeated sections)
    #[error("line {line}: {message}")]
    Structure { line: usize, message: String },
}

impl UapiError {
    pub(crate) fn invalid(line: usize, key: &str, message: impl Into<String>) -> Self {
        UapiError::InvalidValue {
            line,
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Interface part of a set document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceUpdate {
    /// New private key; an all-zero key clears it
    pub private_key: Option<Key>,
    /// New UDP listen port; 0 picks an ephemeral port
    pub listen_port: Option<u16>,
    /// New firewall mark; 0 clears it
    pub fwmark: Option<u32>,
    /// Drop every existing peer before applying the peer sections
    pub replace_peers: bool,
}

/// One peer section of a set document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUpdate {
    pub public_key: Key,
    /// Remove the peer instead of updating it
    pub remove: bool,
    /// Only touch the peer if it already exists
    pub update_only: bool,
    /// New preshared key; an all-zero key clears it
    pub preshared_key: Option<Key>,
    pub endpoint: Option<SocketAddr>,
    /// Seconds between keepalives; 0 disables
    pub persistent_keepalive_interval: Option<u16>,
    /// Drop existing allowed IPs before adding `allowed_ips`
    pub replace_allowed_ips: bool,
    pub allowed_ips: Vec<IpNet>,
}

impl PeerUpdate {
    pub fn new(public_key: Key) -> Self {
        PeerUpdate {
            public_key,
            remove: false,
            update_only: false,
            preshared_key: None,
            endpoint: None,
            persistent_keepalive_interval: None,
            replace_allowed_ips: false,
            allowed_ips: Vec::new(),
        }
    }

    fn set(&mut self, key: &str, value: &str, line: usize) -> UapiResult<()> {
        match key {
            "remove" => self.remove = parse_bool(key, value, line)?,
            "update_only" => self.update_only = parse_bool(key, value, line)?,
            "preshared_key" => self.preshared_key = Some(parse_hex_key(key, value, line)?),
            "endpoint" => self.endpoint = Some(parse_endpoint(key, value, line)?),
            "persistent_keepalive_interval" => {
                self.persistent_keepalive_interval = Some(parse_number(key, value, line)?)
            }
            "replace_allowed_ips" => self.replace_allowed_ips = parse_bool(key, value, line)?,
            "allowed_ip" => self.allowed_ips.push(parse_allowed_ip(key, value, line)?),
            "protocol_version" => parse_protocol_version(key, value, line)?,
            _ if READ_ONLY_KEYS.contains(&key) => {
                return Err(UapiError::ReadOnly {
                    line,
                    key: key.to_string(),
                })
            }
            _ => {
                return Err(UapiError::UnknownKey {
                    line,
                    section: Section::Peer,
                    key: key.to_string(),
                })
            }
        }
        Ok(())
    }
}

/// A UAPI set document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub interface: InterfaceUpdate,
    pub peers: Vec<PeerUpdate>,
}

impl ConfigUpdate {
    /// Decode a set document. Unknown and read-only keys are rejected.
    pub fn parse(text: &str) -> UapiResult<Self> {
        let mut update = ConfigUpdate::default();

        for (line, key, value) in pairs(text)? {
            if key == "public_key" {
                update
                    .peers
                    .push(PeerUpdate::new(parse_hex_key(key, value, line)?));
                continue;
            }

            match update.peers.last_mut() {
                Some(peer) => peer.set(key, value, line)?,
                None => match key {
                    "private_key" => {
                        update.interface.private_key = Some(parse_hex_key(key, value, line)?)
                    }
                    "listen_port" => {
                        update.interface.listen_port = Some(parse_number(key, value, line)?)
                    }
                    "fwmark" => update.interface.fwmark = Some(parse_number(key, value, line)?),
                    "replace_peers" => {
                        update.interface.replace_peers = parse_bool(key, value, line)?
                    }
                    _ => {
                        return Err(UapiError::UnknownKey {
                            line,
                            section: Section::Interface,
                            key: key.to_string(),
                        })
                    }
                },
            }
        }

        Ok(update)
    }

    /// The first endpoint of a peer that is not being removed.
    pub fn first_endpoint(&self) -> Option<SocketAddr> {
        self.peers
            .iter()
            .filter(|peer| !peer.remove)
            .find_map(|peer| peer.endpoint)
    }

    /// Encode as a set document.
    pub fn to_uapi(&self) -> String {
        let mut out = String::new();
        let iface = &self.interface;
        if let Some(key) = &iface.private_key {
            let _ = writeln!(out, "private_key={}", key.to_hex());
        }
        if let Some(port) = iface.listen_port {
            let _ = writeln!(out, "listen_port={port}");
        }
        if let Some(mark) = iface.fwmark {
            let _ = writeln!(out, "fwmark={mark}");
        }
        if iface.replace_peers {
            out.push_str("replace_peers=true\n");
        }

        for peer in &self.peers {
            let _ = writeln!(out, "public_key={}", peer.public_key.to_hex());
            if peer.remove {
                out.push_str("remove=true\n");
                continue;
            }
            if peer.update_only {
                out.push_str("update_only=true\n");
            }
            if let Some(psk) = &peer.preshared_key {
                let _ = writeln!(out, "preshared_key={}", psk.to_hex());
            }
            if let Some(endpoint) = peer.endpoint {
                let _ = writeln!(out, "endpoint={endpoint}");
            }
            if let Some(interval) = peer.persistent_keepalive_interval {
                let _ = writeln!(out, "persistent_keepalive_interval={interval}");
            }
            if peer.replace_allowed_ips {
                out.push_str("replace_allowed_ips=true\n");
            }
            for net in &peer.allowed_ips {
                let _ = writeln!(out, "allowed_ip={net}");
            }
        }
        out
    }
}

/// Interface part of a get document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceState {
    pub private_key: Option<Key>,
    pub listen_port: u16,
    pub fwmark: Option<u32>,
}

/// One peer of a get document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerState {
    pub public_key: Key,
    pub preshared_key: Option<Key>,
    pub protocol_version: u32,
    pub endpoint: Option<SocketAddr>,
    /// Time since the Unix epoch of the last completed handshake
    pub last_handshake: Option<Duration>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub persistent_keepalive_interval: u16,
    pub allowed_ips: Vec<IpNet>,
}

impl PeerState {
    pub fn new(public_key: Key) -> Self {
        PeerState {
            public_key,
            preshared_key: None,
            protocol_version: 1,
            endpoint: None,
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
            persistent_keepalive_interval: 0,
            allowed_ips: Vec::new(),
        }
    }
}

/// A UAPI get document: full device state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    pub interface: InterfaceState,
    pub peers: Vec<PeerState>,
}

impl DeviceSnapshot {
    pub fn peer(&self, public_key: &Key) -> Option<&PeerState> {
        self.peers.iter().find(|p| &p.public_key == public_key)
    }

    /// Encode as a get document.
    pub fn to_uapi(&self) -> String {
        let mut out = String::new();
        let iface = &self.interface;
        if let Some(key) = &iface.private_key {
            let _ = writeln!(out, "private_key={}", key.to_hex());
        }
        let _ = writeln!(out, "listen_port={}", iface.listen_port);
        if let Some(mark) = iface.fwmark {
            let _ = writeln!(out, "fwmark={mark}");
        }

        for peer in &self.peers {
            let _ = writeln!(out, "public_key={}", peer.public_key.to_hex());
            if let Some(psk) = &peer.preshared_key {
                let _ = writeln!(out, "preshared_key={}", psk.to_hex());
            }
            let _ = writeln!(out, "protocol_version={}", peer.protocol_version);
            if let Some(endpoint) = peer.endpoint {
                let _ = writeln!(out, "endpoint={endpoint}");
            }
            let handshake = peer.last_handshake.unwrap_or_default();
            let _ = writeln!(out, "last_handshake_time_sec={}", handshake.as_secs());
            let _ = writeln!(out, "last_handshake_time_nsec={}", handshake.subsec_nanos());
            let _ = writeln!(out, "tx_bytes={}", peer.tx_bytes);
            let _ = writeln!(out, "rx_bytes={}", peer.rx_bytes);
            let _ = writeln!(
                out,
                "persistent_keepalive_interval={}",
                peer.persistent_keepalive_interval
            );
            for net in &peer.allowed_ips {
                let _ = writeln!(out, "allowed_ip={net}");
            }
        }
        out
    }

    /// Decode a get document.
    pub fn parse(text: &str) -> UapiResult<Self> {
        let mut snapshot = DeviceSnapshot::default();
        let mut handshake_secs: Option<u64> = None;
        let mut handshake_nanos: u32 = 0;

        fn finish_handshake(peer: &mut PeerState, secs: Option<u64>, nanos: u32) {
            if let Some(secs) = secs {
                if secs != 0 || nanos != 0 {
                    peer.last_handshake = Some(Duration::new(secs, nanos));
                }
            }
        }

        for (line, key, value) in pairs(text)? {
            if key == "public_key" {
                if let Some(prev) = snapshot.peers.last_mut() {
                    finish_handshake(prev, handshake_secs.take(), handshake_nanos);
                }
                handshake_nanos = 0;
                snapshot
                    .peers
                    .push(PeerState::new(parse_hex_key(key, value, line)?));
                continue;
            }

            match snapshot.peers.last_mut() {
                None => match key {
                    "private_key" => {
                        snapshot.interface.private_key = Some(parse_hex_key(key, value, line)?)
                    }
                    "listen_port" => {
                        snapshot.interface.listen_port = parse_number(key, value, line)?
                    }
                    "fwmark" => {
                        let mark: u32 = parse_number(key, value, line)?;
                        snapshot.interface.fwmark = (mark != 0).then_some(mark);
                    }
                    _ => {
                        return Err(UapiError::UnknownKey {
                            line,
                            section: Section::Interface,
                            key: key.to_string(),
                        })
                    }
                },
                Some(peer) => match key {
                    "preshared_key" => {
                        let psk = parse_hex_key(key, value, line)?;
                        peer.preshared_key = (!psk.is_zero()).then_some(psk);
                    }
                    "protocol_version" => {
                        parse_protocol_version(key, value, line)?;
                        peer.protocol_version = 1;
                    }
                    "endpoint" => peer.endpoint = Some(parse_endpoint(key, value, line)?),
                    "last_handshake_time_sec" => {
                        handshake_secs = Some(parse_number(key, value, line)?)
                    }
                    "last_handshake_time_nsec" => {
                        handshake_nanos = parse_number(key, value, line)?
                    }
                    "tx_bytes" => peer.tx_bytes = parse_number(key, value, line)?,
                    "rx_bytes" => peer.rx_bytes = parse_number(key, value, line)?,
                    "persistent_keepalive_interval" => {
                        peer.persistent_keepalive_interval = parse_number(key, value, line)?
                    }
                    "allowed_ip" => peer.allowed_ips.push(parse_allowed_ip(key, value, line)?),
                    _ => {
                        return Err(UapiError::UnknownKey {
                            line,
                            section: Section::Peer,
                            key: key.to_string(),
                        })
                    }
                },
            }
        }

        if let Some(last) = snapshot.peers.last_mut() {
            finish_handshake(last, handshake_secs, handshake_nanos);
        }
        Ok(snapshot)
    }
}

/// Split a document into numbered `key=value` pairs, skipping blank lines.
fn pairs(text: &str) -> UapiResult<Vec<(usize, &str, &str)>> {
    let mut out = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        if raw.trim().is_empty() {
            continue;
        }
        let Some((key, value)) = raw.split_once('=') else {
            return Err(UapiError::Malformed {
                line,
                text: raw.to_string(),
            });
        };
        if key.is_empty() || key != key.trim() {
            return Err(UapiError::Malformed {
                line,
                text: raw.to_string(),
            });
        }
        out.push((line, key, value));
    }
    Ok(out)
}

fn parse_hex_key(key: &str, value: &str, line: usize) -> UapiResult<Key> {
    Key::from_hex(value).ok_or_else(|| UapiError::invalid(line, key, "expected 64 hex characters"))
}

fn parse_bool(key: &str, value: &str, line: usize) -> UapiResult<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(UapiError::invalid(line, key, "expected true or false")),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str, line: usize) -> UapiResult<T> {
    value
        .parse()
        .map_err(|_| UapiError::invalid(line, key, format!("{value:?} is not a valid number")))
}

fn parse_endpoint(key: &str, value: &str, line: usize) -> UapiResult<SocketAddr> {
    value
        .parse()
        .map_err(|_| UapiError::invalid(line, key, format!("{value:?} is not ip:port")))
}

fn parse_allowed_ip(key: &str, value: &str, line: usize) -> UapiResult<IpNet> {
    value
        .parse()
        .map_err(|_| UapiError::invalid(line, key, format!("{value:?} is not a CIDR range")))
}

fn parse_protocol_version(key: &str, value: &str, line: usize) -> UapiResult<()> {
    if value == "1" {
        Ok(())
    } else {
        Err(UapiError::invalid(line, key, "only protocol version 1 is supported"))
    }
}
