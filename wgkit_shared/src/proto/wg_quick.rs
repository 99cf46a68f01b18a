//! wg-quick style INI configuration.
//!
//! Accepted as an alternative input format for turn-on and set. The document
//! is normalised into a [`ConfigUpdate`] that replaces every peer, plus the
//! host-side [`HostSettings`] the packet engine itself does not consume.

use ipnet::IpNet;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use super::key::Key;
use super::uapi::{ConfigUpdate, PeerUpdate, Section, UapiError, UapiResult};

/// Interface settings that belong to the host rather than the tunnel engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostSettings {
    pub addresses: Vec<IpNet>,
    /// DNS servers and search domains, as written
    pub dns: Vec<String>,
    pub mtu: Option<u16>,
    /// Health-check probe targets (`ip` or `ip:port`)
    pub check_alive: Vec<String>,
    pub check_alive_interval: Option<Duration>,
}

impl HostSettings {
    /// First health-check target, if any.
    pub fn probe_address(&self) -> Option<&str> {
        self.check_alive.first().map(String::as_str)
    }
}

/// Returns true when the first meaningful line is a section header.
pub fn looks_like_wg_quick(text: &str) -> bool {
    text.lines()
        .map(strip_comment)
        .find(|line| !line.is_empty())
        .is_some_and(|line| line.starts_with('['))
}

/// Parse a wg-quick document.
pub fn parse(text: &str) -> UapiResult<(ConfigUpdate, HostSettings)> {
    let mut update = ConfigUpdate::default();
    update.interface.replace_peers = true;
    let mut host = HostSettings::default();

    let mut section: Option<Section> = None;
    let mut seen_interface = false;
    // Peer sections must carry PublicKey; collect until the section closes.
    let mut pending: Option<PendingPeer> = None;

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let content = strip_comment(raw);
        if content.is_empty() {
            continue;
        }

        if let Some(name) = content
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
        {
            if let Some(peer) = pending.take() {
                update.peers.push(peer.finish()?);
            }
            match name.trim().to_ascii_lowercase().as_str() {
                "interface" => {
                    if seen_interface {
                        return Err(UapiError::Structure {
                            line,
                            message: "duplicate [Interface] section".to_string(),
                        });
                    }
                    seen_interface = true;
                    section = Some(Section::Interface);
                }
                "peer" => {
                    section = Some(Section::Peer);
                    pending = Some(PendingPeer::new(line));
                }
                _ => {
                    return Err(UapiError::UnknownSection {
                        line,
                        name: name.trim().to_string(),
                    })
                }
            }
            continue;
        }

        let Some((key, value)) = content.split_once('=') else {
            return Err(UapiError::Malformed {
                line,
                text: raw.to_string(),
            });
        };
        let key = key.trim();
        let value = value.trim();

        match (section, pending.as_mut()) {
            (Some(Section::Interface), _) => {
                interface_key(&mut update, &mut host, key, value, line)?
            }
            (Some(Section::Peer), Some(peer)) => peer.set(key, value, line)?,
            _ => {
                return Err(UapiError::Structure {
                    line,
                    message: format!("{key} appears before any section"),
                })
            }
        }
    }

    if let Some(peer) = pending.take() {
        update.peers.push(peer.finish()?);
    }
    if !seen_interface {
        return Err(UapiError::Structure {
            line: 0,
            message: "missing [Interface] section".to_string(),
        });
    }

    Ok((update, host))
}

fn interface_key(
    update: &mut ConfigUpdate,
    host: &mut HostSettings,
    key: &str,
    value: &str,
    line: usize,
) -> UapiResult<()> {
    match key.to_ascii_lowercase().as_str() {
        "privatekey" => update.interface.private_key = Some(parse_b64_key(key, value, line)?),
        "listenport" => {
            update.interface.listen_port = Some(
                value
                    .parse()
                    .map_err(|_| UapiError::invalid(line, key, "expected a port number"))?,
            )
        }
        "fwmark" => update.interface.fwmark = Some(parse_fwmark(key, value, line)?),
        "address" => {
            for item in split_list(value) {
                host.addresses.push(parse_address(key, item, line)?);
            }
        }
        "dns" => host.dns.extend(split_list(value).map(str::to_string)),
        "mtu" => {
            host.mtu = Some(
                value
                    .parse()
                    .map_err(|_| UapiError::invalid(line, key, "expected a number"))?,
            )
        }
        "checkalive" => {
            for item in split_list(value) {
                if item.parse::<IpAddr>().is_err() && item.parse::<SocketAddr>().is_err() {
                    return Err(UapiError::invalid(
                        line,
                        key,
                        format!("{item:?} is not an ip or ip:port"),
                    ));
                }
                host.check_alive.push(item.to_string());
            }
        }
        "checkaliveinterval" => {
            let secs: u64 = value
                .parse()
                .map_err(|_| UapiError::invalid(line, key, "expected seconds"))?;
            if secs == 0 {
                return Err(UapiError::invalid(line, key, "must be greater than 0"));
            }
            host.check_alive_interval = Some(Duration::from_secs(secs));
        }
        _ => {
            return Err(UapiError::UnknownKey {
                line,
                section: Section::Interface,
                key: key.to_string(),
            })
        }
    }
    Ok(())
}

struct PendingPeer {
    line: usize,
    public_key: Option<Key>,
    preshared_key: Option<Key>,
    endpoint: Option<SocketAddr>,
    keepalive: Option<u16>,
    allowed_ips: Vec<IpNet>,
}

impl PendingPeer {
    fn new(line: usize) -> Self {
        PendingPeer {
            line,
            public_key: None,
            preshared_key: None,
            endpoint: None,
            keepalive: None,
            allowed_ips: Vec::new(),
        }
    }

    fn set(&mut self, key: &str, value: &str, line: usize) -> UapiResult<()> {
        match key.to_ascii_lowercase().as_str() {
            "publickey" => self.public_key = Some(parse_b64_key(key, value, line)?),
            "presharedkey" => self.preshared_key = Some(parse_b64_key(key, value, line)?),
            "endpoint" => self.endpoint = Some(resolve_endpoint(key, value, line)?),
            "allowedips" => {
                for item in split_list(value) {
                    self.allowed_ips.push(
                        item.parse()
                            .map_err(|_| UapiError::invalid(line, key, format!("{item:?} is not a CIDR range")))?,
                    );
                }
            }
            "persistentkeepalive" => {
                self.keepalive = Some(if value.eq_ignore_ascii_case("off") {
                    0
                } else {
                    value
                        .parse()
                        .map_err(|_| UapiError::invalid(line, key, "expected seconds or off"))?
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

    fn finish(self) -> UapiResult<PeerUpdate> {
        let Some(public_key) = self.public_key else {
            return Err(UapiError::Structure {
                line: self.line,
                message: "[Peer] section without PublicKey".to_string(),
            });
        };
        let mut peer = PeerUpdate::new(public_key);
        peer.preshared_key = self.preshared_key;
        peer.endpoint = self.endpoint;
        peer.persistent_keepalive_interval = self.keepalive;
        peer.replace_allowed_ips = true;
        peer.allowed_ips = self.allowed_ips;
        Ok(peer)
    }
}

fn strip_comment(raw: &str) -> &str {
    match raw.find('#') {
        Some(pos) => raw[..pos].trim(),
        None => raw.trim(),
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_b64_key(key: &str, value: &str, line: usize) -> UapiResult<Key> {
    Key::from_base64(value).ok_or_else(|| UapiError::invalid(line, key, "expected a base64 key"))
}

fn parse_fwmark(key: &str, value: &str, line: usize) -> UapiResult<u32> {
    if value.eq_ignore_ascii_case("off") {
        return Ok(0);
    }
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| UapiError::invalid(line, key, "expected a number or off"))
}

/// `Address` accepts bare IPs as host routes.
fn parse_address(key: &str, value: &str, line: usize) -> UapiResult<IpNet> {
    if let Ok(net) = value.parse::<IpNet>() {
        return Ok(net);
    }
    value
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| UapiError::invalid(line, key, format!("{value:?} is not an address")))
}

fn resolve_endpoint(key: &str, value: &str, line: usize) -> UapiResult<SocketAddr> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    value
        .to_socket_addrs()
        .map_err(|e| UapiError::invalid(line, key, format!("cannot resolve {value:?}: {e}")))?
        .next()
        .ok_or_else(|| UapiError::invalid(line, key, format!("{value:?} resolved to nothing")))
}
