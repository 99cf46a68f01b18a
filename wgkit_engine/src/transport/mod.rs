//! Transport attachment.
//!
//! A session either reads packets from a host-provided tunnel descriptor and
//! talks to its peers over a plain UDP bind, or it has no descriptor and
//! reaches its peers through a SOCKS5 or HTTP proxy.

pub mod fd;
pub mod proxy;
pub mod udp;

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;
use thiserror::Error;

pub use fd::TunDescriptor;
pub use proxy::ProxyRelay;
pub use udp::UdpBind;

/// Transport layer errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Descriptor could not be duplicated or configured
    #[error("Invalid tunnel descriptor {fd}: {source}")]
    BadDescriptor {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    /// Proxy address is empty or unparsable
    #[error("Invalid proxy address {0:?}")]
    BadProxyAddress(String),

    /// I/O error talking to the proxy
    #[error("Proxy I/O error: {0}")]
    Io(#[from] io::Error),

    /// Proxy handshake did not finish in time
    #[error("Proxy handshake timed out after {0:?}")]
    Timeout(Duration),

    /// Proxy refused the supplied credentials
    #[error("Proxy rejected credentials")]
    AuthRejected,

    /// SOCKS5 negotiation failed, including rejected credentials
    #[error("SOCKS5 negotiation failed: {0}")]
    Socks5(#[from] fast_socks5::SocksError),

    /// Proxy answered something unexpected
    #[error("Proxy protocol error: {0}")]
    Protocol(String),

    /// HTTP proxies need a peer endpoint to CONNECT to
    #[error("No peer endpoint to reach through the HTTP proxy")]
    NoEndpoint,
}

/// Proxy flavour chosen at turn-on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyProtocol {
    /// SOCKS5 with UDP ASSOCIATE
    Socks5,
    /// HTTP CONNECT, datagrams framed on the stream
    Http,
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyProtocol::Socks5 => write!(f, "socks5"),
            ProxyProtocol::Http => write!(f, "http"),
        }
    }
}

/// Proxy endpoint and credentials. Empty username and password mean no
/// authentication.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxySpec {
    pub address: String,
    pub username: String,
    pub password: String,
    pub protocol: ProxyProtocol,
}

impl ProxySpec {
    pub fn new(address: impl Into<String>, protocol: ProxyProtocol) -> Self {
        ProxySpec {
            address: address.into(),
            username: String::new(),
            password: String::new(),
            protocol,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() || !self.password.is_empty()
    }
}

impl fmt::Debug for ProxySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxySpec")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &if self.password.is_empty() { "" } else { "<redacted>" })
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// What the host hands over at turn-on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSpec {
    /// Tunnel device descriptor; the engine keeps its own duplicate
    Descriptor(RawFd),
    Proxy(ProxySpec),
}
