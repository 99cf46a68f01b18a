//! Proxy attachment.
//!
//! SOCKS5 proxies carry WireGuard datagrams natively through UDP ASSOCIATE
//! (RFC 1928) with optional username/password authentication (RFC 1929).
//! `fast-socks5` runs the negotiation; the UDP request header on each
//! datagram is framed here because the relay socket belongs to the device.
//! HTTP proxies only offer a byte stream: the session CONNECTs to its first
//! peer endpoint and datagrams travel on the stream behind a 2-byte
//! big-endian length prefix.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use fast_socks5::client::{Config as SocksConfig, Socks5Stream};
use fast_socks5::util::target_addr::TargetAddr;
use fast_socks5::{AuthenticationMethod, Socks5Command};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::{ProxyProtocol, ProxySpec, TransportError};

// SOCKS5 UDP request header address types
const ATYP_V4: u8 = 0x01;
const ATYP_V6: u8 = 0x04;

/// Upper bound on an HTTP proxy response head.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// An established proxy association.
#[derive(Debug)]
pub enum ProxyRelay {
    /// Datagrams go to `relay` wrapped in a SOCKS5 UDP header. The association
    /// lives as long as `control` stays open.
    Socks5 {
        control: TcpStream,
        relay: SocketAddr,
    },
    /// Tunnel stream to `target`.
    Http { stream: TcpStream, target: SocketAddr },
}

impl ProxyRelay {
    /// Perform the proxy handshake. `target` is the endpoint an HTTP proxy
    /// should CONNECT to; SOCKS5 ignores it.
    pub async fn establish(
        spec: &ProxySpec,
        target: Option<SocketAddr>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        if spec.address.trim().is_empty() {
            return Err(TransportError::BadProxyAddress(spec.address.clone()));
        }

        let handshake = async {
            match spec.protocol {
                ProxyProtocol::Socks5 => socks5_associate(spec).await,
                ProxyProtocol::Http => {
                    let target = target.ok_or(TransportError::NoEndpoint)?;
                    http_connect(spec, target).await
                }
            }
        };

        let relay = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| TransportError::Timeout(timeout))??;
        info!(proxy = %spec.address, protocol = %spec.protocol, "Proxy association established");
        Ok(relay)
    }

    pub fn protocol(&self) -> ProxyProtocol {
        match self {
            ProxyRelay::Socks5 { .. } => ProxyProtocol::Socks5,
            ProxyRelay::Http { .. } => ProxyProtocol::Http,
        }
    }
}

async fn connect(spec: &ProxySpec) -> Result<TcpStream, TransportError> {
    let stream = TcpStream::connect(spec.address.as_str()).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn socks5_associate(spec: &ProxySpec) -> Result<ProxyRelay, TransportError> {
    let stream = connect(spec).await?;
    let proxy_addr = stream.peer_addr()?;

    let auth = if spec.has_credentials() {
        if spec.username.len() > 255 || spec.password.len() > 255 {
            return Err(TransportError::Protocol(
                "SOCKS5 credentials longer than 255 bytes".to_string(),
            ));
        }
        Some(AuthenticationMethod::Password {
            username: spec.username.clone(),
            password: spec.password.clone(),
        })
    } else {
        None
    };

    let mut socks = Socks5Stream::use_stream(stream, auth, SocksConfig::default()).await?;
    // Our outer UDP address is not known yet: ask with 0.0.0.0:0
    let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    let bound = socks
        .request(Socks5Command::UDPAssociate, TargetAddr::Ip(unspecified))
        .await?;

    let relay = match bound {
        TargetAddr::Ip(addr) if !addr.ip().is_unspecified() => addr,
        TargetAddr::Ip(addr) => SocketAddr::new(proxy_addr.ip(), addr.port()),
        TargetAddr::Domain(_, port) => SocketAddr::new(proxy_addr.ip(), port),
    };

    debug!(relay = %relay, "SOCKS5 UDP relay assigned");
    Ok(ProxyRelay::Socks5 {
        control: socks.get_socket(),
        relay,
    })
}

async fn http_connect(spec: &ProxySpec, target: SocketAddr) -> Result<ProxyRelay, TransportError> {
    let mut stream = connect(spec).await?;

    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if spec.has_credentials() {
        let token = STANDARD.encode(format!("{}:{}", spec.username, spec.password));
        request.push_str(&format!("Proxy-Authorization: Basic {token}\r\n"));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;

    let head = read_response_head(&mut stream).await?;
    let status = parse_status(&head)?;
    match status {
        200..=299 => {}
        407 => return Err(TransportError::AuthRejected),
        code => {
            return Err(TransportError::Protocol(format!(
                "CONNECT {target} failed with status {code}"
            )))
        }
    }

    debug!(target = %target, "HTTP CONNECT tunnel open");
    Ok(ProxyRelay::Http { stream, target })
}

/// Read up to and including the blank line. One byte at a time so nothing
/// past the head is consumed.
async fn read_response_head(stream: &mut TcpStream) -> Result<String, TransportError> {
    let mut head = Vec::with_capacity(256);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(TransportError::Protocol(
                "proxy response head too large".to_string(),
            ));
        }
        head.push(stream.read_u8().await?);
    }
    String::from_utf8(head)
        .map_err(|_| TransportError::Protocol("proxy response is not UTF-8".to_string()))
}

fn parse_status(head: &str) -> Result<u16, TransportError> {
    let status_line = head.lines().next().unwrap_or_default();
    let mut parts = status_line.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(version), Some(code)) if version.starts_with("HTTP/1.") => code
            .parse()
            .map_err(|_| TransportError::Protocol(format!("bad status line {status_line:?}"))),
        _ => Err(TransportError::Protocol(format!(
            "bad status line {status_line:?}"
        ))),
    }
}

/// Prefix a datagram with the SOCKS5 UDP request header for `target`.
pub fn socks5_udp_wrap(target: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 22);
    out.extend_from_slice(&[0, 0, 0]);
    match target.ip() {
        IpAddr::V4(ip) => {
            out.push(ATYP_V4);
            out.extend_from_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            out.push(ATYP_V6);
            out.extend_from_slice(&ip.octets());
        }
    }
    out.extend_from_slice(&target.port().to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Split a relayed SOCKS5 datagram into its source address and payload.
/// Fragmented and domain-addressed datagrams are not accepted.
pub fn socks5_udp_unwrap(datagram: &[u8]) -> Option<(SocketAddr, &[u8])> {
    if datagram.len() < 4 || datagram[2] != 0 {
        return None;
    }
    let (ip, rest) = match datagram[3] {
        ATYP_V4 if datagram.len() >= 10 => {
            let octets: [u8; 4] = datagram[4..8].try_into().ok()?;
            (IpAddr::V4(Ipv4Addr::from(octets)), &datagram[8..])
        }
        ATYP_V6 if datagram.len() >= 22 => {
            let octets: [u8; 16] = datagram[4..20].try_into().ok()?;
            (IpAddr::V6(Ipv6Addr::from(octets)), &datagram[20..])
        }
        _ => return None,
    };
    let port = u16::from_be_bytes([rest[0], rest[1]]);
    Some((SocketAddr::new(ip, port), &rest[2..]))
}

/// Write one length-prefixed datagram to a stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> std::io::Result<()> {
    let len = u16::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "datagram larger than 65535 bytes")
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await
}

/// Read one length-prefixed datagram. `Ok(None)` on clean EOF.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 2];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let mut payload = vec![0u8; u16::from_be_bytes(len_buf) as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socks5_udp_header() {
        let target: SocketAddr = "192.0.2.7:51820".parse().unwrap();
        let wrapped = socks5_udp_wrap(target, b"hello");
        assert_eq!(&wrapped[..4], &[0, 0, 0, ATYP_V4]);
        let (from, payload) = socks5_udp_unwrap(&wrapped).unwrap();
        assert_eq!(from, target);
        assert_eq!(payload, b"hello");

        let v6: SocketAddr = "[2001:db8::9]:4500".parse().unwrap();
        let wrapped = socks5_udp_wrap(v6, b"");
        let (from, payload) = socks5_udp_unwrap(&wrapped).unwrap();
        assert_eq!(from, v6);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_socks5_unwrap_rejects_fragments_and_short_input() {
        let mut wrapped = socks5_udp_wrap("192.0.2.7:1".parse().unwrap(), b"x");
        wrapped[2] = 1;
        assert!(socks5_udp_unwrap(&wrapped).is_none());
        assert!(socks5_udp_unwrap(&[0, 0, 0, ATYP_V4, 1]).is_none());
    }

    #[test]
    fn test_parse_status_line() {
        assert_eq!(parse_status("HTTP/1.1 200 Connection established\r\n\r\n").unwrap(), 200);
        assert_eq!(parse_status("HTTP/1.0 407 Proxy Auth\r\n\r\n").unwrap(), 407);
        assert!(parse_status("SSH-2.0-OpenSSH\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn test_frames_on_a_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"one").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        drop(a);
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"one");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"");
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_socks5_relay_defaults_to_proxy_address() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut head = [0u8; 2];
            stream.read_exact(&mut head).await.unwrap();
            let mut methods = vec![0u8; head[1] as usize];
            stream.read_exact(&mut methods).await.unwrap();
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();
            // Bound to 0.0.0.0:8080
            stream
                .write_all(&[0x05, 0x00, 0x00, ATYP_V4, 0, 0, 0, 0, 0x1f, 0x90])
                .await
                .unwrap();
            let mut sink = [0u8; 16];
            while matches!(stream.read(&mut sink).await, Ok(n) if n > 0) {}
        });

        let spec = ProxySpec::new(addr.to_string(), ProxyProtocol::Socks5);
        let relay = ProxyRelay::establish(&spec, None, Duration::from_secs(2))
            .await
            .unwrap();
        match relay {
            ProxyRelay::Socks5 { relay, .. } => {
                assert_eq!(relay, "127.0.0.1:8080".parse::<SocketAddr>().unwrap())
            }
            other => panic!("unexpected relay {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_socks5_overlong_credentials() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let spec = ProxySpec::new(listener.local_addr().unwrap().to_string(), ProxyProtocol::Socks5)
            .with_credentials("u".repeat(256), "pw");
        let err = ProxyRelay::establish(&spec, None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_http_requires_endpoint() {
        let spec = ProxySpec::new("127.0.0.1:9", ProxyProtocol::Http);
        let err = ProxyRelay::establish(&spec, None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NoEndpoint));
    }

    #[tokio::test]
    async fn test_empty_proxy_address() {
        let spec = ProxySpec::new("", ProxyProtocol::Socks5);
        let err = ProxyRelay::establish(&spec, None, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::BadProxyAddress(_)));
    }
}
