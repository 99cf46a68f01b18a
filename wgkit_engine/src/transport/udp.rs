//! UDP bind used to reach peers directly.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::debug;

/// A bound UDP socket. Dual-stack `[::]` when the host supports it,
/// `0.0.0.0` otherwise.
#[derive(Debug, Clone)]
pub struct UdpBind {
    socket: Arc<UdpSocket>,
    dual_stack: bool,
}

impl UdpBind {
    /// Bind `port` (0 picks one) with an optional firewall mark.
    pub fn open(port: u16, fwmark: Option<u32>) -> io::Result<Self> {
        match bind_socket(Domain::IPV6, port, fwmark) {
            Ok(socket) => Ok(UdpBind {
                socket: Arc::new(socket),
                dual_stack: true,
            }),
            Err(e)
                if e.raw_os_error() == Some(libc::EAFNOSUPPORT)
                    || e.raw_os_error() == Some(libc::EADDRNOTAVAIL) =>
            {
                debug!(error = %e, "IPv6 unavailable, binding IPv4 only");
                Ok(UdpBind {
                    socket: Arc::new(bind_socket(Domain::IPV4, port, fwmark)?),
                    dual_stack: false,
                })
            }
            Err(e) => Err(e),
        }
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Change the firewall mark in place. Only meaningful on Linux.
    pub fn set_fwmark(&self, mark: Option<u32>) -> io::Result<()> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            socket2::SockRef::from(self.socket.as_ref()).set_mark(mark.unwrap_or(0))?;
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let _ = mark;
        Ok(())
    }

    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let target = if self.dual_stack {
            to_mapped(target)
        } else {
            target
        };
        self.socket.send_to(buf, target).await
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (n, from) = self.socket.recv_from(buf).await?;
        Ok((n, canonical(from)))
    }
}

fn bind_socket(domain: Domain, port: u16, fwmark: Option<u32>) -> io::Result<UdpSocket> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    let addr: SocketAddr = if domain == Domain::IPV6 {
        socket.set_only_v6(false)?;
        (Ipv6Addr::UNSPECIFIED, port).into()
    } else {
        (Ipv4Addr::UNSPECIFIED, port).into()
    };

    #[cfg(any(target_os = "linux", target_os = "android"))]
    if let Some(mark) = fwmark.filter(|m| *m != 0) {
        socket.set_mark(mark)?;
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let _ = fwmark;

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

fn to_mapped(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) => {
            SocketAddr::V6(SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0))
        }
        v6 => v6,
    }
}

/// Undo IPv4-mapped IPv6 so peers compare equal to their configured endpoint.
pub(crate) fn canonical(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => SocketAddr::V6(v6),
        },
        v4 => v4,
    }
}
