//! Default packet device.
//!
//! Runs up to two tasks per session: the tunnel descriptor reader, which
//! routes outbound packets into per-peer staging queues, and the transport
//! ingress, which accounts datagrams arriving from peer endpoints. Sealing
//! and opening packets is the cryptographic engine's job; it drains staged
//! packets with [`WgDevice::take_staged`] and sends with
//! [`WgDevice::send_datagram`].

use async_trait::async_trait;
use std::fs::File;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use wgkit_shared::proto::{ConfigUpdate, DeviceSnapshot, InterfaceState, Key};

use super::{Attachment, Device, DeviceContext, PeerTable};
use crate::error::{EngineError, EngineResult};
use crate::reclaim::{Reclaimer, PACKET_BUFFER_SIZE};
use crate::transport::proxy::{read_frame, socks5_udp_unwrap, socks5_udp_wrap, write_frame};
use crate::transport::{ProxyRelay, UdpBind};

/// utun prefixes every packet with a 4-byte address family.
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub const TUN_HEADER_LEN: usize = 4;
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
pub const TUN_HEADER_LEN: usize = 0;

/// Outer transport. A UDP socket slot is empty between a failed rebind and
/// the next successful one.
enum Egress {
    Udp {
        socket: Option<UdpBind>,
    },
    Socks5 {
        socket: Option<UdpBind>,
        relay: SocketAddr,
        _control: TcpStream,
    },
    Http {
        writer: tokio::sync::Mutex<OwnedWriteHalf>,
        target: SocketAddr,
    },
}

pub struct WgDevice {
    handle: i32,
    reclaimer: Arc<Reclaimer>,
    peers: Arc<Mutex<PeerTable>>,
    private_key: Option<Key>,
    listen_port: u16,
    fwmark: Option<u32>,
    kind: &'static str,
    pending: Option<Attachment>,
    egress: Option<Egress>,
    cancel: CancellationToken,
    ingress: Option<(CancellationToken, JoinHandle<()>)>,
    tun_task: Option<JoinHandle<()>>,
}

impl WgDevice {
    pub fn new(ctx: DeviceContext, attachment: Attachment) -> Self {
        WgDevice {
            handle: ctx.handle,
            reclaimer: ctx.reclaimer,
            peers: Arc::new(Mutex::new(PeerTable::default())),
            private_key: None,
            listen_port: 0,
            fwmark: None,
            kind: attachment.kind(),
            pending: Some(attachment),
            egress: None,
            cancel: CancellationToken::new(),
            ingress: None,
            tun_task: None,
        }
    }

    fn table(&self) -> MutexGuard<'_, PeerTable> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Packets routed to `peer` since the last call.
    pub fn take_staged(&self, peer: &Key) -> Vec<Vec<u8>> {
        self.table().take_staged(peer)
    }

    /// Report an authenticated packet from `peer` arriving at `endpoint`.
    pub fn observe_endpoint(&self, peer: &Key, endpoint: SocketAddr) -> bool {
        self.table().observe_endpoint(peer, endpoint)
    }

    pub fn record_handshake(&self, peer: &Key, since_epoch: Duration) {
        self.table().record_handshake(peer, since_epoch)
    }

    /// Send one sealed datagram to a peer endpoint over the outer transport.
    pub async fn send_datagram(&self, endpoint: SocketAddr, payload: &[u8]) -> io::Result<()> {
        match &self.egress {
            Some(Egress::Udp {
                socket: Some(socket),
            }) => socket.send_to(payload, endpoint).await.map(|_| ()),
            Some(Egress::Socks5 {
                socket: Some(socket),
                relay,
                ..
            }) => socket
                .send_to(&socks5_udp_wrap(endpoint, payload), *relay)
                .await
                .map(|_| ()),
            Some(Egress::Http { writer, target }) => {
                if endpoint != *target {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        format!("HTTP proxy tunnel only reaches {target}"),
                    ));
                }
                write_frame(&mut *writer.lock().await, payload).await
            }
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "device transport is down",
            )),
        }
    }

    fn spawn_udp_ingress(&mut self, socket: &UdpBind, socks: bool) {
        let token = self.cancel.child_token();
        let task = tokio::spawn(udp_ingress(
            socket.clone(),
            socks,
            Arc::clone(&self.peers),
            Arc::clone(&self.reclaimer),
            token.clone(),
            self.handle,
        ));
        self.ingress = Some((token, task));
    }

    /// Stop the ingress task and wait until it released its socket.
    async fn stop_ingress(&mut self) {
        if let Some((token, task)) = self.ingress.take() {
            token.cancel();
            let _ = task.await;
        }
    }

    fn open_udp(&self, port: u16, fwmark: Option<u32>) -> io::Result<UdpBind> {
        UdpBind::open(port, fwmark)
    }
}

#[async_trait]
impl Device for WgDevice {
    async fn up(&mut self) -> EngineResult<()> {
        if self.egress.is_some() {
            return Ok(());
        }
        let attachment = self
            .pending
            .take()
            .ok_or_else(|| EngineError::EngineStartFailed("device was closed".to_string()))?;

        match attachment {
            Attachment::Descriptor(tun) => {
                let socket = self.open_udp(self.listen_port, self.fwmark).map_err(|e| {
                    EngineError::EngineStartFailed(format!(
                        "unable to bind UDP port {}: {e}",
                        self.listen_port
                    ))
                })?;
                let tun = AsyncFd::new(tun.into_file()).map_err(|e| {
                    EngineError::EngineStartFailed(format!(
                        "unable to poll tunnel descriptor: {e}"
                    ))
                })?;
                self.listen_port = socket.local_port();
                self.tun_task = Some(tokio::spawn(tun_reader(
                    tun,
                    Arc::clone(&self.peers),
                    Arc::clone(&self.reclaimer),
                    self.cancel.child_token(),
                    self.handle,
                )));
                self.spawn_udp_ingress(&socket, false);
                self.egress = Some(Egress::Udp {
                    socket: Some(socket),
                });
            }
            Attachment::Proxy(ProxyRelay::Socks5 { control, relay }) => {
                let socket = self.open_udp(0, None).map_err(|e| {
                    EngineError::EngineStartFailed(format!("unable to bind relay socket: {e}"))
                })?;
                self.spawn_udp_ingress(&socket, true);
                self.egress = Some(Egress::Socks5 {
                    socket: Some(socket),
                    relay,
                    _control: control,
                });
            }
            Attachment::Proxy(ProxyRelay::Http { stream, target }) => {
                let (reader, writer) = stream.into_split();
                let token = self.cancel.child_token();
                let task = tokio::spawn(http_ingress(
                    reader,
                    target,
                    Arc::clone(&self.peers),
                    token.clone(),
                    self.handle,
                ));
                self.ingress = Some((token, task));
                self.egress = Some(Egress::Http {
                    writer: tokio::sync::Mutex::new(writer),
                    target,
                });
            }
        }

        info!(
            handle = self.handle,
            transport = self.kind,
            listen_port = self.listen_port,
            "Interface up"
        );
        Ok(())
    }

    async fn apply(&mut self, update: &ConfigUpdate) -> EngineResult<()> {
        let iface = &update.interface;
        let fwmark = match iface.fwmark {
            Some(0) => None,
            Some(mark) => Some(mark),
            None => self.fwmark,
        };

        // Socket changes go first: they are the only step that can fail.
        if matches!(self.egress, Some(Egress::Udp { .. })) {
            match iface.listen_port.filter(|port| *port != self.listen_port) {
                Some(port) => {
                    let socket = self.open_udp(port, fwmark).map_err(|e| {
                        EngineError::ConfigInvalid(format!("listen_port {port}: {e}"))
                    })?;
                    self.stop_ingress().await;
                    self.listen_port = socket.local_port();
                    self.spawn_udp_ingress(&socket, false);
                    self.egress = Some(Egress::Udp {
                        socket: Some(socket),
                    });
                    debug!(handle = self.handle, port = self.listen_port, "Listen port changed");
                }
                None if fwmark != self.fwmark => {
                    if let Some(Egress::Udp {
                        socket: Some(socket),
                    }) = &self.egress
                    {
                        socket
                            .set_fwmark(fwmark)
                            .map_err(|e| EngineError::ConfigInvalid(format!("fwmark: {e}")))?;
                    }
                }
                None => {}
            }
        } else if let Some(port) = iface.listen_port {
            self.listen_port = port;
        }
        self.fwmark = fwmark;

        if let Some(key) = &iface.private_key {
            if let Some(old) = self.private_key.take() {
                self.reclaimer.retire(old);
            }
            self.private_key = (!key.is_zero()).then(|| key.clone());
        }

        let reclaimer = Arc::clone(&self.reclaimer);
        let mut table = self.table();
        if iface.replace_peers {
            table.clear(&reclaimer);
        }
        for peer in &update.peers {
            table.apply(peer, &reclaimer);
        }
        Ok(())
    }

    fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            interface: InterfaceState {
                private_key: self.private_key.clone(),
                listen_port: self.listen_port,
                fwmark: self.fwmark,
            },
            peers: self.table().states(),
        }
    }

    async fn bind_update(&mut self) -> EngineResult<()> {
        let (socks, port, fwmark) = match &self.egress {
            Some(Egress::Udp { .. }) => (false, self.listen_port, self.fwmark),
            Some(Egress::Socks5 { .. }) => (true, 0, None),
            // Nothing to rebind on a stream, or before up/after close
            Some(Egress::Http { .. }) | None => return Ok(()),
        };

        self.stop_ingress().await;
        if let Some(Egress::Udp { socket } | Egress::Socks5 { socket, .. }) = &mut self.egress {
            socket.take();
        }

        let socket = self.open_udp(port, fwmark).map_err(|e| {
            EngineError::EngineStartFailed(format!("unable to rebind UDP port {port}: {e}"))
        })?;
        if !socks {
            self.listen_port = socket.local_port();
        }
        self.spawn_udp_ingress(&socket, socks);
        if let Some(Egress::Udp { socket: slot } | Egress::Socks5 { socket: slot, .. }) =
            &mut self.egress
        {
            *slot = Some(socket);
        }
        debug!(handle = self.handle, port = self.listen_port, "Bind updated");
        Ok(())
    }

    fn send_keepalives(&mut self) -> usize {
        let queued = self.table().queue_keepalives();
        debug!(handle = self.handle, peers = queued, "Queued keepalives");
        queued
    }

    fn disable_roaming(&mut self) {
        self.table().disable_roaming();
    }

    fn transport(&self) -> &'static str {
        self.kind
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        self.stop_ingress().await;
        if let Some(task) = self.tun_task.take() {
            let _ = task.await;
        }
        self.egress = None;
        self.pending = None;

        if let Some(key) = self.private_key.take() {
            self.reclaimer.retire(key);
        }
        let reclaimer = Arc::clone(&self.reclaimer);
        self.table().clear(&reclaimer);
        info!(handle = self.handle, "Interface closed");
    }
}

impl Drop for WgDevice {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn tun_reader(
    tun: AsyncFd<File>,
    peers: Arc<Mutex<PeerTable>>,
    reclaimer: Arc<Reclaimer>,
    cancel: CancellationToken,
    handle: i32,
) {
    let mut buf = reclaimer.pool().take();
    buf.resize(PACKET_BUFFER_SIZE, 0);

    loop {
        let mut guard = tokio::select! {
            _ = cancel.cancelled() => break,
            ready = tun.readable() => match ready {
                Ok(guard) => guard,
                Err(e) => {
                    warn!(handle, error = %e, "Tunnel descriptor poll failed");
                    break;
                }
            },
        };

        match guard.try_io(|inner| {
            let mut file = inner.get_ref();
            file.read(&mut buf)
        }) {
            Ok(Ok(0)) => {
                info!(handle, "Tunnel descriptor closed");
                break;
            }
            Ok(Ok(n)) if n > TUN_HEADER_LEN => {
                let routed = peers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .stage_packet(&buf[TUN_HEADER_LEN..n]);
                if !routed {
                    trace!(handle, len = n, "No peer for outbound packet");
                }
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
            Ok(Err(e)) => {
                warn!(handle, error = %e, "Tunnel descriptor read failed");
                break;
            }
            Err(_would_block) => {}
        }
    }

    reclaimer.pool().give(buf);
}

async fn udp_ingress(
    socket: UdpBind,
    socks: bool,
    peers: Arc<Mutex<PeerTable>>,
    reclaimer: Arc<Reclaimer>,
    cancel: CancellationToken,
    handle: i32,
) {
    let mut buf = reclaimer.pool().take();
    buf.resize(PACKET_BUFFER_SIZE, 0);

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        match received {
            Ok((n, from)) => {
                let (source, len) = if socks {
                    match socks5_udp_unwrap(&buf[..n]) {
                        Some((source, payload)) => (source, payload.len()),
                        None => {
                            trace!(handle, "Dropping malformed relay datagram");
                            continue;
                        }
                    }
                } else {
                    (from, n)
                };
                let known = peers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .credit_rx(source, len);
                if !known {
                    trace!(handle, from = %source, "Datagram from unknown endpoint");
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
                ) => {}
            Err(e) => {
                warn!(handle, error = %e, "UDP receive failed");
                break;
            }
        }
    }

    reclaimer.pool().give(buf);
}

async fn http_ingress(
    mut reader: OwnedReadHalf,
    target: SocketAddr,
    peers: Arc<Mutex<PeerTable>>,
    cancel: CancellationToken,
    handle: i32,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut reader) => frame,
        };
        match frame {
            Ok(Some(datagram)) => {
                peers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .credit_rx(target, datagram.len());
            }
            Ok(None) => {
                warn!(handle, "HTTP proxy closed the tunnel stream");
                break;
            }
            Err(e) => {
                warn!(handle, error = %e, "HTTP proxy stream read failed");
                break;
            }
        }
    }
}
