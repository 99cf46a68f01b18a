//! The packet device behind one session.
//!
//! [`Device`] is the seam between the session state machine and the data
//! plane. [`WgDevice`] is the default implementation: it owns the interface
//! and peer state, the outer transport and the descriptor read loop, and
//! stages routed packets for the cryptographic engine.

pub mod peers;
pub mod wg;

use async_trait::async_trait;
use std::sync::Arc;
use wgkit_shared::proto::{ConfigUpdate, DeviceSnapshot};

use crate::error::EngineResult;
use crate::reclaim::Reclaimer;
use crate::transport::{ProxyRelay, TunDescriptor};

pub use peers::PeerTable;
pub use wg::WgDevice;

/// Per-session inputs to a device.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub handle: i32,
    pub reclaimer: Arc<Reclaimer>,
}

/// Transport resources acquired at turn-on.
#[derive(Debug)]
pub enum Attachment {
    Descriptor(TunDescriptor),
    Proxy(ProxyRelay),
}

impl Attachment {
    pub fn kind(&self) -> &'static str {
        match self {
            Attachment::Descriptor(_) => "descriptor",
            Attachment::Proxy(relay) => match relay {
                ProxyRelay::Socks5 { .. } => "socks5",
                ProxyRelay::Http { .. } => "http",
            },
        }
    }
}

/// Operations a session performs on its device. Calls on one device are
/// serialised by the owning session.
#[async_trait]
pub trait Device: Send {
    /// Open the outer transport and start packet I/O.
    async fn up(&mut self) -> EngineResult<()>;

    /// Apply a set document. Either fully applies or leaves the device as it
    /// was.
    async fn apply(&mut self, update: &ConfigUpdate) -> EngineResult<()>;

    /// Current interface and peer state including runtime counters.
    fn snapshot(&self) -> DeviceSnapshot;

    /// Rebind network sockets. Crypto state is left alone.
    async fn bind_update(&mut self) -> EngineResult<()>;

    /// Queue a keepalive to every peer with an endpoint; returns how many.
    fn send_keepalives(&mut self) -> usize;

    /// Stop following peers' observed endpoint changes.
    fn disable_roaming(&mut self);

    /// Short transport label for logs.
    fn transport(&self) -> &'static str;

    /// Stop packet I/O and release the transport. Idempotent.
    async fn close(&mut self);
}

/// Builds the device for a new session.
pub trait DeviceFactory: Send + Sync {
    fn create(&self, ctx: DeviceContext, attachment: Attachment) -> EngineResult<Box<dyn Device>>;
}

/// Factory for [`WgDevice`].
#[derive(Debug, Default, Clone, Copy)]
pub struct WgDeviceFactory;

impl DeviceFactory for WgDeviceFactory {
    fn create(&self, ctx: DeviceContext, attachment: Attachment) -> EngineResult<Box<dyn Device>> {
        Ok(Box::new(WgDevice::new(ctx, attachment)))
    }
}
