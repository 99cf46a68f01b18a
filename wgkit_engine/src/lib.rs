//! Control plane of the wgkit tunnel engine.
//!
//! [`Engine`] maps small integer handles to tunnel sessions. Each session
//! owns a packet [`device::Device`] attached either to a host tunnel
//! descriptor or to a SOCKS5/HTTP proxy, plus an optional health-check
//! [`watchdog::Watchdog`].

pub mod device;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod reclaim;
pub mod registry;
pub mod session;
pub mod transport;
pub mod watchdog;

pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use reclaim::SweepReport;
pub use session::{SessionState, SessionSummary};
pub use transport::{ProxyProtocol, ProxySpec, TransportError};
pub use watchdog::{Prober, TcpProber, WatchdogObserver, WatchdogState, WatchdogStatus};

/// Crate version reported across the C boundary.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
