//! Health-check watchdog.
//!
//! One optional background task per session probing a reachability target
//! on a fixed interval. Suspending keeps the task and its target; stopping
//! ends it. Status is published on a watch channel owned by the session so
//! observers keep reading it after the session is gone.

use async_trait::async_trait;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wgkit_shared::config::{RecoveryPolicy, WatchdogConfig};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Stopped,
    Running,
    Suspended,
}

/// Published watchdog state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogStatus {
    pub state: WatchdogState,
    pub target: Option<SocketAddr>,
    pub probes_sent: u64,
    pub consecutive_failures: u32,
    pub last_probe_ok: Option<bool>,
    /// Recovery actions triggered so far
    pub recoveries: u64,
}

impl Default for WatchdogStatus {
    fn default() -> Self {
        WatchdogStatus {
            state: WatchdogState::Stopped,
            target: None,
            probes_sent: 0,
            consecutive_failures: 0,
            last_probe_ok: None,
            recoveries: 0,
        }
    }
}

/// Read side of a session's watchdog status.
#[derive(Debug, Clone)]
pub struct WatchdogObserver {
    rx: watch::Receiver<WatchdogStatus>,
}

impl WatchdogObserver {
    pub(crate) fn new(rx: watch::Receiver<WatchdogStatus>) -> Self {
        WatchdogObserver { rx }
    }

    pub fn status(&self) -> WatchdogStatus {
        self.rx.borrow().clone()
    }

    pub fn state(&self) -> WatchdogState {
        self.rx.borrow().state
    }
}

/// Parse `ip`, `ip:port` or `[v6]:port`. A bare address gets `default_port`.
pub fn parse_probe_target(address: &str, default_port: u16) -> EngineResult<SocketAddr> {
    let address = address.trim();
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let bare = address
        .strip_prefix('[')
        .and_then(|a| a.strip_suffix(']'))
        .unwrap_or(address);
    bare.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, default_port))
        .map_err(|_| EngineError::ConfigInvalid(format!("invalid probe address {address:?}")))
}

/// Reachability check.
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    async fn probe(&self, target: SocketAddr, timeout: Duration) -> bool;
}

/// TCP connect probe. A refused connection still proves the host answered.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, target: SocketAddr, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => true,
            Ok(Err(e)) => {
                debug!(target = %target, error = %e, "Probe failed");
                false
            }
            Err(_) => false,
        }
    }
}

/// Called when the failure threshold is reached under [`RecoveryPolicy::Rebump`].
pub type RecoveryHook = Arc<dyn Fn() + Send + Sync>;

/// Timing and recovery knobs for one watchdog.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogSettings {
    pub interval: Duration,
    pub probe_timeout: Duration,
    pub failure_threshold: u32,
    pub recovery: RecoveryPolicy,
}

impl WatchdogSettings {
    pub fn from_config(config: &WatchdogConfig, interval: Option<Duration>) -> Self {
        WatchdogSettings {
            interval: interval.unwrap_or_else(|| config.interval()),
            probe_timeout: config.probe_timeout(),
            failure_threshold: config.failure_threshold.max(1),
            recovery: config.recovery,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Control {
    target: SocketAddr,
    suspended: bool,
}

/// A running watchdog task.
pub struct Watchdog {
    control: watch::Sender<Control>,
    status: Arc<watch::Sender<WatchdogStatus>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Watchdog {
    pub fn spawn(
        handle: i32,
        target: SocketAddr,
        settings: WatchdogSettings,
        prober: Arc<dyn Prober>,
        status: Arc<watch::Sender<WatchdogStatus>>,
        on_failure: RecoveryHook,
    ) -> Self {
        let (control, control_rx) = watch::channel(Control {
            target,
            suspended: false,
        });
        status.send_modify(|s| {
            s.state = WatchdogState::Running;
            s.target = Some(target);
            s.consecutive_failures = 0;
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            handle,
            settings,
            prober,
            control_rx,
            Arc::clone(&status),
            on_failure,
            cancel.clone(),
        ));
        info!(handle, target = %target, interval = ?settings.interval, "Health check started");

        Watchdog {
            control,
            status,
            cancel,
            task: Some(task),
        }
    }

    /// Point the watchdog at a new target and make sure it is probing.
    pub fn retarget(&self, target: SocketAddr) {
        self.control.send_modify(|c| {
            c.target = target;
            c.suspended = false;
        });
        self.status.send_modify(|s| {
            s.state = WatchdogState::Running;
            s.target = Some(target);
            s.consecutive_failures = 0;
        });
    }

    pub fn suspend(&self) {
        self.set_suspended(true);
    }

    pub fn resume(&self) {
        self.set_suspended(false);
    }

    fn set_suspended(&self, suspended: bool) {
        self.control.send_if_modified(|c| {
            let changed = c.suspended != suspended;
            c.suspended = suspended;
            changed
        });
        let state = if suspended {
            WatchdogState::Suspended
        } else {
            WatchdogState::Running
        };
        self.status.send_if_modified(|s| {
            let changed = s.state != state;
            s.state = state;
            changed
        });
    }

    pub fn state(&self) -> WatchdogState {
        self.status.borrow().state
    }

    /// End the probing task and publish [`WatchdogState::Stopped`].
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.status.send_modify(|s| s.state = WatchdogState::Stopped);
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(
    handle: i32,
    settings: WatchdogSettings,
    prober: Arc<dyn Prober>,
    mut control: watch::Receiver<Control>,
    status: Arc<watch::Sender<WatchdogStatus>>,
    on_failure: RecoveryHook,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Control { target, suspended } = *control.borrow_and_update();
        if suspended {
            continue;
        }

        let reachable = tokio::select! {
            _ = cancel.cancelled() => break,
            ok = prober.probe(target, settings.probe_timeout) => ok,
        };
        // Suspended or retargeted while probing: the outcome is stale
        if control.has_changed().unwrap_or(false) {
            continue;
        }

        let mut threshold_hit = false;
        status.send_modify(|s| {
            s.probes_sent += 1;
            s.last_probe_ok = Some(reachable);
            if reachable {
                s.consecutive_failures = 0;
                return;
            }
            s.consecutive_failures += 1;
            if s.consecutive_failures >= settings.failure_threshold {
                threshold_hit = true;
                s.consecutive_failures = 0;
                if settings.recovery == RecoveryPolicy::Rebump {
                    s.recoveries += 1;
                }
            }
        });

        if !threshold_hit {
            continue;
        }
        match settings.recovery {
            RecoveryPolicy::Rebump => {
                warn!(handle, target = %target, "Health check target unreachable, rebinding sockets");
                on_failure();
            }
            RecoveryPolicy::Observe => {
                warn!(handle, target = %target, "Health check target unreachable");
            }
        }
    }
    debug!(handle, "Health check task exited");
}
