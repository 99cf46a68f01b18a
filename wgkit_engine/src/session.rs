//! Tunnel session.
//!
//! A session wraps one [`Device`] behind an async mutex so operations on the
//! same handle are serialised, tracks the configuration version, and owns
//! the optional health-check watchdog.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;
use wgkit_shared::config::{BindConfig, WatchdogConfig};
use wgkit_shared::proto::{HostSettings, ParsedSettings};

use crate::device::Device;
use crate::error::{guarded, guarded_sync, EngineError, EngineResult};
use crate::watchdog::{
    parse_probe_target, Prober, RecoveryHook, Watchdog, WatchdogObserver, WatchdogSettings,
    WatchdogState, WatchdogStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    /// A set-config is being applied
    Reconfiguring,
    Stopping,
    Stopped,
}

impl SessionState {
    fn is_live(self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Running | SessionState::Reconfiguring
        )
    }
}

/// Engine knobs a session needs after start.
#[derive(Clone)]
pub struct SessionSettings {
    pub bind: BindConfig,
    pub watchdog: WatchdogConfig,
    pub prober: Arc<dyn Prober>,
}

/// Point-in-time description used by diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub handle: i32,
    pub session_id: Uuid,
    pub state: SessionState,
    pub version: u64,
    pub transport: &'static str,
    pub peers: usize,
    pub watchdog: WatchdogState,
}

struct SessionInner {
    state: SessionState,
    device: Box<dyn Device>,
    version: u64,
    watchdog: Option<Watchdog>,
    host: Option<HostSettings>,
}

impl SessionInner {
    fn ensure_live(&self, handle: i32) -> EngineResult<()> {
        if self.state.is_live() {
            Ok(())
        } else {
            Err(EngineError::UnknownHandle(handle))
        }
    }
}

pub struct Session {
    handle: i32,
    id: Uuid,
    inner: tokio::sync::Mutex<SessionInner>,
    status: Arc<watch::Sender<WatchdogStatus>>,
    bump_task: Mutex<Option<CancellationToken>>,
    settings: SessionSettings,
}

impl Session {
    /// Apply the initial configuration and bring the device up. On failure
    /// the device is closed again.
    #[instrument(level = "info", skip_all, fields(handle = handle))]
    pub async fn start(
        handle: i32,
        parsed: ParsedSettings,
        mut device: Box<dyn Device>,
        settings: SessionSettings,
    ) -> EngineResult<Arc<Self>> {
        let id = Uuid::new_v4();
        let started = guarded(async {
            device.apply(&parsed.update).await.map_err(|e| match e {
                EngineError::ConfigInvalid(message) => EngineError::EngineStartFailed(message),
                other => other,
            })?;
            device.up().await
        })
        .await;

        if let Err(e) = started {
            warn!(handle, session_id = %id, error = %e, "Tunnel session failed to start");
            let _ = guarded(async {
                device.close().await;
                Ok::<(), EngineError>(())
            })
            .await;
            return Err(e);
        }

        info!(
            handle,
            session_id = %id,
            transport = device.transport(),
            peers = parsed.update.peers.len(),
            "Tunnel session running"
        );
        let (status, _) = watch::channel(WatchdogStatus::default());
        Ok(Arc::new(Session {
            handle,
            id,
            inner: tokio::sync::Mutex::new(SessionInner {
                state: SessionState::Running,
                device,
                version: 1,
                watchdog: None,
                host: parsed.host,
            }),
            status: Arc::new(status),
            bump_task: Mutex::new(None),
            settings,
        }))
    }

    pub fn handle(&self) -> i32 {
        self.handle
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Apply a delta configuration and return the new version.
    pub async fn set_config(&self, parsed: ParsedSettings) -> EngineResult<u64> {
        let mut inner = self.inner.lock().await;
        inner.ensure_live(self.handle)?;

        inner.state = SessionState::Reconfiguring;
        let applied = guarded(inner.device.apply(&parsed.update)).await;
        inner.state = SessionState::Running;
        applied?;

        if parsed.host.is_some() {
            inner.host = parsed.host;
        }
        inner.version += 1;
        info!(
            handle = self.handle,
            session_id = %self.id,
            version = inner.version,
            "Configuration applied"
        );
        Ok(inner.version)
    }

    /// Live configuration as a UAPI get document.
    pub async fn get_config(&self) -> EngineResult<String> {
        let inner = self.inner.lock().await;
        inner.ensure_live(self.handle)?;
        let snapshot = guarded_sync(|| inner.device.snapshot())?;
        Ok(snapshot.to_uapi())
    }

    /// Schedule a background socket rebind. Returns once the attempt is
    /// queued.
    pub async fn bump_sockets(self: &Arc<Self>) -> EngineResult<()> {
        self.inner.lock().await.ensure_live(self.handle)?;
        self.spawn_bump();
        Ok(())
    }

    /// Start a rebind retry loop, superseding any earlier one. A superseded
    /// loop finishes its current attempt and exits before the next.
    fn spawn_bump(self: &Arc<Self>) {
        let session = Arc::downgrade(self);
        let retries = self.settings.bind.bump_retries.max(1);
        let delay = self.settings.bind.bump_retry_delay();
        let handle = self.handle;
        let id = self.id;
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            for attempt in 1..=retries {
                if token.is_cancelled() {
                    debug!(handle, session_id = %id, attempt, "Bind update superseded");
                    return;
                }
                let Some(live) = session.upgrade() else {
                    return;
                };
                match live.try_bind_update().await {
                    Ok(Some(keepalives)) => {
                        info!(handle, session_id = %id, attempt, keepalives, "Sockets rebound");
                        return;
                    }
                    Ok(None) => return,
                    Err(e) => {
                        warn!(handle, session_id = %id, attempt, error = %e, "Unable to update bind")
                    }
                }
                drop(live);
                if attempt < retries {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
            error!(
                handle,
                session_id = %id,
                "Gave up trying to update bind; tunnel is likely dysfunctional"
            );
        });

        let previous = self
            .bump_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(cancel);
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// One rebind attempt. `Ok(None)` when the session stopped meanwhile.
    async fn try_bind_update(&self) -> EngineResult<Option<usize>> {
        let mut inner = self.inner.lock().await;
        if !inner.state.is_live() {
            return Ok(None);
        }
        guarded(inner.device.bind_update()).await?;
        guarded_sync(|| inner.device.send_keepalives()).map(Some)
    }

    pub async fn disable_roaming(&self) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_live(self.handle)?;
        guarded_sync(|| inner.device.disable_roaming())?;
        info!(handle = self.handle, session_id = %self.id, "Roaming disabled");
        Ok(())
    }

    /// Start probing `address`, or retarget a running watchdog. An empty
    /// address falls back to the configured `CheckAlive` target.
    pub async fn start_watchdog(self: &Arc<Self>, address: &str) -> EngineResult<()> {
        let mut inner = self.inner.lock().await;
        inner.ensure_live(self.handle)?;

        let address = if address.trim().is_empty() {
            inner
                .host
                .as_ref()
                .and_then(HostSettings::probe_address)
                .map(str::to_string)
                .ok_or_else(|| {
                    EngineError::ConfigInvalid("no health check address configured".to_string())
                })?
        } else {
            address.to_string()
        };
        let target = parse_probe_target(&address, self.settings.watchdog.probe_port)?;

        if let Some(watchdog) = &inner.watchdog {
            watchdog.retarget(target);
            info!(handle = self.handle, target = %target, "Health check retargeted");
            return Ok(());
        }

        let interval = inner.host.as_ref().and_then(|h| h.check_alive_interval);
        let session = Arc::downgrade(self);
        let on_failure: RecoveryHook = Arc::new(move || {
            if let Some(session) = session.upgrade() {
                session.spawn_bump();
            }
        });
        inner.watchdog = Some(Watchdog::spawn(
            self.handle,
            target,
            WatchdogSettings::from_config(&self.settings.watchdog, interval),
            Arc::clone(&self.settings.prober),
            Arc::clone(&self.status),
            on_failure,
        ));
        Ok(())
    }

    pub async fn suspend_watchdog(&self) -> EngineResult<()> {
        let inner = self.inner.lock().await;
        inner.ensure_live(self.handle)?;
        inner
            .watchdog
            .as_ref()
            .ok_or(EngineError::WatchdogNotStarted(self.handle))?
            .suspend();
        Ok(())
    }

    pub async fn resume_watchdog(&self) -> EngineResult<()> {
        let inner = self.inner.lock().await;
        inner.ensure_live(self.handle)?;
        inner
            .watchdog
            .as_ref()
            .ok_or(EngineError::WatchdogNotStarted(self.handle))?
            .resume();
        Ok(())
    }

    pub fn watchdog_status(&self) -> WatchdogStatus {
        self.status.borrow().clone()
    }

    pub fn watchdog_observer(&self) -> WatchdogObserver {
        WatchdogObserver::new(self.status.subscribe())
    }

    /// Stop the watchdog and close the device. Waits for in-flight calls on
    /// this session first. Safe to call more than once.
    #[instrument(level = "info", skip_all, fields(handle = self.handle, session_id = %self.id))]
    pub async fn stop(&self) {
        if let Some(bump) = self
            .bump_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            bump.cancel();
        }

        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Stopped {
            return;
        }
        inner.state = SessionState::Stopping;

        if let Some(mut watchdog) = inner.watchdog.take() {
            watchdog.stop().await;
        }
        self.status.send_modify(|s| s.state = WatchdogState::Stopped);

        let closed = guarded(async {
            inner.device.close().await;
            Ok::<(), EngineError>(())
        })
        .await;
        if let Err(e) = closed {
            error!(handle = self.handle, error = %e, "Device close panicked");
        }
        inner.state = SessionState::Stopped;
        info!(handle = self.handle, session_id = %self.id, "Tunnel session stopped");
    }

    pub async fn describe(&self) -> SessionSummary {
        let inner = self.inner.lock().await;
        let peers = guarded_sync(|| inner.device.snapshot().peers.len()).unwrap_or_default();
        SessionSummary {
            handle: self.handle,
            session_id: self.id,
            state: inner.state,
            version: inner.version,
            transport: inner.device.transport(),
            peers,
            watchdog: self.status.borrow().state,
        }
    }
}
