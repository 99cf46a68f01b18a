//! Synchronous engine facade.
//!
//! The engine owns a multi-thread tokio runtime, the handle registry and the
//! reclaimer. Every public method blocks the calling thread until the
//! operation finishes, which is what the C boundary needs.

use std::future::Future;
use std::os::fd::RawFd;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use wgkit_shared::config::EngineConfig;
use wgkit_shared::proto::{parse_settings, ParsedSettings};

use crate::device::{Attachment, DeviceContext, DeviceFactory, WgDeviceFactory};
use crate::diagnostics;
use crate::error::{guarded_sync, EngineError, EngineResult};
use crate::reclaim::{Reclaimer, SweepReport};
use crate::registry::Registry;
use crate::session::{Session, SessionSettings, SessionSummary};
use crate::transport::{ProxyRelay, ProxySpec, TransportSpec, TunDescriptor};
use crate::watchdog::{Prober, TcpProber, WatchdogObserver, WatchdogStatus};

pub struct Engine {
    runtime: Runtime,
    registry: Arc<Registry>,
    reclaimer: Arc<Reclaimer>,
    factory: Arc<dyn DeviceFactory>,
    prober: Arc<dyn Prober>,
    config: EngineConfig,
    signal_task: Option<JoinHandle<()>>,
}

impl Engine {
    /// Engine with the default device and TCP prober.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        Self::with_parts(config, Arc::new(WgDeviceFactory), Arc::new(TcpProber))
    }

    pub fn with_parts(
        config: EngineConfig,
        factory: Arc<dyn DeviceFactory>,
        prober: Arc<dyn Prober>,
    ) -> EngineResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.runtime.worker_threads.max(1))
            .thread_name("wgkit-engine")
            .enable_all()
            .build()
            .map_err(|e| EngineError::EngineStartFailed(format!("unable to start runtime: {e}")))?;
        let registry = Registry::new(config.registry.max_handles);
        let signal_task = if config.diagnostics.dump_on_sigusr2 {
            diagnostics::spawn_signal_dump(&runtime, Arc::clone(&registry))
        } else {
            None
        };

        info!(
            version = crate::VERSION,
            worker_threads = config.runtime.worker_threads,
            "Engine started"
        );
        Ok(Engine {
            runtime,
            registry,
            reclaimer: Arc::new(Reclaimer::new()),
            factory,
            prober,
            config,
            signal_task,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            bind: self.config.bind.clone(),
            watchdog: self.config.watchdog.clone(),
            prober: Arc::clone(&self.prober),
        }
    }

    /// Turn on a tunnel reading packets from `fd`. The descriptor is
    /// duplicated; the caller keeps ownership of its own copy.
    pub fn turn_on(&self, settings: &str, fd: RawFd) -> EngineResult<i32> {
        self.block_on(self.create(settings, TransportSpec::Descriptor(fd)))
    }

    /// Turn on a tunnel whose peers are reached through a proxy.
    pub fn proxy_turn_on(&self, settings: &str, proxy: ProxySpec) -> EngineResult<i32> {
        self.block_on(self.create(settings, TransportSpec::Proxy(proxy)))
    }

    #[instrument(level = "info", skip_all)]
    async fn create(&self, settings: &str, transport: TransportSpec) -> EngineResult<i32> {
        let parsed = parse_off_runtime(settings).await?;
        let reservation = self.registry.reserve()?;
        let handle = reservation.handle();

        let attachment = match transport {
            TransportSpec::Descriptor(fd) => Attachment::Descriptor(TunDescriptor::attach(fd)?),
            TransportSpec::Proxy(spec) => Attachment::Proxy(
                ProxyRelay::establish(
                    &spec,
                    parsed.update.first_endpoint(),
                    self.config.proxy.connect_timeout(),
                )
                .await?,
            ),
        };
        let kind = attachment.kind();

        let ctx = DeviceContext {
            handle,
            reclaimer: Arc::clone(&self.reclaimer),
        };
        let device = guarded_sync(|| self.factory.create(ctx, attachment))??;
        let session = Session::start(handle, parsed, device, self.session_settings()).await?;

        info!(handle, session_id = %session.id(), transport = kind, "Tunnel turned on");
        reservation.commit(session);
        Ok(handle)
    }

    /// Unregister and stop a session. The handle is free again on return,
    /// not before.
    pub fn turn_off(&self, handle: i32) -> EngineResult<()> {
        let (session, slot) = self.registry.remove(handle)?;
        self.block_on(session.stop());
        drop(slot);
        info!(handle, "Tunnel turned off");
        Ok(())
    }

    pub fn set_config(&self, handle: i32, settings: &str) -> EngineResult<u64> {
        let session = self.registry.get(handle)?;
        let parsed = parse_settings(settings)?;
        self.block_on(session.set_config(parsed))
    }

    pub fn get_config(&self, handle: i32) -> EngineResult<String> {
        let session = self.registry.get(handle)?;
        self.block_on(session.get_config())
    }

    pub fn bump_sockets(&self, handle: i32) -> EngineResult<()> {
        let session = self.registry.get(handle)?;
        self.block_on(session.bump_sockets())
    }

    pub fn disable_roaming(&self, handle: i32) -> EngineResult<()> {
        let session = self.registry.get(handle)?;
        self.block_on(session.disable_roaming())
    }

    pub fn start_watchdog(&self, handle: i32, address: &str) -> EngineResult<()> {
        let session = self.registry.get(handle)?;
        self.block_on(session.start_watchdog(address))
    }

    pub fn suspend_watchdog(&self, handle: i32) -> EngineResult<()> {
        let session = self.registry.get(handle)?;
        self.block_on(session.suspend_watchdog())
    }

    pub fn resume_watchdog(&self, handle: i32) -> EngineResult<()> {
        let session = self.registry.get(handle)?;
        self.block_on(session.resume_watchdog())
    }

    pub fn watchdog_status(&self, handle: i32) -> EngineResult<WatchdogStatus> {
        Ok(self.registry.get(handle)?.watchdog_status())
    }

    /// Status reader that stays valid after the session is destroyed.
    pub fn watchdog_observer(&self, handle: i32) -> EngineResult<WatchdogObserver> {
        Ok(self.registry.get(handle)?.watchdog_observer())
    }

    /// Wipe retired key material and release idle buffers.
    pub fn run_gc(&self) -> SweepReport {
        self.reclaimer.sweep()
    }

    pub fn handles(&self) -> Vec<i32> {
        self.registry.handles()
    }

    pub fn dump_sessions(&self) -> Vec<SessionSummary> {
        self.block_on(diagnostics::dump(&self.registry))
    }

    pub fn version() -> &'static str {
        crate::VERSION
    }
}

/// Parse on the blocking pool: wg-quick endpoints may need a DNS lookup.
async fn parse_off_runtime(settings: &str) -> EngineResult<ParsedSettings> {
    let text = settings.to_string();
    tokio::task::spawn_blocking(move || parse_settings(&text))
        .await
        .map_err(|e| EngineError::Internal(format!("settings parser failed: {e}")))?
        .map_err(EngineError::from)
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(task) = self.signal_task.take() {
            task.abort();
        }
        let sessions = self.registry.drain();
        if sessions.is_empty() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            warn!(
                sessions = sessions.len(),
                "Engine dropped inside a runtime; sessions are cancelled without a clean stop"
            );
            return;
        }
        self.runtime.block_on(async {
            for session in sessions {
                session.stop().await;
            }
        });
    }
}
