//! C ABI for the wgkit tunnel engine.
//!
//! The process holds one lazily built [`Engine`]. Its configuration is read
//! with [`EngineConfig::load_default`] the first time any entry point needs
//! it, and logging is initialised at the same moment so the host logger
//! bridge is ready before the first session starts.

#![deny(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)]

pub mod darwin;
pub mod exports;
pub mod logger;

use once_cell::sync::OnceCell;
use std::sync::Mutex;
use tracing::{error, warn};
use tracing_appender::non_blocking::WorkerGuard;
use wgkit_engine::Engine;
use wgkit_shared::config::EngineConfig;
use wgkit_shared::logging;

static CONFIG: OnceCell<EngineConfig> = OnceCell::new();
static LOG_GUARD: OnceCell<Mutex<Option<WorkerGuard>>> = OnceCell::new();
static ENGINE: OnceCell<Engine> = OnceCell::new();

/// Engine configuration, loading it and starting logging on first use.
pub(crate) fn config() -> &'static EngineConfig {
    CONFIG.get_or_init(|| {
        let (config, load_error) = match EngineConfig::load_default() {
            Ok(config) => (config, None),
            Err(e) => (EngineConfig::default(), Some(e)),
        };
        LOG_GUARD.get_or_init(|| Mutex::new(logging::init_logging_from_config(&config)));
        if let Some(e) = load_error {
            warn!(error = %e, "Unable to load engine configuration, using defaults");
        }
        config
    })
}

/// The process engine, built on first use. `None` if it cannot start.
pub(crate) fn engine() -> Option<&'static Engine> {
    ENGINE
        .get_or_try_init(|| Engine::new(config().clone()))
        .map_err(|e| error!(error = %e, "Unable to start engine"))
        .ok()
}

/// The engine if something already built it.
pub(crate) fn existing_engine() -> Option<&'static Engine> {
    ENGINE.get()
}
