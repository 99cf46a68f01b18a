//! Shared pieces of the wgkit tunnel engine.
//!
//! This crate holds what both the engine and the C boundary need: the
//! configuration wire formats, the engine's own TOML settings, and logging
//! including the bridge to the host's log callback.

pub mod config;
pub mod logging;
pub mod proto;

// Re-export commonly used items for convenience
pub use config::{ConfigError, EngineConfig, RecoveryPolicy};
pub use proto::{parse_settings, ConfigUpdate, DeviceSnapshot, Key, ParsedSettings, UapiError};
