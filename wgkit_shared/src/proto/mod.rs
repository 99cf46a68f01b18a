//! Configuration wire formats for the wgkit tunnel engine.
//!
//! Set and turn-on accept either UAPI text or a wg-quick INI document; get
//! always answers in UAPI.

pub mod key;
pub mod uapi;
pub mod wg_quick;

pub use key::{Key, KEY_LEN};
pub use uapi::{
    ConfigUpdate, DeviceSnapshot, InterfaceState, InterfaceUpdate, PeerState, PeerUpdate,
    Section, UapiError, UapiResult,
};
pub use wg_quick::HostSettings;

/// A decoded settings document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedSettings {
    pub update: ConfigUpdate,
    /// Present only for wg-quick input
    pub host: Option<HostSettings>,
}

/// Decode settings text, picking the format from its first meaningful line.
pub fn parse_settings(text: &str) -> UapiResult<ParsedSettings> {
    if wg_quick::looks_like_wg_quick(text) {
        let (update, host) = wg_quick::parse(text)?;
        Ok(ParsedSettings {
            update,
            host: Some(host),
        })
    } else {
        Ok(ParsedSettings {
            update: ConfigUpdate::parse(text)?,
            host: None,
        })
    }
}
