//! Exported control surface.
//!
//! Every entry point catches panics. Integer results are non-negative on
//! success and a negative errno on failure; see `include/wireguard.h`.

use libc::{c_char, c_int};
use once_cell::sync::OnceCell;
use std::ffi::{CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use tracing::{debug, error};
use wgkit_engine::{Engine, EngineError, EngineResult, ProxyProtocol, ProxySpec};

/// Run `f` against the process engine, logging failures and translating
/// them into their C code.
fn call<T>(function: &'static str, f: impl FnOnce(&Engine) -> EngineResult<T>) -> Result<T, i32> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let engine = crate::engine()
            .ok_or_else(|| EngineError::EngineStartFailed("engine unavailable".to_string()))?;
        f(engine)
    }));
    match outcome {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            error!(function, error = %e, "Call failed");
            Err(e.code())
        }
        Err(_) => {
            error!(function, "Panic caught at the C boundary");
            Err(EngineError::Internal(String::new()).code())
        }
    }
}

fn status(result: Result<(), i32>) -> c_int {
    match result {
        Ok(()) => 0,
        Err(code) => code,
    }
}

/// Borrow a C string. Null and non-UTF-8 input are configuration errors.
unsafe fn required_str<'a>(ptr: *const c_char, what: &str) -> EngineResult<&'a str> {
    if ptr.is_null() {
        return Err(EngineError::ConfigInvalid(format!("{what} is null")));
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map_err(|_| EngineError::ConfigInvalid(format!("{what} is not UTF-8")))
}

/// Like [`required_str`] but null reads as empty.
unsafe fn optional_str<'a>(ptr: *const c_char, what: &str) -> EngineResult<&'a str> {
    if ptr.is_null() {
        Ok("")
    } else {
        unsafe { required_str(ptr, what) }
    }
}

/// Copy into a `malloc`ed, NUL-terminated buffer the caller releases with
/// `free`.
fn into_malloced(text: &str) -> *mut c_char {
    let bytes = text.as_bytes();
    let buf = unsafe { libc::malloc(bytes.len() + 1) } as *mut c_char;
    if buf.is_null() {
        return ptr::null_mut();
    }
    unsafe {
        ptr::copy_nonoverlapping(bytes.as_ptr() as *const c_char, buf, bytes.len());
        *buf.add(bytes.len()) = 0;
    }
    buf
}

#[no_mangle]
pub unsafe extern "C" fn wgTurnOn(settings: *const c_char, tun_fd: i32) -> c_int {
    match call("wgTurnOn", |engine| {
        let settings = unsafe { required_str(settings, "settings") }?;
        engine.turn_on(settings, tun_fd)
    }) {
        Ok(handle) => handle,
        Err(code) => code,
    }
}

#[no_mangle]
pub unsafe extern "C" fn wgProxyTurnOn(
    settings: *const c_char,
    proxy_address: *const c_char,
    proxy_username: *const c_char,
    proxy_password: *const c_char,
    is_socks: bool,
) -> c_int {
    match call("wgProxyTurnOn", |engine| {
        let settings = unsafe { required_str(settings, "settings") }?;
        let address = unsafe { optional_str(proxy_address, "proxy address") }?;
        let username = unsafe { optional_str(proxy_username, "proxy username") }?;
        let password = unsafe { optional_str(proxy_password, "proxy password") }?;
        let protocol = if is_socks {
            ProxyProtocol::Socks5
        } else {
            ProxyProtocol::Http
        };
        let spec = ProxySpec::new(address, protocol).with_credentials(username, password);
        engine.proxy_turn_on(settings, spec)
    }) {
        Ok(handle) => handle,
        Err(code) => code,
    }
}

#[no_mangle]
pub extern "C" fn wgTurnOff(handle: c_int) -> c_int {
    status(call("wgTurnOff", |engine| engine.turn_off(handle)))
}

/// Returns the new configuration version.
#[no_mangle]
pub unsafe extern "C" fn wgSetConfig(handle: c_int, settings: *const c_char) -> i64 {
    match call("wgSetConfig", |engine| {
        let settings = unsafe { required_str(settings, "settings") }?;
        engine.set_config(handle, settings)
    }) {
        Ok(version) => i64::try_from(version).unwrap_or(i64::MAX),
        Err(code) => i64::from(code),
    }
}

/// Null on failure.
#[no_mangle]
pub extern "C" fn wgGetConfig(handle: c_int) -> *mut c_char {
    match call("wgGetConfig", |engine| engine.get_config(handle)) {
        Ok(text) => into_malloced(&text),
        Err(_) => ptr::null_mut(),
    }
}

#[no_mangle]
pub extern "C" fn wgBumpSockets(handle: c_int) -> c_int {
    status(call("wgBumpSockets", |engine| engine.bump_sockets(handle)))
}

#[no_mangle]
pub extern "C" fn wgDisableSomeRoamingForBrokenMobileSemantics(handle: c_int) -> c_int {
    status(call("wgDisableSomeRoamingForBrokenMobileSemantics", |engine| {
        engine.disable_roaming(handle)
    }))
}

/// Start (or retarget) the health check. Null or empty `address` uses the
/// tunnel's configured `CheckAlive` target. Returns `handle` on success.
#[no_mangle]
pub unsafe extern "C" fn wgStartHealthCheckServer(handle: c_int, address: *const c_char) -> c_int {
    match call("wgStartHealthCheckServer", |engine| {
        let address = unsafe { optional_str(address, "address") }?;
        engine.start_watchdog(handle, address)
    }) {
        Ok(()) => handle,
        Err(code) => code,
    }
}

#[no_mangle]
pub extern "C" fn wgSuspendHealthCheckPings(handle: c_int) -> c_int {
    status(call("wgSuspendHealthCheckPings", |engine| {
        engine.suspend_watchdog(handle)
    }))
}

#[no_mangle]
pub extern "C" fn wgResumeHealthCheckPings(handle: c_int) -> c_int {
    status(call("wgResumeHealthCheckPings", |engine| {
        engine.resume_watchdog(handle)
    }))
}

/// Sweep reclaimable resources. A no-op before the first turn-on.
#[no_mangle]
pub extern "C" fn wgRunGC() {
    let _ = panic::catch_unwind(|| {
        if let Some(engine) = crate::existing_engine() {
            let report = engine.run_gc();
            debug!(
                keys_wiped = report.keys_wiped,
                buffers_released = report.buffers_released,
                "GC finished"
            );
        }
    });
}

/// Static string; do not free.
#[no_mangle]
pub extern "C" fn wgVersion() -> *const c_char {
    static VERSION: OnceCell<CString> = OnceCell::new();
    VERSION
        .get_or_init(|| CString::new(wgkit_engine::VERSION).unwrap_or_default())
        .as_ptr()
}
