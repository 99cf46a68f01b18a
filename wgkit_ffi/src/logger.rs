//! Host log callback.

use libc::{c_char, c_int, c_void};
use std::ffi::CString;
use std::panic;
use std::sync::Arc;
use wgkit_shared::logging::{LogBridge, LogLevel, LogSink};

/// `void (*)(void *context, int level, const char *message)`
pub type LoggerFn = unsafe extern "C" fn(context: *mut c_void, level: c_int, message: *const c_char);

/// Forwards lines to a C callback. The context pointer is opaque to us and
/// only handed back to the callback.
struct CallbackSink {
    context: usize,
    callback: LoggerFn,
}

impl LogSink for CallbackSink {
    fn log(&self, level: LogLevel, message: &str) {
        let line = CString::new(message)
            .or_else(|_| CString::new(message.replace('\0', "")))
            .unwrap_or_default();
        unsafe { (self.callback)(self.context as *mut c_void, level as c_int, line.as_ptr()) };
    }
}

/// Install the process-wide log callback. A null callback disables host
/// logging. Lines logged before the call keep the previous callback.
#[no_mangle]
pub unsafe extern "C" fn wgSetLogger(context: *mut c_void, logger_fn: Option<LoggerFn>) {
    let context = context as usize;
    let _ = panic::catch_unwind(move || {
        crate::config();
        let sink = logger_fn.map(|callback| Arc::new(CallbackSink { context, callback }) as Arc<dyn LogSink>);
        LogBridge::global().set_sink(sink);
    });
}
