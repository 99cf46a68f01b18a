//! Apple kernel-control types used to locate the utun descriptor.
//!
//! A packet tunnel extension does not get its utun descriptor handed over
//! directly. It finds it by scanning its own descriptors for a socket whose
//! peer is the utun kernel control.

use libc::{c_char, c_int};

/// `_IOWR('N', 3, struct ctl_info)`
pub const CTLIOCGINFO: libc::c_ulong = 0xc064_4e03;

pub const UTUN_CONTROL_NAME: &str = "com.apple.net.utun_control";

/// Highest descriptor number scanned.
const MAX_SCANNED_FD: c_int = 1024;

/// `struct ctl_info` from `<sys/kern_control.h>`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CtlInfo {
    pub ctl_id: u32,
    pub ctl_name: [c_char; 96],
}

impl CtlInfo {
    /// Info block for looking up `name`. Names longer than 95 bytes are
    /// truncated.
    pub fn named(name: &str) -> Self {
        let mut ctl_name = [0 as c_char; 96];
        for (slot, byte) in ctl_name.iter_mut().zip(name.bytes().take(95)) {
            *slot = byte as c_char;
        }
        CtlInfo { ctl_id: 0, ctl_name }
    }
}

/// `struct sockaddr_ctl` from `<sys/kern_control.h>`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SockaddrCtl {
    pub sc_len: u8,
    pub sc_family: u8,
    pub ss_sysaddr: u16,
    pub sc_id: u32,
    pub sc_unit: u32,
    pub sc_reserved: [u32; 5],
}

/// Find the utun control socket among this process's descriptors.
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub fn find_utun_descriptor() -> Option<c_int> {
    let mut info = CtlInfo::named(UTUN_CONTROL_NAME);
    for fd in 0..MAX_SCANNED_FD {
        let mut addr = SockaddrCtl::default();
        let mut len = std::mem::size_of::<SockaddrCtl>() as libc::socklen_t;
        let rc = unsafe {
            libc::getpeername(fd, &mut addr as *mut SockaddrCtl as *mut libc::sockaddr, &mut len)
        };
        if rc != 0 || c_int::from(addr.sc_family) != libc::AF_SYSTEM {
            continue;
        }
        if info.ctl_id == 0 {
            let rc = unsafe { libc::ioctl(fd, CTLIOCGINFO, &mut info as *mut CtlInfo) };
            if rc != 0 {
                continue;
            }
        }
        if addr.sc_id == info.ctl_id {
            return Some(fd);
        }
    }
    None
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
pub fn find_utun_descriptor() -> Option<c_int> {
    let _ = MAX_SCANNED_FD;
    None
}

/// The utun descriptor, or -1 if none is open.
#[no_mangle]
pub extern "C" fn wgTunnelFileDescriptor() -> c_int {
    std::panic::catch_unwind(find_utun_descriptor)
        .ok()
        .flatten()
        .unwrap_or(-1)
}
