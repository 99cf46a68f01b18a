//! Tunnel descriptor attachment.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use super::TransportError;

/// The engine's own duplicate of the host's tunnel descriptor, switched to
/// non-blocking mode. The host keeps ownership of the original.
#[derive(Debug)]
pub struct TunDescriptor {
    fd: OwnedFd,
}

impl TunDescriptor {
    /// Duplicate `raw` and prepare it for async reads.
    pub fn attach(raw: RawFd) -> Result<Self, TransportError> {
        if raw < 0 {
            return Err(TransportError::BadDescriptor {
                fd: raw,
                source: io::Error::from_raw_os_error(libc::EBADF),
            });
        }

        // SAFETY: fcntl with F_DUPFD_CLOEXEC does not touch memory; an invalid
        // descriptor yields -1/EBADF.
        let dup = unsafe { libc::fcntl(raw, libc::F_DUPFD_CLOEXEC, 0) };
        if dup < 0 {
            return Err(TransportError::BadDescriptor {
                fd: raw,
                source: io::Error::last_os_error(),
            });
        }
        // SAFETY: `dup` is a fresh descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(dup) };

        set_nonblocking(&fd).map_err(|source| TransportError::BadDescriptor { fd: raw, source })?;
        Ok(TunDescriptor { fd })
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn into_file(self) -> File {
        File::from(self.fd)
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let raw = fd.as_raw_fd();
    // SAFETY: plain flag manipulation on a descriptor we own.
    unsafe {
        let flags = libc::fcntl(raw, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
