//! Resource reclamation.
//!
//! Key material that leaves a session (replaced keys, destroyed sessions) is
//! parked here until the next sweep wipes it. Packet buffers are pooled
//! across sessions; a sweep releases the idle ones.

use std::sync::{Mutex, PoisonError};
use tracing::debug;
use wgkit_shared::proto::Key;

/// Size of one pooled packet buffer.
pub const PACKET_BUFFER_SIZE: usize = 65_535;

/// Idle buffers kept between sweeps.
const MAX_IDLE_BUFFERS: usize = 64;

/// What a sweep released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub keys_wiped: usize,
    pub buffers_released: usize,
}

/// Shared pool of packet buffers.
#[derive(Debug, Default)]
pub struct BufferPool {
    idle: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Take a zero-length buffer with at least [`PACKET_BUFFER_SIZE`] capacity.
    pub fn take(&self) -> Vec<u8> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(PACKET_BUFFER_SIZE))
    }

    /// Return a buffer to the pool.
    pub fn give(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE_BUFFERS && buf.capacity() >= PACKET_BUFFER_SIZE {
            idle.push(buf);
        }
    }

    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn release_idle(&self) -> usize {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        let released = idle.len();
        idle.clear();
        idle.shrink_to_fit();
        released
    }
}

/// Engine-wide reclaimer.
#[derive(Debug, Default)]
pub struct Reclaimer {
    retired: Mutex<Vec<Key>>,
    pool: BufferPool,
}

impl Reclaimer {
    pub fn new() -> Self {
        Reclaimer::default()
    }

    /// Park key material for wiping on the next sweep.
    pub fn retire(&self, key: Key) {
        if key.is_zero() {
            return;
        }
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(key);
    }

    pub fn retired(&self) -> usize {
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Wipe retired keys and release idle buffers. Live sessions are not
    /// touched: they never hand anything here that they still use.
    pub fn sweep(&self) -> SweepReport {
        let mut retired = std::mem::take(
            &mut *self.retired.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for key in retired.iter_mut() {
            key.wipe();
        }
        let report = SweepReport {
            keys_wiped: retired.len(),
            buffers_released: self.pool.release_idle(),
        };
        debug!(
            keys_wiped = report.keys_wiped,
            buffers_released = report.buffers_released,
            "Reclaimer sweep finished"
        );
        report
    }
}
