//! Tunnel handle registry.
//!
//! Handles are small non-negative integers. A new session gets the lowest
//! free value, and a destroyed session's handle is free again as soon as
//! its teardown finishes. A handle is reserved while its session starts or
//! stops so two sessions never share one.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::session::Session;

enum Slot {
    Reserved,
    Live(Arc<Session>),
}

pub struct Registry {
    slots: Mutex<BTreeMap<i32, Slot>>,
    max_handles: i32,
}

impl Registry {
    pub fn new(max_handles: i32) -> Arc<Self> {
        Arc::new(Registry {
            slots: Mutex::new(BTreeMap::new()),
            max_handles: max_handles.max(1),
        })
    }

    fn slots(&self) -> MutexGuard<'_, BTreeMap<i32, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the lowest free handle.
    pub fn reserve(self: &Arc<Self>) -> EngineResult<Reservation> {
        let mut slots = self.slots();
        let mut handle = 0;
        for taken in slots.keys() {
            if *taken != handle {
                break;
            }
            handle += 1;
        }
        if handle >= self.max_handles {
            return Err(EngineError::EngineStartFailed(format!(
                "all {} tunnel handles are in use",
                self.max_handles
            )));
        }
        slots.insert(handle, Slot::Reserved);
        debug!(handle, "Reserved tunnel handle");
        Ok(Reservation {
            registry: Arc::clone(self),
            handle,
            committed: false,
        })
    }

    pub fn get(&self, handle: i32) -> EngineResult<Arc<Session>> {
        match self.slots().get(&handle) {
            Some(Slot::Live(session)) => Ok(Arc::clone(session)),
            _ => Err(EngineError::UnknownHandle(handle)),
        }
    }

    /// Unregister a live session. Later lookups of `handle` fail, but the
    /// handle stays reserved until the returned [`Reservation`] is dropped,
    /// so it is not handed out while the session is still stopping.
    pub fn remove(self: &Arc<Self>, handle: i32) -> EngineResult<(Arc<Session>, Reservation)> {
        let mut slots = self.slots();
        match slots.insert(handle, Slot::Reserved) {
            Some(Slot::Live(session)) => Ok((
                session,
                Reservation {
                    registry: Arc::clone(self),
                    handle,
                    committed: false,
                },
            )),
            // Still starting or stopping: leave it reserved
            Some(Slot::Reserved) => Err(EngineError::UnknownHandle(handle)),
            None => {
                slots.remove(&handle);
                Err(EngineError::UnknownHandle(handle))
            }
        }
    }

    /// Live handles in ascending order.
    pub fn handles(&self) -> Vec<i32> {
        self.slots()
            .iter()
            .filter_map(|(handle, slot)| matches!(slot, Slot::Live(_)).then_some(*handle))
            .collect()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.slots()
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(session) => Some(Arc::clone(session)),
                Slot::Reserved => None,
            })
            .collect()
    }

    /// Unregister every live session.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        let mut slots = self.slots();
        let live: Vec<i32> = slots
            .iter()
            .filter_map(|(handle, slot)| matches!(slot, Slot::Live(_)).then_some(*handle))
            .collect();
        live.into_iter()
            .filter_map(|handle| match slots.remove(&handle) {
                Some(Slot::Live(session)) => Some(session),
                _ => None,
            })
            .collect()
    }
}

/// A claimed handle. Dropping it without [`Reservation::commit`] frees the
/// handle again.
pub struct Reservation {
    registry: Arc<Registry>,
    handle: i32,
    committed: bool,
}

impl Reservation {
    pub fn handle(&self) -> i32 {
        self.handle
    }

    pub fn commit(mut self, session: Arc<Session>) {
        self.registry
            .slots()
            .insert(self.handle, Slot::Live(session));
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.slots().remove(&self.handle);
            debug!(handle = self.handle, "Released tunnel handle");
        }
    }
}
