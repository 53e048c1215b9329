//! Registry of connected sessions.
//!
//! A fixed number of slots behind a single mutex. Every operation takes
//! the lock for its whole duration, so no caller ever observes a
//! half-updated table. Lookups are linear scans; capacity is small.
//!
//! Sending never blocks: a message is queued on the target session's
//! outbox while the lock is held. A target whose queue is full or whose
//! handler has gone away is marked inactive and told to hang up; it is
//! skipped from then on and its own handler removes it.

use crate::session::{Session, SlotId};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, trace};

/// Why a session could not be registered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegisterError {
    /// Every slot is occupied
    #[error("registry full ({0} sessions)")]
    Full(usize),
    /// Shutdown has started; no new sessions are accepted
    #[error("server is shutting down")]
    ShuttingDown,
}

struct Slots {
    table: Vec<Option<Session>>,
    closed: bool,
}

impl Slots {
    fn active(&self) -> impl Iterator<Item = (SlotId, &Session)> {
        self.table.iter().enumerate().filter_map(|(i, slot)| match slot {
            Some(session) if session.is_active() => Some((SlotId::new(i), session)),
            _ => None,
        })
    }

    fn get_mut(&mut self, slot: SlotId) -> Option<&mut Session> {
        self.table.get_mut(slot.index()).and_then(Option::as_mut)
    }
}

/// Thread-safe table of connected sessions
pub struct Registry {
    slots: Mutex<Slots>,
    capacity: usize,
}

impl Registry {
    /// Create a registry with `capacity` slots
    pub fn new(capacity: usize) -> Arc<Self> {
        info!(capacity, "Initializing session registry");
        let mut table = Vec::with_capacity(capacity);
        table.resize_with(capacity, || None);
        Arc::new(Self {
            slots: Mutex::new(Slots {
                table,
                closed: false,
            }),
            capacity,
        })
    }

    // Every mutation leaves the table consistent, so a poisoned lock is
    // still safe to use.
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Place `session` in the first free slot and give it the slot's
    /// placeholder name.
    ///
    /// On failure the session is dropped unannounced.
    pub fn try_register(&self, mut session: Session) -> Result<SlotId, RegisterError> {
        let mut slots = self.lock();
        if slots.closed {
            return Err(RegisterError::ShuttingDown);
        }

        let Some(index) = slots.table.iter().position(Option::is_none) else {
            return Err(RegisterError::Full(self.capacity));
        };

        let slot = SlotId::new(index);
        session.set_name(&slot.default_name());
        trace!(%slot, peer = %session.peer(), name = session.name(), "Slot occupied");
        slots.table[index] = Some(session);
        Ok(slot)
    }

    /// Replace a session's display name. Names are not checked for
    /// uniqueness.
    ///
    /// Returns `(old, new)` as stored, or `None` if the slot is empty.
    pub fn rename(&self, slot: SlotId, new_name: &str) -> Option<(String, String)> {
        let mut slots = self.lock();
        let session = slots.get_mut(slot)?;
        let old = session.name().to_string();
        session.set_name(new_name);
        Some((old, session.name().to_string()))
    }

    /// Free a slot and hang up its connection.
    ///
    /// Returns the name the session had, or `None` if the slot was already
    /// empty. Removing twice is harmless.
    pub fn remove(&self, slot: SlotId) -> Option<String> {
        let session = self.lock().table.get_mut(slot.index())?.take()?;
        let name = session.name().to_string();
        trace!(%slot, name = %name, "Slot freed");
        session.close();
        Some(name)
    }

    /// Queue `text` for every active session except `exclude`.
    ///
    /// Failed deliveries only mark their target inactive. Returns the
    /// number of sessions the message was queued for.
    pub fn broadcast(&self, text: &str, exclude: Option<SlotId>) -> usize {
        let mut slots = self.lock();
        let mut delivered = 0;
        for (i, entry) in slots.table.iter_mut().enumerate() {
            let Some(session) = entry else { continue };
            if !session.is_active() || Some(SlotId::new(i)) == exclude {
                continue;
            }
            if session.send(text) {
                delivered += 1;
            } else {
                debug!(slot = i, name = session.name(), "Broadcast delivery failed");
            }
        }
        delivered
    }

    /// Queue `text` for a single session.
    pub fn send_to(&self, slot: SlotId, text: &str) -> bool {
        let mut slots = self.lock();
        match slots.get_mut(slot) {
            Some(session) => session.send(text),
            None => false,
        }
    }

    /// First active session, in slot order, whose name is exactly `name`.
    pub fn find_by_name(&self, name: &str) -> Option<SlotId> {
        self.lock()
            .active()
            .find(|(_, session)| session.name() == name)
            .map(|(slot, _)| slot)
    }

    /// Current display name of an active session
    pub fn name_of(&self, slot: SlotId) -> Option<String> {
        self.lock()
            .active()
            .find(|(id, _)| *id == slot)
            .map(|(_, session)| session.name().to_string())
    }

    /// Names of all active sessions in slot order
    pub fn roster(&self) -> Vec<(SlotId, String)> {
        self.lock()
            .active()
            .map(|(slot, session)| (slot, session.name().to_string()))
            .collect()
    }

    pub fn count_active(&self) -> usize {
        self.lock().active().count()
    }

    /// Refuse further registrations, send `notice` to every session and
    /// remove them all. Returns how many sessions were closed.
    pub fn shutdown(&self, notice: &str) -> usize {
        let mut slots = self.lock();
        slots.closed = true;

        let mut closed = 0;
        for entry in slots.table.iter_mut() {
            if let Some(mut session) = entry.take() {
                session.send(notice);
                session.close();
                closed += 1;
            }
        }
        closed
    }
}
