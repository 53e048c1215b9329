//! Session entity and its outbound line queue.
//!
//! A session is one accepted connection as seen by the registry: its
//! display name, its liveness flag, and the sending half of a bounded
//! queue. The connection handler owns the receiving half and is the only
//! task that ever writes to the socket.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};

/// Display names are capped at this many bytes.
pub const MAX_NAME_LEN: usize = 31;

/// Index of a registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(usize);

impl SlotId {
    pub fn new(index: usize) -> Self {
        SlotId(index)
    }

    pub fn index(self) -> usize {
        self.0
    }

    /// Placeholder display name given to a fresh session in this slot.
    pub fn default_name(self) -> String {
        format!("用户{}", self.0 + 1)
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a line could not be queued for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailure {
    /// The session's queue is full (reader is not keeping up).
    QueueFull,
    /// The connection handler is gone.
    Disconnected,
}

/// Sending half of a session's outbound queue.
#[derive(Debug)]
pub struct Outbox {
    tx: mpsc::Sender<String>,
    hangup: Arc<Notify>,
}

impl Outbox {
    /// Queue a message without waiting.
    pub fn send(&self, text: &str) -> Result<(), SendFailure> {
        self.tx.try_send(text.to_string()).map_err(|e| match e {
            TrySendError::Full(_) => SendFailure::QueueFull,
            TrySendError::Closed(_) => SendFailure::Disconnected,
        })
    }

    /// Ask the owning handler to close the connection.
    pub fn hang_up(&self) {
        self.hangup.notify_one();
    }
}

/// Receiving half of a session's outbound queue, owned by its handler.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::Receiver<String>,
    hangup: Arc<Notify>,
}

impl Inbox {
    /// Next queued message, or `None` once the session has been removed
    /// or hung up.
    pub async fn next(&mut self) -> Option<String> {
        tokio::select! {
            biased;
            text = self.rx.recv() => text,
            _ = self.hangup.notified() => None,
        }
    }

    /// Resolves once the session is hung up. Consumes the hang-up, so a
    /// later `next` will not see it again.
    pub async fn hung_up(&self) {
        self.hangup.notified().await;
    }

    /// Take whatever is still queued without waiting.
    pub fn drain(&mut self) -> Vec<String> {
        let mut pending = Vec::new();
        while let Ok(text) = self.rx.try_recv() {
            pending.push(text);
        }
        pending
    }
}

/// Create a session queue holding at most `capacity` messages.
pub fn channel(capacity: usize) -> (Outbox, Inbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let hangup = Arc::new(Notify::new());
    (
        Outbox {
            tx,
            hangup: Arc::clone(&hangup),
        },
        Inbox { rx, hangup },
    )
}

/// One connected client as held by the registry.
#[derive(Debug)]
pub struct Session {
    name: String,
    peer: SocketAddr,
    active: bool,
    outbox: Outbox,
}

impl Session {
    pub fn new(peer: SocketAddr, outbox: Outbox) -> Self {
        Session {
            name: String::new(),
            peer,
            active: true,
            outbox,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = truncate_name(name).to_string();
    }

    /// Queue a message. A failed enqueue marks the session inactive and
    /// hangs up its handler.
    pub(crate) fn send(&mut self, text: &str) -> bool {
        if !self.active {
            return false;
        }
        match self.outbox.send(text) {
            Ok(()) => true,
            Err(_) => {
                self.mark_inactive();
                false
            }
        }
    }

    pub(crate) fn mark_inactive(&mut self) {
        self.active = false;
        self.outbox.hang_up();
    }

    /// Consume the session, waking its handler so it closes the socket.
    pub(crate) fn close(self) {
        self.outbox.hang_up();
    }
}

/// Longest prefix of `name` that fits in [`MAX_NAME_LEN`] bytes without
/// splitting a character.
pub fn truncate_name(name: &str) -> &str {
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let mut end = MAX_NAME_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
pub(crate) fn test_peer() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 40000))
}
