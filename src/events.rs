//! Client-level lifecycle events (spec §6). The distilled spec describes
//! these against an `EventEmitter`-style API; this crate exposes them as a
//! `tokio::sync::broadcast` stream instead (`SPEC_FULL.md` §6).

use crate::error::RedisLinkError;
use tokio::sync::broadcast;

/// One variant per event name in spec §6's event list.
#[derive(Debug, Clone)]
pub enum Event {
    /// The transport connected; the ready check has not yet run.
    Connect,
    /// The ready check passed; queued offline commands are being replayed.
    Ready,
    /// A reconnect attempt has been scheduled.
    Reconnecting { attempt: u32 },
    /// The transport was closed, intentionally or otherwise.
    End,
    /// A non-fatal error the caller may want to observe (never a
    /// per-command reply error — those go to the command's own sink).
    Error(RedisLinkErrorKind),
}

/// A cheap, cloneable summary of a [`RedisLinkError`] suitable for
/// broadcasting — the error itself is not `Clone` in every variant's
/// payload, so events carry this projection instead.
#[derive(Debug, Clone)]
pub struct RedisLinkErrorKind {
    pub code: Option<String>,
    pub message: String,
}

impl From<&RedisLinkError> for RedisLinkErrorKind {
    fn from(err: &RedisLinkError) -> Self {
        RedisLinkErrorKind {
            code: err.code().map(str::to_string),
            message: err.to_string(),
        }
    }
}

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Owns the broadcast sender; the controller holds one, clients obtain
/// receivers via [`EventBus::subscribe`].
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        EventBus { sender }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Broadcasts `event`. No receivers is not an error — callers are not
    /// required to subscribe.
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}
