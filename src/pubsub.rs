//! Pub/sub overlay (spec §4.5): a mode counter layered on top of the
//! normal reply dispatcher, a subscription set that survives reconnects,
//! and push-message routing.
//!
//! Grounded on the teacher's `PushManager` (`push_manager.rs`): an
//! `ArcSwap`-guarded optional sender that downstream code swaps in when a
//! listener subscribes and clears when the receiver drops. This module
//! keeps that routing shape, adds the channel/pattern subscription
//! bookkeeping and the `pub_sub_mode` counter spec §4.5 layers on top.

use arc_swap::ArcSwap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A received pub/sub push, routed to whoever is currently listening.
#[derive(Debug, Clone)]
pub struct PushMessage {
    pub kind: PushKind,
    pub channel: String,
    /// Present for pattern messages (`PMESSAGE`); the pattern that matched.
    pub pattern: Option<String>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    Message,
    PMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubKind {
    Subscribe,
    Psubscribe,
}

/// Channels/patterns currently subscribed to, kept so a reconnect can
/// replay them in the same order they were originally issued (spec
/// §4.5's "resubscribe-on-reconnect ordering").
#[derive(Default)]
pub struct SubscriptionSet {
    order: Vec<(SubKind, String)>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: SubKind, target: String) {
        if !self.order.iter().any(|(k, t)| *k == kind && *t == target) {
            self.order.push((kind, target));
        }
    }

    pub fn remove(&mut self, kind: SubKind, target: &str) {
        self.order.retain(|(k, t)| !(*k == kind && t == target));
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// The subscribe commands to reissue, in original order, after a
    /// reconnect.
    pub fn replay_order(&self) -> impl Iterator<Item = &(SubKind, String)> {
        self.order.iter()
    }
}

/// Routes push messages to whichever listener last called
/// [`PushRouter::set_sender`], mirroring the teacher's
/// `PushManager::replace_sender`/`try_send_raw` pair. Uses a bounded
/// channel (`SPEC_FULL.md` §5/§6) instead of the teacher's unbounded one,
/// since this crate models backpressure explicitly rather than assuming
/// an unbounded sink.
#[derive(Clone)]
pub struct PushRouter {
    sender: Arc<ArcSwap<Option<mpsc::Sender<PushMessage>>>>,
}

impl Default for PushRouter {
    fn default() -> Self {
        PushRouter {
            sender: Arc::new(ArcSwap::new(Arc::new(None))),
        }
    }
}

impl PushRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sender(&self, sender: mpsc::Sender<PushMessage>) {
        self.sender.store(Arc::new(Some(sender)));
    }

    pub fn clear_sender(&self) {
        self.sender.store(Arc::new(None));
    }

    /// Attempts to forward `message`. If no one is listening, or the
    /// listener's buffer is full, the message is dropped — pub/sub is
    /// inherently best-effort once it leaves the server (spec §4.5 does
    /// not require buffering undelivered messages).
    pub fn try_route(&self, message: PushMessage) {
        let guard = self.sender.load();
        if let Some(sender) = guard.as_ref() {
            if sender.try_send(message).is_err() {
                tracing::warn!("dropped pub/sub message: listener unavailable or full");
            }
        }
    }
}

/// The `pub_sub_mode` counter from spec §4.5: 0 means no subscribe-family
/// command is in flight and no subscriptions are held; 1 means pub/sub is
/// fully active; N > 1 is a "pending entry" countdown — N−1 normal
/// replies, already in flight ahead of the subscribe command that set
/// this, are still due before pub/sub becomes active. Resolved per Design
/// Note 3 in `DESIGN.md`: once non-zero, `CLIENT REPLY` mutations are
/// ignored until it returns to zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct PubSubMode {
    count: u32,
}

impl PubSubMode {
    pub fn is_active(&self) -> bool {
        self.count > 0
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Enters pub/sub mode at `position` (spec §4.5's `command_queue.length
    /// + 1`, computed by the caller from the in-flight queue length before
    /// the new subscribe command is pushed). A no-op if already active —
    /// only the first subscribe-family command issued while inactive
    /// arms the countdown.
    pub fn activate(&mut self, position: u32) {
        if self.count == 0 {
            self.count = position;
        }
    }

    /// Counts down one pending normal reply during a "pending entry"
    /// countdown (`count > 1`). Call sites are expected to check
    /// `count() > 1` before calling this.
    pub fn decrement(&mut self) {
        if self.count > 1 {
            self.count -= 1;
        }
    }

    /// Sets the counter to an explicit value, used by the unsubscribe
    /// walk-forward rule (spec §4.5): when an unsubscribe ack reports the
    /// server-side count has reached zero, the in-flight queue is walked
    /// forward for another pending subscribe-family command and its
    /// position becomes the new mode.
    pub fn set(&mut self, value: u32) {
        self.count = value;
    }

    /// Forces the counter back to zero, e.g. on a disconnect where the
    /// in-flight subscribe acknowledgements it was tracking no longer have
    /// a connection to arrive on (spec §4.3 step 2).
    pub fn reset(&mut self) {
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_set_preserves_insertion_order() {
        let mut set = SubscriptionSet::new();
        set.add(SubKind::Subscribe, "a".into());
        set.add(SubKind::Psubscribe, "p*".into());
        set.add(SubKind::Subscribe, "b".into());
        let order: Vec<_> = set.replay_order().cloned().collect();
        assert_eq!(
            order,
            vec![
                (SubKind::Subscribe, "a".to_string()),
                (SubKind::Psubscribe, "p*".to_string()),
                (SubKind::Subscribe, "b".to_string()),
            ]
        );
    }

    #[test]
    fn subscription_set_dedupes() {
        let mut set = SubscriptionSet::new();
        set.add(SubKind::Subscribe, "a".into());
        set.add(SubKind::Subscribe, "a".into());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn subscription_set_removes() {
        let mut set = SubscriptionSet::new();
        set.add(SubKind::Subscribe, "a".into());
        set.remove(SubKind::Subscribe, "a");
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn push_router_routes_to_current_listener() {
        let router = PushRouter::new();
        let (tx, mut rx) = mpsc::channel(4);
        router.set_sender(tx);
        router.try_route(PushMessage {
            kind: PushKind::Message,
            channel: "ch".into(),
            pattern: None,
            payload: b"hi".to_vec(),
        });
        let received = rx.recv().await.unwrap();
        assert_eq!(received.channel, "ch");
    }

    #[test]
    fn push_router_drops_silently_without_listener() {
        let router = PushRouter::new();
        router.try_route(PushMessage {
            kind: PushKind::Message,
            channel: "ch".into(),
            pattern: None,
            payload: b"hi".to_vec(),
        });
    }

    #[test]
    fn pub_sub_mode_activates_at_the_given_position_and_counts_down() {
        let mut mode = PubSubMode::default();
        assert!(!mode.is_active());
        mode.activate(2);
        assert!(mode.is_active());
        assert_eq!(mode.count(), 2);
        mode.decrement();
        assert_eq!(mode.count(), 1);
        // Once at 1, further decrements are no-ops; only `set`/`reset` move it.
        mode.decrement();
        assert_eq!(mode.count(), 1);
        mode.reset();
        assert!(!mode.is_active());
    }

    #[test]
    fn pub_sub_mode_activate_is_a_no_op_once_already_active() {
        let mut mode = PubSubMode::default();
        mode.activate(3);
        mode.activate(9);
        assert_eq!(mode.count(), 3);
    }
}
