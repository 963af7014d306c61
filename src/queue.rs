//! The two-queue command pipeline (spec §3, §4.2): a command lives in
//! exactly one of `offline_queue` or `in_flight_queue`, except for the
//! atomic "shift from offline, push to in-flight, write" step performed by
//! `Pipeline::dispatch_next`.

use crate::command::Command;
use std::collections::VecDeque;

/// Owns the offline and in-flight FIFOs. A single `Controller` task owns
/// the only `Pipeline` instance, so no internal locking is needed (spec
/// §5's single-writer model).
#[derive(Default)]
pub struct Pipeline {
    offline_queue: VecDeque<Command>,
    in_flight_queue: VecDeque<Command>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a command that cannot be sent yet (not ready, and
    /// `enable_offline_queue` is on).
    pub fn enqueue_offline(&mut self, command: Command) {
        self.offline_queue.push_back(command);
    }

    /// Pops every offline command in FIFO order, appending each straight
    /// onto the in-flight queue as it is handed to the caller for writing.
    /// Used when the connection becomes `ready` (spec §4.2's "offline
    /// queue replay").
    pub fn drain_offline_for_replay(&mut self) -> Vec<Command> {
        let drained: Vec<Command> = self.offline_queue.drain(..).collect();
        drained
    }

    pub fn push_in_flight(&mut self, command: Command) {
        self.in_flight_queue.push_back(command);
    }

    /// Pops the oldest in-flight command to resolve it with the next
    /// parsed reply (spec §4.6's dispatch order: strict FIFO).
    pub fn pop_in_flight(&mut self) -> Option<Command> {
        self.in_flight_queue.pop_front()
    }

    pub fn peek_in_flight(&self) -> Option<&Command> {
        self.in_flight_queue.front()
    }

    pub fn peek_in_flight_mut(&mut self) -> Option<&mut Command> {
        self.in_flight_queue.front_mut()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight_queue.len()
    }

    pub fn offline_len(&self) -> usize {
        self.offline_queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offline_queue.is_empty() && self.in_flight_queue.is_empty()
    }

    /// Drains both queues in FIFO order (offline first, then in-flight),
    /// for the error flusher (spec §4.9). The offline-then-in-flight order
    /// matches the teacher's flush order in `reconnecting_connection.rs`.
    pub fn drain_all(&mut self) -> (Vec<Command>, Vec<Command>) {
        let offline: Vec<Command> = self.offline_queue.drain(..).collect();
        let in_flight: Vec<Command> = self.in_flight_queue.drain(..).collect();
        (offline, in_flight)
    }

    /// Requeues in-flight commands back onto the front of the offline
    /// queue, preserving their relative order, for a disconnect where
    /// `retry_unfulfilled_commands` is set (spec §4.2).
    pub fn requeue_in_flight_to_offline(&mut self) {
        while let Some(cmd) = self.in_flight_queue.pop_back() {
            self.offline_queue.push_front(cmd);
        }
    }

    /// Drains only the in-flight queue, leaving `offline_queue` untouched.
    /// Used for a disconnect where `retry_unfulfilled_commands` is not
    /// set: the orphaned commands are resolved with `UNCERTAIN_STATE`
    /// directly rather than merged back in with commands that never left
    /// the offline queue (spec §4.2/§4.9).
    pub fn drain_in_flight(&mut self) -> Vec<Command> {
        self.in_flight_queue.drain(..).collect()
    }

    /// The 0-based index of the first `SUBSCRIBE`/`UNSUBSCRIBE`/
    /// `PSUBSCRIBE`/`PUNSUBSCRIBE` command still in flight, used by the
    /// pub/sub walk-forward rule (spec §4.5) to re-arm `pub_sub_mode`
    /// after an unsubscribe ack reports the subscription count has
    /// reached zero.
    pub fn position_of_first_subscribe_family(&self) -> Option<usize> {
        self.in_flight_queue.iter().position(|command| {
            matches!(
                command.name.to_ascii_uppercase().as_str(),
                "SUBSCRIBE" | "UNSUBSCRIBE" | "PSUBSCRIBE" | "PUNSUBSCRIBE"
            )
        })
    }
}
