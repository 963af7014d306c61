//! Reply dispatch (spec §4.6): matches parsed frames against the in-flight
//! queue in strict FIFO order, except for pub/sub push frames and
//! `MONITOR` lines, which are routed out-of-band instead of consuming a
//! queue slot.
//!
//! Grounded on the teacher's `PipelineSink::send_result`
//! (`aio/multiplexed_connection.rs`), which inspects each parsed value for
//! `Value::Push` before handing it to the in-flight entry at the front of
//! the queue. This module generalizes that single `if let Push` check into
//! the full pub/sub ack/message/monitor routing spec §4.5/§4.6 require.

use crate::command::Command;
use crate::error::{RedisLinkError, ReplyError};
use crate::pubsub::{PubSubMode, PushKind, PushMessage, PushRouter, SubKind, SubscriptionSet};
use crate::queue::Pipeline;
use crate::value::Value;

/// What the controller should do after a single frame has been
/// dispatched. Most frames resolve a command sink and need no further
/// action from the controller; `MonitorLine` and `PushRouted` are called
/// out so the controller can emit the matching [`crate::events::Event`]
/// if it wants to.
pub enum DispatchOutcome {
    Resolved,
    PushRouted,
    MonitorLine(Value),
    /// The frame didn't match anything in flight — a protocol
    /// desynchronization. The controller should treat this the same as a
    /// transport error (spec §4.6: "a reply parser failure is always
    /// fatal").
    Unmatched,
}

/// Dispatches one parsed frame. `monitoring` is `true` once `MONITOR` has
/// been acknowledged, at which point every subsequent simple-string frame
/// is a monitor line rather than a normal command reply (spec §4.6).
///
/// Routing is gated on `pub_sub_mode` (spec §4.5), not on reply shape
/// alone: a RESP3 `Value::Push` frame is wire-distinguished and always
/// routed as pub/sub, but a RESP2 array is only ever treated as one while
/// `pub_sub_mode != 0` — otherwise a normal command reply that happens to
/// be a 2+ element array starting with a push-like token would be
/// misrouted and leave its sink unresolved.
pub fn dispatch(
    frame: Result<Value, ReplyError>,
    pipeline: &mut Pipeline,
    pubsub_mode: &mut PubSubMode,
    subscriptions: &mut SubscriptionSet,
    push_router: &PushRouter,
    monitoring: bool,
    config: &crate::config::ClientConfig,
) -> DispatchOutcome {
    if monitoring {
        if let Ok(value) = &frame {
            if matches!(value, Value::SimpleString(_)) {
                return DispatchOutcome::MonitorLine(value.clone());
            }
        }
    }

    if let Ok(Value::Push(items)) = &frame {
        return dispatch_push(items, pipeline, pubsub_mode, subscriptions, push_router);
    }

    match pubsub_mode.count() {
        0 => resolve_or_unmatched(frame, pipeline, config),
        1 => {
            if let Ok(value) = &frame {
                if let Some(items) = array_push_candidate(value) {
                    return dispatch_push(items, pipeline, pubsub_mode, subscriptions, push_router);
                }
            }
            resolve_or_unmatched(frame, pipeline, config)
        }
        _ => {
            // Pending entry: this reply belongs to a normal command that
            // was already in flight ahead of the subscribe command that
            // put us into pending mode. Count it down and deliver
            // normally (spec §4.5/§4.6), regardless of whether it is a
            // success or an error reply.
            pubsub_mode.decrement();
            resolve_or_unmatched(frame, pipeline, config)
        }
    }
}

/// A RESP2 array is only a pub/sub candidate when `pub_sub_mode == 1`
/// (spec §4.5): anything that isn't an array, or is an array of length
/// ≤ 2, is delivered normally — this is what lets `PING`/`QUIT` replies
/// through while subscribed.
fn array_push_candidate(value: &Value) -> Option<&[Value]> {
    match value {
        Value::Array(items) if items.len() > 2 => Some(items.as_slice()),
        _ => None,
    }
}

fn resolve_or_unmatched(
    frame: Result<Value, ReplyError>,
    pipeline: &mut Pipeline,
    config: &crate::config::ClientConfig,
) -> DispatchOutcome {
    let Some(command) = pipeline.pop_in_flight() else {
        return DispatchOutcome::Unmatched;
    };
    resolve_normal_reply(command, frame, config);
    DispatchOutcome::Resolved
}

fn dispatch_push(
    items: &[Value],
    pipeline: &mut Pipeline,
    pubsub_mode: &mut PubSubMode,
    subscriptions: &mut SubscriptionSet,
    push_router: &PushRouter,
) -> DispatchOutcome {
    let Some(kind) = items.first().and_then(Value::as_str) else {
        return DispatchOutcome::Unmatched;
    };

    match kind {
        "message" => {
            if let (Some(channel), Some(payload)) = (
                items.get(1).and_then(Value::as_str),
                items.get(2).and_then(Value::as_bulk_string),
            ) {
                push_router.try_route(PushMessage {
                    kind: PushKind::Message,
                    channel: channel.to_string(),
                    pattern: None,
                    payload: payload.to_vec(),
                });
            }
            DispatchOutcome::PushRouted
        }
        "pmessage" => {
            if let (Some(pattern), Some(channel), Some(payload)) = (
                items.get(1).and_then(Value::as_str),
                items.get(2).and_then(Value::as_str),
                items.get(3).and_then(Value::as_bulk_string),
            ) {
                push_router.try_route(PushMessage {
                    kind: PushKind::PMessage,
                    channel: channel.to_string(),
                    pattern: Some(pattern.to_string()),
                    payload: payload.to_vec(),
                });
            }
            DispatchOutcome::PushRouted
        }
        "subscribe" | "unsubscribe" | "psubscribe" | "punsubscribe" => {
            let is_sub = matches!(kind, "subscribe" | "psubscribe");
            let sub_kind = if matches!(kind, "psubscribe" | "punsubscribe") {
                SubKind::Psubscribe
            } else {
                SubKind::Subscribe
            };
            let count = items.get(2).and_then(Value::as_int);
            if let Some(target) = items.get(1).and_then(Value::as_str) {
                if is_sub {
                    subscriptions.add(sub_kind, target.to_string());
                } else {
                    subscriptions.remove(sub_kind, target);
                }
            }
            ack_front_command(pipeline, items);

            // Spec §4.5: after an unsubscribe ack reports the server-side
            // subscription count has reached zero, walk the in-flight
            // queue forward — another still-pending subscribe-family
            // command re-arms the countdown at its position, otherwise
            // pub/sub mode is fully torn down.
            if !is_sub && count == Some(0) {
                match pipeline.position_of_first_subscribe_family() {
                    Some(index) => pubsub_mode.set(index as u32 + 1),
                    None => pubsub_mode.reset(),
                }
            }
            DispatchOutcome::PushRouted
        }
        _ => DispatchOutcome::Unmatched,
    }
}

/// Counts one subscribe/unsubscribe acknowledgement against the command
/// at the front of the in-flight queue, resolving and popping it once all
/// of its channels/patterns have been acknowledged (spec §4.5, Design
/// Note 2).
fn ack_front_command(pipeline: &mut Pipeline, items: &[Value]) {
    let Some(command) = pipeline.peek_in_flight() else {
        return;
    };
    let is_target_command = matches!(
        command.name.to_ascii_uppercase().as_str(),
        "SUBSCRIBE" | "UNSUBSCRIBE" | "PSUBSCRIBE" | "PUNSUBSCRIBE"
    );
    if !is_target_command {
        return;
    }

    let remaining = command.sub_commands_left.unwrap_or(1).saturating_sub(1);
    if remaining == 0 {
        let command = pipeline.pop_in_flight().expect("peeked above");
        let reply = Ok(Value::Array(items.to_vec()));
        command.sink.resolve(reply);
    } else if let Some(front) = pipeline.peek_in_flight_mut() {
        front.sub_commands_left = Some(remaining);
    }
}

/// Resolves a normal (non-push) reply against the oldest in-flight
/// command, applying `detect_buffers`/HGETALL conversions per spec §4.6.
fn resolve_normal_reply(
    command: Command,
    frame: Result<Value, ReplyError>,
    config: &crate::config::ClientConfig,
) {
    let result: Result<Value, RedisLinkError> = match frame {
        Err(err) => Err(RedisLinkError::from(
            err.with_command(command.name.clone(), args_as_strings(&command)),
        )),
        Ok(value) => match value.extract_error() {
            Err(err) => Err(RedisLinkError::from(
                err.with_command(command.name.clone(), args_as_strings(&command)),
            )),
            Ok(value) => Ok(postprocess_reply(&command, value, config)),
        },
    };
    command.sink.resolve(result);
}

fn postprocess_reply(command: &Command, value: Value, config: &crate::config::ClientConfig) -> Value {
    let value = if command.name.eq_ignore_ascii_case("HGETALL") {
        value.hgetall_to_map()
    } else {
        value
    };
    if config.detect_buffers && !command.big_data {
        value.detect_buffers_to_text()
    } else {
        value
    }
}

fn args_as_strings(command: &Command) -> Vec<String> {
    command
        .args
        .iter()
        .map(|arg| match arg {
            crate::command::Arg::Text(s) => s.clone(),
            crate::command::Arg::Binary(_) => "<binary>".to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Sink;
    use tokio::sync::oneshot;

    fn make_config() -> crate::config::ClientConfig {
        crate::config::ClientConfig::default()
    }

    #[tokio::test]
    async fn resolves_front_command_in_fifo_order() {
        let mut pipeline = Pipeline::new();
        let mut pubsub_mode = PubSubMode::default();
        let mut subs = SubscriptionSet::new();
        let push_router = PushRouter::new();
        let (tx, rx) = oneshot::channel();
        pipeline.push_in_flight(Command::new("GET", vec![], Sink::Future(tx)));

        let outcome = dispatch(
            Ok(Value::BulkString(b"v".to_vec())),
            &mut pipeline,
            &mut pubsub_mode,
            &mut subs,
            &push_router,
            false,
            &make_config(),
        );
        assert!(matches!(outcome, DispatchOutcome::Resolved));
        let result = rx.await.unwrap();
        assert_eq!(result.unwrap(), Value::BulkString(b"v".to_vec()));
    }

    #[tokio::test]
    async fn flattens_hgetall_reply() {
        let mut pipeline = Pipeline::new();
        let mut pubsub_mode = PubSubMode::default();
        let mut subs = SubscriptionSet::new();
        let push_router = PushRouter::new();
        let (tx, rx) = oneshot::channel();
        pipeline.push_in_flight(Command::new("HGETALL", vec![], Sink::Future(tx)));

        dispatch(
            Ok(Value::Array(vec![
                Value::BulkString(b"field".to_vec()),
                Value::BulkString(b"value".to_vec()),
            ])),
            &mut pipeline,
            &mut pubsub_mode,
            &mut subs,
            &push_router,
            false,
            &make_config(),
        );
        let result = rx.await.unwrap().unwrap();
        assert!(matches!(result, Value::Map(_)));
    }

    #[test]
    fn an_array_shaped_like_a_push_is_delivered_normally_when_pub_sub_mode_is_zero() {
        // Spec §8's "exactly one completion" invariant: a plain command
        // reply that happens to be a 2+ element array starting with
        // "message" must still resolve its sink when no subscribe-family
        // command is active, rather than being swallowed as a push.
        let mut pipeline = Pipeline::new();
        let mut pubsub_mode = PubSubMode::default();
        let mut subs = SubscriptionSet::new();
        let push_router = PushRouter::new();
        let (tx, rx) = oneshot::channel();
        pipeline.push_in_flight(Command::new("LRANGE", vec![], Sink::Future(tx)));

        let outcome = dispatch(
            Ok(Value::Array(vec![
                Value::BulkString(b"message".to_vec()),
                Value::BulkString(b"ch".to_vec()),
                Value::BulkString(b"payload".to_vec()),
            ])),
            &mut pipeline,
            &mut pubsub_mode,
            &mut subs,
            &push_router,
            false,
            &make_config(),
        );
        assert!(matches!(outcome, DispatchOutcome::Resolved));
        assert!(rx.await.unwrap().is_ok());
    }

    #[test]
    fn routes_message_push_without_touching_pipeline() {
        let mut pipeline = Pipeline::new();
        pipeline.push_in_flight(Command::new("GET", vec![], Sink::None));
        let mut pubsub_mode = PubSubMode::default();
        pubsub_mode.activate(1);
        let mut subs = SubscriptionSet::new();
        let push_router = PushRouter::new();

        let outcome = dispatch(
            Ok(Value::Array(vec![
                Value::BulkString(b"message".to_vec()),
                Value::BulkString(b"ch".to_vec()),
                Value::BulkString(b"payload".to_vec()),
            ])),
            &mut pipeline,
            &mut pubsub_mode,
            &mut subs,
            &push_router,
            false,
            &make_config(),
        );
        assert!(matches!(outcome, DispatchOutcome::PushRouted));
        assert_eq!(pipeline.in_flight_len(), 1);
    }

    #[test]
    fn a_resp3_push_frame_always_routes_as_pub_sub_even_with_mode_zero() {
        let mut pipeline = Pipeline::new();
        let mut pubsub_mode = PubSubMode::default();
        let mut subs = SubscriptionSet::new();
        let push_router = PushRouter::new();

        let outcome = dispatch(
            Ok(Value::Push(vec![
                Value::BulkString(b"message".to_vec()),
                Value::BulkString(b"ch".to_vec()),
                Value::BulkString(b"payload".to_vec()),
            ])),
            &mut pipeline,
            &mut pubsub_mode,
            &mut subs,
            &push_router,
            false,
            &make_config(),
        );
        assert!(matches!(outcome, DispatchOutcome::PushRouted));
    }

    #[test]
    fn subscribe_ack_activates_pubsub_mode_and_records_subscription() {
        let mut pipeline = Pipeline::new();
        let mut cmd = Command::new("SUBSCRIBE", vec![], Sink::None);
        cmd.sub_commands_left = Some(1);
        pipeline.push_in_flight(cmd);
        let mut pubsub_mode = PubSubMode::default();
        pubsub_mode.activate(1);
        let mut subs = SubscriptionSet::new();
        let push_router = PushRouter::new();

        dispatch(
            Ok(Value::Array(vec![
                Value::BulkString(b"subscribe".to_vec()),
                Value::BulkString(b"ch".to_vec()),
                Value::Int(1),
            ])),
            &mut pipeline,
            &mut pubsub_mode,
            &mut subs,
            &push_router,
            false,
            &make_config(),
        );
        assert!(pubsub_mode.is_active());
        assert_eq!(subs.len(), 1);
        assert_eq!(pipeline.in_flight_len(), 0);
    }

    #[test]
    fn unsubscribe_ack_reaching_zero_resets_pubsub_mode_when_nothing_else_pending() {
        let mut pipeline = Pipeline::new();
        let mut cmd = Command::new("UNSUBSCRIBE", vec![], Sink::None);
        cmd.sub_commands_left = Some(1);
        pipeline.push_in_flight(cmd);
        let mut pubsub_mode = PubSubMode::default();
        pubsub_mode.activate(1);
        let mut subs = SubscriptionSet::new();
        subs.add(SubKind::Subscribe, "ch".to_string());
        let push_router = PushRouter::new();

        dispatch(
            Ok(Value::Array(vec![
                Value::BulkString(b"unsubscribe".to_vec()),
                Value::BulkString(b"ch".to_vec()),
                Value::Int(0),
            ])),
            &mut pipeline,
            &mut pubsub_mode,
            &mut subs,
            &push_router,
            false,
            &make_config(),
        );
        assert!(!pubsub_mode.is_active());
        assert!(subs.is_empty());
    }

    #[test]
    fn pending_entry_countdown_decrements_on_intervening_normal_replies() {
        let mut pipeline = Pipeline::new();
        let (tx, _rx) = oneshot::channel();
        pipeline.push_in_flight(Command::new("GET", vec![], Sink::Future(tx)));
        let mut sub_cmd = Command::new("SUBSCRIBE", vec![], Sink::None);
        sub_cmd.sub_commands_left = Some(1);
        pipeline.push_in_flight(sub_cmd);

        let mut pubsub_mode = PubSubMode::default();
        pubsub_mode.activate(2); // one command ahead of the subscribe
        let mut subs = SubscriptionSet::new();
        let push_router = PushRouter::new();

        let outcome = dispatch(
            Ok(Value::BulkString(b"v".to_vec())),
            &mut pipeline,
            &mut pubsub_mode,
            &mut subs,
            &push_router,
            false,
            &make_config(),
        );
        assert!(matches!(outcome, DispatchOutcome::Resolved));
        assert_eq!(pubsub_mode.count(), 1);
        assert_eq!(pipeline.in_flight_len(), 1);
    }
}
