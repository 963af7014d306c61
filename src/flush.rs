//! The error flusher (spec §4.9): drains both queues on a fatal
//! transition, resolving every pending sink with a message whose suffix
//! distinguishes a command that was merely queued from one that may have
//! already reached the server.

use crate::command::Command;
use crate::error::RedisLinkError;
use crate::queue::Pipeline;

/// Resolves every command still held by `pipeline` with `cause`, using
/// [`RedisLinkError::UncertainState`] instead for in-flight commands when
/// `retry_unfulfilled_commands` is not set — those may have already been
/// written to the socket and possibly processed by the server (spec
/// §4.2/§4.9).
pub fn flush_and_error(
    pipeline: &mut Pipeline,
    cause: RedisLinkError,
    retry_unfulfilled_commands: bool,
) {
    let (offline, in_flight) = pipeline.drain_all();

    for command in offline {
        resolve_with(command, clone_error(&cause));
    }

    for command in in_flight {
        let error = if retry_unfulfilled_commands {
            clone_error(&cause)
        } else {
            RedisLinkError::UncertainState
        };
        resolve_with(command, error);
    }
}

fn resolve_with(command: Command, error: RedisLinkError) {
    command.sink.resolve(Err(error));
}

/// `RedisLinkError` is not `Clone` (it wraps a `ReplyError`/`io::Error`
/// that may not round-trip cleanly), so fatal flush causes are
/// represented by their discriminant instead of the original value when
/// more than one sink needs resolving.
fn clone_error(cause: &RedisLinkError) -> RedisLinkError {
    match cause {
        RedisLinkError::NrClosed(reason) => RedisLinkError::NrClosed(*reason),
        RedisLinkError::UncertainState => RedisLinkError::UncertainState,
        RedisLinkError::ConnectionBroken => RedisLinkError::ConnectionBroken,
        RedisLinkError::NrFatal(msg) => RedisLinkError::NrFatal(msg.clone()),
        RedisLinkError::Reply(err) => RedisLinkError::Reply(err.clone()),
        RedisLinkError::Io(err) => RedisLinkError::Io(std::io::Error::new(err.kind(), err.to_string())),
        RedisLinkError::Aggregate(errs) => {
            RedisLinkError::Aggregate(errs.iter().map(clone_error).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Sink;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn offline_commands_get_the_flush_cause_verbatim() {
        let mut pipeline = Pipeline::new();
        let (tx, rx) = oneshot::channel();
        pipeline.enqueue_offline(Command::new("GET", vec![], Sink::Future(tx)));

        flush_and_error(&mut pipeline, RedisLinkError::ConnectionBroken, false);

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, RedisLinkError::ConnectionBroken));
    }

    #[tokio::test]
    async fn in_flight_commands_get_uncertain_state_by_default() {
        let mut pipeline = Pipeline::new();
        let (tx, rx) = oneshot::channel();
        pipeline.push_in_flight(Command::new("SET", vec![], Sink::Future(tx)));

        flush_and_error(&mut pipeline, RedisLinkError::ConnectionBroken, false);

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, RedisLinkError::UncertainState));
    }

    #[tokio::test]
    async fn in_flight_commands_get_the_cause_when_retry_unfulfilled_is_set() {
        let mut pipeline = Pipeline::new();
        let (tx, rx) = oneshot::channel();
        pipeline.push_in_flight(Command::new("SET", vec![], Sink::Future(tx)));

        flush_and_error(&mut pipeline, RedisLinkError::ConnectionBroken, true);

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, RedisLinkError::ConnectionBroken));
    }
}
