//! Error taxonomy for the client core.
//!
//! Mirrors the table in spec §7: every fatal or propagated failure the
//! controller produces has exactly one variant here, and every variant
//! carries enough context (command, args, origin) for a command sink to
//! report something actionable.

use std::fmt;

/// The reason an `NrClosed` error was produced, distinguishing the three
/// cases spec §4.2 calls out explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedReason {
    /// `end()`/`quit()` already put the client into `closing`.
    AlreadyClosed,
    /// The transport reported it is not currently writable.
    NotWritable,
    /// `enable_offline_queue` is `false` and the client is not ready.
    OfflineQueueDisabled,
}

impl fmt::Display for ClosedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClosedReason::AlreadyClosed => write!(f, "connection already closed"),
            ClosedReason::NotWritable => write!(f, "stream not writable"),
            ClosedReason::OfflineQueueDisabled => write!(f, "offline queue deactivated"),
        }
    }
}

/// A `-`-prefixed server reply, enriched with the context the dispatcher
/// attaches in spec §4.6 (command, args, origin stack, extracted code).
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyError {
    pub code: Option<String>,
    pub message: String,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub origin: Option<String>,
}

impl ReplyError {
    /// Parses a raw `-ERR some message` line, extracting a leading
    /// upper-case token as the error code per spec §4.6 (`^([A-Z]+)\s+(.+)$`).
    pub fn parse(raw: &str) -> Self {
        let (code, message) = split_code(raw);
        ReplyError {
            code,
            message,
            command: None,
            args: None,
            origin: None,
        }
    }

    pub fn with_command(mut self, command: impl Into<String>, args: Vec<String>) -> Self {
        self.command = Some(command.into());
        self.args = Some(args);
        self
    }

    pub fn with_origin(mut self, origin: Option<String>) -> Self {
        self.origin = origin;
        self
    }
}

/// Splits `"ERR wrong number of arguments"` into `(Some("ERR"),
/// "wrong number of arguments")`. Any message not starting with a run of
/// upper-case letters followed by whitespace has no code.
fn split_code(raw: &str) -> (Option<String>, String) {
    let mut chars = raw.char_indices();
    let mut end = 0;
    for (idx, ch) in &mut chars {
        if ch.is_ascii_uppercase() {
            end = idx + ch.len_utf8();
        } else {
            break;
        }
    }
    if end == 0 {
        return (None, raw.to_string());
    }
    let rest = &raw[end..];
    if let Some(stripped) = rest.strip_prefix(' ') {
        (Some(raw[..end].to_string()), stripped.to_string())
    } else {
        (None, raw.to_string())
    }
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(command) = &self.command {
            write!(f, " (command: {command})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ReplyError {}

/// Every failure mode a command sink or the client-level `error` event can
/// observe. Variant names follow spec §7's `code` column.
#[derive(Debug, thiserror::Error)]
pub enum RedisLinkError {
    /// `NR_CLOSED` — send attempted while closing, not writable, or the
    /// offline queue is disabled.
    #[error("connection is closed: {0}")]
    NrClosed(ClosedReason),

    /// `UNCERTAIN_STATE` — an in-flight command was orphaned by a disconnect
    /// and `retry_unfulfilled_commands` was not set.
    #[error("Redis connection lost and command aborted. It might have been processed.")]
    UncertainState,

    /// `CONNECTION_BROKEN` — the retry budget (attempts or total time) was
    /// exhausted.
    #[error("connection broken: retry budget exhausted")]
    ConnectionBroken,

    /// `NR_FATAL` — the reply parser reported a fatal, unrecoverable framing
    /// error.
    #[error("fatal protocol error: {0}")]
    NrFatal(String),

    /// A `-` reply from the server, possibly enriched with command context.
    #[error(transparent)]
    Reply(#[from] ReplyError),

    /// Propagated transport I/O failure.
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    /// Several of the above collected by the error flusher (spec §4.9) when
    /// more than one queued command had no sink to report to.
    #[error("{0} aggregated errors")]
    Aggregate(Vec<RedisLinkError>),
}

impl RedisLinkError {
    pub fn closed(reason: ClosedReason) -> Self {
        RedisLinkError::NrClosed(reason)
    }

    /// `true` for errors spec §7 says must never reach a command sink or the
    /// `error` event because they were locally recovered.
    pub fn is_connection_dropped(&self) -> bool {
        matches!(
            self,
            RedisLinkError::Io(_) | RedisLinkError::UncertainState | RedisLinkError::NrFatal(_)
        )
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            RedisLinkError::Reply(err) => err.code.as_deref(),
            RedisLinkError::NrClosed(_) => Some("NR_CLOSED"),
            RedisLinkError::UncertainState => Some("UNCERTAIN_STATE"),
            RedisLinkError::ConnectionBroken => Some("CONNECTION_BROKEN"),
            RedisLinkError::NrFatal(_) => Some("NR_FATAL"),
            _ => None,
        }
    }
}

pub type RedisLinkResult<T> = Result<T, RedisLinkError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_leading_code() {
        let err = ReplyError::parse("WRONGTYPE Operation against a key");
        assert_eq!(err.code.as_deref(), Some("WRONGTYPE"));
        assert_eq!(err.message, "Operation against a key");
    }

    #[test]
    fn leaves_codeless_messages_alone() {
        let err = ReplyError::parse("no password is set");
        assert_eq!(err.code, None);
        assert_eq!(err.message, "no password is set");
    }
}
