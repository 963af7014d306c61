//! Client configuration (spec §6's recognized-option table) plus the
//! per-command metadata the key-prefixing and renaming features need
//! (spec §4.1).

use std::collections::HashMap;
use std::time::Duration;

/// Negotiated reply protocol. Threaded through the ready check's
/// handshake path (spec §4.8, supplemented per `SPEC_FULL.md` §4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    #[default]
    Resp2,
    Resp3,
}

/// Decision returned by a user-supplied [`RetryStrategyFn`] for the next
/// reconnect attempt (spec §4.3).
#[derive(Debug, Clone, Copy)]
pub enum RetryDecision {
    /// Wait this long, then retry.
    RetryAfter(Duration),
    /// Give up; the controller transitions to `end` and flushes both
    /// queues with `ConnectionBroken`.
    Stop,
}

/// Context handed to a [`RetryStrategyFn`] ahead of each reconnect attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext {
    pub attempt: u32,
    pub elapsed: Duration,
}

/// A user-pluggable retry strategy, overriding the default exponential
/// backoff (spec §4.3). Boxed rather than generic so `ClientConfig` stays
/// object-safe to construct and clone-free to store.
pub type RetryStrategyFn = Box<dyn Fn(RetryContext) -> RetryDecision + Send + Sync>;

/// The full recognized-option surface of spec §6, as a plain struct.
/// URL-style construction remains an external collaborator; callers build
/// this directly or via [`ClientConfig::default`] plus field assignment.
pub struct ClientConfig {
    pub host: String,
    pub port: u16,

    /// Queue commands sent while not `ready` instead of rejecting them
    /// immediately (spec §4.2).
    pub enable_offline_queue: bool,

    /// Maximum reconnect attempts before giving up (spec §4.3). `None`
    /// means unlimited attempts (still bounded by `max_retry_time` if set).
    pub max_reconnect_attempts: Option<u32>,

    /// Maximum cumulative time spent retrying before giving up (spec
    /// §4.3's `retry_total_ms >= connect_timeout_ms` check). `None` falls
    /// back to `connect_timeout` itself, which is what spec §4.3's state
    /// vector does — `connect_timeout_ms` is the only cumulative-budget
    /// field it names, so the default keeps that single field load-bearing
    /// instead of silently retrying forever until an explicit value is set.
    pub max_retry_time: Option<Duration>,

    /// Initial delay for the default backoff recurrence (spec §4.3,
    /// default 200ms).
    pub retry_base_delay: Duration,

    /// Multiplier applied to the retry delay after every attempt (spec
    /// §4.3's `retry_delay = round(retry_delay * retry_backoff)`, default
    /// 1.7).
    pub retry_backoff: f64,

    /// Cap on the computed backoff delay (spec §4.3).
    pub retry_max_delay: Duration,

    /// Overrides the default exponential backoff entirely when set.
    pub retry_strategy: Option<RetryStrategyFn>,

    /// Resolve a command's in-flight sink with `UNCERTAIN_STATE` instead of
    /// silently requeuing it after a disconnect (spec §4.2/§4.9).
    pub retry_unfulfilled_commands: bool,

    /// Skip the `INFO`-based ready check entirely and transition straight
    /// to `ready` once the transport connects (spec §4.8/§6).
    pub no_ready_check: bool,

    /// Keep the subscription set across a reconnect but do not replay it
    /// onto the new connection (spec §4.5/§6).
    pub disable_resubscribing: bool,

    /// Socket/connect-level timeout (spec §6).
    pub connect_timeout: Duration,

    /// How long a single command may wait for its reply before the sink is
    /// resolved with a timeout error (spec §6).
    pub command_timeout: Option<Duration>,

    /// Negotiated protocol version (`SPEC_FULL.md` §4 supplement).
    pub protocol: ProtocolVersion,

    /// Convert bulk-string replies to text when the originating command
    /// carried no binary arguments (spec §4.6).
    pub detect_buffers: bool,

    /// Prefix prepended to every key-position argument, per the command
    /// metadata table in `key_positions` (spec §4.1).
    pub key_prefix: Option<String>,

    /// Substitutes a command name before it is sent, e.g. disabling a
    /// dangerous command by renaming it to an empty string (spec §4.1).
    pub rename_commands: HashMap<String, String>,

    /// Username/password issued via `AUTH`/`HELLO` during the ready check
    /// (spec §6).
    pub username: Option<String>,
    pub password: Option<String>,

    /// Logical database selected via `SELECT` during the ready check
    /// (spec §6).
    pub database: Option<i64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 6379,
            enable_offline_queue: true,
            max_reconnect_attempts: None,
            max_retry_time: None,
            retry_base_delay: Duration::from_millis(200),
            retry_backoff: 1.7,
            retry_max_delay: Duration::from_secs(2),
            retry_strategy: None,
            retry_unfulfilled_commands: false,
            no_ready_check: false,
            disable_resubscribing: false,
            connect_timeout: Duration::from_millis(3_600_000),
            command_timeout: None,
            protocol: ProtocolVersion::default(),
            detect_buffers: false,
            key_prefix: None,
            rename_commands: HashMap::new(),
            username: None,
            password: None,
            database: None,
        }
    }
}

impl Clone for ClientConfig {
    /// `retry_strategy` is a `Box<dyn Fn>` and cannot be cloned; a cloned
    /// config falls back to the default exponential backoff. Used by
    /// [`crate::Client::duplicate`] (spec §6), which takes an `overrides`
    /// record precisely so a caller who needs a custom strategy on the
    /// duplicate can re-supply it there.
    fn clone(&self) -> Self {
        ClientConfig {
            host: self.host.clone(),
            port: self.port,
            enable_offline_queue: self.enable_offline_queue,
            max_reconnect_attempts: self.max_reconnect_attempts,
            max_retry_time: self.max_retry_time,
            retry_base_delay: self.retry_base_delay,
            retry_backoff: self.retry_backoff,
            retry_max_delay: self.retry_max_delay,
            retry_strategy: None,
            retry_unfulfilled_commands: self.retry_unfulfilled_commands,
            no_ready_check: self.no_ready_check,
            disable_resubscribing: self.disable_resubscribing,
            connect_timeout: self.connect_timeout,
            command_timeout: self.command_timeout,
            protocol: self.protocol,
            detect_buffers: self.detect_buffers,
            key_prefix: self.key_prefix.clone(),
            rename_commands: self.rename_commands.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            database: self.database,
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("enable_offline_queue", &self.enable_offline_queue)
            .field("max_reconnect_attempts", &self.max_reconnect_attempts)
            .field("max_retry_time", &self.max_retry_time)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("retry_backoff", &self.retry_backoff)
            .field("retry_max_delay", &self.retry_max_delay)
            .field("retry_strategy", &self.retry_strategy.as_ref().map(|_| "<fn>"))
            .field(
                "retry_unfulfilled_commands",
                &self.retry_unfulfilled_commands,
            )
            .field("no_ready_check", &self.no_ready_check)
            .field("disable_resubscribing", &self.disable_resubscribing)
            .field("connect_timeout", &self.connect_timeout)
            .field("command_timeout", &self.command_timeout)
            .field("protocol", &self.protocol)
            .field("detect_buffers", &self.detect_buffers)
            .field("key_prefix", &self.key_prefix)
            .field("rename_commands", &self.rename_commands)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .finish()
    }
}

impl ClientConfig {
    /// Applies `rename_commands`, returning the name actually sent on the
    /// wire (spec §4.1).
    pub fn resolve_command_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.rename_commands
            .get(name)
            .map(String::as_str)
            .unwrap_or(name)
    }
}

/// Describes which argument positions of a command are key names, so
/// `key_prefix` can be applied without a server-side command table lookup.
/// Mirrors the static command table the grounding teacher ships in its
/// cluster routing layer, trimmed to the subset this crate needs
/// (single-connection key prefixing, not slot routing).
#[derive(Debug, Clone, Copy)]
pub enum KeyPositions {
    /// No arguments are key names (e.g. `PING`, `INFO`).
    None,
    /// A single fixed argument index is the key (0-based into `args`).
    Fixed(usize),
    /// Every argument from this index onward is a key (e.g. `MGET`, `DEL`).
    FromIndex(usize),
    /// Keys occupy alternating positions starting at this index (e.g.
    /// `MSET`: key, value, key, value...).
    Alternating(usize),
}

/// Looks up the key-position rule for a well-known command name. Unknown
/// commands default to [`KeyPositions::None`] — the caller is expected to
/// extend this table for application-specific commands rather than guess.
pub fn key_positions_for(command: &str) -> KeyPositions {
    match command.to_ascii_uppercase().as_str() {
        "GET" | "SET" | "INCR" | "DECR" | "APPEND" | "STRLEN" | "TYPE" | "TTL" | "PERSIST"
        | "EXPIRE" | "HGETALL" | "HGET" | "HSET" | "LPUSH" | "RPUSH" | "LRANGE" | "SADD"
        | "SMEMBERS" | "ZADD" | "ZRANGE" => KeyPositions::Fixed(0),
        "MGET" | "DEL" | "UNLINK" | "EXISTS" | "WATCH" => KeyPositions::FromIndex(0),
        "MSET" | "MSETNX" => KeyPositions::Alternating(0),
        _ => KeyPositions::None,
    }
}

/// Applies `key_prefix` to a command's text arguments at the key
/// positions [`key_positions_for`] reports. Binary arguments at key
/// positions are left untouched — prefixing is a text-protocol
/// convenience, not something this crate forces onto opaque bytes.
pub fn prefixed_args(
    command: &str,
    args: &[crate::command::Arg],
    prefix: &str,
) -> Vec<crate::command::Arg> {
    use crate::command::Arg;

    let is_key_index = |idx: usize| -> bool {
        match key_positions_for(command) {
            KeyPositions::None => false,
            KeyPositions::Fixed(i) => idx == i,
            KeyPositions::FromIndex(i) => idx >= i,
            KeyPositions::Alternating(i) => idx >= i && (idx - i) % 2 == 0,
        }
    };

    args.iter()
        .enumerate()
        .map(|(idx, arg)| match arg {
            Arg::Text(s) if is_key_index(idx) => Arg::Text(format!("{prefix}{s}")),
            other => other.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Arg;

    #[test]
    fn default_config_enables_offline_queue() {
        let cfg = ClientConfig::default();
        assert!(cfg.enable_offline_queue);
        assert_eq!(cfg.protocol, ProtocolVersion::Resp2);
        assert!(!cfg.no_ready_check);
        assert!(!cfg.disable_resubscribing);
    }

    #[test]
    fn renames_commands() {
        let mut cfg = ClientConfig::default();
        cfg.rename_commands
            .insert("FLUSHALL".to_string(), "".to_string());
        assert_eq!(cfg.resolve_command_name("FLUSHALL"), "");
        assert_eq!(cfg.resolve_command_name("GET"), "GET");
    }

    #[test]
    fn prefixes_fixed_key_position() {
        let args = vec![Arg::Text("foo".into()), Arg::Text("bar".into())];
        let out = prefixed_args("SET", &args, "app:");
        assert_eq!(out[0], Arg::Text("app:foo".into()));
        assert_eq!(out[1], Arg::Text("bar".into()));
    }

    #[test]
    fn prefixes_alternating_keys_for_mset() {
        let args = vec![
            Arg::Text("k1".into()),
            Arg::Text("v1".into()),
            Arg::Text("k2".into()),
            Arg::Text("v2".into()),
        ];
        let out = prefixed_args("MSET", &args, "ns:");
        assert_eq!(out[0], Arg::Text("ns:k1".into()));
        assert_eq!(out[1], Arg::Text("v1".into()));
        assert_eq!(out[2], Arg::Text("ns:k2".into()));
        assert_eq!(out[3], Arg::Text("v2".into()));
    }

    #[test]
    fn prefixes_every_key_for_mget() {
        let args = vec![Arg::Text("a".into()), Arg::Text("b".into())];
        let out = prefixed_args("MGET", &args, "p:");
        assert_eq!(out[0], Arg::Text("p:a".into()));
        assert_eq!(out[1], Arg::Text("p:b".into()));
    }
}
