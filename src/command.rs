//! Command construction and argument normalization (spec §3, §4.1).

use crate::error::RedisLinkError;
use crate::value::Value;
use tokio::sync::oneshot;

/// Arguments promoted past this many bytes are rewritten as binary rather
/// than text, per spec §4.1.
pub const MAX_TEXT_ARG_LEN: usize = 30_000;

/// A single command argument: either UTF-8 text or an opaque byte string.
/// The writer's corking batcher decides its fast path based on whether any
/// argument in a batch is `Binary` (spec §4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Text(String),
    Binary(Vec<u8>),
}

impl Arg {
    pub fn len(&self) -> usize {
        match self {
            Arg::Text(s) => s.len(),
            Arg::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Arg::Binary(_))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Arg::Text(s) => s.as_bytes(),
            Arg::Binary(b) => b,
        }
    }
}

/// Marker type for `null`, rendered as the literal text `"null"` with a
/// deprecation warning per spec §4.1.
#[derive(Debug, Clone, Copy, Default)]
pub struct Null;

/// Marker type for `undefined`, rendered as the literal text `"undefined"`
/// with a deprecation warning per spec §4.1.
#[derive(Debug, Clone, Copy, Default)]
pub struct Undefined;

/// Converts a caller-supplied value into a normalized `Arg`, applying the
/// text/binary promotion and literal-text rules of spec §4.1.
pub trait ToArg {
    fn to_arg(&self) -> Arg;

    /// `true` if converting this value should emit a deprecation warning
    /// (the `Null`/`Undefined` literal-text forms).
    fn deprecated(&self) -> bool {
        false
    }
}

impl ToArg for Arg {
    fn to_arg(&self) -> Arg {
        self.clone()
    }
}

impl ToArg for str {
    fn to_arg(&self) -> Arg {
        normalize_text(self.to_string())
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Arg {
        normalize_text(self.clone())
    }
}

impl ToArg for [u8] {
    fn to_arg(&self) -> Arg {
        Arg::Binary(self.to_vec())
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Arg {
        Arg::Binary(self.clone())
    }
}

macro_rules! impl_to_arg_int {
    ($($t:ty => $buf:ty),+ $(,)?) => {
        $(
            impl ToArg for $t {
                fn to_arg(&self) -> Arg {
                    let mut buf = <$buf>::new();
                    Arg::Text(buf.format(*self).to_string())
                }
            }
        )+
    };
}

impl_to_arg_int!(
    i8 => itoa::Buffer, i16 => itoa::Buffer, i32 => itoa::Buffer, i64 => itoa::Buffer,
    u8 => itoa::Buffer, u16 => itoa::Buffer, u32 => itoa::Buffer, u64 => itoa::Buffer,
    isize => itoa::Buffer, usize => itoa::Buffer,
);

impl ToArg for f32 {
    fn to_arg(&self) -> Arg {
        let mut buf = ryu::Buffer::new();
        Arg::Text(buf.format(*self).to_string())
    }
}

impl ToArg for f64 {
    fn to_arg(&self) -> Arg {
        let mut buf = ryu::Buffer::new();
        Arg::Text(buf.format(*self).to_string())
    }
}

impl ToArg for Null {
    fn to_arg(&self) -> Arg {
        Arg::Text("null".to_string())
    }

    fn deprecated(&self) -> bool {
        true
    }
}

impl ToArg for Undefined {
    fn to_arg(&self) -> Arg {
        Arg::Text("undefined".to_string())
    }

    fn deprecated(&self) -> bool {
        true
    }
}

/// Promotes text longer than [`MAX_TEXT_ARG_LEN`] to `Arg::Binary`, per
/// spec §4.1 ("long text arguments are treated as binary to avoid a copy
/// at encode time").
fn normalize_text(s: String) -> Arg {
    if s.len() > MAX_TEXT_ARG_LEN {
        Arg::Binary(s.into_bytes())
    } else {
        Arg::Text(s)
    }
}

/// Where a command's reply is delivered. A callback sink is used by the
/// pipelining API surface; a oneshot sink backs the `async fn` facade on
/// `Client`. See Design Note 1 in `DESIGN.md`.
pub enum Sink {
    Callback(Box<dyn FnOnce(Result<Value, RedisLinkError>) + Send>),
    Future(oneshot::Sender<Result<Value, RedisLinkError>>),
    /// No one is listening for the reply (fire-and-forget pipelining).
    None,
}

impl Sink {
    pub fn resolve(self, result: Result<Value, RedisLinkError>) {
        match self {
            Sink::Callback(cb) => cb(result),
            Sink::Future(tx) => {
                let _ = tx.send(result);
            }
            Sink::None => {}
        }
    }
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Sink::Callback(_) => "Callback",
            Sink::Future(_) => "Future",
            Sink::None => "None",
        };
        f.debug_tuple("Sink").field(&kind).finish()
    }
}

/// A fully-normalized command record (spec §3): the command name, its
/// normalized arguments, and where its reply should go. `sub_commands_left`
/// tracks outstanding subscribe/unsubscribe acknowledgements for pub/sub
/// commands issued with multiple channel/pattern arguments (spec §4.5,
/// resolved per Design Note 2 in `DESIGN.md`).
#[derive(Debug)]
pub struct Command {
    pub name: String,
    pub args: Vec<Arg>,
    pub sink: Sink,
    /// Any argument in this command is `Arg::Binary` — decides the writer's
    /// strings-fast-path vs. buffers-path split (spec §4.4).
    pub has_binary: bool,
    /// This command's reply should bypass `detect_buffers` text conversion
    /// because the command itself carried binary input (spec §4.6).
    pub big_data: bool,
    pub sub_commands_left: Option<usize>,
}

impl Command {
    pub fn new(name: impl Into<String>, args: Vec<Arg>, sink: Sink) -> Self {
        let has_binary = args.iter().any(Arg::is_binary);
        Command {
            name: name.into(),
            args,
            sink,
            has_binary,
            big_data: has_binary,
            sub_commands_left: None,
        }
    }

    /// Renders `name` plus `args` as the ordered multi-bulk argument vector
    /// the writer serializes (spec §4.4).
    pub fn multi_bulk_args(&self) -> Vec<Arg> {
        let mut out = Vec::with_capacity(self.args.len() + 1);
        out.push(Arg::Text(self.name.clone()));
        out.extend(self.args.iter().cloned());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotes_long_text_to_binary() {
        let long = "a".repeat(MAX_TEXT_ARG_LEN + 1);
        assert!(matches!(long.to_arg(), Arg::Binary(_)));
    }

    #[test]
    fn keeps_short_text_as_text() {
        assert_eq!("hello".to_arg(), Arg::Text("hello".to_string()));
    }

    #[test]
    fn null_and_undefined_are_deprecated_literals() {
        assert_eq!(Null.to_arg(), Arg::Text("null".to_string()));
        assert!(Null.deprecated());
        assert_eq!(Undefined.to_arg(), Arg::Text("undefined".to_string()));
        assert!(Undefined.deprecated());
    }

    #[test]
    fn integers_render_as_decimal_text() {
        assert_eq!(42i64.to_arg(), Arg::Text("42".to_string()));
        assert_eq!((-7i32).to_arg(), Arg::Text("-7".to_string()));
    }

    #[test]
    fn detects_binary_commands() {
        let cmd = Command::new(
            "SET",
            vec![Arg::Text("k".into()), Arg::Binary(vec![0, 1, 2])],
            Sink::None,
        );
        assert!(cmd.has_binary);
        assert!(cmd.big_data);
    }
}
