//! The reply parser. Spec §1 treats this as an external collaborator
//! ("assumed to exist and deliver structured replies"); this module
//! provides the concrete default every other component is written against
//! via the `ReplyParser` trait, so an alternate tokenizer can be swapped in
//! without touching the pipeline, dispatcher, or controller.

use crate::error::{RedisLinkError, ReplyError};
use crate::value::{Frame, Value};
use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

/// Anything that can turn a byte stream into a sequence of `Frame`s is a
/// valid reply parser. `tokio_util::codec::Decoder` already has exactly the
/// right shape (incremental, buffer-owning), so we ask for that instead of
/// inventing a parallel trait.
pub trait ReplyParser: Decoder<Item = Frame, Error = RedisLinkError> + Send + 'static {}

impl<T> ReplyParser for T where T: Decoder<Item = Frame, Error = RedisLinkError> + Send + 'static {}

/// RESP2/RESP3 multi-bulk decoder.
///
/// RESP3 additions (`_`, `#`, `,`, `>`, `%`) are recognized regardless of
/// the negotiated protocol version; a RESP2-only server will simply never
/// emit them.
#[derive(Debug, Default)]
pub struct Resp2Parser {
    _private: (),
}

impl Resp2Parser {
    pub fn new() -> Self {
        Self::default()
    }
}

const MAX_INLINE_LEN: i64 = 512 * 1024 * 1024;

impl Decoder for Resp2Parser {
    type Item = Frame;
    type Error = RedisLinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, RedisLinkError> {
        match parse_frame(src)? {
            Some((consumed, frame)) => {
                src.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

/// Finds a `\r\n`-terminated line starting at `buf`, returning the line
/// content (without the terminator) and the number of bytes it and the
/// terminator occupy.
fn read_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    let pos = buf.windows(2).position(|w| w == b"\r\n")?;
    Some((&buf[..pos], pos + 2))
}

/// Parses exactly one top-level frame out of `buf`, returning the number of
/// bytes consumed and the resulting `Frame`. Returns `Ok(None)` if `buf`
/// does not yet contain a complete frame.
fn parse_frame(buf: &[u8]) -> Result<Option<(usize, Frame)>, RedisLinkError> {
    match parse_value(buf)? {
        Some((consumed, ParsedValue::Value(value))) => Ok(Some((consumed, Ok(value)))),
        Some((consumed, ParsedValue::Error(err))) => Ok(Some((consumed, Err(err)))),
        None => Ok(None),
    }
}

enum ParsedValue {
    Value(Value),
    Error(ReplyError),
}

/// Parses one RESP value (which may recurse into arrays/maps). Top-level
/// errors and nested errors are both produced here; the caller decides
/// whether a top-level error becomes `Frame::Err` or a nested
/// `Value::ServerError`.
fn parse_value(buf: &[u8]) -> Result<Option<(usize, ParsedValue)>, RedisLinkError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let tag = buf[0];
    let rest = &buf[1..];
    let Some((line, line_len)) = read_line(rest) else {
        return Ok(None);
    };
    let header_len = 1 + line_len;
    let text = std::str::from_utf8(line)
        .map_err(|_| RedisLinkError::NrFatal("non-utf8 line in reply".into()))?;

    match tag {
        b'+' => {
            let value = if text == "OK" {
                Value::Okay
            } else {
                Value::SimpleString(text.to_string())
            };
            Ok(Some((header_len, ParsedValue::Value(value))))
        }
        b'-' => Ok(Some((
            header_len,
            ParsedValue::Error(ReplyError::parse(text)),
        ))),
        b':' => {
            let n: i64 = text
                .parse()
                .map_err(|_| RedisLinkError::NrFatal(format!("invalid integer reply: {text}")))?;
            Ok(Some((header_len, ParsedValue::Value(Value::Int(n)))))
        }
        b'_' => Ok(Some((header_len, ParsedValue::Value(Value::Nil)))),
        b'#' => {
            let b = match text {
                "t" => true,
                "f" => false,
                _ => return Err(RedisLinkError::NrFatal(format!("invalid boolean reply: {text}"))),
            };
            Ok(Some((header_len, ParsedValue::Value(Value::Boolean(b)))))
        }
        b',' => {
            let d: f64 = text
                .parse()
                .map_err(|_| RedisLinkError::NrFatal(format!("invalid double reply: {text}")))?;
            Ok(Some((header_len, ParsedValue::Value(Value::Double(d)))))
        }
        b'$' => parse_bulk_string(buf, header_len, text),
        b'*' | b'>' => parse_array(buf, header_len, text, tag == b'>'),
        b'%' => parse_map(buf, header_len, text),
        other => Err(RedisLinkError::NrFatal(format!(
            "unrecognized reply type byte {other:#04x}"
        ))),
    }
}

fn parse_bulk_string(
    buf: &[u8],
    header_len: usize,
    len_text: &str,
) -> Result<Option<(usize, ParsedValue)>, RedisLinkError> {
    let len: i64 = len_text
        .parse()
        .map_err(|_| RedisLinkError::NrFatal(format!("invalid bulk length: {len_text}")))?;
    if len == -1 {
        return Ok(Some((header_len, ParsedValue::Value(Value::Nil))));
    }
    if !(0..=MAX_INLINE_LEN).contains(&len) {
        return Err(RedisLinkError::NrFatal(format!(
            "bulk length out of range: {len}"
        )));
    }
    let len = len as usize;
    let needed = header_len + len + 2;
    if buf.len() < needed {
        return Ok(None);
    }
    if &buf[header_len + len..needed] != b"\r\n" {
        return Err(RedisLinkError::NrFatal(
            "bulk string missing trailing CRLF".into(),
        ));
    }
    let bytes = buf[header_len..header_len + len].to_vec();
    Ok(Some((needed, ParsedValue::Value(Value::BulkString(bytes)))))
}

fn parse_array(
    buf: &[u8],
    header_len: usize,
    len_text: &str,
    is_push: bool,
) -> Result<Option<(usize, ParsedValue)>, RedisLinkError> {
    let len: i64 = len_text
        .parse()
        .map_err(|_| RedisLinkError::NrFatal(format!("invalid array length: {len_text}")))?;
    if len == -1 {
        return Ok(Some((header_len, ParsedValue::Value(Value::Nil))));
    }
    if len < 0 {
        return Err(RedisLinkError::NrFatal(format!(
            "negative array length: {len}"
        )));
    }
    let mut consumed = header_len;
    let mut items = Vec::with_capacity(len as usize);
    for _ in 0..len {
        let Some((item_len, parsed)) = parse_value(&buf[consumed..])? else {
            return Ok(None);
        };
        items.push(match parsed {
            ParsedValue::Value(v) => v,
            ParsedValue::Error(err) => Value::ServerError(Box::new(err)),
        });
        consumed += item_len;
    }
    let value = if is_push {
        Value::Push(items)
    } else {
        Value::Array(items)
    };
    Ok(Some((consumed, ParsedValue::Value(value))))
}

fn parse_map(
    buf: &[u8],
    header_len: usize,
    len_text: &str,
) -> Result<Option<(usize, ParsedValue)>, RedisLinkError> {
    let len: i64 = len_text
        .parse()
        .map_err(|_| RedisLinkError::NrFatal(format!("invalid map length: {len_text}")))?;
    if len < 0 {
        return Err(RedisLinkError::NrFatal(format!(
            "negative map length: {len}"
        )));
    }
    let mut consumed = header_len;
    let mut pairs = Vec::with_capacity(len as usize);
    for _ in 0..len {
        let Some((key_len, key)) = parse_value(&buf[consumed..])? else {
            return Ok(None);
        };
        consumed += key_len;
        let Some((value_len, value)) = parse_value(&buf[consumed..])? else {
            return Ok(None);
        };
        consumed += value_len;
        let to_value = |p: ParsedValue| match p {
            ParsedValue::Value(v) => v,
            ParsedValue::Error(err) => Value::ServerError(Box::new(err)),
        };
        pairs.push((to_value(key), to_value(value)));
    }
    Ok(Some((consumed, ParsedValue::Value(Value::Map(pairs)))))
}
