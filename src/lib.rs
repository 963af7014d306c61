//! `respire` — a RESP client core: connection lifecycle and reconnection,
//! command pipelining, the pub/sub overlay, and the corking write batcher,
//! all driving a single connection to one server.
//!
//! The flat per-command convenience surface, URL-style client construction,
//! and the multi/exec transaction builder are deliberately out of scope
//! (spec.md §1) — this crate exposes the generic [`Client::send`] /
//! [`Client::command`] entry points those layers would be built on top of.

mod client;
mod command;
mod config;
mod controller;
mod dispatcher;
mod error;
mod events;
mod flush;
mod parser;
mod pubsub;
mod queue;
mod retry;
mod transport;
mod value;
mod writer;

pub use client::{Client, ClientReplyMode};
pub use controller::{ConnectionSnapshot, ServerInfo};
pub use command::{Arg, Command, Null, Sink, ToArg, Undefined, MAX_TEXT_ARG_LEN};
pub use config::{
    key_positions_for, prefixed_args, ClientConfig, KeyPositions, ProtocolVersion, RetryContext,
    RetryDecision, RetryStrategyFn,
};
pub use error::{ClosedReason, RedisLinkError, RedisLinkResult, ReplyError};
pub use events::{Event, RedisLinkErrorKind};
pub use parser::{ReplyParser, Resp2Parser};
pub use pubsub::{PushKind, PushMessage, SubKind};
pub use transport::{BoxedTransport, Connector, TcpConnector, Transport, UnixConnector};
pub use value::{Frame, Value};
