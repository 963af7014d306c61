//! The public client facade (spec §6's API surface).
//!
//! Grounded on the teacher's `StandaloneClient` (`client/standalone_client.rs`):
//! a cheaply-`Clone`able handle around a channel to the task that actually
//! owns the connection, exposing `send_command` plus lifecycle methods.
//! This crate's `Client` is the same shape, fronting the `Controller` task
//! from `controller.rs` instead of a `redis-rs` `MultiplexedConnection`.

use crate::command::{Arg, Command, Sink, ToArg};
use crate::config::ClientConfig;
use crate::controller::{self, ConnectionSnapshot, ControllerMessage, ReplyMode, ServerInfo};
use crate::error::{ClosedReason, RedisLinkError, RedisLinkResult};
use crate::events::{Event, EventBus};
use crate::pubsub::{PushMessage, PushRouter, SubKind};
use crate::transport::{Connector, TcpConnector, UnixConnector};
use crate::value::Value;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// A handle to a single server connection's controller task. Cloning a
/// `Client` is cheap (it clones the channel senders); all clones talk to
/// the same controller. Keeps its own connector handle and a snapshot of
/// the config it was built with so [`Client::duplicate`] can spin up an
/// independent second connection without the caller re-supplying either.
#[derive(Clone)]
pub struct Client {
    sender: mpsc::Sender<ControllerMessage>,
    events: EventBus,
    push_router: PushRouter,
    connection_id: u64,
    connector: Arc<dyn Connector>,
    config: Arc<ClientConfig>,
}

impl Client {
    /// Connects over TCP and spawns the controller task.
    pub fn connect_tcp(host: impl Into<String>, port: u16, config: ClientConfig) -> Client {
        let connector = TcpConnector {
            host: host.into(),
            port,
        };
        Client::spawn_with(Arc::new(connector), config)
    }

    /// Connects over a Unix domain socket and spawns the controller task.
    pub fn connect_unix(path: impl AsRef<Path>, config: ClientConfig) -> Client {
        let connector = UnixConnector {
            path: path.as_ref().to_path_buf(),
        };
        Client::spawn_with(Arc::new(connector), config)
    }

    fn spawn_with(connector: Arc<dyn Connector>, config: ClientConfig) -> Client {
        let config_snapshot = Arc::new(config.clone());
        let (sender, events, push_router) = controller::spawn(connector.clone(), config);
        Client {
            sender,
            events,
            push_router,
            connection_id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            connector,
            config: config_snapshot,
        }
    }

    /// Spawns a brand-new controller task against the same connector this
    /// client was built with, so it opens an independent second connection
    /// to the same server rather than sharing this one (spec §6's
    /// `duplicate(overrides?)`). `overrides`, if given, replaces the
    /// snapshotted config entirely; otherwise the original config is
    /// reused (minus `retry_strategy`, which cannot be cloned — see
    /// `ClientConfig::clone`'s doc comment).
    pub fn duplicate(&self, overrides: Option<ClientConfig>) -> Client {
        let config = overrides.unwrap_or_else(|| (*self.config).clone());
        Client::spawn_with(self.connector.clone(), config)
    }

    /// A per-process, per-client diagnostic identifier (`SPEC_FULL.md` §4
    /// supplement). Not persisted or shared with the server.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// The number of commands whose bytes have been written but whose
    /// reply has not yet arrived (spec §6's `command_queue_length`).
    pub async fn command_queue_length(&self) -> RedisLinkResult<usize> {
        self.snapshot().await.map(|s| s.in_flight_len)
    }

    /// The number of commands parked while the connection is not ready
    /// (spec §6's `offline_queue_length`).
    pub async fn offline_queue_length(&self) -> RedisLinkResult<usize> {
        self.snapshot().await.map(|s| s.offline_len)
    }

    /// Whether the writer is currently reporting backpressure (spec §6's
    /// `should_buffer`). See `ConnectionSnapshot::should_buffer`'s doc
    /// comment for why this is always `false` under this crate's
    /// fully-awaited write model.
    pub async fn should_buffer(&self) -> RedisLinkResult<bool> {
        self.snapshot().await.map(|s| s.should_buffer)
    }

    /// The most recently parsed `INFO` snapshot (spec §6's `server_info`,
    /// spec §3's "server info snapshot" row), populated by the ready check
    /// and re-populated on every reconnect.
    pub async fn server_info(&self) -> RedisLinkResult<ServerInfo> {
        self.snapshot().await.map(|s| s.server_info)
    }

    async fn snapshot(&self) -> RedisLinkResult<ConnectionSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(ControllerMessage::Snapshot(tx)).await?;
        rx.await
            .map_err(|_| RedisLinkError::closed(ClosedReason::AlreadyClosed))
    }

    /// Subscribes to lifecycle events (spec §6's event list).
    pub fn events(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Sends a command built from already-normalized arguments and awaits
    /// its reply.
    pub async fn send(&self, name: &str, args: Vec<Arg>) -> RedisLinkResult<Value> {
        let (tx, rx) = oneshot::channel();
        let command = Command::new(name, args, Sink::Future(tx));
        self.dispatch(ControllerMessage::Send(command)).await?;
        await_reply(rx).await
    }

    /// Convenience wrapper that normalizes each argument via [`ToArg`]
    /// before sending, so callers can pass a mix of strings, integers,
    /// and byte slices directly (spec §4.1).
    pub async fn command<A: ToArg>(&self, name: &str, args: &[A]) -> RedisLinkResult<Value> {
        let args = args.iter().map(ToArg::to_arg).collect();
        self.send(name, args).await
    }

    /// Fire-and-forget send: queues the command but never waits for (or
    /// even allocates a slot for) its reply. Used by pipelining callers
    /// who only care about the aggregate outcome.
    pub async fn send_ignore(&self, name: &str, args: Vec<Arg>) -> RedisLinkResult<()> {
        let command = Command::new(name, args, Sink::None);
        self.dispatch(ControllerMessage::Send(command)).await
    }

    /// Begins a cork: subsequent sends issued before the matching
    /// `uncork()` are batched into a single write (spec §4.4).
    pub async fn cork(&self) -> RedisLinkResult<()> {
        self.dispatch(ControllerMessage::Cork).await
    }

    /// Ends a cork, flushing the accumulated batch if this was the
    /// outermost `uncork()` (spec §4.4).
    pub async fn uncork(&self) -> RedisLinkResult<()> {
        self.dispatch(ControllerMessage::Uncork).await
    }

    /// Subscribes to one or more channels, returning a receiver for
    /// messages on them. Resubscribed automatically after a reconnect
    /// (spec §4.5).
    pub async fn subscribe(
        &self,
        channels: Vec<String>,
    ) -> RedisLinkResult<mpsc::Receiver<PushMessage>> {
        self.subscribe_kind(SubKind::Subscribe, channels).await
    }

    /// Subscribes to one or more glob patterns (spec §4.5).
    pub async fn psubscribe(
        &self,
        patterns: Vec<String>,
    ) -> RedisLinkResult<mpsc::Receiver<PushMessage>> {
        self.subscribe_kind(SubKind::Psubscribe, patterns).await
    }

    async fn subscribe_kind(
        &self,
        kind: SubKind,
        targets: Vec<String>,
    ) -> RedisLinkResult<mpsc::Receiver<PushMessage>> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(ControllerMessage::Subscribe {
            kind,
            targets,
            sink: Sink::Future(tx),
        })
        .await?;
        await_reply(rx).await?;

        let (push_tx, push_rx) = mpsc::channel(256);
        self.push_router.set_sender(push_tx);
        Ok(push_rx)
    }

    pub async fn unsubscribe(&self, channels: Vec<String>) -> RedisLinkResult<()> {
        self.unsubscribe_kind(SubKind::Subscribe, channels).await
    }

    pub async fn punsubscribe(&self, patterns: Vec<String>) -> RedisLinkResult<()> {
        self.unsubscribe_kind(SubKind::Psubscribe, patterns).await
    }

    async fn unsubscribe_kind(&self, kind: SubKind, targets: Vec<String>) -> RedisLinkResult<()> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(ControllerMessage::Unsubscribe {
            kind,
            targets,
            sink: Sink::Future(tx),
        })
        .await?;
        await_reply(rx).await.map(|_| ())
    }

    /// Issues `MONITOR`. Subsequent monitor lines are traced but not
    /// otherwise surfaced through this handle — see the `Unmatched` note
    /// in `DESIGN.md`.
    pub async fn monitor(&self) -> RedisLinkResult<Value> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(ControllerMessage::Monitor(tx)).await?;
        await_reply(rx).await
    }

    /// Issues `CLIENT REPLY ON|OFF|SKIP`, per spec §4.7. Does not await a
    /// server acknowledgment itself — `ON` still gets one, but it is
    /// consumed internally rather than surfaced here. Ignored while
    /// pub/sub mode is active (Design Note 3).
    pub async fn client_reply(&self, mode: ClientReplyMode) -> RedisLinkResult<()> {
        let mode = match mode {
            ClientReplyMode::On => ReplyMode::On,
            ClientReplyMode::Off => ReplyMode::Off,
            ClientReplyMode::Skip => ReplyMode::Skip,
        };
        self.dispatch(ControllerMessage::ClientReplyMode(mode)).await
    }

    /// Closes the connection without waiting for a server acknowledgment
    /// (spec §6's `end(flush)`). When `flush` is `true`, both queues are
    /// drained and every pending sink resolved with an error before the
    /// connection closes; when `false`, pending commands are simply
    /// abandoned.
    pub async fn end(&self, flush: bool) -> RedisLinkResult<()> {
        self.dispatch(ControllerMessage::End(flush)).await
    }

    /// Issues `QUIT` and closes the connection once the server
    /// acknowledges (spec §6's `quit()`).
    pub async fn quit(&self) -> RedisLinkResult<Value> {
        let (tx, rx) = oneshot::channel();
        self.dispatch(ControllerMessage::Quit(tx)).await?;
        await_reply(rx).await
    }

    async fn dispatch(&self, message: ControllerMessage) -> RedisLinkResult<()> {
        self.sender
            .send(message)
            .await
            .map_err(|_| RedisLinkError::closed(ClosedReason::AlreadyClosed))
    }
}

/// `CLIENT REPLY` modes exposed on the public facade (spec §4.7), kept
/// distinct from `controller::ReplyMode` so the controller's internal
/// representation can evolve without becoming part of this crate's API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientReplyMode {
    On,
    Off,
    Skip,
}

async fn await_reply(rx: oneshot::Receiver<Result<Value, RedisLinkError>>) -> RedisLinkResult<Value> {
    match rx.await {
        Ok(result) => result,
        Err(_) => Err(RedisLinkError::closed(ClosedReason::AlreadyClosed)),
    }
}
