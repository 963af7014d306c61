//! The connection-lifecycle controller (spec §2, §4.2, §4.3, §4.8): the
//! single task that owns the transport, the pipeline, the corking
//! batcher, and the pub/sub overlay, and drives all of their state
//! transitions.
//!
//! Grounded on the teacher's `ReconnectingConnection`
//! (`client/reconnecting_connection.rs`): a `Mutex`-guarded state enum
//! (`Connected` / `Reconnecting` / `InitializedDisconnected`) with a
//! spawned background reconnect loop. This module keeps that state shape
//! but moves state out of a shared `Mutex` entirely — spec §5's
//! single-writer model maps onto "one task owns everything", so the
//! controller's loop body is both the reader and the only place state is
//! mutated.

use crate::command::{Arg, Command, Sink};
use crate::config::ClientConfig;
use crate::dispatcher::{self, DispatchOutcome};
use crate::error::{ClosedReason, RedisLinkError, ReplyError};
use crate::events::{Event, EventBus};
use crate::flush::flush_and_error;
use crate::parser::Resp2Parser;
use crate::pubsub::{PubSubMode, PushRouter, SubKind, SubscriptionSet};
use crate::queue::Pipeline;
use crate::retry::RetryBudget;
use crate::transport::Connector;
use crate::value::Value;
use crate::writer::CorkingBatcher;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;

/// The `INFO`-derived snapshot spec §3's "server info snapshot" row
/// describes: the flat `field -> value` map, plus `versions` parsed out of
/// `redis_version` and one sub-map per `db<N>:keys=...,expires=...,...`
/// line, keyed by the database index.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    pub fields: HashMap<String, String>,
    pub versions: Vec<u32>,
    pub db_sizes: HashMap<u32, HashMap<String, String>>,
}

impl ServerInfo {
    fn parse(bytes: &[u8]) -> ServerInfo {
        let fields = parse_info(bytes);
        let versions = fields
            .get("redis_version")
            .map(|v| {
                v.split('.')
                    .filter_map(|part| part.parse::<u32>().ok())
                    .collect()
            })
            .unwrap_or_default();
        let mut db_sizes = HashMap::new();
        for (key, value) in &fields {
            if let Some(index) = key.strip_prefix("db") {
                if let Ok(index) = index.parse::<u32>() {
                    let sub_map = value
                        .split(',')
                        .filter_map(|part| part.split_once('='))
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect();
                    db_sizes.insert(index, sub_map);
                }
            }
        }
        ServerInfo {
            fields,
            versions,
            db_sizes,
        }
    }
}

/// A point-in-time view of the queue/backpressure/server-info state,
/// returned in response to [`ControllerMessage::Snapshot`] (spec §6's
/// `command_queue_length`/`offline_queue_length`/`should_buffer`/
/// `server_info` accessors).
#[derive(Debug, Clone, Default)]
pub struct ConnectionSnapshot {
    pub in_flight_len: usize,
    pub offline_len: usize,
    pub should_buffer: bool,
    pub server_info: ServerInfo,
}

/// Discrete controller state (spec §3's "discrete state" row).
/// `IntoStaticStr` gives tracing a cheap `&'static str` to log instead of
/// `Debug`-formatting the enum on every transition, mirroring the
/// teacher's own use of `strum_macros::IntoStaticStr` for its
/// `ServiceType` enum (`iam/mod.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::IntoStaticStr)]
pub enum ControllerState {
    Connecting,
    Ready,
    Reconnecting,
    Closing,
    Closed,
}

/// Messages the public `Client` facade sends to the controller task. No
/// external code ever touches the pipeline, batcher, or transport
/// directly — every mutation flows through here, which is what makes the
/// single-writer invariant structural rather than conventional
/// (`SPEC_FULL.md` §5).
pub enum ControllerMessage {
    Send(Command),
    Cork,
    Uncork,
    Subscribe {
        kind: SubKind,
        targets: Vec<String>,
        sink: Sink,
    },
    Unsubscribe {
        kind: SubKind,
        targets: Vec<String>,
        sink: Sink,
    },
    Monitor(oneshot::Sender<Result<Value, RedisLinkError>>),
    ClientReplyMode(ReplyMode),
    /// Closes the connection (spec §6's `end(flush)`). `true` drains both
    /// queues and resolves every pending sink with an error before
    /// closing; `false` abandons them in place.
    End(bool),
    Quit(oneshot::Sender<Result<Value, RedisLinkError>>),
    /// Spec §6's queue-length/backpressure/server-info accessors, answered
    /// from inside the controller task since `Pipeline`/`ServerInfo` never
    /// leave it.
    Snapshot(oneshot::Sender<ConnectionSnapshot>),
}

/// `CLIENT REPLY` modes (spec §4.7). Interaction with pub/sub mode is
/// resolved per Design Note 3 in `DESIGN.md`: once `pub_sub_mode` is
/// non-zero, a `ClientReplyMode` message is accepted but ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    On,
    Off,
    Skip,
    /// Entered directly when `CLIENT REPLY SKIP` is issued: the command
    /// itself carries no reply, and exactly one further command is also
    /// unreplied before the mode reverts to `On` (DESIGN.md's SKIP
    /// resolution — the bare `Skip` state is never observed by
    /// `handle_send`, only `SkipOneMore` is).
    SkipOneMore,
}

const COMMAND_CHANNEL_CAPACITY: usize = 1024;

/// Spawns the controller task, returning the sender side other
/// components use to talk to it plus the event/push subscription
/// surfaces. Takes the connector behind an `Arc<dyn Connector>` (rather
/// than staying generic over `C: Connector`) so [`Client::duplicate`] can
/// hold the same connector handle and spawn a second, independent
/// controller from it without re-threading a type parameter through the
/// whole facade.
pub fn spawn(
    connector: Arc<dyn Connector>,
    config: ClientConfig,
) -> (mpsc::Sender<ControllerMessage>, EventBus, PushRouter) {
    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let events = EventBus::new();
    let push_router = PushRouter::new();

    let controller = Controller {
        connector,
        config,
        cmd_rx: rx,
        events: events.clone(),
        push_router: push_router.clone(),
        reply_mode: ReplyMode::On,
        monitoring: false,
        server_info: ServerInfo::default(),
    };
    tokio::spawn(controller.run());

    (tx, events, push_router)
}

struct Controller {
    connector: Arc<dyn Connector>,
    config: ClientConfig,
    cmd_rx: mpsc::Receiver<ControllerMessage>,
    events: EventBus,
    push_router: PushRouter,
    reply_mode: ReplyMode,
    monitoring: bool,
    server_info: ServerInfo,
}

impl Controller {
    async fn run(mut self) {
        let mut pipeline = Pipeline::new();
        let mut pubsub_mode = PubSubMode::default();
        let mut subscriptions = SubscriptionSet::new();
        let mut retry_budget = RetryBudget::new(&self.config);
        let mut state = ControllerState::Connecting;

        'connect: loop {
            if state == ControllerState::Closing || state == ControllerState::Closed {
                break;
            }

            // `CLIENT REPLY` is a per-connection server setting: a freshly
            // (re)connected server is always back to `ON`, regardless of
            // what the previous connection was left in.
            self.reply_mode = ReplyMode::On;

            // Messages sent while still disconnected/retrying sit in
            // `cmd_rx`'s buffer (the channel itself never blocks a sender
            // short of its capacity) but are otherwise invisible until
            // `serve` starts reading it — and `serve` only ever runs once
            // `state == Ready`, so without this drain they would silently
            // skip offline-queue handling (spec §4.2) entirely the first
            // time they are finally read. Draining here applies that
            // handling up front, so a budget-exhausted disconnect (below)
            // flushes them along with anything already in `pipeline`.
            match self.drain_pending_messages(&mut pipeline) {
                std::ops::ControlFlow::Continue(()) => {}
                std::ops::ControlFlow::Break(flush) => {
                    if flush {
                        flush_and_error(
                            &mut pipeline,
                            RedisLinkError::closed(ClosedReason::AlreadyClosed),
                            true,
                        );
                    }
                    self.events.emit(Event::End);
                    return;
                }
            }

            self.events.emit(Event::Connect);
            tracing::debug!("connecting to {}:{}", self.config.host, self.config.port);

            let transport = match self.connector.connect().await {
                Ok(t) => t,
                Err(err) => {
                    tracing::warn!("connect failed: {err}");
                    if self
                        .wait_for_next_attempt(&mut retry_budget, &mut pipeline, &mut state)
                        .await
                    {
                        continue 'connect;
                    } else {
                        return;
                    }
                }
            };

            let (read_half, write_half) = tokio::io::split(transport);
            let mut framed = FramedRead::new(read_half, Resp2Parser::new());
            let mut write_half = write_half;

            if let Err(err) = self.ready_check(&mut write_half, &mut framed).await {
                tracing::warn!("ready check failed: {err}");
                if self
                    .wait_for_next_attempt(&mut retry_budget, &mut pipeline, &mut state)
                    .await
                {
                    continue 'connect;
                } else {
                    return;
                }
            }

            retry_budget = RetryBudget::new(&self.config);

            // Spec §4.5/§5: resubscribe before draining the offline queue,
            // and emit `ready` only once both have completed — a reader
            // must never observe a `ready` event while subscriptions are
            // still being re-acknowledged.
            if let Err(err) = self
                .resubscribe(
                    &mut subscriptions,
                    &mut pubsub_mode,
                    &mut pipeline,
                    &mut framed,
                    &mut write_half,
                )
                .await
            {
                tracing::warn!("resubscribe failed: {err}");
                self.recover_in_flight_on_retryable_disconnect(&mut pubsub_mode, &mut pipeline);
                if self
                    .wait_for_next_attempt(&mut retry_budget, &mut pipeline, &mut state)
                    .await
                {
                    continue 'connect;
                } else {
                    return;
                }
            }

            // Ready check and resubscribe can each take a while (loading
            // retries, many channels to reacknowledge); drain again so
            // anything submitted during that window is queued before the
            // replay below, instead of waiting for the next drain point.
            match self.drain_pending_messages(&mut pipeline) {
                std::ops::ControlFlow::Continue(()) => {}
                std::ops::ControlFlow::Break(flush) => {
                    if flush {
                        flush_and_error(
                            &mut pipeline,
                            RedisLinkError::closed(ClosedReason::AlreadyClosed),
                            true,
                        );
                    }
                    self.events.emit(Event::End);
                    return;
                }
            }

            if let Err(err) = self
                .replay_offline_queue(&mut pipeline, &mut write_half)
                .await
            {
                tracing::warn!("offline queue replay failed: {err}");
                self.recover_in_flight_on_retryable_disconnect(&mut pubsub_mode, &mut pipeline);
                if self
                    .wait_for_next_attempt(&mut retry_budget, &mut pipeline, &mut state)
                    .await
                {
                    continue 'connect;
                } else {
                    return;
                }
            }

            state = ControllerState::Ready;
            self.events.emit(Event::Ready);
            tracing::debug!("connection ready");

            let disconnect_reason = self
                .serve(
                    &mut pipeline,
                    &mut pubsub_mode,
                    &mut subscriptions,
                    &mut framed,
                    &mut write_half,
                    &mut state,
                )
                .await;

            match disconnect_reason {
                DisconnectReason::ClientDropped => {
                    break 'connect;
                }
                DisconnectReason::Closed { flush } => {
                    if flush {
                        flush_and_error(
                            &mut pipeline,
                            RedisLinkError::closed(ClosedReason::AlreadyClosed),
                            true,
                        );
                    }
                    break 'connect;
                }
                DisconnectReason::TransportError(err) => {
                    self.recover_in_flight_on_retryable_disconnect(&mut pubsub_mode, &mut pipeline);
                    tracing::warn!("transport error, reconnecting: {err}");
                    if self
                        .wait_for_next_attempt(&mut retry_budget, &mut pipeline, &mut state)
                        .await
                    {
                        continue 'connect;
                    } else {
                        return;
                    }
                }
            }
        }

        state = ControllerState::Closed;
        tracing::debug!(state = <&'static str>::from(state), "controller loop exited");
        self.events.emit(Event::End);
    }

    /// Non-blocking drain of every message currently sitting in `cmd_rx`,
    /// applying the same rules `serve`'s select arm applies once connected
    /// — `Send`/`Subscribe`/`Unsubscribe`/`Monitor`/`ClientReplyMode` are
    /// queued into `pipeline.offline_queue` (or rejected immediately with
    /// `NR_CLOSED` when `enable_offline_queue` is off) rather than written,
    /// since there is no live connection yet to write to; `Snapshot` is
    /// answered directly off `pipeline`/`self.server_info`; `Cork`/`Uncork`
    /// are no-ops (nothing has been written yet for them to batch); `End`/
    /// `Quit` stop the whole connect loop, signaled via `ControlFlow::Break`
    /// carrying whether the caller should flush both queues before exiting
    /// — `End(flush)`'s flag, or `true` for `Quit` — exactly like a
    /// user-initiated close reached from `serve`.
    fn drain_pending_messages(&mut self, pipeline: &mut Pipeline) -> std::ops::ControlFlow<bool> {
        while let Ok(message) = self.cmd_rx.try_recv() {
            match message {
                ControllerMessage::Send(command) => {
                    if self.config.enable_offline_queue {
                        pipeline.enqueue_offline(command);
                    } else {
                        command
                            .sink
                            .resolve(Err(RedisLinkError::closed(ClosedReason::OfflineQueueDisabled)));
                    }
                }
                ControllerMessage::Subscribe { kind, targets, sink } => {
                    let name = match kind {
                        SubKind::Subscribe => "SUBSCRIBE",
                        SubKind::Psubscribe => "PSUBSCRIBE",
                    };
                    let args = targets.into_iter().map(Arg::Text).collect::<Vec<_>>();
                    let mut command = Command::new(name, args, sink);
                    command.sub_commands_left = Some(command.args.len().max(1));
                    pipeline.enqueue_offline(command);
                }
                ControllerMessage::Unsubscribe { kind, targets, sink } => {
                    let name = match kind {
                        SubKind::Subscribe => "UNSUBSCRIBE",
                        SubKind::Psubscribe => "PUNSUBSCRIBE",
                    };
                    let args = targets.into_iter().map(Arg::Text).collect::<Vec<_>>();
                    let mut command = Command::new(name, args, sink);
                    command.sub_commands_left = Some(command.args.len().max(1));
                    pipeline.enqueue_offline(command);
                }
                ControllerMessage::Monitor(reply) => {
                    pipeline.enqueue_offline(Command::new("MONITOR", vec![], Sink::Future(reply)));
                    self.monitoring = true;
                }
                ControllerMessage::ClientReplyMode(mode) => {
                    let word = match mode {
                        ReplyMode::On => "ON",
                        ReplyMode::Off => "OFF",
                        ReplyMode::Skip | ReplyMode::SkipOneMore => "SKIP",
                    };
                    let args = vec![Arg::Text("REPLY".to_string()), Arg::Text(word.to_string())];
                    pipeline.enqueue_offline(Command::new("CLIENT", args, Sink::None));
                    self.reply_mode = match mode {
                        ReplyMode::On => ReplyMode::On,
                        ReplyMode::Off => ReplyMode::Off,
                        ReplyMode::Skip | ReplyMode::SkipOneMore => ReplyMode::SkipOneMore,
                    };
                }
                ControllerMessage::Cork | ControllerMessage::Uncork => {}
                ControllerMessage::Snapshot(reply) => {
                    let _ = reply.send(ConnectionSnapshot {
                        in_flight_len: pipeline.in_flight_len(),
                        offline_len: pipeline.offline_len(),
                        should_buffer: false,
                        server_info: self.server_info.clone(),
                    });
                }
                ControllerMessage::End(flush) => return std::ops::ControlFlow::Break(flush),
                ControllerMessage::Quit(reply) => {
                    let _ = reply.send(Ok(Value::Okay));
                    return std::ops::ControlFlow::Break(true);
                }
            }
        }
        std::ops::ControlFlow::Continue(())
    }

    /// Recovers from a retryable disconnect (spec §4.3 step 7): tears down
    /// pub/sub mode and either requeues in-flight commands onto the front
    /// of the offline queue, or resolves them with `UNCERTAIN_STATE`
    /// directly, depending on `retry_unfulfilled_commands`. Never touches
    /// `offline_queue` — commands parked there while disconnected must
    /// survive untouched across failed reconnect attempts, only being
    /// given up on once the retry budget is actually exhausted (step 6)
    /// or the client is closing (step 4). Shared by the initial-connect,
    /// ready-check, resubscribe, and replay failure paths, as well as a
    /// mid-`serve` transport error — all of which are equally "retryable
    /// disconnect" per spec §4.3, just discovered at different points in
    /// the reconnect sequence.
    fn recover_in_flight_on_retryable_disconnect(
        &self,
        pubsub_mode: &mut PubSubMode,
        pipeline: &mut Pipeline,
    ) {
        // Spec §4.3 step 2: tear down pub/sub mode on every disconnect.
        // The subscription set itself survives — `resubscribe` replays it
        // once the new connection is ready — but the mode counter
        // describing the *old* connection's in-flight acks no longer
        // means anything.
        pubsub_mode.reset();
        if self.config.retry_unfulfilled_commands {
            pipeline.requeue_in_flight_to_offline();
        } else {
            for command in pipeline.drain_in_flight() {
                command.sink.resolve(Err(RedisLinkError::UncertainState));
            }
        }
    }

    /// Emits `reconnecting` and sleeps for the next backoff delay, or
    /// flushes both queues with `ConnectionBroken` and returns `false` if
    /// the retry budget is exhausted (spec §4.3). Called from every site
    /// that can fail a connection attempt — initial connect, the ready
    /// check, and a transport error once `ready` — so `reconnecting` fires
    /// once per attempt regardless of which stage failed, matching the
    /// literal "three failed connects emit `reconnecting`" scenario in
    /// spec §8.
    async fn wait_for_next_attempt(
        &mut self,
        retry_budget: &mut RetryBudget,
        pipeline: &mut Pipeline,
        state: &mut ControllerState,
    ) -> bool {
        match retry_budget.next(&self.config) {
            crate::config::RetryDecision::RetryAfter(delay) => {
                *state = ControllerState::Reconnecting;
                self.events.emit(Event::Reconnecting {
                    attempt: retry_budget.attempt(),
                });
                tokio::time::sleep(delay).await;
                true
            }
            crate::config::RetryDecision::Stop => {
                flush_and_error(pipeline, RedisLinkError::ConnectionBroken, true);
                self.events.emit(Event::Error((&RedisLinkError::ConnectionBroken).into()));
                self.events.emit(Event::End);
                false
            }
        }
    }

    /// Issues `AUTH`/`HELLO`/`SELECT` as configured, then polls `INFO`
    /// until `loading:0` and (if present) `master_link_status:up` are
    /// observed, per spec §4.8. Skipped entirely when `no_ready_check` is
    /// set. Two server responses are locally recovered rather than
    /// propagated, per spec §7: `AUTH` failing with "no password is set"
    /// (treated as a successful auth, with a warning), and `INFO` being
    /// rejected as an unknown command (treated as ready outright, for
    /// servers built without the `INFO` command).
    async fn ready_check<R, W>(
        &mut self,
        write_half: &mut W,
        framed: &mut FramedRead<R, Resp2Parser>,
    ) -> Result<(), RedisLinkError>
    where
        R: tokio::io::AsyncRead + Unpin,
        W: tokio::io::AsyncWrite + Unpin,
    {
        if self.config.no_ready_check {
            return Ok(());
        }

        if let Some(password) = &self.config.password {
            let mut args = vec![Arg::Text("AUTH".to_string())];
            if let Some(username) = &self.config.username {
                args.push(Arg::Text(username.clone()));
            }
            args.push(Arg::Text(password.clone()));
            write_command(write_half, &args).await?;
            match next_frame(framed).await {
                Ok(_) => {}
                Err(RedisLinkError::Reply(err)) if is_no_password_set(&err) => {
                    tracing::warn!("AUTH sent but server has no password set; treating as success");
                }
                Err(other) => return Err(other),
            }
        }

        if self.config.protocol == crate::config::ProtocolVersion::Resp3 {
            let args = vec![Arg::Text("HELLO".to_string()), Arg::Text("3".to_string())];
            write_command(write_half, &args).await?;
            let _ = next_frame(framed).await?;
        }

        if let Some(db) = self.config.database {
            let args = vec![Arg::Text("SELECT".to_string()), Arg::Text(db.to_string())];
            write_and_expect_ok(write_half, framed, &args).await?;
        }

        for _ in 0..300 {
            let args = vec![Arg::Text("INFO".to_string())];
            write_command(write_half, &args).await?;
            let value = match next_frame(framed).await {
                Ok(value) => value,
                Err(RedisLinkError::Reply(err)) if is_unknown_info_command(&err) => {
                    tracing::debug!("server rejected INFO as unknown; treating connection as ready");
                    return Ok(());
                }
                Err(other) => return Err(other),
            };
            self.server_info = value
                .as_bulk_string()
                .map(ServerInfo::parse)
                .unwrap_or_default();
            let info = &self.server_info.fields;

            let loading = info.get("loading").map(String::as_str).unwrap_or("0");
            let master_link_ok = info
                .get("master_link_status")
                .map(|s| s == "up")
                .unwrap_or(true);

            if loading == "0" && master_link_ok {
                return Ok(());
            }

            // spec §4.8: a `loading` server re-checks after
            // `min(loading_eta_seconds * 1000, 1000)` ms; a server whose
            // `master_link_status` isn't yet `up` (a replica still
            // syncing) re-checks sooner, after a flat 50 ms.
            let delay = if loading == "1" {
                let eta_seconds: f64 = info
                    .get("loading_eta_seconds")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(1.0);
                std::time::Duration::from_millis((eta_seconds * 1000.0).clamp(0.0, 1000.0) as u64)
            } else {
                std::time::Duration::from_millis(50)
            };
            tokio::time::sleep(delay).await;
        }

        Err(RedisLinkError::NrFatal(
            "server did not become ready in time".to_string(),
        ))
    }

    async fn replay_offline_queue<W>(
        &self,
        pipeline: &mut Pipeline,
        write_half: &mut W,
    ) -> Result<(), RedisLinkError>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let mut batcher = CorkingBatcher::new();
        let commands = pipeline.drain_offline_for_replay();
        if commands.is_empty() {
            return Ok(());
        }
        for command in commands {
            batcher.queue_command(&command.multi_bulk_args());
            pipeline.push_in_flight(command);
        }
        batcher.flush(write_half).await
    }

    /// Re-issues every channel/pattern in `subscriptions` and blocks until
    /// every acknowledgement has come back, so the caller can safely treat
    /// the connection as `ready` the moment this returns (spec §4.5: "emit
    /// `ready` only after all acknowledgements return"). Reads directly off
    /// `framed` rather than leaving the acks for `serve`'s event loop to
    /// pick up later, since at this point in the reconnect sequence nothing
    /// else is consuming frames yet.
    async fn resubscribe<R, W>(
        &self,
        subscriptions: &mut SubscriptionSet,
        pubsub_mode: &mut PubSubMode,
        pipeline: &mut Pipeline,
        framed: &mut FramedRead<R, Resp2Parser>,
        write_half: &mut W,
    ) -> Result<(), RedisLinkError>
    where
        R: tokio::io::AsyncRead + Unpin,
        W: tokio::io::AsyncWrite + Unpin,
    {
        if subscriptions.is_empty() || self.config.disable_resubscribing {
            return Ok(());
        }
        // Spec §4.5: arms the countdown at the position of the first
        // reissued subscribe command, relative to whatever is already
        // in flight ahead of it (normally nothing, right after a
        // reconnect, but `activate` is a no-op if mode is already active).
        pubsub_mode.activate(pipeline.in_flight_len() as u32 + 1);
        let mut batcher = CorkingBatcher::new();
        let expected_acks = subscriptions.len();
        for (kind, target) in subscriptions.replay_order() {
            let name = match kind {
                SubKind::Subscribe => "SUBSCRIBE",
                SubKind::Psubscribe => "PSUBSCRIBE",
            };
            let mut command = Command::new(name, vec![Arg::Text(target.clone())], Sink::None);
            command.sub_commands_left = Some(1);
            batcher.queue_command(&command.multi_bulk_args());
            pipeline.push_in_flight(command);
        }
        batcher.flush(write_half).await?;

        let push_router = self.push_router.clone();
        for _ in 0..expected_acks {
            let frame = next_raw_frame(framed).await?;
            let outcome = dispatcher::dispatch(
                frame,
                pipeline,
                pubsub_mode,
                subscriptions,
                &push_router,
                false,
                &self.config,
            );
            if matches!(outcome, DispatchOutcome::Unmatched) {
                return Err(RedisLinkError::NrFatal(
                    "reply did not match any in-flight command during resubscribe".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Serves commands and replies until the transport closes/errors, the
    /// client is dropped, or `end()`/`quit()` is requested.
    async fn serve<R, W>(
        &mut self,
        pipeline: &mut Pipeline,
        pubsub_mode: &mut PubSubMode,
        subscriptions: &mut SubscriptionSet,
        framed: &mut FramedRead<R, Resp2Parser>,
        write_half: &mut W,
        state: &mut ControllerState,
    ) -> DisconnectReason
    where
        R: tokio::io::AsyncRead + Unpin,
        W: tokio::io::AsyncWrite + Unpin,
    {
        let mut batcher = CorkingBatcher::new();

        loop {
            tokio::select! {
                msg = self.cmd_rx.recv() => {
                    match msg {
                        None => return DisconnectReason::ClientDropped,
                        Some(ControllerMessage::Send(command)) => {
                            if let Err(err) = self
                                .handle_send(command, pipeline, &mut batcher, write_half, *state)
                                .await
                            {
                                return DisconnectReason::TransportError(err);
                            }
                        }
                        Some(ControllerMessage::Cork) => batcher.cork(),
                        Some(ControllerMessage::Uncork) => {
                            if batcher.uncork() {
                                if let Err(err) = batcher.flush(write_half).await {
                                    return DisconnectReason::TransportError(err);
                                }
                            }
                        }
                        Some(ControllerMessage::Subscribe { kind, targets, sink }) => {
                            if let Err(err) = self
                                .handle_subscribe(kind, targets, sink, pubsub_mode, pipeline, &mut batcher, write_half)
                                .await
                            {
                                return DisconnectReason::TransportError(err);
                            }
                        }
                        Some(ControllerMessage::Unsubscribe { kind, targets, sink }) => {
                            if let Err(err) = self
                                .handle_unsubscribe(kind, targets, sink, pubsub_mode, pipeline, &mut batcher, write_half)
                                .await
                            {
                                return DisconnectReason::TransportError(err);
                            }
                        }
                        Some(ControllerMessage::Monitor(reply)) => {
                            let command = Command::new("MONITOR", vec![], Sink::Future(reply));
                            if let Err(err) = self
                                .handle_send(command, pipeline, &mut batcher, write_half, *state)
                                .await
                            {
                                return DisconnectReason::TransportError(err);
                            }
                            self.monitoring = true;
                        }
                        Some(ControllerMessage::ClientReplyMode(mode)) => {
                            if let Err(err) = self
                                .handle_client_reply_mode(mode, pubsub_mode, pipeline, &mut batcher, write_half)
                                .await
                            {
                                return DisconnectReason::TransportError(err);
                            }
                        }
                        Some(ControllerMessage::End(flush)) => {
                            *state = ControllerState::Closing;
                            return DisconnectReason::Closed { flush };
                        }
                        Some(ControllerMessage::Quit(reply)) => {
                            let command = Command::new("QUIT", vec![], Sink::Future(reply));
                            let _ = self
                                .handle_send(command, pipeline, &mut batcher, write_half, *state)
                                .await;
                            *state = ControllerState::Closing;
                            return DisconnectReason::Closed { flush: true };
                        }
                        Some(ControllerMessage::Snapshot(reply)) => {
                            let _ = reply.send(ConnectionSnapshot {
                                in_flight_len: pipeline.in_flight_len(),
                                offline_len: pipeline.offline_len(),
                                // Writes go through `AsyncWriteExt::write_all`,
                                // which drives the write to completion before
                                // returning rather than reporting a Node-style
                                // "this would have buffered" `false` — there is
                                // never a window in this async model where a
                                // write is outstanding when the controller task
                                // is free to answer a `Snapshot` query, so this
                                // is always `false` here (see DESIGN.md).
                                should_buffer: false,
                                server_info: self.server_info.clone(),
                            });
                        }
                    }
                }
                frame = framed.next() => {
                    match frame {
                        None => return DisconnectReason::TransportError(RedisLinkError::Io(
                            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "server closed connection"),
                        )),
                        Some(Err(err)) => return DisconnectReason::TransportError(err),
                        Some(Ok(frame)) => {
                            if self.monitoring {
                                if let Ok(Value::SimpleString(_)) = &frame {
                                    continue;
                                }
                            }
                            match dispatcher::dispatch(
                                frame,
                                pipeline,
                                pubsub_mode,
                                subscriptions,
                                &self.push_router,
                                self.monitoring,
                                &self.config,
                            ) {
                                DispatchOutcome::Resolved | DispatchOutcome::PushRouted => {}
                                DispatchOutcome::MonitorLine(line) => {
                                    tracing::debug!(?line, "monitor line");
                                }
                                DispatchOutcome::Unmatched => {
                                    return DisconnectReason::TransportError(RedisLinkError::NrFatal(
                                        "reply did not match any in-flight command".to_string(),
                                    ));
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_send<W>(
        &mut self,
        mut command: Command,
        pipeline: &mut Pipeline,
        batcher: &mut CorkingBatcher,
        write_half: &mut W,
        state: ControllerState,
    ) -> Result<(), RedisLinkError>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        if state != ControllerState::Ready {
            if self.config.enable_offline_queue {
                pipeline.enqueue_offline(command);
                return Ok(());
            } else {
                command
                    .sink
                    .resolve(Err(RedisLinkError::closed(ClosedReason::OfflineQueueDisabled)));
                return Ok(());
            }
        }

        command.name = self.config.resolve_command_name(&command.name).to_string();
        if let Some(prefix) = &self.config.key_prefix {
            command.args = crate::config::prefixed_args(&command.name, &command.args, prefix);
        }

        // Under OFF/SKIP the server still executes the command, it just
        // never sends a reply for it — so the bytes still go out, but the
        // command never occupies a slot in `in_flight_queue` waiting for a
        // reply that will never arrive (spec §4.7).
        if self.reply_mode != ReplyMode::On {
            let fragments = command.multi_bulk_args();
            batcher.queue_command(&fragments);
            if !batcher.is_corked() {
                batcher.flush(write_half).await?;
            }
            if self.reply_mode == ReplyMode::SkipOneMore {
                self.reply_mode = ReplyMode::On;
            }
            command.sink.resolve(Ok(Value::Nil));
            return Ok(());
        }

        let fragments = command.multi_bulk_args();
        pipeline.push_in_flight(command);
        batcher.queue_command(&fragments);
        if !batcher.is_corked() {
            batcher.flush(write_half).await?;
        }
        Ok(())
    }

    /// Handles a `CLIENT REPLY` request: writes the actual command to the
    /// wire (so the server's behavior stays in sync with this side's
    /// bookkeeping) and updates `reply_mode` immediately, since the
    /// single-writer model guarantees no other command can be serialized
    /// in between. Ignored entirely while pub/sub mode is active (Design
    /// Note 3 in `DESIGN.md`).
    async fn handle_client_reply_mode<W>(
        &mut self,
        mode: ReplyMode,
        pubsub_mode: &PubSubMode,
        pipeline: &mut Pipeline,
        batcher: &mut CorkingBatcher,
        write_half: &mut W,
    ) -> Result<(), RedisLinkError>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        if pubsub_mode.is_active() {
            return Ok(());
        }

        let word = match mode {
            ReplyMode::On => "ON",
            ReplyMode::Off => "OFF",
            ReplyMode::Skip | ReplyMode::SkipOneMore => "SKIP",
        };
        let args = vec![Arg::Text("REPLY".to_string()), Arg::Text(word.to_string())];
        let fragments = Command::new("CLIENT", args, Sink::None).multi_bulk_args();
        batcher.queue_command(&fragments);
        batcher.flush(write_half).await?;

        match mode {
            ReplyMode::On => {
                // Switching back to ON always gets a real `+OK`, even if
                // the connection was silent before — give it an in-flight
                // slot (with no caller waiting on it) so the dispatcher's
                // FIFO pairing doesn't attribute that `+OK` to whatever
                // user command happens to come next.
                pipeline.push_in_flight(Command::new(
                    "CLIENT",
                    vec![Arg::Text("REPLY".to_string()), Arg::Text("ON".to_string())],
                    Sink::None,
                ));
                self.reply_mode = ReplyMode::On;
            }
            ReplyMode::Off => self.reply_mode = ReplyMode::Off,
            // `CLIENT REPLY SKIP` itself gets no reply either, so the
            // "one further command" SKIP promises is the very next
            // command sent, not this one — go straight to SkipOneMore.
            ReplyMode::Skip | ReplyMode::SkipOneMore => self.reply_mode = ReplyMode::SkipOneMore,
        }
        Ok(())
    }

    async fn handle_subscribe<W>(
        &self,
        kind: SubKind,
        targets: Vec<String>,
        sink: Sink,
        pubsub_mode: &mut PubSubMode,
        pipeline: &mut Pipeline,
        batcher: &mut CorkingBatcher,
        write_half: &mut W,
    ) -> Result<(), RedisLinkError>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let name = match kind {
            SubKind::Subscribe => "SUBSCRIBE",
            SubKind::Psubscribe => "PSUBSCRIBE",
        };
        let args = targets.into_iter().map(Arg::Text).collect::<Vec<_>>();
        let mut command = Command::new(name, args, sink);
        command.sub_commands_left = Some(command.args.len().max(1));
        // Spec §4.5: arm the countdown at this command's position in the
        // in-flight queue (before it is pushed), unless pub/sub mode is
        // already active.
        pubsub_mode.activate(pipeline.in_flight_len() as u32 + 1);
        let fragments = command.multi_bulk_args();
        pipeline.push_in_flight(command);
        batcher.queue_command(&fragments);
        batcher.flush(write_half).await
    }

    async fn handle_unsubscribe<W>(
        &self,
        kind: SubKind,
        targets: Vec<String>,
        sink: Sink,
        pubsub_mode: &mut PubSubMode,
        pipeline: &mut Pipeline,
        batcher: &mut CorkingBatcher,
        write_half: &mut W,
    ) -> Result<(), RedisLinkError>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let name = match kind {
            SubKind::Subscribe => "UNSUBSCRIBE",
            SubKind::Psubscribe => "PUNSUBSCRIBE",
        };
        let args = targets.into_iter().map(Arg::Text).collect::<Vec<_>>();
        let mut command = Command::new(name, args, sink);
        command.sub_commands_left = Some(command.args.len().max(1));
        pubsub_mode.activate(pipeline.in_flight_len() as u32 + 1);
        let fragments = command.multi_bulk_args();
        pipeline.push_in_flight(command);
        batcher.queue_command(&fragments);
        batcher.flush(write_half).await
    }
}

enum DisconnectReason {
    ClientDropped,
    /// `flush` carries the caller's `end(flush)` flag (always `true` for
    /// `quit()`): whether both queues should be drained and every pending
    /// sink resolved with an error before the controller task exits.
    Closed { flush: bool },
    TransportError(RedisLinkError),
}

async fn write_command<W>(write_half: &mut W, args: &[Arg]) -> Result<(), RedisLinkError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut batcher = CorkingBatcher::new();
    batcher.queue_command(args);
    batcher.flush(write_half).await
}

/// Reads the next frame and collapses a `-` reply into `RedisLinkError`,
/// so ready-check call sites never have to juggle the nested
/// `Result<Result<..>>` shape the decoder produces.
async fn next_frame<R>(framed: &mut FramedRead<R, Resp2Parser>) -> Result<Value, RedisLinkError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match framed.next().await {
        Some(Ok(frame)) => frame.map_err(RedisLinkError::from),
        Some(Err(err)) => Err(err),
        None => Err(RedisLinkError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection closed during ready check",
        ))),
    }
}

/// Like [`next_frame`], but preserves a `-` reply as `Err(ReplyError)`
/// inside the returned `Frame` instead of collapsing it into
/// `RedisLinkError` — needed by [`Controller::resubscribe`], which hands
/// the raw frame to [`dispatcher::dispatch`].
async fn next_raw_frame<R>(
    framed: &mut FramedRead<R, Resp2Parser>,
) -> Result<crate::value::Frame, RedisLinkError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    match framed.next().await {
        Some(Ok(frame)) => Ok(frame),
        Some(Err(err)) => Err(err),
        None => Err(RedisLinkError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection closed while resubscribing",
        ))),
    }
}

async fn write_and_expect_ok<R, W>(
    write_half: &mut W,
    framed: &mut FramedRead<R, Resp2Parser>,
    args: &[Arg],
) -> Result<(), RedisLinkError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    write_command(write_half, args).await?;
    next_frame(framed).await?;
    Ok(())
}

/// `true` for the exact locally-recovered `AUTH` failure spec §7 names:
/// a password was supplied but the server has none configured.
fn is_no_password_set(err: &ReplyError) -> bool {
    err.message
        .to_ascii_lowercase()
        .contains("no password is set")
}

/// `true` for the locally-recovered `INFO` failure spec §4.8 names: a
/// server built without the `INFO` command (`ERR unknown command 'info'`,
/// case-insensitive on the command name).
fn is_unknown_info_command(err: &ReplyError) -> bool {
    let lower = err.message.to_ascii_lowercase();
    lower.contains("unknown command") && lower.contains("info")
}

fn parse_info(bytes: &[u8]) -> std::collections::HashMap<String, String> {
    let text = String::from_utf8_lossy(bytes);
    text.lines()
        .filter(|line| !line.starts_with('#') && !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.to_string(), v.trim_end_matches('\r').to_string()))
        .collect()
}
