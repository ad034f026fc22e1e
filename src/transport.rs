//! WebSocket transport to the orchestration server.
//!
//! One background task owns the socket and every piece of connection state;
//! the rest of the program talks to it through a cloneable
//! [`TransportHandle`] backed by an mpsc command queue. Inbound events,
//! outbound commands, and timer expirations all funnel into a single
//! `select!` loop, so state transitions never overlap.
//!
//! Connection state machine:
//!
//! ```text
//! Idle ──connect()──▶ Connecting ──token+socket ok──▶ Open
//!   ▲                     │  ▲                          │
//!   │            attempt failed (backoff)      heartbeat timeout /
//!   │                     │  └──────────────── socket error / peer close
//!   └── close(): Closed (terminal, from any state)
//! ```
//!
//! Reconnection is unbounded: every non-explicit drop schedules a new
//! attempt after `min(base × 1.5^retries, max)`, and each attempt fetches a
//! fresh session token (tokens are short-lived). A successful open resets
//! the retry counter and replays any log entries still above the ack
//! watermark.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::log_buffer::LogBuffer;
use crate::protocol::{
    encode_hello, encode_log, encode_status, parse_inbound, AgentState, ControlMessage,
    InboundFrame, LogEntry,
};
use crate::{AppError, Result};

/// Fixed path of the control endpoint on the server.
const CONTROL_PATH: &str = "/api/ws";
/// Command queue capacity; sends beyond it are dropped, not blocked.
const QUEUE_CAPACITY: usize = 256;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Asynchronous session-token source injected into the transport.
///
/// Called once per connection attempt; a failure is treated as a transient
/// connectivity error and schedules a backoff retry.
pub type TokenProvider = Arc<dyn Fn() -> BoxFuture<'static, Result<String>> + Send + Sync>;

/// Timer configuration for heartbeat, keep-alive, and reconnection.
#[derive(Debug, Clone)]
pub struct TransportTiming {
    /// First reconnect delay.
    pub base_retry_delay: Duration,
    /// Reconnect delay cap.
    pub max_retry_delay: Duration,
    /// Expected maximum silence from the peer.
    pub heartbeat_interval: Duration,
    /// Slack added to the heartbeat window before declaring the peer dead.
    pub heartbeat_grace: Duration,
    /// Interval between outbound literal `"ping"` frames.
    pub ping_interval: Duration,
}

impl Default for TransportTiming {
    fn default() -> Self {
        Self {
            base_retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_grace: Duration::from_secs(5),
            ping_interval: Duration::from_secs(10),
        }
    }
}

/// Everything the transport task needs to run.
pub struct TransportOptions {
    /// HTTP(S) base URL of the server; mapped to ws(s) for the upgrade.
    pub server_url: String,
    /// Client identity sent in the `hello` envelope.
    pub client_id: String,
    /// Fresh-token source, invoked per connection attempt.
    pub token_provider: TokenProvider,
    /// Shared buffer used for ack watermark advancement and replay.
    pub log_buffer: Arc<Mutex<LogBuffer>>,
    /// Sink for inbound `control` envelopes.
    pub control_tx: mpsc::Sender<ControlMessage>,
    /// Timer configuration.
    pub timing: TransportTiming,
}

/// Command sent from handles to the transport task.
#[derive(Debug, Clone)]
pub enum TransportCommand {
    /// Emit a `log` envelope for the entry.
    SendLog(LogEntry),
    /// Emit a `status` envelope.
    SendStatus {
        /// Agent session the status refers to.
        agent_id: String,
        /// Reported lifecycle state.
        state: AgentState,
    },
    /// Explicit close: tear down the socket and never reconnect.
    Close,
}

/// Cloneable, non-blocking front end to the transport task.
///
/// All sends are fire-and-forget: while the connection is anything but
/// open, log and status emissions are dropped (buffering before the
/// transport is the caller's job — see [`LogBuffer`]).
#[derive(Clone)]
pub struct TransportHandle {
    tx: Option<mpsc::Sender<TransportCommand>>,
}

impl TransportHandle {
    /// A handle with no backing connection; every send is a no-op.
    /// Used for offline (`--no-connect` or unpaired) operation.
    #[must_use]
    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    /// Build a handle wired to a raw command receiver.
    ///
    /// Used by integration tests and alternative transports to observe
    /// exactly what the supervisor emits.
    #[must_use]
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<TransportCommand>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx: Some(tx) }, rx)
    }

    /// Emit a `log` envelope for `entry`, if the connection is open.
    pub fn send_log(&self, entry: LogEntry) {
        self.send(TransportCommand::SendLog(entry));
    }

    /// Emit a `status` envelope, if the connection is open.
    pub fn send_status(&self, agent_id: &str, state: AgentState) {
        self.send(TransportCommand::SendStatus {
            agent_id: agent_id.to_owned(),
            state,
        });
    }

    /// Explicitly close the transport. Terminal: all timers are cancelled
    /// and later drops are not reconnected.
    pub fn close(&self) {
        self.send(TransportCommand::Close);
    }

    fn send(&self, command: TransportCommand) {
        if let Some(tx) = &self.tx {
            // Queue full or task gone both mean the send is dropped.
            let _ = tx.try_send(command);
        }
    }
}

/// WebSocket transport entry point.
pub struct WsTransport;

impl WsTransport {
    /// Start the transport task and return its handle.
    ///
    /// The task begins connecting immediately and keeps reconnecting with
    /// exponential backoff until [`TransportHandle::close`] is called or
    /// every handle is dropped.
    #[must_use]
    pub fn connect(options: TransportOptions) -> TransportHandle {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        tokio::spawn(run(options, rx));
        TransportHandle { tx: Some(tx) }
    }
}

/// Why the open-connection loop ended.
enum LoopExit {
    /// Explicit close; the task must terminate.
    Closed,
    /// Failure-induced drop; reconnect after backoff.
    Dropped,
}

async fn run(options: TransportOptions, mut cmd_rx: mpsc::Receiver<TransportCommand>) {
    let mut retry_count: u32 = 0;

    loop {
        match establish(&options).await {
            Ok(mut ws) => {
                retry_count = 0;
                // Sends queued while the attempt was in flight predate the
                // connection; they are no-ops, not a backlog to flush.
                if !drain_stale_commands(&mut cmd_rx) {
                    let _ = ws.close(None).await;
                    info!("transport closed");
                    return;
                }
                match open_loop(&options, ws, &mut cmd_rx).await {
                    LoopExit::Closed => {
                        info!("transport closed");
                        return;
                    }
                    LoopExit::Dropped => {}
                }
            }
            Err(err) => {
                warn!(%err, attempt = retry_count + 1, "connection attempt failed");
            }
        }

        let delay = backoff_delay(&options.timing, retry_count);
        warn!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt = retry_count + 1,
            "reconnecting after backoff"
        );
        retry_count = retry_count.saturating_add(1);

        if !wait_backoff(delay, &mut cmd_rx).await {
            info!("transport closed during backoff");
            return;
        }
    }
}

/// `min(base × 1.5^retries, max)`.
fn backoff_delay(timing: &TransportTiming, retry_count: u32) -> Duration {
    let mut delay = timing.base_retry_delay;
    for _ in 0..retry_count {
        if delay >= timing.max_retry_delay {
            return timing.max_retry_delay;
        }
        delay += delay / 2;
    }
    delay.min(timing.max_retry_delay)
}

/// Discard send commands that accumulated while no connection was open.
/// Returns `false` when a close arrived or every handle is gone.
fn drain_stale_commands(cmd_rx: &mut mpsc::Receiver<TransportCommand>) -> bool {
    loop {
        match cmd_rx.try_recv() {
            Ok(TransportCommand::Close) => return false,
            Ok(_) => {}
            Err(mpsc::error::TryRecvError::Empty) => return true,
            Err(mpsc::error::TryRecvError::Disconnected) => return false,
        }
    }
}

/// Sleep out the backoff while still honoring explicit close. Send commands
/// arriving in this window are dropped (the connection is not open).
async fn wait_backoff(delay: Duration, cmd_rx: &mut mpsc::Receiver<TransportCommand>) -> bool {
    let end = Instant::now() + delay;
    loop {
        tokio::select! {
            () = sleep_until(end) => return true,
            command = cmd_rx.recv() => match command {
                Some(TransportCommand::Close) | None => return false,
                Some(_) => {}
            },
        }
    }
}

/// One full connection attempt: fresh token, URI, socket upgrade.
async fn establish(options: &TransportOptions) -> Result<WsStream> {
    let token = (options.token_provider)()
        .await
        .map_err(|err| AppError::Transport(format!("session token fetch failed: {err}")))?;

    let url = control_url(&options.server_url, &token)?;
    info!(server = options.server_url, "connecting to control endpoint");

    let (ws, _response) = connect_async(url.as_str()).await?;
    Ok(ws)
}

/// Map the HTTP(S) base URL to the ws(s) control URI with the token as a
/// query parameter.
fn control_url(server_url: &str, token: &str) -> Result<Url> {
    let mut url = Url::parse(server_url)
        .map_err(|err| AppError::Transport(format!("invalid server url: {err}")))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(AppError::Transport(format!(
                "unsupported server url scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| AppError::Transport("cannot map server url scheme".into()))?;
    url.set_path(CONTROL_PATH);
    url.query_pairs_mut().clear().append_pair("token", token);
    Ok(url)
}

/// Drive one open connection until it drops or is closed explicitly.
async fn open_loop(
    options: &TransportOptions,
    mut ws: WsStream,
    cmd_rx: &mut mpsc::Receiver<TransportCommand>,
) -> LoopExit {
    info!("control connection open");

    let device = hostname::get().map_or_else(
        |_| "unknown".to_owned(),
        |name| name.to_string_lossy().into_owned(),
    );
    let hello = encode_hello(&options.client_id, &device, std::env::consts::OS);
    if ws.send(Message::Text(hello)).await.is_err() {
        return LoopExit::Dropped;
    }

    // Replay everything the server has not acknowledged yet. Duplicates are
    // possible (an ack may have been lost with the old socket); `seq` lets
    // the server de-duplicate.
    let pending = options.log_buffer.lock().await.unacked();
    if !pending.is_empty() {
        info!(count = pending.len(), "replaying unacknowledged log entries");
        for entry in &pending {
            if ws.send(Message::Text(encode_log(entry))).await.is_err() {
                return LoopExit::Dropped;
            }
        }
    }

    let liveness = options.timing.heartbeat_interval + options.timing.heartbeat_grace;
    let mut deadline = Instant::now() + liveness;
    let mut ping_tick = interval_at(
        Instant::now() + options.timing.ping_interval,
        options.timing.ping_interval,
    );
    ping_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            inbound = ws.next() => {
                match inbound {
                    Some(Ok(message)) => {
                        // Any inbound traffic proves the peer is alive.
                        deadline = Instant::now() + liveness;
                        match handle_inbound(options, &mut ws, message).await {
                            InboundOutcome::Continue => {}
                            InboundOutcome::Drop => return LoopExit::Dropped,
                        }
                    }
                    Some(Err(err)) => {
                        warn!(%err, "socket error");
                        return LoopExit::Dropped;
                    }
                    None => {
                        warn!("peer closed connection");
                        return LoopExit::Dropped;
                    }
                }
            }
            command = cmd_rx.recv() => {
                match command {
                    Some(TransportCommand::SendLog(entry)) => {
                        if ws.send(Message::Text(encode_log(&entry))).await.is_err() {
                            return LoopExit::Dropped;
                        }
                    }
                    Some(TransportCommand::SendStatus { agent_id, state }) => {
                        if ws.send(Message::Text(encode_status(&agent_id, state))).await.is_err() {
                            return LoopExit::Dropped;
                        }
                    }
                    Some(TransportCommand::Close) | None => {
                        let _ = ws.close(None).await;
                        return LoopExit::Closed;
                    }
                }
            }
            _ = ping_tick.tick() => {
                if ws.send(Message::Text("ping".to_owned())).await.is_err() {
                    return LoopExit::Dropped;
                }
            }
            () = sleep_until(deadline) => {
                warn!("connection timed out (no heartbeat), reconnecting");
                let _ = ws.close(None).await;
                return LoopExit::Dropped;
            }
        }
    }
}

enum InboundOutcome {
    Continue,
    Drop,
}

async fn handle_inbound(
    options: &TransportOptions,
    ws: &mut WsStream,
    message: Message,
) -> InboundOutcome {
    let text = match message {
        Message::Text(text) => text,
        Message::Binary(bytes) => match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => return InboundOutcome::Continue,
        },
        Message::Close(_) => return InboundOutcome::Drop,
        // Protocol-level ping/pong frames are handled by the library.
        _ => return InboundOutcome::Continue,
    };

    match parse_inbound(&text) {
        Some(InboundFrame::Ping) => {
            if ws.send(Message::Text("pong".to_owned())).await.is_err() {
                return InboundOutcome::Drop;
            }
        }
        Some(InboundFrame::Control(control)) => {
            if options.control_tx.send(control).await.is_err() {
                debug!("control channel closed, dropping inbound control message");
            }
        }
        Some(InboundFrame::Ack(id)) => {
            options.log_buffer.lock().await.set_last_acked_id(id);
        }
        // Pongs already reset the liveness timer; malformed or unrecognized
        // frames never take the connection down.
        Some(InboundFrame::Pong) | None => {}
    }
    InboundOutcome::Continue
}
