//! Integration tests for the WebSocket transport against an in-process
//! server.
//!
//! Validates:
//! - token delivery in the upgrade URI and the `hello` envelope on connect
//! - `log`/`status` envelope emission through the handle
//! - server acks advancing the buffer watermark
//! - `control` envelopes dispatched onto the control channel
//! - literal `"ping"` answered with literal `"pong"`
//! - unacknowledged entries replayed after a reconnect
//! - sends queued before the connection opens dropped, not flushed

use std::sync::Arc;
use std::time::Duration;

use futures_util::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use agent_link::log_buffer::LogBuffer;
use agent_link::protocol::{AgentState, ControlAction, ControlMessage, LogEntry, LogStream};
use agent_link::transport::{
    TokenProvider, TransportHandle, TransportOptions, TransportTiming, WsTransport,
};

const WAIT: Duration = Duration::from_secs(5);

fn fast_timing() -> TransportTiming {
    TransportTiming {
        base_retry_delay: Duration::from_millis(50),
        max_retry_delay: Duration::from_millis(200),
        heartbeat_interval: Duration::from_secs(30),
        heartbeat_grace: Duration::from_secs(5),
        ping_interval: Duration::from_secs(60),
    }
}

fn static_token(token: &str) -> TokenProvider {
    let token = token.to_owned();
    Arc::new(move || {
        let token = token.clone();
        async move { Ok(token) }.boxed()
    })
}

struct Harness {
    listener: TcpListener,
    transport: TransportHandle,
    buffer: Arc<Mutex<LogBuffer>>,
    control_rx: mpsc::Receiver<ControlMessage>,
}

/// Bind a local server socket and start a transport pointed at it.
async fn start(buffer: LogBuffer, token: &str) -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");

    let buffer = Arc::new(Mutex::new(buffer));
    let (control_tx, control_rx) = mpsc::channel(16);
    let transport = WsTransport::connect(TransportOptions {
        server_url: format!("http://{addr}"),
        client_id: "client-under-test".to_owned(),
        token_provider: static_token(token),
        log_buffer: Arc::clone(&buffer),
        control_tx,
        timing: fast_timing(),
    });

    Harness {
        listener,
        transport,
        buffer,
        control_rx,
    }
}

/// Accept one connection, capturing the upgrade URI.
async fn accept(listener: &TcpListener) -> (WebSocketStream<TcpStream>, String) {
    let (stream, _) = timeout(WAIT, listener.accept())
        .await
        .expect("accept timed out")
        .expect("accept");

    let mut uri = String::new();
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        uri = req.uri().to_string();
        Ok(resp)
    })
    .await
    .expect("websocket upgrade");
    (ws, uri)
}

/// Read the next text frame as JSON.
async fn next_json(ws: &mut WebSocketStream<TcpStream>) -> Value {
    let text = next_text(ws).await;
    serde_json::from_str(&text).expect("frame must be JSON")
}

async fn next_text(ws: &mut WebSocketStream<TcpStream>) -> String {
    loop {
        let frame = timeout(WAIT, ws.next())
            .await
            .expect("read timed out")
            .expect("stream ended")
            .expect("read");
        if let Message::Text(text) = frame {
            return text;
        }
    }
}

#[tokio::test]
async fn connect_sends_token_and_hello() {
    let harness = start(LogBuffer::new(16), "tok-123").await;
    let (mut ws, uri) = accept(&harness.listener).await;

    assert!(uri.starts_with("/api/ws"), "upgrade path must be fixed: {uri}");
    assert!(uri.contains("token=tok-123"), "session token must ride the query: {uri}");

    let hello = next_json(&mut ws).await;
    assert_eq!(hello["type"], "hello");
    assert_eq!(hello["clientId"], "client-under-test");
    assert!(hello["payload"]["platform"].is_string());

    harness.transport.close();
}

#[tokio::test]
async fn logs_and_statuses_flow_and_acks_advance_watermark() {
    let mut harness = start(LogBuffer::new(16), "tok").await;
    let (mut ws, _uri) = accept(&harness.listener).await;

    let hello = next_json(&mut ws).await;
    assert_eq!(hello["type"], "hello");

    // Outbound log envelope.
    let entry = LogEntry::new(5, "sess-a", LogStream::Stdout, "line five\n");
    harness.buffer.lock().await.push(entry.clone());
    harness.transport.send_log(entry);

    let log = next_json(&mut ws).await;
    assert_eq!(log["type"], "log");
    assert_eq!(log["sessionId"], "sess-a");
    assert_eq!(log["seq"], 5);
    assert_eq!(log["payload"]["message"], "line five\n");

    // Outbound status envelope.
    harness.transport.send_status("sess-a", AgentState::Running);
    let status = next_json(&mut ws).await;
    assert_eq!(status["type"], "status");
    assert_eq!(status["payload"]["state"], "running");

    // Ack advances the watermark.
    ws.send(Message::Text(r#"{"type":"ack","id":5}"#.to_owned()))
        .await
        .expect("send ack");
    timeout(WAIT, async {
        loop {
            if harness.buffer.lock().await.last_acked_id() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("watermark must advance after ack");
    assert!(harness.buffer.lock().await.unacked().is_empty());

    // Control envelope lands on the control channel.
    ws.send(Message::Text(
        r#"{"type":"control","action":"spawn","agentId":"sess-b","payload":{"prompt":"go"}}"#
            .to_owned(),
    ))
    .await
    .expect("send control");
    let control = timeout(WAIT, harness.control_rx.recv())
        .await
        .expect("control timed out")
        .expect("control channel open");
    assert_eq!(control.action, ControlAction::Spawn);
    assert_eq!(control.agent_id.as_deref(), Some("sess-b"));

    harness.transport.close();
}

#[tokio::test]
async fn literal_ping_answered_with_literal_pong() {
    let harness = start(LogBuffer::new(16), "tok").await;
    let (mut ws, _uri) = accept(&harness.listener).await;
    let _hello = next_json(&mut ws).await;

    ws.send(Message::Text("ping".to_owned()))
        .await
        .expect("send ping");

    assert_eq!(next_text(&mut ws).await, "pong");
    harness.transport.close();
}

#[tokio::test]
async fn malformed_frames_do_not_kill_the_connection() {
    let harness = start(LogBuffer::new(16), "tok").await;
    let (mut ws, _uri) = accept(&harness.listener).await;
    let _hello = next_json(&mut ws).await;

    ws.send(Message::Text("{definitely not json".to_owned()))
        .await
        .expect("send junk");
    ws.send(Message::Text(r#"{"type":"mystery"}"#.to_owned()))
        .await
        .expect("send unknown");

    // The connection must still answer a heartbeat afterwards.
    ws.send(Message::Text("ping".to_owned()))
        .await
        .expect("send ping");
    assert_eq!(next_text(&mut ws).await, "pong");

    harness.transport.close();
}

/// Sends issued while the connection attempt is still in flight are
/// no-ops; only the buffer replay may carry old entries onto a new
/// connection.
#[tokio::test]
async fn sends_queued_before_open_are_dropped() {
    let harness = start(LogBuffer::new(16), "tok").await;

    // The upgrade cannot complete until `accept` runs below, so these
    // queue while the transport is still connecting. The entry is not in
    // the buffer, so it cannot come back via replay either.
    let entry = LogEntry::new(9, "sess-q", LogStream::Stdout, "stale line\n");
    harness.transport.send_log(entry);
    harness.transport.send_status("sess-q", AgentState::Running);

    let (mut ws, _uri) = accept(&harness.listener).await;
    let hello = next_json(&mut ws).await;
    assert_eq!(hello["type"], "hello");

    // The next frame after a ping must be the pong, not a flushed
    // pre-open log or status envelope.
    ws.send(Message::Text("ping".to_owned()))
        .await
        .expect("send ping");
    assert_eq!(next_text(&mut ws).await, "pong");

    harness.transport.close();
}

#[tokio::test]
async fn unacked_entries_replay_after_reconnect() {
    let mut seeded = LogBuffer::new(16);
    for id in 1..=3 {
        seeded.push(LogEntry::new(id, "sess-r", LogStream::Stdout, format!("l{id}\n")));
    }
    seeded.set_last_acked_id(1);

    let harness = start(seeded, "tok").await;

    // First connection: hello, then the two unacked entries.
    let (mut ws, _uri) = accept(&harness.listener).await;
    let hello = next_json(&mut ws).await;
    assert_eq!(hello["type"], "hello");
    assert_eq!(next_json(&mut ws).await["seq"], 2);
    assert_eq!(next_json(&mut ws).await["seq"], 3);

    // Kill the connection server-side; the client must reconnect.
    drop(ws);

    // Second connection: same replay, nothing was acked in between.
    let (mut ws, _uri) = accept(&harness.listener).await;
    let hello = next_json(&mut ws).await;
    assert_eq!(hello["type"], "hello");
    assert_eq!(next_json(&mut ws).await["seq"], 2);
    assert_eq!(next_json(&mut ws).await["seq"], 3);

    harness.transport.close();
}
