use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use cowrite_client::persistence::PersistenceHandle;
use cowrite_client::replica::ReplicaStore;
use cowrite_client::runtime::{self, ClientEvent, ClientOptions};
use cowrite_client::session::{ConnectionState, ReconnectPolicy, WsTransport};
use cowrite_common::protocol::control::{AiAction, AiCommandPayload};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout, Instant};
use url::Url;

const SEED: &str = "Hello from the authority. ";

/// Minimal authority: relays its state on connect, merges binary deltas and
/// answers every AI command with a status and a result.
#[derive(Clone)]
struct Authority {
    doc: Arc<Mutex<ReplicaStore>>,
    connections: Arc<AtomicUsize>,
    commands: Arc<Mutex<Vec<Value>>>,
    drop_first_connection: bool,
}

impl Authority {
    fn new(drop_first_connection: bool) -> Self {
        let doc = ReplicaStore::with_client_id("doc", 1_000).expect("authority doc");
        doc.push(SEED);
        Self {
            doc: Arc::new(Mutex::new(doc)),
            connections: Arc::new(AtomicUsize::new(0)),
            commands: Arc::new(Mutex::new(Vec::new())),
            drop_first_connection,
        }
    }

    fn text(&self) -> String {
        self.doc.lock().expect("authority doc").text()
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn commands(&self) -> Vec<Value> {
        self.commands.lock().expect("commands").clone()
    }

    async fn serve(self) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("test listener should bind");
        let addr = listener.local_addr().expect("listener should expose local address");
        let app = Router::new().route("/ws", get(ws_route)).with_state(self);
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("authority should run");
        });
        Url::parse(&format!("ws://{addr}/ws")).expect("url")
    }
}

async fn ws_route(ws: WebSocketUpgrade, State(authority): State<Authority>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, authority))
}

async fn handle_socket(mut socket: WebSocket, authority: Authority) {
    let connection = authority.connections.fetch_add(1, Ordering::SeqCst) + 1;

    let state = authority.doc.lock().expect("authority doc").encode_full_state();
    if socket.send(WsMessage::Binary(state.into())).await.is_err() {
        return;
    }
    let synced = json!({"type": "SYNC_COMPLETE"}).to_string();
    if socket.send(WsMessage::Text(synced.into())).await.is_err() {
        return;
    }

    if authority.drop_first_connection && connection == 1 {
        let close = CloseFrame { code: 1011, reason: "restarting".into() };
        let _ = socket.send(WsMessage::Close(Some(close))).await;
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        match message {
            WsMessage::Binary(delta) => {
                let doc = authority.doc.lock().expect("authority doc");
                doc.apply_remote_delta(&delta).expect("client deltas should decode");
            }
            WsMessage::Text(text) => {
                let command: Value = serde_json::from_str(text.as_str()).expect("client sends json");
                let request_id = command["request_id"].clone();
                authority.commands.lock().expect("commands").push(command);

                let replies = [
                    json!({"type": "AI_STATUS", "status": "thinking", "message": "Working", "request_id": request_id}),
                    json!({"type": "AI_RESULT", "status": "complete", "message": "polished text", "request_id": request_id}),
                ];
                for reply in replies {
                    if socket.send(WsMessage::Text(reply.to_string().into())).await.is_err() {
                        return;
                    }
                }
            }
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
        }
    }
}

fn options() -> ClientOptions {
    let mut options = ClientOptions::new("doc");
    options.auto_trigger.enabled = false;
    options.reconnect = ReconnectPolicy { delay: Duration::from_millis(100) };
    options
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn client_converges_with_authority_and_round_trips_ai() {
    let authority = Authority::new(false);
    let url = authority.clone().serve().await;

    let (transport, transport_events) = WsTransport::channel();
    let client = runtime::spawn(
        url,
        transport,
        transport_events,
        async { PersistenceHandle::ephemeral("doc") },
        options(),
    )
    .expect("client should spawn");
    let handle = client.handle();
    let status = handle.status();
    let mut events = handle.subscribe_events();

    eventually("server sync", || status.is_server_synced()).await;
    assert_eq!(status.connection(), ConnectionState::Connected);
    assert_eq!(handle.text().await.expect("text"), SEED);

    handle.append("And a reply.").expect("append");
    eventually("authority to merge the edit", || authority.text() == format!("{SEED}And a reply.")).await;

    let text = handle.text().await.expect("text");
    let request_id = handle
        .request_ai(AiAction::Improve, Some(AiCommandPayload::Text(text)))
        .await
        .expect("AI command sent");

    let result = timeout(Duration::from_secs(5), async {
        loop {
            if let ClientEvent::AiResult { request_id, message } = events.recv().await.expect("events open") {
                return (request_id, message);
            }
        }
    })
    .await
    .expect("AI result should arrive");
    assert_eq!(result, (Some(request_id), "polished text".to_string()));

    let commands = authority.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0]["type"], "AI_COMMAND");
    assert_eq!(commands[0]["action"], "IMPROVE");
    assert_eq!(commands[0]["request_id"], request_id);

    client.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn client_reconnects_after_server_drops_the_channel() {
    let authority = Authority::new(true);
    let url = authority.clone().serve().await;

    let (transport, transport_events) = WsTransport::channel();
    let client = runtime::spawn(
        url,
        transport,
        transport_events,
        async { PersistenceHandle::ephemeral("doc") },
        options(),
    )
    .expect("client should spawn");
    let handle = client.handle();
    let status = handle.status();

    eventually("a second connection", || authority.connections() >= 2).await;
    eventually("the second session to open", || status.connection() == ConnectionState::Connected).await;
    assert_eq!(authority.connections(), 2);

    handle.append("Written after the restart.").expect("append");
    eventually("authority to merge the edit", || {
        authority.text() == format!("{SEED}Written after the restart.")
    })
    .await;

    client.shutdown().await.expect("shutdown");
}
