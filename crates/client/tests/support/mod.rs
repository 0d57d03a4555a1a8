// Shared fakes for the client integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use cowrite_client::replica::ReplicaStore;
use cowrite_client::session::{SessionEvent, SessionId, Transport, TransportEvent};
use cowrite_common::protocol::frame::Frame;
use tokio::sync::mpsc;
use url::Url;

#[derive(Debug, Default)]
struct FakeLog {
    opened: Vec<SessionId>,
    sent: Vec<(SessionId, Frame)>,
    closed: Vec<(SessionId, u16)>,
}

/// Records every call; never talks to a network.
#[derive(Debug, Clone, Default)]
pub struct FakeTransport {
    log: Arc<Mutex<FakeLog>>,
}

impl Transport for FakeTransport {
    fn open(&mut self, session: SessionId, _url: &Url) -> Result<()> {
        self.log.lock().expect("fake log").opened.push(session);
        Ok(())
    }

    fn send(&mut self, session: SessionId, frame: Frame) -> Result<()> {
        self.log.lock().expect("fake log").sent.push((session, frame));
        Ok(())
    }

    fn close(&mut self, session: SessionId, code: u16) {
        self.log.lock().expect("fake log").closed.push((session, code));
    }
}

impl FakeTransport {
    pub fn opened(&self) -> Vec<SessionId> {
        self.log.lock().expect("fake log").opened.clone()
    }

    pub fn latest(&self) -> SessionId {
        *self.opened().last().expect("no session was opened")
    }

    pub fn sent(&self) -> Vec<Frame> {
        self.log.lock().expect("fake log").sent.iter().map(|(_, frame)| frame.clone()).collect()
    }

    pub fn sent_binary(&self) -> Vec<Vec<u8>> {
        self.sent()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Binary(bytes) => Some(bytes),
                Frame::Text(_) => None,
            })
            .collect()
    }

    /// Outbound control messages, parsed as JSON.
    pub fn sent_control(&self) -> Vec<serde_json::Value> {
        self.sent()
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Text(text) => Some(serde_json::from_str(&text).expect("outbound json")),
                Frame::Binary(_) => None,
            })
            .collect()
    }

    pub fn closed(&self) -> Vec<(SessionId, u16)> {
        self.log.lock().expect("fake log").closed.clone()
    }
}

/// Test-side end of a fake connection: injects transport events.
#[derive(Debug, Clone)]
pub struct FakeRemote {
    pub transport: FakeTransport,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl FakeRemote {
    pub fn emit(&self, session: SessionId, event: TransportEvent) {
        self.events.send(SessionEvent::new(session, event)).expect("client alive");
    }

    /// Complete the handshake of the most recent session.
    pub fn accept(&self) -> SessionId {
        let session = self.transport.latest();
        self.emit(session, TransportEvent::Opened);
        session
    }

    pub fn deliver(&self, session: SessionId, frame: Frame) {
        self.emit(session, TransportEvent::Frame(frame));
    }

    pub fn close(&self, session: SessionId, code: u16) {
        self.emit(session, TransportEvent::Closed { code, reason: String::new() });
    }
}

pub fn fake_connection() -> (FakeTransport, FakeRemote, mpsc::UnboundedReceiver<SessionEvent>) {
    let transport = FakeTransport::default();
    let (events, rx) = mpsc::unbounded_channel();
    let remote = FakeRemote { transport: transport.clone(), events };
    (transport, remote, rx)
}

pub fn test_url() -> Url {
    Url::parse("ws://127.0.0.1:3030/ws").expect("url")
}

/// Full state of a peer that typed `content`.
pub fn peer_delta(client_id: u64, content: &str) -> Vec<u8> {
    let peer = ReplicaStore::with_client_id("doc", client_id).expect("peer");
    peer.push(content);
    peer.encode_full_state()
}

/// Let spawned tasks drain their queues. Under a paused clock this also
/// advances virtual time by a few milliseconds.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}
