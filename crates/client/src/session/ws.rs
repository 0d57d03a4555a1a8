// WebSocket transport: one tokio task per session socket.
//
// Each task reports `Opened`, inbound frames and finally exactly one
// `Closed` into the shared event channel. Errors are reported as `Error`
// followed by `Closed` with 1006 so the session manager only ever reacts to
// the close.

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use cowrite_common::protocol::frame::{
    Frame, ABNORMAL_CLOSURE, NORMAL_CLOSURE, NO_STATUS_RECEIVED,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

use super::{SessionEvent, SessionId, Transport, TransportEvent};

#[derive(Debug)]
enum Outbound {
    Frame(Frame),
    Close(u16),
}

pub struct WsTransport {
    events: mpsc::UnboundedSender<SessionEvent>,
    sockets: HashMap<SessionId, mpsc::UnboundedSender<Outbound>>,
}

impl WsTransport {
    pub fn new(events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { events, sockets: HashMap::new() }
    }

    /// Transport plus the receiver its events arrive on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn open_sockets(&self) -> usize {
        self.sockets.values().filter(|tx| !tx.is_closed()).count()
    }
}

impl Transport for WsTransport {
    fn open(&mut self, session: SessionId, url: &Url) -> Result<()> {
        let runtime =
            tokio::runtime::Handle::try_current().context("websocket transport needs a tokio runtime")?;
        self.sockets.retain(|_, tx| !tx.is_closed());

        let (tx, rx) = mpsc::unbounded_channel();
        self.sockets.insert(session, tx);
        runtime.spawn(run_socket(session, url.to_string(), rx, self.events.clone()));
        Ok(())
    }

    fn send(&mut self, session: SessionId, frame: Frame) -> Result<()> {
        let tx = self
            .sockets
            .get(&session)
            .ok_or_else(|| anyhow!("no socket for session {session}"))?;
        tx.send(Outbound::Frame(frame))
            .map_err(|_| anyhow!("socket task for session {session} has stopped"))
    }

    fn close(&mut self, session: SessionId, code: u16) {
        if let Some(tx) = self.sockets.remove(&session) {
            let _ = tx.send(Outbound::Close(code));
        }
    }
}

async fn run_socket(
    session: SessionId,
    url: String,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    let emit = |event: TransportEvent| {
        let _ = events.send(SessionEvent::new(session, event));
    };
    let fail = |message: String| {
        emit(TransportEvent::Error { message });
        emit(TransportEvent::Closed { code: ABNORMAL_CLOSURE, reason: String::new() });
    };

    let stream = match connect_async(url.as_str()).await {
        Ok((stream, _response)) => stream,
        Err(error) => {
            fail(format!("connect to {url} failed: {error}"));
            return;
        }
    };
    emit(TransportEvent::Opened);
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            command = outbound.recv() => {
                let code = match command {
                    Some(Outbound::Frame(frame)) => {
                        let message = match frame {
                            Frame::Binary(bytes) => Message::Binary(bytes.into()),
                            Frame::Text(text) => Message::Text(text.into()),
                        };
                        if let Err(error) = sink.send(message).await {
                            fail(format!("send failed: {error}"));
                            return;
                        }
                        continue;
                    }
                    Some(Outbound::Close(code)) => code,
                    // Transport dropped; nobody is listening any more.
                    None => NORMAL_CLOSURE,
                };
                let close = CloseFrame { code: CloseCode::from(code), reason: String::new().into() };
                let _ = sink.send(Message::Close(Some(close))).await;
                let _ = sink.close().await;
                debug!(session_id = %session, close_code = code, "socket closed by client");
                return;
            }
            incoming = source.next() => match incoming {
                Some(Ok(Message::Binary(bytes))) => {
                    emit(TransportEvent::Frame(Frame::Binary(bytes.to_vec())));
                }
                Some(Ok(Message::Text(text))) => {
                    emit(TransportEvent::Frame(Frame::Text(text.as_str().to_owned())));
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
                        None => (NO_STATUS_RECEIVED, String::new()),
                    };
                    emit(TransportEvent::Closed { code, reason });
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    fail(format!("receive failed: {error}"));
                    return;
                }
                None => {
                    emit(TransportEvent::Closed { code: ABNORMAL_CLOSURE, reason: String::new() });
                    return;
                }
            },
        }
    }
}
