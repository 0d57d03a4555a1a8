// Session manager: owns the lifecycle of the channel to the authority.
//
// A fresh `ConnectionSession` (with its own id) is created for every
// connection attempt. Transport events carry the id of the session that
// produced them, so late events from a torn-down socket are recognised and
// ignored. Unclean closes schedule exactly one reconnect after a fixed
// delay; a normal closure (1000) or an explicit teardown never does.
//
// Time is passed in explicitly (`*_at(now)`) so the state machine can be
// driven deterministically in tests. The transport is abstracted via
// `Transport`; the WebSocket implementation lives in `ws`.

pub mod ws;

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use cowrite_common::protocol::frame::{is_clean_close, Frame, NORMAL_CLOSURE};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

pub use ws::WsTransport;

// ── Configuration ───────────────────────────────────────────────────

/// Reconnection parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self { delay: Duration::from_millis(3_000) }
    }
}

// ── Session identity ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// ── Transport trait ─────────────────────────────────────────────────

/// What a transport reports about one session's socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Opened,
    Frame(Frame),
    /// Always emitted last, including after an `Error`.
    Closed { code: u16, reason: String },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub session: SessionId,
    pub event: TransportEvent,
}

impl SessionEvent {
    pub fn new(session: SessionId, event: TransportEvent) -> Self {
        Self { session, event }
    }
}

/// Abstraction over the network channel for testability.
///
/// Implementations deliver `SessionEvent`s out of band (the WebSocket
/// transport pushes them into a channel handed over at construction).
pub trait Transport {
    /// Start opening a socket for `session`. Returning an error means no
    /// events will ever arrive for it.
    fn open(&mut self, session: SessionId, url: &Url) -> Result<()>;

    fn send(&mut self, session: SessionId, frame: Frame) -> Result<()>;

    /// Close the socket with `code`. Unknown sessions are ignored.
    fn close(&mut self, session: SessionId, code: u16);
}

// ── Connection state ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        })
    }
}

/// One connection attempt. Destroyed when its channel closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSession {
    pub id: SessionId,
    pub state: ConnectionState,
    pub close_code: Option<u16>,
}

/// Result of handing a frame to the session manager. Sending never fails
/// loudly; the caller decides whether to retry later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    NotConnected,
    Failed,
}

/// What the owner of the session manager must react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// Channel is open; the full replica state should be pushed.
    Established,
    Frame(Frame),
    Errored { message: String },
    Closed { code: u16, reconnect_at: Option<Instant> },
}

// ── Session manager ─────────────────────────────────────────────────

pub struct SessionManager<T: Transport> {
    url: Url,
    transport: T,
    policy: ReconnectPolicy,
    current: Option<ConnectionSession>,
    reconnect_at: Option<Instant>,
    torn_down: bool,
}

impl<T: Transport> SessionManager<T> {
    pub fn new(url: Url, transport: T) -> Self {
        Self {
            url,
            transport,
            policy: ReconnectPolicy::default(),
            current: None,
            reconnect_at: None,
            torn_down: false,
        }
    }

    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.current.as_ref().map_or(ConnectionState::Disconnected, |session| session.state)
    }

    pub fn current_session(&self) -> Option<&ConnectionSession> {
        self.current.as_ref()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_at.is_some()
    }

    /// Earliest instant at which `poll_at` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.reconnect_at
    }

    /// Open a new session unless one is already connecting or connected.
    pub fn connect_at(&mut self, now: Instant) {
        if self.torn_down {
            debug!("connect ignored after teardown");
            return;
        }
        if self.current.is_some() {
            debug!(state = %self.state(), "connect ignored; session already active");
            return;
        }
        self.reconnect_at = None;

        let id = SessionId::new();
        self.current =
            Some(ConnectionSession { id, state: ConnectionState::Connecting, close_code: None });
        info!(session_id = %id, url = %self.url, "opening session");

        if let Err(error) = self.transport.open(id, &self.url) {
            warn!(session_id = %id, error = %format!("{error:#}"), "failed to open session");
            self.current = None;
            self.schedule_reconnect(now);
        }
    }

    /// Fire the reconnect timer if it is due. Returns true when a new
    /// connection attempt was started.
    pub fn poll_at(&mut self, now: Instant) -> bool {
        match self.reconnect_at {
            Some(at) if at <= now => {
                self.reconnect_at = None;
                self.connect_at(now);
                true
            }
            _ => false,
        }
    }

    /// Apply one transport event. Events from any session other than the
    /// current one are ignored and yield `None`.
    pub fn handle_event_at(&mut self, now: Instant, event: SessionEvent) -> Option<SessionSignal> {
        let current = self.current.as_mut().filter(|session| session.id == event.session);
        let Some(session) = current else {
            debug!(session_id = %event.session, "ignoring event from stale session");
            return None;
        };

        match event.event {
            TransportEvent::Opened => {
                session.state = ConnectionState::Connected;
                self.reconnect_at = None;
                info!(session_id = %event.session, "session established");
                Some(SessionSignal::Established)
            }
            TransportEvent::Frame(frame) => Some(SessionSignal::Frame(frame)),
            TransportEvent::Error { message } => {
                session.state = ConnectionState::Disconnected;
                warn!(session_id = %event.session, error = %message, "session transport error");
                Some(SessionSignal::Errored { message })
            }
            TransportEvent::Closed { code, reason } => {
                session.close_code = Some(code);
                info!(session_id = %event.session, close_code = code, reason = %reason, "session closed");
                self.current = None;
                if !is_clean_close(code) {
                    self.schedule_reconnect(now);
                }
                Some(SessionSignal::Closed { code, reconnect_at: self.reconnect_at })
            }
        }
    }

    /// Hand a frame to the open channel.
    pub fn send(&mut self, frame: Frame) -> SendOutcome {
        let Some(session) = self.current.as_ref() else {
            return SendOutcome::NotConnected;
        };
        if session.state != ConnectionState::Connected {
            return SendOutcome::NotConnected;
        }
        let id = session.id;
        match self.transport.send(id, frame) {
            Ok(()) => SendOutcome::Sent,
            Err(error) => {
                warn!(session_id = %id, error = %format!("{error:#}"), "failed to send frame");
                SendOutcome::Failed
            }
        }
    }

    /// Close the channel for good. No reconnect happens afterwards.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.reconnect_at = None;
        if let Some(session) = self.current.take() {
            info!(session_id = %session.id, "tearing down session");
            self.transport.close(session.id, NORMAL_CLOSURE);
        }
    }

    fn schedule_reconnect(&mut self, now: Instant) {
        if self.torn_down || self.reconnect_at.is_some() {
            return;
        }
        let at = now + self.policy.delay;
        self.reconnect_at = Some(at);
        info!(delay_ms = self.policy.delay.as_millis() as u64, "reconnect scheduled");
    }
}

/// Parse and check the authority endpoint. Plain `ws` is accepted but
/// flagged when it does not point at this machine.
pub fn parse_server_url(value: &str) -> Result<Url> {
    let parsed =
        Url::parse(value).map_err(|error| anyhow!("invalid server_url `{value}`: {error}"))?;
    match parsed.scheme() {
        "wss" => Ok(parsed),
        "ws" => {
            if !is_loopback_host(parsed.host_str()) {
                warn!(url = %parsed, "server_url uses unencrypted ws to a remote host");
            }
            Ok(parsed)
        }
        other => Err(anyhow!("server_url must use ws or wss, got `{other}`")),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|addr| addr.is_loopback())
}
