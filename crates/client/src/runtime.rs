// Client runtime: one task owns the replica and every component around it.
//
// The task first waits for local storage, hydrates, and only then opens the
// session. After that a single `select!` loop reacts to transport events,
// replica changes, UI commands and the earliest pending timer. Handlers
// never await, so components are only ever touched from this loop.

use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use cowrite_common::crdt::origin::Origin;
use cowrite_common::protocol::control::{
    AgentPayload, AiAction, AiCommand, AiCommandPayload, AiStatusKind, Comment, ControlMessage,
};
use cowrite_common::protocol::frame::Frame;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::autotrigger::{AutoTriggerConfig, AutoTriggerScheduler, TriggerFire};
use crate::config::{AutoTriggerSettings, ClientConfig};
use crate::correlation::RequestGuard;
use crate::demux::{DemuxEvent, ProtocolDemux};
use crate::persistence::PersistenceHandle;
use crate::publisher::ChangePublisher;
use crate::replica::{ChangeEvent, ReplicaStore};
use crate::session::{
    ReconnectPolicy, SendOutcome, SessionEvent, SessionManager, SessionSignal, Transport,
};
use crate::status::{AiActivity, StatusBoard, StatusView};
use crate::upstream::{RefineClient, UpstreamError};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub doc_id: String,
    pub reconnect: ReconnectPolicy,
    pub auto_trigger: AutoTriggerConfig,
    /// Action issued when the auto-trigger fires.
    pub auto_action: AiAction,
    pub auto_role: String,
    pub refine: Option<RefineClient>,
}

impl ClientOptions {
    pub fn new(doc_id: impl Into<String>) -> Self {
        let auto = AutoTriggerSettings::default();
        Self {
            doc_id: doc_id.into(),
            reconnect: ReconnectPolicy::default(),
            auto_trigger: auto.scheduler_config(),
            auto_action: auto.action,
            auto_role: auto.role,
            refine: None,
        }
    }

    pub fn from_config(doc_id: impl Into<String>, config: &ClientConfig) -> Result<Self, UpstreamError> {
        let refine = config.refine_url.as_deref().map(RefineClient::new).transpose()?;
        Ok(Self {
            doc_id: doc_id.into(),
            reconnect: config.session.reconnect_policy(),
            auto_trigger: config.auto_trigger.scheduler_config(),
            auto_action: config.auto_trigger.action,
            auto_role: config.auto_trigger.role.clone(),
            refine,
        })
    }
}

/// Things the UI should react to beyond the status board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    ServerSynced,
    Comment(Comment),
    AiResult { request_id: Option<u64>, message: String },
    AiFailed { request_id: Option<u64>, message: String },
    AutoTriggered { request_id: u64, action: AiAction },
}

#[derive(Debug)]
enum ClientCommand {
    Insert { index: u32, text: String },
    Append(String),
    Remove { index: u32, len: u32 },
    ReplaceAll(String),
    RequestAi {
        action: AiAction,
        payload: Option<AiCommandPayload>,
        reply: oneshot::Sender<Result<u64, SendOutcome>>,
    },
    SetAutoTrigger(bool),
    Text(oneshot::Sender<String>),
}

/// Cheap to clone. Every clone talks to the same runtime task.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    commands: mpsc::UnboundedSender<ClientCommand>,
    shutdown: Arc<watch::Sender<bool>>,
    events: broadcast::Sender<ClientEvent>,
    board: Arc<StatusBoard>,
    guard: RequestGuard,
    refine: Option<RefineClient>,
}

impl ClientHandle {
    /// Offsets are UTF-8 bytes; see [`ReplicaStore::insert`].
    pub fn insert(&self, index: u32, text: impl Into<String>) -> Result<()> {
        self.command(ClientCommand::Insert { index, text: text.into() })
    }

    pub fn append(&self, text: impl Into<String>) -> Result<()> {
        self.command(ClientCommand::Append(text.into()))
    }

    pub fn remove(&self, index: u32, len: u32) -> Result<()> {
        self.command(ClientCommand::Remove { index, len })
    }

    pub fn replace_all(&self, text: impl Into<String>) -> Result<()> {
        self.command(ClientCommand::ReplaceAll(text.into()))
    }

    /// Send an AI command over the session, superseding any request still
    /// in flight. Resolves to the request id once the frame is handed to the
    /// transport.
    pub async fn request_ai(&self, action: AiAction, payload: Option<AiCommandPayload>) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.command(ClientCommand::RequestAi { action, payload, reply })?;
        let sent = rx.await.context("client runtime has stopped")?;
        sent.map_err(|outcome| anyhow!("{action} command not sent ({outcome:?})"))
    }

    /// Forget the current AI request. Whatever it produces later is ignored.
    pub fn cancel_ai(&self) {
        self.guard.cancel();
        self.board.set_ai(AiActivity::Idle);
    }

    pub fn set_auto_trigger(&self, enabled: bool) -> Result<()> {
        self.command(ClientCommand::SetAutoTrigger(enabled))
    }

    pub async fn text(&self) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.command(ClientCommand::Text(reply))?;
        rx.await.context("client runtime has stopped")
    }

    /// Run `text` through the refinement service under the request guard.
    /// `Ok(None)` means a newer request (or a cancel) superseded this one.
    /// Refused until local state has been hydrated.
    pub async fn refine(&self, action: AiAction, text: &str) -> Result<Option<String>, UpstreamError> {
        let client = self.refine.as_ref().ok_or(UpstreamError::NotConfigured)?;
        if !*self.board.local_synced.borrow() {
            return Err(UpstreamError::NotHydrated);
        }
        let board = Arc::clone(&self.board);
        let outcome = self
            .guard
            .run(|check| {
                board.set_ai(AiActivity::Requested { request_id: check.id(), action });
                async move { client.refine(action, text).await.map(|refined| (check.id(), refined)) }
            })
            .await;

        match outcome {
            Ok(Some((request_id, refined))) => {
                self.board.set_ai(AiActivity::Done {
                    request_id: Some(request_id),
                    message: format!("Applied {action}"),
                });
                Ok(Some(refined))
            }
            Ok(None) => Ok(None),
            Err(error) => {
                let request_id = self.guard.current().map(|record| record.id);
                self.board.set_ai(AiActivity::Failed { request_id, message: error.to_string() });
                Err(error)
            }
        }
    }

    pub fn has_refine_service(&self) -> bool {
        self.refine.is_some()
    }

    pub fn status(&self) -> StatusView {
        self.board.view()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    fn command(&self, command: ClientCommand) -> Result<()> {
        self.commands.send(command).map_err(|_| anyhow!("client runtime has stopped"))
    }
}

/// A spawned client plus its task.
pub struct RunningClient {
    handle: ClientHandle,
    task: JoinHandle<()>,
}

impl RunningClient {
    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    /// Signal shutdown and wait for the task to flush and close.
    pub async fn shutdown(self) -> Result<()> {
        self.handle.shutdown();
        self.task.await.context("client task panicked")
    }
}

/// Start a client for `options.doc_id`. `store` resolves to the persistence
/// handle; no connection is attempted before it does.
pub fn spawn<T, S>(
    url: Url,
    transport: T,
    transport_events: mpsc::UnboundedReceiver<SessionEvent>,
    store: S,
    options: ClientOptions,
) -> Result<RunningClient>
where
    T: Transport + Send + 'static,
    S: Future<Output = PersistenceHandle> + Send + 'static,
{
    let replica = ReplicaStore::new(options.doc_id.clone())?;
    let (commands_tx, commands) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown) = watch::channel(false);
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let board = Arc::new(StatusBoard::new());
    let guard = RequestGuard::new();

    let handle = ClientHandle {
        commands: commands_tx,
        shutdown: Arc::new(shutdown_tx),
        events: events.clone(),
        board: Arc::clone(&board),
        guard: guard.clone(),
        refine: options.refine.clone(),
    };

    let session = SessionManager::new(url, transport).with_reconnect_policy(options.reconnect);
    let parts = ClientParts {
        replica,
        session,
        transport_events,
        commands,
        shutdown,
        events,
        board,
        guard,
        options,
    };
    let task = tokio::spawn(parts.run(store));

    Ok(RunningClient { handle, task })
}

/// Everything the task needs before local storage is ready.
struct ClientParts<T: Transport> {
    replica: ReplicaStore,
    session: SessionManager<T>,
    transport_events: mpsc::UnboundedReceiver<SessionEvent>,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    shutdown: watch::Receiver<bool>,
    events: broadcast::Sender<ClientEvent>,
    board: Arc<StatusBoard>,
    guard: RequestGuard,
    options: ClientOptions,
}

impl<T: Transport> ClientParts<T> {
    async fn run<S>(mut self, store: S)
    where
        S: Future<Output = PersistenceHandle>,
    {
        let persistence = tokio::select! {
            persistence = store => persistence,
            _ = wait_for_shutdown(&mut self.shutdown) => {
                info!(doc_id = %self.replica.doc_id(), "shutdown before local state was loaded");
                return;
            }
        };

        let mut client = SyncClient {
            publisher: ChangePublisher::subscribe(&self.replica),
            scheduler: AutoTriggerScheduler::new(self.options.auto_trigger.clone()),
            demux: ProtocolDemux::new(),
            replica: self.replica,
            persistence,
            session: self.session,
            transport_events: self.transport_events,
            commands: self.commands,
            shutdown: self.shutdown,
            events: self.events,
            board: self.board,
            guard: self.guard,
            auto_action: self.options.auto_action,
            auto_role: self.options.auto_role,
        };
        client.start();
        client.run().await;
    }
}

struct SyncClient<T: Transport> {
    replica: ReplicaStore,
    persistence: PersistenceHandle,
    session: SessionManager<T>,
    publisher: ChangePublisher,
    demux: ProtocolDemux,
    scheduler: AutoTriggerScheduler,
    transport_events: mpsc::UnboundedReceiver<SessionEvent>,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
    shutdown: watch::Receiver<bool>,
    events: broadcast::Sender<ClientEvent>,
    board: Arc<StatusBoard>,
    guard: RequestGuard,
    auto_action: AiAction,
    auto_role: String,
}

impl<T: Transport> SyncClient<T> {
    /// Hydrate, then connect. The order is what keeps offline edits safe.
    fn start(&mut self) {
        let report = self.persistence.hydrate(&self.replica);
        // Hydration changes are remote-origin; drop them before they reach
        // the publisher.
        let replayed = self.publisher.pump(&self.replica, &mut self.session);
        debug!(doc_id = %self.replica.doc_id(), applied = report.applied, replayed = replayed.len(), "replica hydrated");

        self.board.set_local_synced(true);
        self.board.set_text(&self.replica.text());
        self.scheduler.set_document_active(true);

        self.session.connect_at(Instant::now());
        self.sync_connection_status();
    }

    async fn run(&mut self) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                _ = wait_for_shutdown(&mut self.shutdown) => break,
                Some(event) = self.transport_events.recv() => self.on_transport_event(event),
                Some(change) = self.persistence.next_change() => {
                    self.persistence.record(&change, &self.replica);
                }
                Some(change) = self.publisher.next_change() => self.on_replica_change(change),
                Some(command) = self.commands.recv() => self.on_command(command),
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_timer();
                }
            }
        }
        self.stop();
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.session.next_deadline(), self.scheduler.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn on_transport_event(&mut self, event: SessionEvent) {
        let signal = self.session.handle_event_at(Instant::now(), event);
        self.sync_connection_status();

        match signal {
            Some(SessionSignal::Established) => {
                self.demux.reset();
                self.board.set_server_synced(false);
                let outcome = self.publisher.push_full_state(&self.replica, &mut self.session);
                debug!(doc_id = %self.replica.doc_id(), ?outcome, "pushed full state to authority");
            }
            Some(SessionSignal::Frame(frame)) => self.on_frame(frame),
            Some(SessionSignal::Closed { .. }) => {
                self.demux.reset();
                self.board.set_server_synced(false);
            }
            Some(SessionSignal::Errored { .. }) | None => {}
        }
    }

    fn on_frame(&mut self, frame: Frame) {
        for event in self.demux.route(frame, &self.replica) {
            match event {
                DemuxEvent::ServerSynced => {
                    info!(doc_id = %self.replica.doc_id(), "server synced");
                    self.board.set_server_synced(true);
                    self.emit(ClientEvent::ServerSynced);
                }
                DemuxEvent::DeltaApplied { .. } => {}
                DemuxEvent::Control(message) => self.on_control(message),
            }
        }
    }

    fn on_control(&mut self, message: ControlMessage) {
        let request_id = message.request_id();
        match message {
            ControlMessage::AiStatus(status) => {
                if !self.guard.accepts(request_id) {
                    debug!(?request_id, "ignoring AI status for a superseded request");
                    return;
                }
                if status.status == AiStatusKind::Error {
                    self.emit(ClientEvent::AiFailed { request_id, message: status.message.clone() });
                }
                self.board.set_ai(AiActivity::from_status(status.status, request_id, status.message));
            }
            ControlMessage::AiResult(result) => {
                if !self.guard.accepts(request_id) {
                    debug!(?request_id, "ignoring AI result for a superseded request");
                    return;
                }
                self.emit(ClientEvent::AiResult { request_id, message: result.message });
            }
            ControlMessage::Comment(comment) => self.emit(ClientEvent::Comment(comment)),
            ControlMessage::SyncComplete | ControlMessage::Unrecognized { .. } => {}
        }
    }

    fn on_replica_change(&mut self, change: ChangeEvent) {
        self.publisher.publish(&change, &self.replica, &mut self.session);

        let text = self.replica.text();
        self.board.set_text(&text);
        if change.origin == Origin::Local {
            let now = Instant::now();
            self.scheduler.schedule_at(now, &text);
            self.board.set_countdown(self.scheduler.seconds_remaining_at(now));
        }
    }

    fn on_command(&mut self, command: ClientCommand) {
        match command {
            ClientCommand::Insert { index, text } => self.replica.insert(index, &text),
            ClientCommand::Append(text) => self.replica.push(&text),
            ClientCommand::Remove { index, len } => self.replica.remove_range(index, len),
            ClientCommand::ReplaceAll(text) => self.replica.replace_all(&text),
            ClientCommand::RequestAi { action, payload, reply } => {
                // A manual request makes the pending automatic one moot.
                self.scheduler.cancel();
                self.board.set_countdown(None);
                let _ = reply.send(self.send_ai_command(action, payload));
            }
            ClientCommand::SetAutoTrigger(enabled) => {
                self.scheduler.set_enabled(enabled);
                self.board.set_countdown(self.scheduler.seconds_remaining_at(Instant::now()));
                info!(enabled, "auto-trigger toggled");
            }
            ClientCommand::Text(reply) => {
                let _ = reply.send(self.replica.text());
            }
        }
    }

    fn on_timer(&mut self) {
        let now = Instant::now();
        if self.session.poll_at(now) {
            self.sync_connection_status();
        }
        if self.scheduler.is_pending() {
            let text = self.replica.text();
            if let Some(fire) = self.scheduler.poll_at(now, &text) {
                self.fire_auto_trigger(fire);
            }
        }
        self.board.set_countdown(self.scheduler.seconds_remaining_at(now));
    }

    fn fire_auto_trigger(&mut self, fire: TriggerFire) {
        let action = self.auto_action;
        let payload = match action {
            AiAction::Agent => AiCommandPayload::Agent(AgentPayload { role: self.auto_role.clone() }),
            _ => AiCommandPayload::Text(fire.content),
        };
        match self.send_ai_command(action, Some(payload)) {
            Ok(request_id) => {
                info!(request_id, %action, length = fire.length, first = fire.first, "auto-trigger issued AI command");
                self.emit(ClientEvent::AutoTriggered { request_id, action });
            }
            Err(outcome) => debug!(?outcome, "auto-trigger command not sent"),
        }
    }

    /// Tag a command with a fresh request id and send it. A command that
    /// never left is cancelled so nothing waits on it.
    fn send_ai_command(&mut self, action: AiAction, payload: Option<AiCommandPayload>) -> Result<u64, SendOutcome> {
        let request_id = self.guard.next_id();
        let mut command = AiCommand::new(action).with_request_id(request_id);
        command.payload = payload;

        let outcome = match command.to_text() {
            Ok(text) => self.session.send(Frame::Text(text)),
            Err(error) => {
                warn!(request_id, error = %error, "failed to encode AI command");
                SendOutcome::Failed
            }
        };

        if outcome == SendOutcome::Sent {
            debug!(request_id, %action, "AI command sent");
            self.board.set_ai(AiActivity::Requested { request_id, action });
            return Ok(request_id);
        }

        warn!(request_id, %action, ?outcome, "AI command not sent");
        self.guard.cancel();
        let message = match outcome {
            SendOutcome::NotConnected => "not connected to the server".to_string(),
            _ => "failed to send AI command".to_string(),
        };
        self.board.set_ai(AiActivity::Failed { request_id: Some(request_id), message: message.clone() });
        self.emit(ClientEvent::AiFailed { request_id: Some(request_id), message });
        Err(outcome)
    }

    fn sync_connection_status(&self) {
        self.board.set_connection(self.session.state());
    }

    fn emit(&self, event: ClientEvent) {
        // No receivers is fine; the UI may not be listening.
        let _ = self.events.send(event);
    }

    fn stop(&mut self) {
        self.scheduler.teardown();
        self.board.set_countdown(None);

        // Last chance for edits that arrived since the previous publish.
        self.publisher.pump(&self.replica, &mut self.session);
        self.publisher.unsubscribe();
        self.session.teardown();
        self.sync_connection_status();

        self.persistence.close(Some(&self.replica));
        info!(doc_id = %self.replica.doc_id(), "client stopped");
    }
}

/// Resolves once shutdown was requested or every handle is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_follow_config() {
        let mut config = ClientConfig::default();
        config.auto_trigger.action = AiAction::Continue;
        config.session.reconnect_delay_ms = 250;
        config.refine_url = Some("http://127.0.0.1:3030".into());

        let options = ClientOptions::from_config("doc", &config).expect("options");
        assert_eq!(options.auto_action, AiAction::Continue);
        assert_eq!(options.reconnect.delay.as_millis(), 250);
        assert!(options.refine.is_some());
    }

    #[test]
    fn bad_refine_url_is_rejected() {
        let mut config = ClientConfig::default();
        config.refine_url = Some("ftp://example.com".into());
        assert!(matches!(
            ClientOptions::from_config("doc", &config),
            Err(UpstreamError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn default_options_use_agent_role() {
        let options = ClientOptions::new("doc");
        assert_eq!(options.auto_action, AiAction::Agent);
        assert_eq!(options.auto_role, "composer");
        assert!(options.refine.is_none());
    }

    #[tokio::test]
    async fn refine_without_service_is_not_configured() {
        let (transport, events) = crate::session::WsTransport::channel();
        let url = Url::parse("ws://127.0.0.1:9/ws").expect("url");
        let client = spawn(url, transport, events, std::future::pending::<PersistenceHandle>(), ClientOptions::new("doc"))
            .expect("spawn");
        let handle = client.handle();

        assert!(!handle.has_refine_service());
        assert!(matches!(
            handle.refine(AiAction::Improve, "text").await,
            Err(UpstreamError::NotConfigured)
        ));
        client.shutdown().await.expect("shutdown");
    }

    #[tokio::test]
    async fn refine_waits_for_local_hydration() {
        let (transport, events) = crate::session::WsTransport::channel();
        let url = Url::parse("ws://127.0.0.1:9/ws").expect("url");
        let mut options = ClientOptions::new("doc");
        options.auto_trigger.enabled = false;
        options.refine = Some(RefineClient::new("http://127.0.0.1:9").expect("refine client"));
        let (store_tx, store_rx) = oneshot::channel::<PersistenceHandle>();
        let store = async move { store_rx.await.unwrap_or_else(|_| PersistenceHandle::ephemeral("doc")) };
        let client = spawn(url, transport, events, store, options).expect("spawn");
        let handle = client.handle();
        let mut status = handle.status();

        assert!(matches!(
            handle.refine(AiAction::Improve, "text").await,
            Err(UpstreamError::NotHydrated)
        ));
        assert_eq!(status.ai(), AiActivity::Idle);

        store_tx.send(PersistenceHandle::ephemeral("doc")).map_err(|_| ()).expect("store receiver");
        status.local_synced.wait_for(|synced| *synced).await.expect("board alive");

        // Past the gate the request is attempted; nothing listens on the port.
        assert!(matches!(
            handle.refine(AiAction::Improve, "text").await,
            Err(UpstreamError::Request(_))
        ));
        client.shutdown().await.expect("shutdown");
    }
}
