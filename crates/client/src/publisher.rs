// Change publisher: forwards local replica mutations to the session and
// suppresses everything that came from the authority.

use cowrite_common::crdt::origin::Origin;
use cowrite_common::protocol::frame::Frame;
use tracing::debug;

use crate::replica::{ChangeEvent, ChangeStream, ReplicaStore};
use crate::session::{ConnectionState, SendOutcome, SessionManager, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Remote-origin change; never re-sent.
    Suppressed,
    Sent,
    /// Not sent now; stays buffered in the replica until the next attempt
    /// or the full-state push on reconnect.
    Deferred,
    /// An earlier publish already carried this change.
    UpToDate,
}

#[derive(Debug)]
pub struct ChangePublisher {
    stream: Option<ChangeStream>,
    sent: u64,
    suppressed: u64,
}

impl ChangePublisher {
    pub fn subscribe(replica: &ReplicaStore) -> Self {
        Self { stream: Some(replica.subscribe()), sent: 0, suppressed: 0 }
    }

    pub fn is_subscribed(&self) -> bool {
        self.stream.is_some()
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn suppressed(&self) -> u64 {
        self.suppressed
    }

    /// Next replica change. Pending forever once unsubscribed.
    pub async fn next_change(&mut self) -> Option<ChangeEvent> {
        match self.stream.as_mut() {
            Some(stream) => stream.recv().await,
            None => std::future::pending().await,
        }
    }

    pub fn publish<T: Transport>(
        &mut self,
        event: &ChangeEvent,
        replica: &ReplicaStore,
        session: &mut SessionManager<T>,
    ) -> PublishOutcome {
        if event.origin == Origin::Remote {
            self.suppressed += 1;
            debug!(doc_id = %replica.doc_id(), len = event.delta.len(), "suppressing remote-origin change");
            return PublishOutcome::Suppressed;
        }

        // Offline edits stay in the replica; the full-state push on connect
        // carries them.
        if session.state() != ConnectionState::Connected {
            debug!(doc_id = %replica.doc_id(), state = %session.state(), "local change deferred until connected");
            return PublishOutcome::Deferred;
        }

        let Some(delta) = replica.encode_since_last_send() else {
            return PublishOutcome::UpToDate;
        };

        match session.send(Frame::Binary(delta)) {
            SendOutcome::Sent => {
                replica.mark_sent();
                self.sent += 1;
                PublishOutcome::Sent
            }
            outcome => {
                debug!(doc_id = %replica.doc_id(), ?outcome, "local change deferred");
                PublishOutcome::Deferred
            }
        }
    }

    /// Publish every change already queued on the subscription.
    pub fn pump<T: Transport>(
        &mut self,
        replica: &ReplicaStore,
        session: &mut SessionManager<T>,
    ) -> Vec<PublishOutcome> {
        let pending = self.stream.as_mut().map(ChangeStream::drain).unwrap_or_default();
        pending.iter().map(|event| self.publish(event, replica, session)).collect()
    }

    /// Push the whole replica so the authority can reconcile after any
    /// amount of time offline.
    pub fn push_full_state<T: Transport>(
        &mut self,
        replica: &ReplicaStore,
        session: &mut SessionManager<T>,
    ) -> SendOutcome {
        let outcome = session.send(Frame::Binary(replica.encode_full_state()));
        if outcome == SendOutcome::Sent {
            replica.mark_sent();
        }
        outcome
    }

    pub fn unsubscribe(&mut self) {
        self.stream = None;
    }
}
