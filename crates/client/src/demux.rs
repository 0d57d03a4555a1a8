// Protocol demultiplexer: binary frames are deltas, text frames are control
// messages. The decision is made on framing alone, before any parsing.

use cowrite_common::protocol::control::ControlMessage;
use cowrite_common::protocol::frame::Frame;
use tracing::{debug, warn};

use crate::replica::ReplicaStore;

/// What an inbound frame turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxEvent {
    /// First authoritative state received on the current session.
    ServerSynced,
    DeltaApplied { len: usize },
    Control(ControlMessage),
}

#[derive(Debug, Default)]
pub struct ProtocolDemux {
    server_synced: bool,
    dropped: u64,
}

impl ProtocolDemux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget server-sync state; call whenever a new session opens.
    pub fn reset(&mut self) {
        self.server_synced = false;
    }

    pub fn is_server_synced(&self) -> bool {
        self.server_synced
    }

    /// Frames dropped because they were malformed or unrecognized.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn route(&mut self, frame: Frame, replica: &ReplicaStore) -> Vec<DemuxEvent> {
        match frame {
            Frame::Binary(delta) => self.route_delta(&delta, replica),
            Frame::Text(text) => self.route_control(&text),
        }
    }

    fn route_delta(&mut self, delta: &[u8], replica: &ReplicaStore) -> Vec<DemuxEvent> {
        if let Err(error) = replica.apply_remote_delta(delta) {
            self.dropped += 1;
            warn!(doc_id = %replica.doc_id(), len = delta.len(), error = %format!("{error:#}"), "dropping malformed delta");
            return Vec::new();
        }

        let mut events = vec![DemuxEvent::DeltaApplied { len: delta.len() }];
        if self.mark_synced() {
            debug!(doc_id = %replica.doc_id(), "first authoritative delta received");
            events.insert(0, DemuxEvent::ServerSynced);
        }
        events
    }

    fn route_control(&mut self, text: &str) -> Vec<DemuxEvent> {
        match ControlMessage::parse(text) {
            ControlMessage::Unrecognized { raw, reason } => {
                self.dropped += 1;
                warn!(%reason, raw = %truncate(&raw, 120), "dropping unrecognized control message");
                Vec::new()
            }
            ControlMessage::SyncComplete => {
                let mut events = Vec::with_capacity(2);
                if self.mark_synced() {
                    events.push(DemuxEvent::ServerSynced);
                }
                events.push(DemuxEvent::Control(ControlMessage::SyncComplete));
                events
            }
            message => vec![DemuxEvent::Control(message)],
        }
    }

    fn mark_synced(&mut self) -> bool {
        let first = !self.server_synced;
        self.server_synced = true;
        first
    }
}

fn truncate(raw: &str, max_chars: usize) -> &str {
    match raw.char_indices().nth(max_chars) {
        Some((index, _)) => &raw[..index],
        None => raw,
    }
}
