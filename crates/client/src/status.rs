// Read-only observables for the UI layer.

use cowrite_common::protocol::control::{AiAction, AiStatusKind};
use tokio::sync::watch;

use crate::session::ConnectionState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextStats {
    pub chars: usize,
    pub words: usize,
}

impl TextStats {
    pub fn of(text: &str) -> Self {
        Self { chars: text.chars().count(), words: text.split_whitespace().count() }
    }
}

/// What the AI side is doing, as far as the current request is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AiActivity {
    #[default]
    Idle,
    Requested { request_id: u64, action: AiAction },
    Thinking { request_id: Option<u64>, message: String },
    Done { request_id: Option<u64>, message: String },
    Failed { request_id: Option<u64>, message: String },
}

impl AiActivity {
    pub fn from_status(kind: AiStatusKind, request_id: Option<u64>, message: String) -> Self {
        match kind {
            AiStatusKind::Thinking => Self::Thinking { request_id, message },
            AiStatusKind::Done => Self::Done { request_id, message },
            AiStatusKind::Error => Self::Failed { request_id, message },
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Requested { .. } | Self::Thinking { .. })
    }
}

/// Writer side, owned by the client runtime.
#[derive(Debug)]
pub struct StatusBoard {
    pub connection: watch::Sender<ConnectionState>,
    pub local_synced: watch::Sender<bool>,
    pub server_synced: watch::Sender<bool>,
    pub ai: watch::Sender<AiActivity>,
    pub countdown: watch::Sender<Option<u64>>,
    pub stats: watch::Sender<TextStats>,
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self {
            connection: watch::channel(ConnectionState::Disconnected).0,
            local_synced: watch::channel(false).0,
            server_synced: watch::channel(false).0,
            ai: watch::channel(AiActivity::Idle).0,
            countdown: watch::channel(None).0,
            stats: watch::channel(TextStats::default()).0,
        }
    }
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(&self) -> StatusView {
        StatusView {
            connection: self.connection.subscribe(),
            local_synced: self.local_synced.subscribe(),
            server_synced: self.server_synced.subscribe(),
            ai: self.ai.subscribe(),
            countdown: self.countdown.subscribe(),
            stats: self.stats.subscribe(),
        }
    }

    pub fn set_connection(&self, state: ConnectionState) {
        set_if_changed(&self.connection, state);
    }

    pub fn set_local_synced(&self, synced: bool) {
        set_if_changed(&self.local_synced, synced);
    }

    pub fn set_server_synced(&self, synced: bool) {
        set_if_changed(&self.server_synced, synced);
    }

    pub fn set_ai(&self, activity: AiActivity) {
        set_if_changed(&self.ai, activity);
    }

    pub fn set_countdown(&self, seconds: Option<u64>) {
        set_if_changed(&self.countdown, seconds);
    }

    pub fn set_text(&self, text: &str) {
        set_if_changed(&self.stats, TextStats::of(text));
    }
}

fn set_if_changed<T: PartialEq>(tx: &watch::Sender<T>, value: T) {
    tx.send_if_modified(|current| {
        if *current == value {
            false
        } else {
            *current = value;
            true
        }
    });
}

/// Reader side handed to the UI.
#[derive(Debug, Clone)]
pub struct StatusView {
    pub connection: watch::Receiver<ConnectionState>,
    pub local_synced: watch::Receiver<bool>,
    pub server_synced: watch::Receiver<bool>,
    pub ai: watch::Receiver<AiActivity>,
    pub countdown: watch::Receiver<Option<u64>>,
    pub stats: watch::Receiver<TextStats>,
}

impl StatusView {
    pub fn connection(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn is_local_synced(&self) -> bool {
        *self.local_synced.borrow()
    }

    pub fn is_server_synced(&self) -> bool {
        *self.server_synced.borrow()
    }

    pub fn ai(&self) -> AiActivity {
        self.ai.borrow().clone()
    }

    pub fn countdown(&self) -> Option<u64> {
        *self.countdown.borrow()
    }

    pub fn stats(&self) -> TextStats {
        *self.stats.borrow()
    }
}
