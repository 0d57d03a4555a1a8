// Control messages carried in textual frames.
//
// Outbound: AI_COMMAND. Inbound: AI_STATUS, AI_RESULT, SYNC_COMPLETE, COMMENT.
// Inbound parsing never fails: anything that does not match a known shape is
// returned as `ControlMessage::Unrecognized` so callers can log and drop it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// AI operations the authority knows how to run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AiAction {
    Improve,
    Fix,
    Longer,
    Shorter,
    Continue,
    Custom,
    Agent,
    Toggle,
}

impl AiAction {
    pub const ALL: [AiAction; 8] = [
        Self::Improve,
        Self::Fix,
        Self::Longer,
        Self::Shorter,
        Self::Continue,
        Self::Custom,
        Self::Agent,
        Self::Toggle,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Improve => "IMPROVE",
            Self::Fix => "FIX",
            Self::Longer => "LONGER",
            Self::Shorter => "SHORTER",
            Self::Continue => "CONTINUE",
            Self::Custom => "CUSTOM",
            Self::Agent => "AGENT",
            Self::Toggle => "TOGGLE",
        }
    }

    /// Path segment of the request/response refinement endpoint, if this
    /// action has one.
    pub fn refine_endpoint(self) -> Option<&'static str> {
        match self {
            Self::Improve => Some("improve"),
            Self::Fix => Some("fix"),
            Self::Longer => Some("longer"),
            Self::Shorter => Some("shorter"),
            _ => None,
        }
    }
}

impl fmt::Display for AiAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AiAction {
    type Err = UnknownAction;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|action| action.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| UnknownAction(value.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown AI action `{0}`")]
pub struct UnknownAction(pub String);

/// Body of an AI command: text for refinement/toggle actions, a role for agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum AiCommandPayload {
    Text(String),
    Agent(AgentPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentPayload {
    pub role: String,
}

/// Outbound request for the authority to run an AI action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AiCommand {
    pub action: AiAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<AiCommandPayload>,
    /// Correlation id; replies that echo an older id are stale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
}

impl AiCommand {
    pub fn new(action: AiAction) -> Self {
        Self { action, payload: None, request_id: None }
    }

    pub fn with_payload(mut self, payload: AiCommandPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_request_id(mut self, request_id: u64) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Serialize as a textual frame body.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&OutboundControl::AiCommand(self.clone()))
    }
}

/// Every message the client sends in a textual frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundControl {
    AiCommand(AiCommand),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AiStatusKind {
    Thinking,
    #[serde(alias = "complete")]
    Done,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AiStatus {
    pub status: AiStatusKind,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
}

/// Text produced by an AI action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AiResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
}

/// Advisory inline comment. Passed through to the UI untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Comment {
    pub comment_on: String,
    pub comment: String,
    pub color_hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum KnownControl {
    AiStatus(AiStatus),
    AiResult(AiResult),
    SyncComplete,
    Comment(Comment),
}

/// Inbound control message, closed over the known kinds plus a fallback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    AiStatus(AiStatus),
    AiResult(AiResult),
    SyncComplete,
    Comment(Comment),
    /// Anything else. Must be ignored, never treated as fatal.
    Unrecognized { raw: String, reason: String },
}

impl ControlMessage {
    /// Classify a textual frame body.
    pub fn parse(text: &str) -> Self {
        match serde_json::from_str::<KnownControl>(text) {
            Ok(KnownControl::AiStatus(status)) => Self::AiStatus(status),
            Ok(KnownControl::AiResult(result)) => Self::AiResult(result),
            Ok(KnownControl::SyncComplete) => Self::SyncComplete,
            Ok(KnownControl::Comment(comment)) => Self::Comment(comment),
            Err(error) => Self::Unrecognized { raw: text.to_string(), reason: error.to_string() },
        }
    }

    /// Serialize a known message; used by authorities and tests.
    pub fn to_text(&self) -> Option<String> {
        let known = match self {
            Self::AiStatus(status) => KnownControl::AiStatus(status.clone()),
            Self::AiResult(result) => KnownControl::AiResult(result.clone()),
            Self::SyncComplete => KnownControl::SyncComplete,
            Self::Comment(comment) => KnownControl::Comment(comment.clone()),
            Self::Unrecognized { .. } => return None,
        };
        serde_json::to_string(&known).ok()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::AiStatus(_) => "AI_STATUS",
            Self::AiResult(_) => "AI_RESULT",
            Self::SyncComplete => "SYNC_COMPLETE",
            Self::Comment(_) => "COMMENT",
            Self::Unrecognized { .. } => "UNRECOGNIZED",
        }
    }

    /// Correlation id echoed by the authority, if any.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::AiStatus(status) => status.request_id,
            Self::AiResult(result) => result.request_id,
            _ => None,
        }
    }
}
