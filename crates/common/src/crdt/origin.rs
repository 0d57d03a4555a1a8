use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Transaction origin written by edits made through the local replica.
pub const LOCAL_ORIGIN_TAG: &str = "cowrite:local";
/// Transaction origin written when a delta from the authority is merged.
pub const REMOTE_ORIGIN_TAG: &str = "cowrite:remote";

/// Where a replica mutation came from.
///
/// Every mutation event carries one of these. Only `Local` mutations are
/// ever forwarded to the authority; forwarding a `Remote` one would bounce
/// the authority's own delta back at it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Local,
    Remote,
}

impl Origin {
    /// Tag string stored as the yrs transaction origin.
    pub fn as_tag(self) -> &'static str {
        match self {
            Self::Local => LOCAL_ORIGIN_TAG,
            Self::Remote => REMOTE_ORIGIN_TAG,
        }
    }

    /// Decode a transaction origin back into an `Origin`.
    ///
    /// Untagged or foreign transactions are rejected rather than guessed.
    pub fn from_tag(bytes: &[u8]) -> Result<Self, OriginTagError> {
        if bytes == LOCAL_ORIGIN_TAG.as_bytes() {
            Ok(Self::Local)
        } else if bytes == REMOTE_ORIGIN_TAG.as_bytes() {
            Ok(Self::Remote)
        } else {
            Err(OriginTagError::Unknown(String::from_utf8_lossy(bytes).into_owned()))
        }
    }

    pub fn is_local(self) -> bool {
        matches!(self, Self::Local)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OriginTagError {
    #[error("transaction carries no origin tag")]
    Missing,
    #[error("unknown transaction origin tag `{0}`")]
    Unknown(String),
}
