// Frames on the client<->authority channel.

/// Close code for an intentional, acknowledged shutdown. Never triggers a reconnect.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported when the peer went away without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Close code reported when a close frame arrived without a status.
pub const NO_STATUS_RECEIVED: u16 = 1005;

/// One message on the wire. The variant is the framing, not a parsed type tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Opaque CRDT delta bytes.
    Binary(Vec<u8>),
    /// JSON control message.
    Text(String),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::Binary(_) => FrameKind::Binary,
            Self::Text(_) => FrameKind::Text,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Binary(bytes) => bytes.len(),
            Self::Text(text) => text.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Binary,
    Text,
}

/// Whether a close code marks a clean shutdown that must not be retried.
pub fn is_clean_close(code: u16) -> bool {
    code == NORMAL_CLOSURE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_normal_closure_is_clean() {
        assert!(is_clean_close(NORMAL_CLOSURE));
        assert!(!is_clean_close(ABNORMAL_CLOSURE));
        assert!(!is_clean_close(NO_STATUS_RECEIVED));
        assert!(!is_clean_close(1001));
    }

    #[test]
    fn frame_kind_follows_variant() {
        assert_eq!(Frame::Binary(vec![0, 0]).kind(), FrameKind::Binary);
        assert_eq!(Frame::Text("{}".into()).kind(), FrameKind::Text);
        assert_eq!(Frame::Text("{}".into()).len(), 2);
    }
}
