// Wire protocol for the single client<->authority channel.
//
// Binary frames carry opaque CRDT deltas; textual frames carry JSON control
// messages. The frame kind is decided structurally before any parsing.

pub mod control;
pub mod frame;
