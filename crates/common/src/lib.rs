// cowrite-common: wire-level types shared by the sync client and any authority.

pub mod crdt;
pub mod protocol;
