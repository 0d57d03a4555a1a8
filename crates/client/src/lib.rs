// cowrite-client library: the sync and coordination layer of the editor.

pub mod autotrigger;
pub mod config;
pub mod correlation;
pub mod demux;
pub mod persistence;
pub mod publisher;
pub mod replica;
pub mod runtime;
pub mod session;
pub mod status;
pub mod upstream;
