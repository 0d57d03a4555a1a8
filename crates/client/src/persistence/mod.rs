// Persistence adapter: mirrors every replica change into a durable update
// log and hydrates the replica from it on startup. Storage failures degrade
// to an ephemeral session instead of stopping the client.

pub mod sqlite;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::replica::{ChangeEvent, ChangeStream, ReplicaStore};

pub use sqlite::SqliteStore;

/// Stored updates merged into one full-state row after this many appends.
pub const DEFAULT_COMPACT_AFTER: usize = 500;

/// Durable per-document update log.
pub trait DurableStore: Send {
    fn load_updates(&mut self, doc_id: &str) -> Result<Vec<Vec<u8>>>;
    fn append_update(&mut self, doc_id: &str, delta: &[u8]) -> Result<()>;
    fn update_count(&mut self, doc_id: &str) -> Result<usize>;
    /// Replace every stored update of the document with one full state.
    fn compact(&mut self, doc_id: &str, full_state: &[u8]) -> Result<()>;
}

/// Process-local store. Clones share the same log, which lets tests reopen
/// a document as if it were read back from disk.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    docs: Arc<Mutex<HashMap<String, Vec<Vec<u8>>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DurableStore for MemoryStore {
    fn load_updates(&mut self, doc_id: &str) -> Result<Vec<Vec<u8>>> {
        let docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.get(doc_id).cloned().unwrap_or_default())
    }

    fn append_update(&mut self, doc_id: &str, delta: &[u8]) -> Result<()> {
        let mut docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
        docs.entry(doc_id.to_string()).or_default().push(delta.to_vec());
        Ok(())
    }

    fn update_count(&mut self, doc_id: &str) -> Result<usize> {
        let docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.get(doc_id).map_or(0, Vec::len))
    }

    fn compact(&mut self, doc_id: &str, full_state: &[u8]) -> Result<()> {
        let mut docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
        docs.insert(doc_id.to_string(), vec![full_state.to_vec()]);
        Ok(())
    }
}

/// Observable "local state loaded" flag. Becomes true exactly once.
#[derive(Debug, Clone)]
pub struct LocalSynced {
    rx: watch::Receiver<bool>,
}

impl LocalSynced {
    pub fn is_synced(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once hydration has finished. Returns immediately afterwards.
    pub async fn wait(&mut self) {
        // The sender lives as long as the handle; a dropped handle means no
        // further hydration is coming either way.
        let _ = self.rx.wait_for(|synced| *synced).await;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HydrateReport {
    pub applied: usize,
    pub skipped: usize,
}

pub struct PersistenceHandle {
    doc_id: String,
    store: Option<Box<dyn DurableStore>>,
    stream: Option<ChangeStream>,
    synced_tx: watch::Sender<bool>,
    stored_updates: usize,
    compact_after: usize,
    closed: bool,
}

impl PersistenceHandle {
    /// Open durable storage for `doc_id`. An opener failure is logged and
    /// the handle continues without durability.
    pub fn open<F>(doc_id: impl Into<String>, opener: F) -> Self
    where
        F: FnOnce() -> Result<Box<dyn DurableStore>>,
    {
        let doc_id = doc_id.into();
        match opener() {
            Ok(store) => Self::with_store(doc_id, Some(store)),
            Err(error) => {
                warn!(doc_id = %doc_id, error = %format!("{error:#}"), "local storage unavailable; continuing without durability");
                Self::with_store(doc_id, None)
            }
        }
    }

    /// Open the SQLite store at `path` on the blocking pool. Falls back to
    /// an ephemeral handle like `open`.
    pub async fn open_sqlite(doc_id: impl Into<String>, path: PathBuf) -> Self {
        let doc_id = doc_id.into();
        let opened = tokio::task::spawn_blocking(move || SqliteStore::open(&path)).await;
        Self::open(doc_id, move || {
            let store = opened.context("replica store open task failed")??;
            Ok(Box::new(store) as Box<dyn DurableStore>)
        })
    }

    pub fn ephemeral(doc_id: impl Into<String>) -> Self {
        Self::with_store(doc_id.into(), None)
    }

    fn with_store(doc_id: String, store: Option<Box<dyn DurableStore>>) -> Self {
        let (synced_tx, _) = watch::channel(false);
        Self {
            doc_id,
            store,
            stream: None,
            synced_tx,
            stored_updates: 0,
            compact_after: DEFAULT_COMPACT_AFTER,
            closed: false,
        }
    }

    pub fn with_compact_after(mut self, updates: usize) -> Self {
        self.compact_after = updates.max(1);
        self
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn is_durable(&self) -> bool {
        self.store.is_some()
    }

    pub fn local_synced(&self) -> LocalSynced {
        LocalSynced { rx: self.synced_tx.subscribe() }
    }

    /// Apply every stored update to `replica`, then start mirroring its
    /// changes. Corrupted entries are skipped. `localSynced` fires even when
    /// nothing could be loaded.
    pub fn hydrate(&mut self, replica: &ReplicaStore) -> HydrateReport {
        let mut report = HydrateReport::default();
        if self.closed {
            return report;
        }

        let stored = match self.store.as_mut() {
            Some(store) => match store.load_updates(&self.doc_id) {
                Ok(updates) => updates,
                Err(error) => {
                    warn!(doc_id = %self.doc_id, error = %format!("{error:#}"), "failed to load stored updates; starting empty");
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        for update in &stored {
            match replica.apply_remote_delta(update) {
                Ok(()) => report.applied += 1,
                Err(error) => {
                    report.skipped += 1;
                    warn!(doc_id = %self.doc_id, error = %format!("{error:#}"), "skipping corrupted stored update");
                }
            }
        }
        self.stored_updates = stored.len();

        if self.stream.is_none() {
            self.stream = Some(replica.subscribe());
        }
        self.synced_tx.send_replace(true);
        info!(doc_id = %self.doc_id, applied = report.applied, skipped = report.skipped, durable = self.is_durable(), "local state hydrated");
        report
    }

    /// Next replica change to persist. Pending forever before hydration.
    pub async fn next_change(&mut self) -> Option<ChangeEvent> {
        match self.stream.as_mut() {
            Some(stream) => stream.recv().await,
            None => std::future::pending().await,
        }
    }

    /// Append one change to the log, compacting once the log grows past
    /// the threshold.
    pub fn record(&mut self, event: &ChangeEvent, replica: &ReplicaStore) {
        let Some(store) = self.store.as_mut() else {
            return;
        };
        if let Err(error) = store.append_update(&self.doc_id, &event.delta) {
            warn!(doc_id = %self.doc_id, error = %format!("{error:#}"), "failed to persist update");
            return;
        }
        self.stored_updates += 1;
        if self.stored_updates >= self.compact_after {
            self.compact(replica);
        }
    }

    /// Persist every change already queued on the mirror stream.
    pub fn flush(&mut self, replica: &ReplicaStore) -> usize {
        let pending = self.stream.as_mut().map(ChangeStream::drain).unwrap_or_default();
        for event in &pending {
            self.record(event, replica);
        }
        pending.len()
    }

    pub fn stored_updates(&self) -> usize {
        self.stored_updates
    }

    fn compact(&mut self, replica: &ReplicaStore) {
        let Some(store) = self.store.as_mut() else {
            return;
        };
        let state = replica.encode_full_state();
        match store.compact(&self.doc_id, &state) {
            Ok(()) => {
                debug!(doc_id = %self.doc_id, merged = self.stored_updates, "compacted stored updates");
                self.stored_updates = 1;
            }
            Err(error) => {
                warn!(doc_id = %self.doc_id, error = %format!("{error:#}"), "failed to compact stored updates");
            }
        }
    }

    /// Flush, compact and release the store. Safe to call more than once.
    pub fn close(&mut self, replica: Option<&ReplicaStore>) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(replica) = replica {
            self.flush(replica);
            if self.stored_updates > 1 {
                self.compact(replica);
            }
        }
        self.stream = None;
        self.store = None;
        debug!(doc_id = %self.doc_id, "persistence closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
