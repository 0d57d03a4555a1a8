// Replica store: the only owner of the shared document's CRDT state.
//
// Every mutation runs in a yrs transaction tagged with its `Origin`; a single
// update observer turns committed transactions into `ChangeEvent`s carrying
// that origin explicitly. Subscribers receive events after the delta is
// already part of the document.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Context, Result};
use cowrite_common::crdt::origin::{Origin, OriginTagError};
use tokio::sync::mpsc;
use tracing::warn;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, GetString, ReadTxn, StateVector, Subscription, Text, TextRef, Transact, TransactionMut,
    Update,
};

/// Name of the shared text type holding the document body.
pub const CONTENT_TEXT: &str = "content";

/// One committed replica mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub delta: Vec<u8>,
    pub origin: Origin,
}

/// Receiving end of a replica subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct ChangeStream {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl ChangeStream {
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }

    /// Take every event that is already queued.
    pub fn drain(&mut self) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}

#[derive(Default)]
struct Shared {
    subscribers: Vec<mpsc::UnboundedSender<ChangeEvent>>,
    /// Set by any local commit, cleared by `mark_sent`. Deletions do not
    /// advance the local clock, so the clock alone cannot tell.
    local_pending: bool,
    /// This replica's own clock when local state last reached the authority.
    sent_clock: u32,
}

impl Shared {
    fn publish(&mut self, event: ChangeEvent) {
        if event.origin.is_local() {
            self.local_pending = true;
        }
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

pub struct ReplicaStore {
    _updates: Subscription,
    doc_id: String,
    doc: Doc,
    text: TextRef,
    shared: Arc<Mutex<Shared>>,
}

impl ReplicaStore {
    pub fn new(doc_id: impl Into<String>) -> Result<Self> {
        Self::from_doc(doc_id.into(), Doc::new())
    }

    /// Replica with a fixed yrs client id (for deterministic tests).
    pub fn with_client_id(doc_id: impl Into<String>, client_id: u64) -> Result<Self> {
        let options = yrs::Options { client_id, ..Default::default() };
        Self::from_doc(doc_id.into(), Doc::with_options(options))
    }

    fn from_doc(doc_id: String, doc: Doc) -> Result<Self> {
        let text = doc.get_or_insert_text(CONTENT_TEXT);
        let shared = Arc::new(Mutex::new(Shared::default()));

        let observer_shared = Arc::clone(&shared);
        let observer_doc_id = doc_id.clone();
        let updates = doc
            .observe_update_v1(move |txn, event| {
                let origin = match txn.origin() {
                    Some(tag) => Origin::from_tag(tag.as_ref()),
                    None => Err(OriginTagError::Missing),
                };
                match origin {
                    Ok(origin) => {
                        lock(&observer_shared)
                            .publish(ChangeEvent { delta: event.update.to_vec(), origin });
                    }
                    Err(error) => {
                        warn!(doc_id = %observer_doc_id, %error, "dropping untagged replica update");
                    }
                }
            })
            .map_err(|error| anyhow!("failed to observe replica updates: {error:?}"))?;

        Ok(Self { _updates: updates, doc_id, doc, text, shared })
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Merge a delta received from the authority. Applying the same delta
    /// again is a no-op.
    pub fn apply_remote_delta(&self, delta: &[u8]) -> Result<()> {
        self.apply_tagged(delta, Origin::Remote)
    }

    fn apply_tagged(&self, delta: &[u8], origin: Origin) -> Result<()> {
        let update = Update::decode_v1(delta).context("failed to decode replica delta")?;
        let mut txn = self.doc.transact_mut_with(origin.as_tag());
        txn.apply_update(update).context("failed to apply replica delta")?;
        Ok(())
    }

    /// Run a local edit against the content text in one transaction.
    pub fn edit<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&TextRef, &mut TransactionMut<'_>) -> R,
    {
        let mut txn = self.doc.transact_mut_with(Origin::Local.as_tag());
        f(&self.text, &mut txn)
    }

    /// Insert at a UTF-8 byte offset. The offset is clamped to the text and
    /// moved back to the start of the character it falls inside.
    pub fn insert(&self, index: u32, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.edit(|text, txn| {
            let current = text.get_string(&*txn);
            let index = floor_char_boundary(&current, index);
            text.insert(txn, index, chunk);
        });
    }

    pub fn push(&self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        self.edit(|text, txn| text.push(txn, chunk));
    }

    /// Remove the UTF-8 byte range `index..index + len`, clamped to the text.
    /// A range edge inside a multi-byte character widens to cover all of it.
    pub fn remove_range(&self, index: u32, len: u32) {
        self.edit(|text, txn| {
            let current = text.get_string(&*txn);
            let start = floor_char_boundary(&current, index);
            let end = ceil_char_boundary(&current, index.saturating_add(len));
            if end > start {
                text.remove_range(txn, start, end - start);
            }
        });
    }

    /// Swap the whole body for `content` in a single local transaction.
    pub fn replace_all(&self, content: &str) {
        self.edit(|text, txn| {
            let total = text.len(txn);
            if total > 0 {
                text.remove_range(txn, 0, total);
            }
            if !content.is_empty() {
                text.insert(txn, 0, content);
            }
        });
    }

    pub fn text(&self) -> String {
        self.text.get_string(&self.doc.transact())
    }

    pub fn encode_full_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything this replica authored since the last `mark_sent`, as one
    /// update. `None` when nothing local is outstanding. Changes merged from
    /// other clients are left out.
    pub fn encode_since_last_send(&self) -> Option<Vec<u8>> {
        let sent_clock = {
            let shared = lock(&self.shared);
            if !shared.local_pending {
                return None;
            }
            shared.sent_clock
        };
        let txn = self.doc.transact();
        let mut since = txn.state_vector();
        since.set_min(self.doc.client_id(), sent_clock);
        Some(txn.encode_state_as_update_v1(&since))
    }

    /// Record that everything local up to now has reached the authority.
    pub fn mark_sent(&self) {
        let clock = self.doc.transact().state_vector().get(&self.doc.client_id());
        let mut shared = lock(&self.shared);
        shared.local_pending = false;
        shared.sent_clock = clock;
    }

    pub fn has_unsent(&self) -> bool {
        lock(&self.shared).local_pending
    }

    pub fn subscribe(&self) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.shared).subscribers.push(tx);
        ChangeStream { rx }
    }

    pub fn subscriber_count(&self) -> usize {
        let mut shared = lock(&self.shared);
        shared.subscribers.retain(|tx| !tx.is_closed());
        shared.subscribers.len()
    }
}

fn floor_char_boundary(text: &str, index: u32) -> u32 {
    let mut index = (index as usize).min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index as u32
}

fn ceil_char_boundary(text: &str, index: u32) -> u32 {
    let mut index = (index as usize).min(text.len());
    while !text.is_char_boundary(index) {
        index += 1;
    }
    index as u32
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer_delta(client_id: u64, content: &str) -> Vec<u8> {
        let doc = Doc::with_options(yrs::Options { client_id, ..Default::default() });
        let text = doc.get_or_insert_text(CONTENT_TEXT);
        text.push(&mut doc.transact_mut(), content);
        let delta = doc.transact().encode_state_as_update_v1(&StateVector::default());
        delta
    }

    #[test]
    fn text_operations_edit_content() {
        let replica = ReplicaStore::with_client_id("doc", 1).expect("replica");
        replica.push("hello");
        replica.insert(5, " world");
        replica.insert(0, ">> ");
        assert_eq!(replica.text(), ">> hello world");

        replica.remove_range(0, 3);
        assert_eq!(replica.text(), "hello world");
    }

    #[test]
    fn out_of_range_edits_are_clamped() {
        let replica = ReplicaStore::with_client_id("doc", 1).expect("replica");
        replica.push("abc");
        replica.insert(99, "!");
        assert_eq!(replica.text(), "abc!");

        replica.remove_range(2, 99);
        assert_eq!(replica.text(), "ab");

        replica.remove_range(50, 1);
        assert_eq!(replica.text(), "ab");
    }

    #[test]
    fn replace_all_is_one_local_change() {
        let replica = ReplicaStore::with_client_id("doc", 1).expect("replica");
        replica.push("draft text");
        let mut stream = replica.subscribe();

        replica.replace_all("final text");
        assert_eq!(replica.text(), "final text");
        assert_eq!(stream.drain().len(), 1);

        replica.replace_all("");
        assert_eq!(replica.text(), "");
    }

    #[test]
    fn full_state_restores_into_fresh_replica() {
        let source = ReplicaStore::with_client_id("doc", 1).expect("replica");
        source.push("persistent data");

        let restored = ReplicaStore::with_client_id("doc", 2).expect("replica");
        restored.apply_remote_delta(&source.encode_full_state()).expect("state should apply");
        assert_eq!(restored.text(), "persistent data");
    }

    #[test]
    fn local_edits_emit_local_events() {
        let replica = ReplicaStore::with_client_id("doc", 1).expect("replica");
        let mut stream = replica.subscribe();

        replica.push("typed");

        let events = stream.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].origin, Origin::Local);
        assert!(!events[0].delta.is_empty());
    }

    #[test]
    fn remote_deltas_emit_remote_events_after_apply() {
        let replica = ReplicaStore::with_client_id("doc", 1).expect("replica");
        let mut stream = replica.subscribe();

        replica.apply_remote_delta(&peer_delta(9, "from afar")).expect("delta should apply");

        let event = stream.try_recv().expect("remote apply should emit an event");
        assert_eq!(event.origin, Origin::Remote);
        assert_eq!(replica.text(), "from afar");
        assert!(!replica.has_unsent());
    }

    #[test]
    fn applying_the_same_delta_twice_is_idempotent() {
        let delta = peer_delta(9, "twice");
        let once = ReplicaStore::with_client_id("doc", 1).expect("replica");
        once.apply_remote_delta(&delta).expect("apply");

        let twice = ReplicaStore::with_client_id("doc", 1).expect("replica");
        twice.apply_remote_delta(&delta).expect("apply");
        twice.apply_remote_delta(&delta).expect("re-apply");

        assert_eq!(once.encode_full_state(), twice.encode_full_state());
        assert_eq!(twice.text(), "twice");
    }

    #[test]
    fn unsent_local_deltas_merge_until_marked_sent() {
        let replica = ReplicaStore::with_client_id("doc", 1).expect("replica");
        assert!(replica.encode_since_last_send().is_none());

        replica.push("one ");
        replica.push("two");
        let pending = replica.encode_since_last_send().expect("pending delta");

        let peer = ReplicaStore::with_client_id("doc", 2).expect("replica");
        peer.apply_remote_delta(&pending).expect("merged delta should apply");
        assert_eq!(peer.text(), "one two");

        replica.mark_sent();
        assert!(replica.encode_since_last_send().is_none());
    }

    #[test]
    fn pending_delta_starts_after_last_send() {
        let replica = ReplicaStore::with_client_id("doc", 1).expect("replica");
        let peer = ReplicaStore::with_client_id("doc", 2).expect("replica");

        replica.push("sent ");
        peer.apply_remote_delta(&replica.encode_since_last_send().expect("pending")).expect("apply");
        replica.mark_sent();

        replica.push("later");
        let pending = replica.encode_since_last_send().expect("pending");
        assert!(pending.len() < replica.encode_full_state().len());
        peer.apply_remote_delta(&pending).expect("apply");
        assert_eq!(peer.text(), "sent later");
    }

    #[test]
    fn local_deletion_of_remote_text_is_pending() {
        let replica = ReplicaStore::with_client_id("doc", 1).expect("replica");
        let seed = peer_delta(9, "remote words");
        replica.apply_remote_delta(&seed).expect("apply");
        assert!(!replica.has_unsent());

        replica.remove_range(0, 7);
        let pending = replica.encode_since_last_send().expect("deletion is pending");

        let peer = ReplicaStore::with_client_id("doc", 2).expect("replica");
        peer.apply_remote_delta(&seed).expect("apply");
        peer.apply_remote_delta(&pending).expect("apply");
        assert_eq!(peer.text(), "words");
    }

    #[test]
    fn edits_snap_to_character_boundaries() {
        let replica = ReplicaStore::with_client_id("doc", 1).expect("replica");
        replica.push("héllo");

        // Byte 2 is inside the two-byte 'é'.
        replica.insert(2, "X");
        assert_eq!(replica.text(), "hXéllo");

        replica.remove_range(3, 1);
        assert_eq!(replica.text(), "hXllo");

        replica.push(" 😀!");
        replica.remove_range(7, 2);
        assert_eq!(replica.text(), "hXllo !");
    }

    #[test]
    fn invalid_delta_is_an_error() {
        let replica = ReplicaStore::new("doc").expect("replica");
        assert!(replica.apply_remote_delta(b"not a valid update").is_err());
    }

    #[test]
    fn dropping_stream_unsubscribes() {
        let replica = ReplicaStore::new("doc").expect("replica");
        let first = replica.subscribe();
        let _second = replica.subscribe();
        assert_eq!(replica.subscriber_count(), 2);

        drop(first);
        assert_eq!(replica.subscriber_count(), 1);
        replica.push("still delivered");
    }
}
