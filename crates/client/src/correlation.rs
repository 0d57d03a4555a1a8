// Request correlation guard: last-writer-wins bookkeeping for AI requests.
//
// Issuing an id supersedes whatever was current before. Cancelling only
// forgets the current id locally; nothing in flight is aborted, its reply
// is just recognised as stale when it lands.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationRecord {
    pub id: u64,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct GuardState {
    issued: u64,
    current: Option<CorrelationRecord>,
}

/// Cheap to clone; clones share the same bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct RequestGuard {
    state: Arc<Mutex<GuardState>>,
}

impl RequestGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue an id strictly greater than every id issued before and make it
    /// the current one.
    pub fn next_id(&self) -> u64 {
        let mut state = self.lock();
        state.issued += 1;
        let id = state.issued;
        state.current = Some(CorrelationRecord { id, issued_at: Utc::now() });
        debug!(request_id = id, "issued request id");
        id
    }

    pub fn is_latest(&self, id: u64) -> bool {
        self.lock().current.is_some_and(|record| record.id == id)
    }

    /// Forget the current id. In-flight work is left alone.
    pub fn cancel(&self) {
        if let Some(record) = self.lock().current.take() {
            debug!(request_id = record.id, "request cancelled locally");
        }
    }

    pub fn current(&self) -> Option<CorrelationRecord> {
        self.lock().current
    }

    /// Highest id issued so far (0 before the first).
    pub fn last_issued(&self) -> u64 {
        self.lock().issued
    }

    /// Whether an inbound effect tagged with `request_id` should be applied.
    /// Untagged effects belong to whatever request is current.
    pub fn accepts(&self, request_id: Option<u64>) -> bool {
        match request_id {
            Some(id) => self.is_latest(id),
            None => self.current().is_some(),
        }
    }

    /// Run `action` under a freshly issued id.
    ///
    /// Returns `Ok(Some(_))` when the action finished while still current and
    /// `Ok(None)` once it was superseded or cancelled, whether it succeeded
    /// or failed. Errors only propagate from an action that is still current.
    pub async fn run<F, Fut, T, E>(&self, action: F) -> Result<Option<T>, E>
    where
        F: FnOnce(StaleCheck) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let id = self.next_id();
        let outcome = action(StaleCheck { guard: self.clone(), id }).await;
        let latest = self.is_latest(id);

        match outcome {
            Ok(value) if latest => Ok(Some(value)),
            Ok(_) => {
                debug!(request_id = id, "discarding result of superseded request");
                Ok(None)
            }
            Err(error) if latest => Err(error),
            Err(_) => {
                debug!(request_id = id, "swallowing failure of superseded request");
                Ok(None)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handed to actions run under the guard.
#[derive(Debug, Clone)]
pub struct StaleCheck {
    guard: RequestGuard,
    id: u64,
}

impl StaleCheck {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_stale(&self) -> bool {
        !self.guard.is_latest(self.id)
    }
}
