use super::store::{CacheKey, CacheStore, CacheValue};
use crate::api::{NotesApi, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::models::is_tmp_id;
use crate::sync::with_timeout;
use crate::util::Timer;
use std::rc::Rc;
use std::time::Duration;

/// Owns refetching for every cache key.
///
/// At most one request per key is in flight. Invalidating a key that is already
/// being refetched does not start a second request; the running one fetches again
/// once it finishes, so the newer invalidation is not lost.
#[derive(Clone)]
pub struct NoteQueries {
    store: CacheStore,
    api: Rc<dyn NotesApi>,
    timer: Rc<dyn Timer>,
    timeout: Duration,
    events: EventBus,
}

impl NoteQueries {
    pub fn new(
        store: CacheStore,
        api: Rc<dyn NotesApi>,
        timer: Rc<dyn Timer>,
        timeout: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            api,
            timer,
            timeout,
            events,
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Refetch `key` from the backend. Returns `Ok(false)` when the fetch was skipped
    /// (already in flight, or a tmp id the backend does not know) or its result was
    /// superseded by a local write.
    pub async fn fetch(&self, key: &CacheKey) -> Result<bool, SyncError> {
        if let CacheKey::Note(id) = key {
            if is_tmp_id(id) {
                return Ok(false);
            }
        }

        loop {
            let epoch = self.store.epoch();
            // `None`: another fetch holds the slot and will pick up this request.
            let Some(res) = self.fetch_once(key).await else {
                return Ok(false);
            };
            let again = self.store.epoch() == epoch && self.store.take_refetch_request(key);
            match res {
                Ok(applied) if !again => return Ok(applied),
                Ok(_) => tracing::debug!(%key, "invalidated during refetch; fetching again"),
                Err(e) => return Err(e),
            }
        }
    }

    /// One request for `key`, or `None` when another fetch already holds the slot.
    async fn fetch_once(&self, key: &CacheKey) -> Option<Result<bool, SyncError>> {
        let Some(ticket) = self.store.begin_fetch(key) else {
            tracing::debug!(%key, "refetch already in flight");
            return None;
        };

        let api = self.api.clone();
        let res = with_timeout(self.timer.as_ref(), self.timeout, async {
            match key {
                CacheKey::List(p) => api.list_notes(*p).await.map(CacheValue::Notes),
                CacheKey::Note(id) => api.get_note(id).await.map(CacheValue::Note),
            }
        })
        .await;

        match res {
            Ok(value) => Some(Ok(self.store.finish_fetch(ticket, Some(value)))),
            Err(e) => {
                self.store.finish_fetch(ticket, None);
                if e == SyncError::Auth {
                    self.events.emit(SyncEvent::SessionExpired);
                }
                Some(Err(e))
            }
        }
    }

    /// Current value for `key`, loading it first if the cache has none.
    pub async fn ensure(&self, key: &CacheKey) -> Result<Option<CacheValue>, SyncError> {
        if let Some(v) = self.store.read(key) {
            return Ok(Some(v));
        }
        self.fetch(key).await?;
        Ok(self.store.read(key))
    }

    /// Mark matching entries stale and refetch them concurrently. Failures keep the
    /// stale value visible and are only logged.
    pub async fn invalidate(&self, pred: impl Fn(&CacheKey) -> bool) {
        let keys = self.store.invalidate(pred);
        self.refetch_all(keys).await;
    }

    pub async fn invalidate_keys(&self, keys: &[CacheKey]) {
        self.invalidate(|k| keys.contains(k)).await;
    }

    /// Like `invalidate_keys`, but also loads keys that have no entry yet.
    pub async fn refresh_keys(&self, keys: Vec<CacheKey>) {
        self.store.invalidate(|k| keys.contains(k));
        self.refetch_all(keys).await;
    }

    async fn refetch_all(&self, keys: Vec<CacheKey>) {
        let fetches = keys.iter().map(|key| async move {
            if let Err(e) = self.fetch(key).await {
                tracing::warn!(%key, error = %e, "refetch failed; keeping stale value");
            }
        });
        futures::future::join_all(fetches).await;
    }
}
