use super::mutation::Mutation;
use super::retry::{run_with_retry, RetryPolicy};
use crate::api::{NotesApi, SyncError};
use crate::cache::{CacheEntry, CacheKey, CacheStore, CacheValue, NoteQueries};
use crate::events::{EventBus, SyncEvent};
use crate::models::{make_tmp_id, Note, Partition};
use crate::positions::sort_notes;
use crate::util::{random_u64, Timer};
use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

/// Pre-mutation copies of every cache entry a mutation optimistically rewrites.
/// Discarded on commit, restored verbatim on failure. Tied to the cache epoch it was
/// captured in: once the cache is cleared, the mutation no longer writes.
#[derive(Debug)]
pub struct MutationContext {
    saved: Vec<(CacheKey, Option<CacheEntry>)>,
    epoch: u64,
}

impl MutationContext {
    pub fn capture(store: &CacheStore, keys: &[CacheKey]) -> Self {
        Self {
            saved: keys.iter().map(|k| (k.clone(), store.entry(k))).collect(),
            epoch: store.epoch(),
        }
    }

    /// Whether the cache still belongs to the session this was captured in.
    pub fn is_current(&self, store: &CacheStore) -> bool {
        store.epoch() == self.epoch
    }

    pub fn rollback(self, store: &CacheStore) {
        if !self.is_current(store) {
            tracing::debug!("cache cleared since capture; nothing to roll back");
            return;
        }
        store.restore_entries(self.saved);
    }
}

/// Runs mutations: validate, apply optimistically, send with retry, then commit
/// (refetch canonical values) or roll back.
#[derive(Clone)]
pub struct MutationExecutor {
    queries: NoteQueries,
    api: Rc<dyn NotesApi>,
    timer: Rc<dyn Timer>,
    policy: RetryPolicy,
    timeout: Duration,
    events: EventBus,
    backend_online: Rc<Cell<bool>>,
    tmp_rand: Rc<dyn Fn() -> u64>,
}

impl MutationExecutor {
    pub fn new(
        queries: NoteQueries,
        api: Rc<dyn NotesApi>,
        timer: Rc<dyn Timer>,
        policy: RetryPolicy,
        timeout: Duration,
        events: EventBus,
    ) -> Self {
        Self {
            queries,
            api,
            timer,
            policy,
            timeout,
            events,
            backend_online: Rc::new(Cell::new(true)),
            tmp_rand: Rc::new(random_u64),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_tmp_rand(mut self, f: impl Fn() -> u64 + 'static) -> Self {
        self.tmp_rand = Rc::new(f);
        self
    }

    pub fn store(&self) -> &CacheStore {
        self.queries.store()
    }

    pub fn queries(&self) -> &NoteQueries {
        &self.queries
    }

    /// Last observed backend reachability. Diagnostic only; never gates mutations.
    pub fn is_backend_online(&self) -> bool {
        self.backend_online.get()
    }

    /// Execute one mutation. Returns the canonical note for create/update/patch.
    pub async fn execute(&self, mutation: Mutation) -> Result<Option<Note>, SyncError> {
        let kind = mutation.kind();
        let target = mutation.target_id().unwrap_or_default().to_string();

        if let Err(e) = mutation.validate() {
            tracing::debug!(kind, id = %target, error = %e, "mutation rejected before dispatch");
            return Err(e);
        }

        let now = self.timer.now_ms();
        let mutation = mutation.with_pin_position(self.store(), now);
        let tmp_id = make_tmp_id(now, (self.tmp_rand)());
        let plan = mutation.plan(self.store(), now, &tmp_id);
        let keys = plan.keys();

        // Snapshot and optimistic apply happen in one synchronous step.
        let ctx = MutationContext::capture(self.store(), &keys);
        self.store().write_batch(plan.writes);
        tracing::debug!(kind, id = %target, touched = keys.len(), "mutation applied optimistically");

        let res = run_with_retry(self.policy, self.timer.as_ref(), self.timeout, kind, || {
            dispatch(self.api.as_ref(), &mutation)
        })
        .await;

        match res {
            Ok(canonical) => {
                self.backend_online.set(true);
                if !ctx.is_current(self.store()) {
                    tracing::info!(kind, id = %target, "mutation committed after sign-out");
                    return Ok(canonical);
                }
                drop(ctx);
                if let (Some(tmp), Some(note)) = (plan.tmp_id.as_deref(), canonical.as_ref()) {
                    self.swap_tmp_note(tmp, note);
                }
                tracing::info!(kind, id = %target, "mutation committed");
                self.queries.invalidate_keys(&keys).await;
                Ok(canonical)
            }
            Err(e) => {
                if e.is_network() {
                    self.backend_online.set(false);
                }
                ctx.rollback(self.store());
                tracing::warn!(kind, id = %target, error = %e, "mutation failed; rolled back");
                if e == SyncError::Auth {
                    self.events.emit(SyncEvent::SessionExpired);
                }
                Err(e)
            }
        }
    }

    /// Replace the optimistic tmp note with the backend's copy in place, in every
    /// loaded list, without leaving a duplicate behind.
    fn swap_tmp_note(&self, tmp_id: &str, canonical: &Note) {
        let mut writes = Vec::new();
        for p in Partition::ALL {
            let Some(mut notes) = self.store().read_list(p) else {
                continue;
            };
            let Some(idx) = notes.iter().position(|n| n.id == tmp_id) else {
                continue;
            };
            if notes.iter().any(|n| n.id == canonical.id) {
                notes.remove(idx);
            } else {
                notes[idx] = canonical.clone();
            }
            sort_notes(notes.as_mut_slice());
            writes.push((CacheKey::List(p), Some(CacheValue::Notes(notes))));
        }
        writes.push((
            CacheKey::note(canonical.id.clone()),
            Some(CacheValue::Note(canonical.clone())),
        ));
        self.store().write_batch(writes);
    }
}

async fn dispatch(api: &dyn NotesApi, mutation: &Mutation) -> Result<Option<Note>, SyncError> {
    match mutation {
        Mutation::Create { draft } => api.create_note(draft).await.map(Some),
        Mutation::Update { note } => api.update_note(note).await.map(Some),
        Mutation::Patch { id, patch } => api.patch_note(id, patch).await.map(Some),
        Mutation::Delete { id } => api.delete_note(id).await.map(|_| None),
        Mutation::Restore { id } => api.restore_note(id).await.map(|_| None),
        Mutation::DeletePermanent { id } => api.delete_note_permanent(id).await.map(|_| None),
        Mutation::EmptyTrash => api.empty_trash().await.map(|_| None),
        Mutation::Archive { id, archived } => api.archive_note(id, *archived).await.map(|_| None),
        Mutation::Reorder { .. } => {
            let Some(req) = mutation.reorder_request() else {
                return Ok(None);
            };
            api.reorder_notes(&req).await.map(|_| None)
        }
    }
}
