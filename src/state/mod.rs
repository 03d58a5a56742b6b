use crate::api::{ApiClient, NotesApi, SyncError};
use crate::cache::{
    clear_boot_snapshot, load_boot_snapshot, BrowserStorage, CacheEntry, CacheKey, CacheStore,
    CacheValue, NoteQueries, SnapshotStorage,
};
use crate::config::SyncConfig;
use crate::events::{EventBus, Subscription, SyncEvent, WindowEvents};
use crate::models::{Note, Partition};
use crate::positions::compute_drag_order;
use crate::sync::{
    CollabSession, EventSourceConnector, Mutation, MutationExecutor, PushConnector,
    ReconciliationListener, RetryPolicy,
};
use crate::util::{browser_spawner, BrowserTimer, Spawner, Timer};
use leptos::prelude::*;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

/// Everything the engine needs from the outside world.
pub struct EngineDeps {
    pub api: Rc<dyn NotesApi>,
    pub timer: Rc<dyn Timer>,
    pub spawn: Spawner,
    pub storage: Rc<dyn SnapshotStorage>,
    pub push: Option<Rc<dyn PushConnector>>,
    pub config: SyncConfig,
}

struct EngineInner {
    store: CacheStore,
    queries: NoteQueries,
    executor: MutationExecutor,
    listener: ReconciliationListener,
    events: EventBus,
    timer: Rc<dyn Timer>,
    spawn: Spawner,
    storage: Rc<dyn SnapshotStorage>,
    config: SyncConfig,
    user_id: RefCell<Option<String>>,
    expiry_watch: RefCell<Option<Subscription>>,
    window_events: RefCell<Option<WindowEvents>>,
}

/// Client-side sync engine for one signed-in user.
///
/// Wires the cache, mutation executor and reconciliation listener together around
/// one [`EventBus`], and tears everything down when the session expires.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Rc<EngineInner>,
}

impl SyncEngine {
    pub fn new(deps: EngineDeps) -> Self {
        let EngineDeps {
            api,
            timer,
            spawn,
            storage,
            push,
            config,
        } = deps;

        let events = EventBus::new();
        let store = CacheStore::new(timer.clone());
        let queries = NoteQueries::new(
            store.clone(),
            api.clone(),
            timer.clone(),
            config.request_timeout,
            events.clone(),
        );
        let executor = MutationExecutor::new(
            queries.clone(),
            api,
            timer.clone(),
            RetryPolicy::from_config(&config),
            config.request_timeout,
            events.clone(),
        );
        let listener =
            ReconciliationListener::new(queries.clone(), timer.clone(), spawn.clone(), push, &config);

        let inner = Rc::new(EngineInner {
            store,
            queries,
            executor,
            listener,
            events,
            timer,
            spawn,
            storage,
            config,
            user_id: RefCell::new(None),
            expiry_watch: RefCell::new(None),
            window_events: RefCell::new(None),
        });

        let weak: Weak<EngineInner> = Rc::downgrade(&inner);
        let watch = inner.events.subscribe(move |ev| {
            if *ev != SyncEvent::SessionExpired {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                tracing::warn!("session expired; discarding cached notes");
                inner.teardown();
            }
        });
        *inner.expiry_watch.borrow_mut() = Some(watch);

        Self { inner }
    }

    /// Engine wired to the browser: `fetch`, `setTimeout`, `localStorage`,
    /// `EventSource` and window connectivity/visibility events.
    pub fn browser(client: ApiClient, config: SyncConfig) -> Self {
        let push = EventSourceConnector::new(client.push_url(&config.push_path));
        let engine = Self::new(EngineDeps {
            api: Rc::new(client),
            timer: Rc::new(BrowserTimer),
            spawn: browser_spawner(),
            storage: Rc::new(BrowserStorage),
            push: Some(Rc::new(push)),
            config,
        });
        *engine.inner.window_events.borrow_mut() = WindowEvents::attach(&engine.inner.events);
        engine
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn current_user(&self) -> Option<String> {
        self.inner.user_id.borrow().clone()
    }

    /// Start a session: paint the boot snapshot as stale placeholders, then load the
    /// active list from the server and start listening for remote changes.
    pub fn boot(&self, user_id: &str) {
        let inner = &self.inner;
        *inner.user_id.borrow_mut() = Some(user_id.to_string());

        if let Some(snap) = load_boot_snapshot(inner.storage.as_ref(), user_id) {
            tracing::debug!(
                active = snap.active.len(),
                archived = snap.archived.len(),
                "painting boot snapshot"
            );
            let placeholder = |notes: Vec<Note>| {
                Some(CacheEntry {
                    value: CacheValue::Notes(notes),
                    stale: true,
                    updated_ms: snap.saved_ms,
                })
            };
            inner.store.restore_entries(vec![
                (CacheKey::List(Partition::Active), placeholder(snap.active.clone())),
                (CacheKey::List(Partition::Archived), placeholder(snap.archived.clone())),
            ]);
        }
        inner
            .store
            .set_persistence(inner.storage.clone(), user_id.to_string());

        inner.listener.start(&inner.events);
        tracing::info!(user = user_id, "sync engine booted");

        let queries = inner.queries.clone();
        (inner.spawn)(Box::pin(async move {
            if let Err(e) = queries.fetch(&CacheKey::List(Partition::Active)).await {
                tracing::warn!(error = %e, "initial load failed; showing cached notes");
            }
        }));
    }

    /// Fetch a partition from the server now.
    pub async fn refresh(&self, partition: Partition) -> Result<(), SyncError> {
        self.inner
            .queries
            .fetch(&CacheKey::List(partition))
            .await
            .map(|_| ())
    }

    /// Notes of a partition, loading it if nothing is cached yet.
    pub async fn load(&self, partition: Partition) -> Result<Vec<Note>, SyncError> {
        let value = self.inner.queries.ensure(&CacheKey::List(partition)).await?;
        Ok(value
            .and_then(|v| v.as_notes().map(<[Note]>::to_vec))
            .unwrap_or_default())
    }

    pub fn notes(&self, partition: Partition) -> Vec<Note> {
        self.inner.store.read_list(partition).unwrap_or_default()
    }

    pub async fn mutate(&self, mutation: Mutation) -> Result<Option<Note>, SyncError> {
        self.inner.executor.execute(mutation).await
    }

    /// Move `dragged_id` before or after `target_id` within its pinned/unpinned group
    /// of the active list. `Ok(false)` when the drop changes nothing.
    pub async fn drag_reorder(
        &self,
        dragged_id: &str,
        target_id: &str,
        insert_after: bool,
    ) -> Result<bool, SyncError> {
        let active = self.notes(Partition::Active);
        let ids = |pinned: bool| -> Vec<String> {
            active
                .iter()
                .filter(|n| n.pinned == pinned)
                .map(|n| n.id.clone())
                .collect()
        };
        let (mut pinned_ids, mut other_ids) = (ids(true), ids(false));

        let Some(dragged) = active.iter().find(|n| n.id == dragged_id) else {
            return Ok(false);
        };
        let group = if dragged.pinned {
            &mut pinned_ids
        } else {
            &mut other_ids
        };
        let Some(order) = compute_drag_order(group, dragged_id, target_id, insert_after) else {
            return Ok(false);
        };
        *group = order;

        self.mutate(Mutation::Reorder {
            pinned_ids,
            other_ids,
        })
        .await?;
        Ok(true)
    }

    /// Open a detail view for a cached note. A note found only in a list gets its
    /// own detail entry, so resyncs keep the open view current.
    pub fn open_note(&self, note_id: &str) -> Option<CollabSession> {
        let note = self.inner.store.find_note(note_id)?;
        let key = CacheKey::note(note_id);
        if self.inner.store.read(&key).is_none() {
            self.inner.store.write(key, CacheValue::Note(note.clone()));
        }
        let user = self.current_user();
        Some(CollabSession::open(
            self.inner.executor.clone(),
            self.inner.timer.clone(),
            self.inner.spawn.clone(),
            self.inner.config.debounce,
            &note,
            user.as_deref(),
        ))
    }

    /// Which list the user is browsing; resyncs refresh that one.
    pub fn set_view(&self, partition: Partition) {
        self.inner.listener.set_view(partition);
    }

    /// Push channel status, for display only.
    pub fn is_live(&self) -> bool {
        self.inner.listener.is_live()
    }

    pub fn is_backend_online(&self) -> bool {
        self.inner.executor.is_backend_online()
    }

    pub fn sign_out(&self) {
        tracing::info!("signing out");
        self.inner.teardown();
    }

    /// Mirror a partition into a reactive signal for views. The signal stops
    /// updating when the returned subscription is dropped.
    pub fn watch_partition(&self, partition: Partition) -> (RwSignal<Vec<Note>>, Subscription) {
        let signal = RwSignal::new(self.notes(partition));
        let sub = self
            .inner
            .store
            .subscribe(CacheKey::List(partition), move |value| {
                let notes = value
                    .as_ref()
                    .and_then(|v| v.as_notes().map(<[Note]>::to_vec))
                    .unwrap_or_default();
                signal.set(notes);
            });
        (signal, sub)
    }
}

impl EngineInner {
    /// Discard all partitions, stop the listener and remove the boot snapshot.
    fn teardown(&self) {
        self.listener.stop();
        if let Some((storage, user)) = self.store.clear_all() {
            clear_boot_snapshot(storage.as_ref(), &user);
        }
        self.user_id.borrow_mut().take();
    }
}

/// Leptos context wrapper, provided once at the app root. The engine is
/// single-threaded, so it lives in thread-local reactive storage.
#[derive(Clone, Copy)]
pub struct SyncContext(pub StoredValue<SyncEngine, LocalStorage>);

pub fn provide_sync_engine(engine: SyncEngine) {
    provide_context(SyncContext(StoredValue::new_local(engine)));
}

pub fn use_sync_engine() -> Option<SyncEngine> {
    use_context::<SyncContext>().and_then(|c| c.0.try_get_value())
}
