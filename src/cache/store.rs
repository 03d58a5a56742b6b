use super::snapshot::{save_boot_snapshot, SnapshotStorage};
use crate::events::{Listeners, Subscription};
use crate::models::{Note, Partition};
use crate::util::Timer;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CacheKey {
    List(Partition),
    Note(String),
}

impl CacheKey {
    pub fn note(id: impl Into<String>) -> Self {
        CacheKey::Note(id.into())
    }

    pub fn is_list(&self) -> bool {
        matches!(self, CacheKey::List(_))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheKey::List(p) => write!(f, "notes:{p}"),
            CacheKey::Note(id) => write!(f, "note:{id}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CacheValue {
    Notes(Vec<Note>),
    Note(Note),
}

impl CacheValue {
    pub fn as_notes(&self) -> Option<&[Note]> {
        match self {
            CacheValue::Notes(n) => Some(n),
            CacheValue::Note(_) => None,
        }
    }

    pub fn as_note(&self) -> Option<&Note> {
        match self {
            CacheValue::Note(n) => Some(n),
            CacheValue::Notes(_) => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub value: CacheValue,
    /// Marked by `invalidate`; the value stays readable until the refetch lands.
    pub stale: bool,
    pub updated_ms: i64,
}

/// Proof that a refetch was started; carries the write version and session epoch
/// it was started at.
#[derive(Debug)]
pub struct FetchTicket {
    pub key: CacheKey,
    version: u64,
    epoch: u64,
}

type EntryCallback = Listeners<Option<CacheValue>>;

struct StoreInner {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Bumped on every local write; a refetch started at an older version is discarded.
    versions: HashMap<CacheKey, u64>,
    in_flight: HashSet<CacheKey>,
    /// Keys asked for again while their refetch was running.
    refetch_requested: HashSet<CacheKey>,
    /// Bumped by `clear_all`; work started under an older epoch must not touch the cache.
    epoch: u64,
    subscribers: HashMap<CacheKey, EntryCallback>,
    persist: Option<(Rc<dyn SnapshotStorage>, String)>,
}

/// In-memory note cache shared by every sync component.
///
/// All access goes through `read` / `write` / `invalidate` / `subscribe`. Writes are
/// synchronous and notify subscribers only after the whole batch is applied, so no
/// observer ever sees a partially applied mutation.
#[derive(Clone)]
pub struct CacheStore {
    inner: Rc<RefCell<StoreInner>>,
    timer: Rc<dyn Timer>,
}

impl CacheStore {
    pub fn new(timer: Rc<dyn Timer>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(StoreInner {
                entries: HashMap::new(),
                versions: HashMap::new(),
                in_flight: HashSet::new(),
                refetch_requested: HashSet::new(),
                epoch: 0,
                subscribers: HashMap::new(),
                persist: None,
            })),
            timer,
        }
    }

    pub fn read(&self, key: &CacheKey) -> Option<CacheValue> {
        self.inner.borrow().entries.get(key).map(|e| e.value.clone())
    }

    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner.borrow().entries.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.inner.borrow().entries.keys().cloned().collect()
    }

    /// Notes of a list partition, or `None` when the list was never loaded.
    pub fn read_list(&self, partition: Partition) -> Option<Vec<Note>> {
        match self.read(&CacheKey::List(partition))? {
            CacheValue::Notes(notes) => Some(notes),
            CacheValue::Note(_) => None,
        }
    }

    pub fn read_note(&self, id: &str) -> Option<Note> {
        match self.read(&CacheKey::note(id))? {
            CacheValue::Note(note) => Some(note),
            CacheValue::Notes(_) => None,
        }
    }

    /// Find a note by id in the detail entry or any loaded list.
    pub fn find_note(&self, id: &str) -> Option<Note> {
        if let Some(n) = self.read_note(id) {
            return Some(n);
        }
        Partition::ALL.iter().find_map(|p| {
            self.read_list(*p)
                .and_then(|notes| notes.into_iter().find(|n| n.id == id))
        })
    }

    pub fn write(&self, key: CacheKey, value: CacheValue) {
        self.write_batch(vec![(key, Some(value))]);
    }

    /// Apply several writes as one step. `None` removes the entry.
    pub fn write_batch(&self, writes: Vec<(CacheKey, Option<CacheValue>)>) {
        let now = self.timer.now_ms();
        let entries = writes
            .into_iter()
            .map(|(key, value)| {
                let entry = value.map(|value| CacheEntry {
                    value,
                    stale: false,
                    updated_ms: now,
                });
                (key, entry)
            })
            .collect();
        self.put_entries(entries);
    }

    /// Write entries verbatim (freshness and timestamps included). Used for rollback.
    pub fn restore_entries(&self, entries: Vec<(CacheKey, Option<CacheEntry>)>) {
        self.put_entries(entries);
    }

    fn put_entries(&self, entries: Vec<(CacheKey, Option<CacheEntry>)>) {
        if entries.is_empty() {
            return;
        }

        let mut notify = Vec::with_capacity(entries.len());
        let persist_lists;
        {
            let mut inner = self.inner.borrow_mut();
            let mut touched_lists = false;
            for (key, entry) in entries {
                *inner.versions.entry(key.clone()).or_insert(0) += 1;
                if matches!(
                    key,
                    CacheKey::List(Partition::Active) | CacheKey::List(Partition::Archived)
                ) {
                    touched_lists = true;
                }
                let value = entry.as_ref().map(|e| e.value.clone());
                match entry {
                    Some(e) => {
                        inner.entries.insert(key.clone(), e);
                    }
                    None => {
                        inner.entries.remove(&key);
                    }
                }
                if let Some(subs) = inner.subscribers.get(&key) {
                    notify.push((subs.callbacks(), value));
                }
            }
            persist_lists = touched_lists;
        }

        if persist_lists {
            self.persist_snapshot();
        }

        for (callbacks, value) in notify {
            for cb in callbacks {
                cb(&value);
            }
        }
    }

    /// Mark matching entries stale and return their keys. The caller owns the refetch.
    pub fn invalidate(&self, pred: impl Fn(&CacheKey) -> bool) -> Vec<CacheKey> {
        let mut inner = self.inner.borrow_mut();
        let mut keys = Vec::new();
        for (key, entry) in inner.entries.iter_mut() {
            if pred(key) {
                entry.stale = true;
                keys.push(key.clone());
            }
        }
        keys
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.inner.borrow().in_flight.contains(key)
    }

    /// Current session epoch. Changes only when the cache is cleared.
    pub fn epoch(&self) -> u64 {
        self.inner.borrow().epoch
    }

    /// Claim the refetch slot for `key`. `None` when a refetch is already running;
    /// the running one is then asked to fetch once more after it finishes.
    pub fn begin_fetch(&self, key: &CacheKey) -> Option<FetchTicket> {
        let mut inner = self.inner.borrow_mut();
        if !inner.in_flight.insert(key.clone()) {
            inner.refetch_requested.insert(key.clone());
            return None;
        }
        let version = inner.versions.get(key).copied().unwrap_or(0);
        Some(FetchTicket {
            key: key.clone(),
            version,
            epoch: inner.epoch,
        })
    }

    /// Whether `key` was asked for again while its refetch ran. Clears the request.
    pub fn take_refetch_request(&self, key: &CacheKey) -> bool {
        self.inner.borrow_mut().refetch_requested.remove(key)
    }

    /// Release the refetch slot and store the result if no local write happened
    /// since the fetch began. Returns whether the value was applied.
    pub fn finish_fetch(&self, ticket: FetchTicket, value: Option<CacheValue>) -> bool {
        let current = {
            let mut inner = self.inner.borrow_mut();
            if inner.epoch != ticket.epoch {
                tracing::debug!(key = %ticket.key, "discarding refetch from a cleared session");
                return false;
            }
            inner.in_flight.remove(&ticket.key);
            inner.versions.get(&ticket.key).copied().unwrap_or(0)
        };

        let Some(value) = value else {
            return false;
        };
        if current != ticket.version {
            tracing::debug!(key = %ticket.key, "discarding refetch older than a local write");
            return false;
        }
        self.write(ticket.key, value);
        true
    }

    pub fn subscribe(
        &self,
        key: CacheKey,
        cb: impl Fn(&Option<CacheValue>) + 'static,
    ) -> Subscription {
        let id = self
            .inner
            .borrow_mut()
            .subscribers
            .entry(key.clone())
            .or_default()
            .add(Rc::new(cb));

        let weak: Weak<RefCell<StoreInner>> = Rc::downgrade(&self.inner);
        Subscription::new(move || {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut inner = inner.borrow_mut();
            if let Some(subs) = inner.subscribers.get_mut(&key) {
                subs.remove(id);
                if subs.len() == 0 {
                    inner.subscribers.remove(&key);
                }
            }
        })
    }

    /// Keys some view is currently watching, loaded or not.
    pub fn observed_keys(&self) -> Vec<CacheKey> {
        self.inner
            .borrow()
            .subscribers
            .iter()
            .filter(|(_, s)| s.len() > 0)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Persist the active/archived lists under `user_id` after every write to them.
    pub fn set_persistence(&self, storage: Rc<dyn SnapshotStorage>, user_id: String) {
        self.inner.borrow_mut().persist = Some((storage, user_id));
    }

    fn persist_snapshot(&self) {
        let (storage, user_id, active, archived) = {
            let inner = self.inner.borrow();
            let Some((storage, user_id)) = inner.persist.clone() else {
                return;
            };
            let list = |p: Partition| {
                inner
                    .entries
                    .get(&CacheKey::List(p))
                    .and_then(|e| e.value.as_notes().map(<[Note]>::to_vec))
                    .unwrap_or_default()
            };
            (storage, user_id, list(Partition::Active), list(Partition::Archived))
        };

        if let Err(e) = save_boot_snapshot(
            storage.as_ref(),
            &user_id,
            active,
            archived,
            self.timer.now_ms(),
        ) {
            tracing::warn!(error = %e, "failed to persist boot snapshot");
        }
    }

    /// Drop every entry and in-flight claim, notify watchers with `None`, and stop
    /// persisting. Starts a new epoch, so fetches and mutations begun before the
    /// clear can no longer write. Returns the storage binding that was active, if any.
    pub fn clear_all(&self) -> Option<(Rc<dyn SnapshotStorage>, String)> {
        let (notify, persist) = {
            let mut inner = self.inner.borrow_mut();
            let keys: Vec<CacheKey> = inner.entries.keys().cloned().collect();
            for key in keys.iter() {
                *inner.versions.entry(key.clone()).or_insert(0) += 1;
            }
            inner.entries.clear();
            inner.in_flight.clear();
            inner.refetch_requested.clear();
            inner.epoch += 1;
            let notify: Vec<_> = keys
                .iter()
                .filter_map(|k| inner.subscribers.get(k).map(|s| s.callbacks()))
                .collect();
            (notify, inner.persist.take())
        };

        for callbacks in notify {
            for cb in callbacks {
                cb(&None);
            }
        }
        persist
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::snapshot::{load_boot_snapshot, MemoryStorage};
    use crate::models::test_note;
    use crate::util::testing::ManualTimer;
    use std::cell::Cell;

    fn store() -> CacheStore {
        CacheStore::new(Rc::new(ManualTimer::at(1_000)))
    }

    #[test]
    fn test_write_is_immediately_visible_to_subscribers() {
        let store = store();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let _sub = store.subscribe(CacheKey::List(Partition::Active), move |v| {
            s.borrow_mut().push(v.clone());
        });

        store.write(
            CacheKey::List(Partition::Active),
            CacheValue::Notes(vec![test_note("a", 1)]),
        );

        assert_eq!(
            store.read_list(Partition::Active),
            Some(vec![test_note("a", 1)])
        );
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn test_batch_notifies_after_all_writes() {
        let store = store();
        let observed = Rc::new(RefCell::new(None));
        let (o, st) = (observed.clone(), store.clone());
        let _sub = store.subscribe(CacheKey::List(Partition::Active), move |_| {
            // By the time any watcher runs, the whole batch is in place.
            *o.borrow_mut() = st.read_list(Partition::Archived);
        });

        store.write_batch(vec![
            (CacheKey::List(Partition::Active), Some(CacheValue::Notes(vec![]))),
            (
                CacheKey::List(Partition::Archived),
                Some(CacheValue::Notes(vec![test_note("a", 1)])),
            ),
        ]);

        assert_eq!(*observed.borrow(), Some(vec![test_note("a", 1)]));
    }

    #[test]
    fn test_invalidate_keeps_stale_value_visible() {
        let store = store();
        store.write(CacheKey::note("a"), CacheValue::Note(test_note("a", 1)));
        let keys = store.invalidate(|k| matches!(k, CacheKey::Note(_)));

        assert_eq!(keys, vec![CacheKey::note("a")]);
        let entry = store.entry(&CacheKey::note("a")).expect("entry stays");
        assert!(entry.stale);
        assert_eq!(entry.value, CacheValue::Note(test_note("a", 1)));
    }

    #[test]
    fn test_begin_fetch_is_exclusive_per_key() {
        let store = store();
        let key = CacheKey::List(Partition::Active);
        let ticket = store.begin_fetch(&key).expect("first claim");
        assert!(store.begin_fetch(&key).is_none());
        assert!(store.begin_fetch(&CacheKey::List(Partition::Trash)).is_some());

        assert!(store.finish_fetch(ticket, Some(CacheValue::Notes(vec![]))));
        assert!(!store.is_in_flight(&key));
        assert!(store.begin_fetch(&key).is_some());
    }

    #[test]
    fn test_fetch_result_discarded_after_local_write() {
        let store = store();
        let key = CacheKey::List(Partition::Active);
        let ticket = store.begin_fetch(&key).expect("claim");

        store.write(key.clone(), CacheValue::Notes(vec![test_note("local", 2)]));
        let applied = store.finish_fetch(ticket, Some(CacheValue::Notes(vec![])));

        assert!(!applied);
        assert_eq!(store.read_list(Partition::Active), Some(vec![test_note("local", 2)]));
    }

    #[test]
    fn test_dropped_subscription_stops_notifications() {
        let store = store();
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let sub = store.subscribe(CacheKey::note("a"), move |_| c.set(c.get() + 1));
        assert_eq!(store.observed_keys(), vec![CacheKey::note("a")]);

        store.write(CacheKey::note("a"), CacheValue::Note(test_note("a", 1)));
        drop(sub);
        store.write(CacheKey::note("a"), CacheValue::Note(test_note("a", 2)));

        assert_eq!(count.get(), 1);
        assert!(store.observed_keys().is_empty());
    }

    #[test]
    fn test_list_writes_persist_boot_snapshot() {
        let store = store();
        let storage = Rc::new(MemoryStorage::default());
        store.set_persistence(storage.clone(), "u1".to_string());

        store.write(
            CacheKey::List(Partition::Archived),
            CacheValue::Notes(vec![test_note("z", 1)]),
        );
        store.write(CacheKey::List(Partition::Trash), CacheValue::Notes(vec![test_note("t", 1)]));

        let snap = load_boot_snapshot(storage.as_ref(), "u1").expect("snapshot saved");
        assert!(snap.active.is_empty());
        assert_eq!(snap.archived, vec![test_note("z", 1)]);
    }

    #[test]
    fn test_clear_all_notifies_and_unbinds_persistence() {
        let store = store();
        let storage = Rc::new(MemoryStorage::default());
        store.set_persistence(storage, "u1".to_string());
        store.write(CacheKey::note("a"), CacheValue::Note(test_note("a", 1)));

        let cleared = Rc::new(Cell::new(false));
        let c = cleared.clone();
        let _sub = store.subscribe(CacheKey::note("a"), move |v| c.set(v.is_none()));

        let binding = store.clear_all();
        assert!(binding.is_some());
        assert!(cleared.get());
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_second_claim_requests_one_follow_up() {
        let store = store();
        let key = CacheKey::List(Partition::Active);
        let ticket = store.begin_fetch(&key).expect("claim");
        assert!(!store.take_refetch_request(&key));

        assert!(store.begin_fetch(&key).is_none());
        assert!(store.begin_fetch(&key).is_none());
        store.finish_fetch(ticket, Some(CacheValue::Notes(vec![])));

        assert!(store.take_refetch_request(&key));
        assert!(!store.take_refetch_request(&key));
    }

    #[test]
    fn test_fetch_from_before_clear_keeps_newer_claim() {
        let store = store();
        let key = CacheKey::List(Partition::Active);
        let old = store.begin_fetch(&key).expect("claim");
        let epoch = store.epoch();

        store.clear_all();
        assert_ne!(store.epoch(), epoch);
        let _fresh = store.begin_fetch(&key).expect("claim after clear");

        let applied = store.finish_fetch(old, Some(CacheValue::Notes(vec![test_note("old", 1)])));
        assert!(!applied);
        assert!(store.is_in_flight(&key));
        assert!(store.begin_fetch(&key).is_none());
        assert!(store.read_list(Partition::Active).is_none());
    }

    #[test]
    fn test_observed_keys_include_unloaded_entries() {
        let store = store();
        let _sub = store.subscribe(CacheKey::note("a"), |_| {});
        assert_eq!(store.observed_keys(), vec![CacheKey::note("a")]);
        assert!(store.read_note("a").is_none());
    }
}
