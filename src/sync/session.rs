use super::executor::MutationExecutor;
use super::guard::{ConflictGuard, NoteFields, RemoteOutcome};
use super::mutation::Mutation;
use crate::api::SyncError;
use crate::cache::{CacheKey, CacheValue};
use crate::events::{Listeners, Subscription};
use crate::models::{Note, NotePatch};
use crate::util::{Spawner, Timer};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

struct SessionInner {
    executor: MutationExecutor,
    timer: Rc<dyn Timer>,
    spawn: Spawner,
    debounce: Duration,
    guard: RefCell<ConflictGuard>,
    /// Bumped on every keystroke and on close; a debounce timer only fires for the
    /// generation it was started with.
    debounce_gen: Cell<u64>,
    closed: Cell<bool>,
    watch: RefCell<Option<Subscription>>,
    display_listeners: Rc<RefCell<Listeners<NoteFields>>>,
}

/// An open note detail view.
///
/// Drives a [`ConflictGuard`]: watches the note's cache entry for remote copies,
/// pushes metadata immediately, autosaves content after a quiet period (guarded notes
/// in edit mode only), and flushes a final save on close.
#[derive(Clone)]
pub struct CollabSession {
    inner: Rc<SessionInner>,
}

impl CollabSession {
    pub fn open(
        executor: MutationExecutor,
        timer: Rc<dyn Timer>,
        spawn: Spawner,
        debounce: Duration,
        note: &Note,
        current_user_id: Option<&str>,
    ) -> Self {
        let guard = ConflictGuard::open(note, current_user_id);
        tracing::debug!(id = %note.id, guarded = guard.is_guarded(), "note opened");
        let inner = Rc::new(SessionInner {
            executor,
            timer,
            spawn,
            debounce,
            guard: RefCell::new(guard),
            debounce_gen: Cell::new(0),
            closed: Cell::new(false),
            watch: RefCell::new(None),
            display_listeners: Rc::new(RefCell::new(Listeners::default())),
        });

        let weak: Weak<SessionInner> = Rc::downgrade(&inner);
        let sub = inner
            .executor
            .store()
            .subscribe(CacheKey::note(note.id.clone()), move |value| {
                let (Some(s), Some(CacheValue::Note(remote))) = (weak.upgrade(), value) else {
                    return;
                };
                s.on_remote(remote);
            });
        *inner.watch.borrow_mut() = Some(sub);

        Self { inner }
    }

    pub fn note_id(&self) -> String {
        self.inner.guard.borrow().note_id().to_string()
    }

    pub fn is_guarded(&self) -> bool {
        self.inner.guard.borrow().is_guarded()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.guard.borrow().is_dirty()
    }

    pub fn display(&self) -> NoteFields {
        self.inner.guard.borrow().display().clone()
    }

    /// Called whenever a remote copy changes what is displayed.
    pub fn on_display_change(&self, cb: impl Fn(&NoteFields) + 'static) -> Subscription {
        let id = self.inner.display_listeners.borrow_mut().add(Rc::new(cb));
        let weak = Rc::downgrade(&self.inner.display_listeners);
        Subscription::new(move || {
            if let Some(l) = weak.upgrade() {
                l.borrow_mut().remove(id);
            }
        })
    }

    pub fn set_editing(&self, editing: bool) {
        self.inner.guard.borrow_mut().set_editing(editing);
        if editing {
            self.inner.schedule_autosave();
        }
    }

    pub fn edit_title(&self, title: impl Into<String>) {
        self.inner.guard.borrow_mut().edit_title(title);
        self.inner.schedule_autosave();
    }

    pub fn edit_content(&self, content: impl Into<String>) {
        self.inner.guard.borrow_mut().edit_content(content);
        self.inner.schedule_autosave();
    }

    /// Change color, transparency, tags or images. Sent right away in any mode.
    pub fn update_metadata(&self, f: impl FnOnce(&mut NoteFields)) {
        let (id, patch) = {
            let mut guard = self.inner.guard.borrow_mut();
            (guard.note_id().to_string(), guard.set_metadata(f))
        };
        let Some(patch) = patch else {
            return;
        };
        let executor = self.inner.executor.clone();
        (self.inner.spawn)(Box::pin(async move {
            if let Err(e) = executor.execute(Mutation::Patch { id: id.clone(), patch }).await {
                tracing::warn!(%id, error = %e, "metadata save failed");
            }
        }));
    }

    /// Save pending content now (edit mode only).
    pub async fn flush(&self) -> Result<(), SyncError> {
        let patch = self.inner.guard.borrow().content_patch();
        self.inner.save(patch).await
    }

    /// Cancel any pending autosave and flush the user's edit, if there is one.
    pub async fn close(self) -> Result<(), SyncError> {
        self.inner.closed.set(true);
        self.inner.debounce_gen.set(self.inner.debounce_gen.get() + 1);
        self.inner.watch.borrow_mut().take();
        let patch = self.inner.guard.borrow_mut().close();
        tracing::debug!(id = %self.note_id(), flush = patch.is_some(), "note closed");
        self.inner.save(patch).await
    }
}

impl SessionInner {
    fn on_remote(&self, remote: &Note) {
        let outcome = self.guard.borrow_mut().on_remote_update(remote);
        if outcome != RemoteOutcome::Adopted {
            return;
        }
        let display = self.guard.borrow().display().clone();
        let callbacks = self.display_listeners.borrow().callbacks();
        for cb in callbacks {
            cb(&display);
        }
    }

    fn schedule_autosave(self: &Rc<Self>) {
        let wanted = {
            let g = self.guard.borrow();
            g.is_guarded() && g.is_editing()
        };
        if !wanted || self.closed.get() {
            return;
        }

        let generation = self.debounce_gen.get() + 1;
        self.debounce_gen.set(generation);
        let weak = Rc::downgrade(self);
        let sleep = self.timer.sleep(self.debounce);
        (self.spawn)(Box::pin(async move {
            sleep.await;
            let Some(s) = weak.upgrade() else {
                return;
            };
            if s.closed.get() || s.debounce_gen.get() != generation {
                return;
            }
            let patch = s.guard.borrow().content_patch();
            if let Err(e) = s.save(patch).await {
                tracing::warn!(error = %e, "autosave failed");
            }
        }));
    }

    async fn save(&self, patch: Option<NotePatch>) -> Result<(), SyncError> {
        let Some(patch) = patch else {
            return Ok(());
        };
        let id = self.guard.borrow().note_id().to_string();
        self.executor
            .execute(Mutation::Patch {
                id,
                patch: patch.clone(),
            })
            .await?;
        self.guard.borrow_mut().mark_saved(&patch);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheStore, NoteQueries};
    use crate::events::EventBus;
    use crate::models::{test_note, Collaborator};
    use crate::sync::RetryPolicy;
    use crate::testing::FakeApi;
    use crate::util::testing::{pool_spawner, StepTimer};
    use futures::executor::LocalPool;

    fn shared_note() -> Note {
        let mut n = test_note("n", 1);
        n.content = "x".to_string();
        n.collaborators = Some(vec![Collaborator {
            id: "u2".to_string(),
            name: String::new(),
            email: String::new(),
        }]);
        n
    }

    struct Harness {
        api: Rc<FakeApi>,
        timer: Rc<StepTimer>,
        store: CacheStore,
        pool: LocalPool,
        session: CollabSession,
    }

    fn harness(note: Note) -> Harness {
        let api = Rc::new(FakeApi::with_notes(vec![note.clone()]));
        let timer = Rc::new(StepTimer::default());
        let events = EventBus::new();
        let store = CacheStore::new(timer.clone());
        store.write(CacheKey::note("n"), CacheValue::Note(note.clone()));
        let queries = NoteQueries::new(
            store.clone(),
            api.clone(),
            timer.clone(),
            Duration::from_secs(30),
            events.clone(),
        );
        let executor = MutationExecutor::new(
            queries,
            api.clone(),
            timer.clone(),
            RetryPolicy::default(),
            Duration::from_secs(30),
            events,
        );
        let pool = LocalPool::new();
        let session = CollabSession::open(
            executor,
            timer.clone(),
            pool_spawner(&pool),
            Duration::from_secs(1),
            &note,
            Some("u1"),
        );
        Harness {
            api,
            timer,
            store,
            pool,
            session,
        }
    }

    impl Harness {
        fn run(&mut self) {
            self.pool.run_until_stalled();
        }

        fn server_content(&self) -> String {
            self.api
                .notes
                .borrow()
                .iter()
                .find(|n| n.id == "n")
                .map(|n| n.content.clone())
                .unwrap_or_default()
        }
    }

    #[test]
    fn test_typing_is_debounced_into_one_save() {
        let mut h = harness(shared_note());
        h.session.set_editing(true);
        h.session.edit_content("a");
        h.session.edit_content("ab");
        h.run();
        assert_eq!(h.api.count_calls("patch:n"), 0);
        assert!(h.timer.pending().contains(&Duration::from_secs(1)));

        h.timer.fire();
        h.run();
        assert_eq!(h.api.count_calls("patch:n"), 1);
        assert_eq!(h.server_content(), "ab");
        assert!(!h.session.is_dirty());
    }

    #[test]
    fn test_read_only_mode_pushes_metadata_but_not_content() {
        let mut h = harness(shared_note());
        h.session.edit_content("typed");
        h.session
            .update_metadata(|f| f.color = "#222222".to_string());
        h.run();
        h.timer.fire();
        h.run();

        assert_eq!(h.api.count_calls("patch:n"), 1);
        assert_eq!(h.server_content(), "x");
        let color = h.api.notes.borrow()[0].color.clone();
        assert_eq!(color, "#222222");
    }

    #[test]
    fn test_remote_copy_does_not_replace_unsaved_edit() {
        let mut h = harness(shared_note());
        let shown = Rc::new(RefCell::new(Vec::new()));
        let s = shown.clone();
        let _sub = h
            .session
            .on_display_change(move |f| s.borrow_mut().push(f.content.clone()));

        h.session.set_editing(true);
        h.session.edit_content("mine");
        let mut theirs = shared_note();
        theirs.content = "theirs".to_string();
        h.store.write(CacheKey::note("n"), CacheValue::Note(theirs));
        h.run();

        assert_eq!(h.session.display().content, "mine");
        assert!(shown.borrow().is_empty());
    }

    #[test]
    fn test_remote_copy_adopted_when_untouched() {
        let mut h = harness(shared_note());
        let shown = Rc::new(RefCell::new(Vec::new()));
        let s = shown.clone();
        let _sub = h
            .session
            .on_display_change(move |f| s.borrow_mut().push(f.content.clone()));

        let mut theirs = shared_note();
        theirs.content = "theirs".to_string();
        h.store.write(CacheKey::note("n"), CacheValue::Note(theirs));
        h.run();

        assert_eq!(h.session.display().content, "theirs");
        assert_eq!(*shown.borrow(), vec!["theirs".to_string()]);
    }

    #[test]
    fn test_close_cancels_debounce_and_flushes_once() {
        let mut h = harness(shared_note());
        h.session.set_editing(true);
        h.session.edit_content("final");
        let session = h.session.clone();
        h.pool
            .run_until(session.close())
            .expect("flush succeeds");
        assert_eq!(h.api.count_calls("patch:n"), 1);
        assert_eq!(h.server_content(), "final");

        h.timer.fire();
        h.run();
        assert_eq!(h.api.count_calls("patch:n"), 1);
        assert!(!h.store.observed_keys().contains(&CacheKey::note("n")));
    }

    #[test]
    fn test_own_note_saves_on_close_only() {
        let mut h = harness(test_note("n", 1));
        assert!(!h.session.is_guarded());
        h.session.set_editing(true);
        h.session.edit_content("draft");
        h.run();
        assert!(h.timer.pending().is_empty());

        let session = h.session.clone();
        h.pool.run_until(session.close()).expect("flush");
        assert_eq!(h.server_content(), "draft");
    }

    #[test]
    fn test_failed_flush_keeps_edit_dirty() {
        let mut h = harness(shared_note());
        h.session.set_editing(true);
        h.session.edit_content("mine");
        h.api.fail_writes([SyncError::Api {
            status: 409,
            message: "conflict".to_string(),
        }]);
        let session = h.session.clone();
        let res = h.pool.run_until(async move { session.flush().await });
        assert!(res.is_err());
        assert!(h.session.is_dirty());
        assert_eq!(h.session.display().content, "mine");
    }
}
