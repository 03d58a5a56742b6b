//! Cross-cutting events (session expiry, connectivity, visibility, remote change)
//! passed explicitly to the components that react to them.
//!
//! A [`Subscription`] keeps its callback registered until it is dropped.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use wasm_bindgen::closure::Closure;
use wasm_bindgen::JsCast;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    /// A request came back 401; every partition and listener must be torn down.
    SessionExpired,
    Online,
    Offline,
    /// The document became visible again after being backgrounded.
    VisibilityRegained,
    /// The server reported that some notes changed.
    RemoteChanged,
}

type Callback<T> = Rc<dyn Fn(&T)>;

/// Ordered callback registry shared by the event bus and the cache store.
pub(crate) struct Listeners<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }
}

impl<T> Listeners<T> {
    pub(crate) fn add(&mut self, cb: Callback<T>) -> u64 {
        self.next_id += 1;
        self.entries.push((self.next_id, cb));
        self.next_id
    }

    pub(crate) fn remove(&mut self, id: u64) {
        self.entries.retain(|(i, _)| *i != id);
    }

    /// Snapshot of the callbacks, so callers can notify without holding a borrow.
    pub(crate) fn callbacks(&self) -> Vec<Callback<T>> {
        self.entries.iter().map(|(_, cb)| cb.clone()).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Handle returned by `subscribe`; dropping it unregisters the callback.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Keep the callback registered for the lifetime of the process.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Rc<RefCell<Listeners<SyncEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, cb: impl Fn(&SyncEvent) + 'static) -> Subscription {
        let id = self.inner.borrow_mut().add(Rc::new(cb));
        let weak: Weak<RefCell<Listeners<SyncEvent>>> = Rc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.borrow_mut().remove(id);
            }
        })
    }

    pub fn emit(&self, event: SyncEvent) {
        tracing::debug!(?event, "sync event");
        let callbacks = self.inner.borrow().callbacks();
        for cb in callbacks {
            cb(&event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.borrow().len()
    }
}

/// Browser `online` / `offline` / `visibilitychange` listeners feeding an [`EventBus`].
///
/// Listeners are removed when this value is dropped.
pub struct WindowEvents {
    target: web_sys::EventTarget,
    handlers: Vec<(&'static str, Closure<dyn FnMut(web_sys::Event)>)>,
}

impl WindowEvents {
    pub fn attach(bus: &EventBus) -> Option<Self> {
        let window = web_sys::window()?;
        let mut handlers: Vec<(&'static str, Closure<dyn FnMut(web_sys::Event)>)> = Vec::new();

        let b = bus.clone();
        handlers.push((
            "online",
            Closure::wrap(Box::new(move |_ev: web_sys::Event| b.emit(SyncEvent::Online))
                as Box<dyn FnMut(web_sys::Event)>),
        ));

        let b = bus.clone();
        handlers.push((
            "offline",
            Closure::wrap(Box::new(move |_ev: web_sys::Event| b.emit(SyncEvent::Offline))
                as Box<dyn FnMut(web_sys::Event)>),
        ));

        let b = bus.clone();
        handlers.push((
            "visibilitychange",
            Closure::wrap(Box::new(move |_ev: web_sys::Event| {
                let visible = web_sys::window()
                    .and_then(|w| w.document())
                    .map(|d| d.visibility_state() == web_sys::VisibilityState::Visible)
                    .unwrap_or(false);
                if visible {
                    b.emit(SyncEvent::VisibilityRegained);
                }
            }) as Box<dyn FnMut(web_sys::Event)>),
        ));

        let target: web_sys::EventTarget = window.unchecked_into();
        for (name, cb) in handlers.iter() {
            let _ = target.add_event_listener_with_callback(name, cb.as_ref().unchecked_ref());
        }

        Some(Self { target, handlers })
    }
}

impl Drop for WindowEvents {
    fn drop(&mut self) {
        for (name, cb) in self.handlers.iter() {
            let _ = self
                .target
                .remove_event_listener_with_callback(name, cb.as_ref().unchecked_ref());
        }
    }
}
