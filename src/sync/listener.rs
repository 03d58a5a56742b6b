//! Keeps the cache in step with changes made elsewhere.
//!
//! A server-push stream is preferred; while it is unavailable or dropped the listener
//! polls instead. Visibility regain, coming back online and every push message all
//! force a resync of the current view. Nothing here is ever surfaced as an error.

use crate::cache::{CacheKey, NoteQueries};
use crate::config::SyncConfig;
use crate::events::{EventBus, Subscription, SyncEvent};
use crate::models::Partition;
use crate::util::{Spawner, Timer};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;
use wasm_bindgen::closure::Closure;
use wasm_bindgen::JsCast;

/// Callbacks a push transport reports into.
#[derive(Clone)]
pub struct PushHandlers {
    pub on_open: Rc<dyn Fn()>,
    pub on_message: Rc<dyn Fn()>,
    pub on_error: Rc<dyn Fn()>,
}

pub trait PushConnection {
    fn close(&self);
}

pub trait PushConnector {
    /// Open a stream. `None` means push is not available at all.
    fn connect(&self, handlers: PushHandlers) -> Option<Box<dyn PushConnection>>;
}

/// Push transport over the browser `EventSource` API.
pub struct EventSourceConnector {
    url: String,
}

impl EventSourceConnector {
    pub fn new(url: String) -> Self {
        Self { url }
    }
}

struct EventSourceConnection {
    source: web_sys::EventSource,
    _handlers: Vec<Closure<dyn FnMut(web_sys::Event)>>,
}

impl PushConnection for EventSourceConnection {
    fn close(&self) {
        self.source.close();
    }
}

impl Drop for EventSourceConnection {
    fn drop(&mut self) {
        self.source.close();
    }
}

fn js_handler(cb: Rc<dyn Fn()>) -> Closure<dyn FnMut(web_sys::Event)> {
    Closure::wrap(Box::new(move |_ev: web_sys::Event| cb()) as Box<dyn FnMut(web_sys::Event)>)
}

impl PushConnector for EventSourceConnector {
    fn connect(&self, handlers: PushHandlers) -> Option<Box<dyn PushConnection>> {
        let source = match web_sys::EventSource::new(&self.url) {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(error = ?e, "EventSource unavailable");
                return None;
            }
        };
        let on_open = js_handler(handlers.on_open);
        let on_message = js_handler(handlers.on_message);
        let on_error = js_handler(handlers.on_error);
        source.set_onopen(Some(on_open.as_ref().unchecked_ref()));
        source.set_onmessage(Some(on_message.as_ref().unchecked_ref()));
        source.set_onerror(Some(on_error.as_ref().unchecked_ref()));
        Some(Box::new(EventSourceConnection {
            source,
            _handlers: vec![on_open, on_message, on_error],
        }))
    }
}

struct ListenerState {
    running: bool,
    live: bool,
    view: Partition,
    /// Bumped on start/stop so callbacks and loops from an older run go inert.
    generation: u64,
    polling: bool,
    reconnect_pending: bool,
    connection: Option<Box<dyn PushConnection>>,
    events: Option<Subscription>,
}

struct ListenerInner {
    queries: NoteQueries,
    timer: Rc<dyn Timer>,
    spawn: Spawner,
    connector: Option<Rc<dyn PushConnector>>,
    poll_interval: Duration,
    reconnect_delay: Duration,
    state: RefCell<ListenerState>,
}

#[derive(Clone)]
pub struct ReconciliationListener {
    inner: Rc<ListenerInner>,
}

impl ReconciliationListener {
    pub fn new(
        queries: NoteQueries,
        timer: Rc<dyn Timer>,
        spawn: Spawner,
        connector: Option<Rc<dyn PushConnector>>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            inner: Rc::new(ListenerInner {
                queries,
                timer,
                spawn,
                connector,
                poll_interval: config.poll_interval,
                reconnect_delay: config.reconnect_delay,
                state: RefCell::new(ListenerState {
                    running: false,
                    live: false,
                    view: Partition::Active,
                    generation: 0,
                    polling: false,
                    reconnect_pending: false,
                    connection: None,
                    events: None,
                }),
            }),
        }
    }

    /// Whether the push channel is currently open. Diagnostic only.
    pub fn is_live(&self) -> bool {
        self.inner.state.borrow().live
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.borrow().running
    }

    pub fn view(&self) -> Partition {
        self.inner.state.borrow().view
    }

    /// Switch which list partition resyncs refresh.
    pub fn set_view(&self, view: Partition) {
        let changed = {
            let mut st = self.inner.state.borrow_mut();
            std::mem::replace(&mut st.view, view) != view
        };
        if changed {
            self.inner.spawn_resync("view changed");
        }
    }

    pub fn start(&self, events: &EventBus) {
        {
            let mut st = self.inner.state.borrow_mut();
            if st.running {
                return;
            }
            st.running = true;
            st.generation += 1;
        }

        let weak = Rc::downgrade(&self.inner);
        let sub = events.subscribe(move |ev| {
            if let Some(l) = weak.upgrade() {
                l.handle_event(ev);
            }
        });
        self.inner.state.borrow_mut().events = Some(sub);

        tracing::info!("reconciliation listener started");
        self.inner.connect_push();
        self.inner.ensure_polling();
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn handle_event(&self, event: &SyncEvent) {
        self.inner.handle_event(event);
    }

    /// Refetch the current view's list and every note some view is watching.
    pub async fn resync(&self) {
        self.inner.resync().await;
    }
}

impl ListenerInner {
    fn is_current(&self, generation: u64) -> bool {
        let st = self.state.borrow();
        st.running && st.generation == generation
    }

    fn handle_event(self: &Rc<Self>, event: &SyncEvent) {
        match event {
            SyncEvent::Online => {
                self.spawn_resync("online");
                if self.state.borrow().connection.is_none() {
                    self.connect_push();
                }
            }
            SyncEvent::VisibilityRegained => self.spawn_resync("visible"),
            SyncEvent::RemoteChanged => self.spawn_resync("remote change"),
            SyncEvent::Offline => tracing::debug!("offline; waiting for connectivity"),
            SyncEvent::SessionExpired => self.stop(),
        }
    }

    fn stop(&self) {
        let (conn, sub) = {
            let mut st = self.state.borrow_mut();
            if !st.running {
                return;
            }
            st.running = false;
            st.live = false;
            st.polling = false;
            st.reconnect_pending = false;
            st.generation += 1;
            (st.connection.take(), st.events.take())
        };
        if let Some(c) = conn {
            c.close();
        }
        drop(sub);
        tracing::info!("reconciliation listener stopped");
    }

    async fn resync(&self) {
        let view = self.state.borrow().view;
        let store = self.queries.store();
        let list = CacheKey::List(view);
        let mut keys: Vec<CacheKey> = store
            .observed_keys()
            .into_iter()
            .filter(|k| matches!(k, CacheKey::Note(_)))
            .collect();
        if store.read(&list).is_some() {
            keys.push(list);
        }
        tracing::debug!(%view, keys = keys.len(), "resync");
        self.queries.refresh_keys(keys).await;
    }

    fn spawn_resync(self: &Rc<Self>, reason: &'static str) {
        if !self.state.borrow().running {
            return;
        }
        tracing::debug!(reason, "resync requested");
        let l = self.clone();
        (self.spawn)(Box::pin(async move { l.resync().await }));
    }

    fn callback(self: &Rc<Self>, generation: u64, f: fn(&Rc<Self>)) -> Rc<dyn Fn()> {
        let weak: Weak<Self> = Rc::downgrade(self);
        Rc::new(move || {
            if let Some(l) = weak.upgrade() {
                if l.is_current(generation) {
                    f(&l);
                }
            }
        })
    }

    fn connect_push(self: &Rc<Self>) -> bool {
        let Some(connector) = self.connector.clone() else {
            return false;
        };
        let generation = self.state.borrow().generation;
        let handlers = PushHandlers {
            on_open: self.callback(generation, Self::on_open),
            on_message: self.callback(generation, |l| l.spawn_resync("push")),
            on_error: self.callback(generation, Self::on_drop),
        };
        match connector.connect(handlers) {
            Some(conn) => {
                self.state.borrow_mut().connection = Some(conn);
                true
            }
            None => {
                tracing::debug!("push unavailable; polling");
                false
            }
        }
    }

    fn on_open(self: &Rc<Self>) {
        self.state.borrow_mut().live = true;
        tracing::info!("push channel open");
        self.spawn_resync("push open");
    }

    fn on_drop(self: &Rc<Self>) {
        let conn = {
            let mut st = self.state.borrow_mut();
            st.live = false;
            st.connection.take()
        };
        if let Some(c) = conn {
            c.close();
        }
        tracing::warn!("push channel dropped; falling back to polling");
        self.ensure_polling();
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Rc<Self>) {
        let generation = {
            let mut st = self.state.borrow_mut();
            if st.reconnect_pending || !st.running {
                return;
            }
            st.reconnect_pending = true;
            st.generation
        };
        let weak = Rc::downgrade(self);
        let sleep = self.timer.sleep(self.reconnect_delay);
        (self.spawn)(Box::pin(async move {
            sleep.await;
            let Some(l) = weak.upgrade() else {
                return;
            };
            if !l.is_current(generation) {
                return;
            }
            l.state.borrow_mut().reconnect_pending = false;
            if l.state.borrow().connection.is_none() {
                tracing::debug!("reconnecting push channel");
                l.connect_push();
            }
        }));
    }

    fn ensure_polling(self: &Rc<Self>) {
        let generation = {
            let mut st = self.state.borrow_mut();
            if st.polling || st.live || !st.running {
                return;
            }
            st.polling = true;
            st.generation
        };
        let weak = Rc::downgrade(self);
        let timer = self.timer.clone();
        let interval = self.poll_interval;
        (self.spawn)(Box::pin(async move {
            loop {
                timer.sleep(interval).await;
                let Some(l) = weak.upgrade() else {
                    return;
                };
                if !l.is_current(generation) {
                    return;
                }
                if l.state.borrow().live {
                    l.state.borrow_mut().polling = false;
                    return;
                }
                l.resync().await;
            }
        }));
    }
}
