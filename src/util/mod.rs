use futures::future::LocalBoxFuture;
use gloo_timers::future::TimeoutFuture;
use std::rc::Rc;
use std::time::Duration;

/// Runs a detached background task on the current thread.
pub type Spawner = Rc<dyn Fn(LocalBoxFuture<'static, ()>)>;

pub fn browser_spawner() -> Spawner {
    Rc::new(|fut| leptos::task::spawn_local(fut))
}

/// Time source and suspension point for every delay in the engine
/// (retry backoff, request timeout, debounce, reconnect, polling).
pub trait Timer {
    fn now_ms(&self) -> i64;
    fn sleep(&self, dur: Duration) -> LocalBoxFuture<'static, ()>;
}

/// Browser timer backed by `setTimeout`.
#[derive(Clone, Copy, Debug, Default)]
pub struct BrowserTimer;

impl Timer for BrowserTimer {
    fn now_ms(&self) -> i64 {
        now_ms()
    }

    fn sleep(&self, dur: Duration) -> LocalBoxFuture<'static, ()> {
        let ms = u32::try_from(dur.as_millis()).unwrap_or(u32::MAX);
        Box::pin(TimeoutFuture::new(ms))
    }
}

pub(crate) fn now_ms() -> i64 {
    js_sys::Date::now().round() as i64
}

pub(crate) fn random_u64() -> u64 {
    let mut buf = [0u8; 8];
    // Collisions only matter within one tab; a zero fallback is still unique per ms.
    let _ = getrandom::getrandom(&mut buf);
    u64::from_le_bytes(buf)
}
