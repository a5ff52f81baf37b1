//! A single-owner cooperative timer plus named-event bus (§4.F). The core
//! runs entirely on one `tokio` task; this crate's job is to give that task
//! the handful of scheduling primitives the original cooperative reactor
//! exposed (`call_later`, `call_every`, a named-event bus, and a
//! worker-thread escape hatch for blocking work), realized on top of
//! `tokio::time` and `tokio::task::spawn_blocking` the way
//! `da-indexer-logic/src/indexer.rs` realizes its own poll loop on
//! `tokio::time::sleep`.

mod clock;

pub use clock::{Clock, SystemClock};

use relay_wire::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(u64);

type Handler = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

enum Registration {
    Timer(tokio::task::AbortHandle),
    Listener(String),
}

pub struct Reactor {
    next_id: AtomicU64,
    calls: Mutex<HashMap<u64, Registration>>,
    handlers: Mutex<HashMap<String, Vec<(u64, Handler)>>>,
    clock: Arc<dyn Clock>,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            calls: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn next_id(&self) -> CallId {
        CallId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn time(&self) -> f64 {
        self.clock.now()
    }

    /// Fires `f` once after `delay` has elapsed.
    pub fn call_later<F>(&self, delay: Duration, f: F) -> CallId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.next_id();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        self.calls
            .lock()
            .unwrap()
            .insert(id.0, Registration::Timer(handle.abort_handle()));
        id
    }

    /// Fires `f` every `interval`, starting one interval from now.
    pub fn call_every<F>(&self, interval: Duration, mut f: F) -> CallId
    where
        F: FnMut() + Send + 'static,
    {
        let id = self.next_id();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                f();
            }
        });
        self.calls
            .lock()
            .unwrap()
            .insert(id.0, Registration::Timer(handle.abort_handle()));
        id
    }

    /// Cancels a pending/recurring timer or a registered event handler.
    /// Safe to call after the call has already fired (the id is simply not
    /// found).
    pub fn cancel_call(&self, id: CallId) {
        let registration = self.calls.lock().unwrap().remove(&id.0);
        match registration {
            Some(Registration::Timer(handle)) => handle.abort(),
            Some(Registration::Listener(event)) => {
                if let Some(handlers) = self.handlers.lock().unwrap().get_mut(&event) {
                    handlers.retain(|(hid, _)| *hid != id.0);
                }
            }
            None => {}
        }
    }

    /// Registers a handler for a named event; returns an id usable with
    /// [`Reactor::cancel_call`].
    pub fn call_on<F>(&self, event: &str, handler: F) -> CallId
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.handlers
            .lock()
            .unwrap()
            .entry(event.to_string())
            .or_default()
            .push((id.0, Arc::new(handler)));
        self.calls
            .lock()
            .unwrap()
            .insert(id.0, Registration::Listener(event.to_string()));
        id
    }

    /// Invokes every handler registered for `event`, in registration order.
    /// A handler returning `Err` is logged and does not stop the remaining
    /// handlers from running. Returns the successful return values.
    pub fn fire(&self, event: &str, args: &[Value]) -> Vec<Value> {
        let snapshot: Vec<(u64, Handler)> = self
            .handlers
            .lock()
            .unwrap()
            .get(event)
            .cloned()
            .unwrap_or_default();

        let mut results = Vec::with_capacity(snapshot.len());
        for (_, handler) in snapshot {
            match handler(args) {
                Ok(value) => results.push(value),
                Err(error) => tracing::error!(event, %error, "event handler failed"),
            }
        }
        results
    }

    /// Runs `f` on a blocking-task worker, off the event loop. Awaiting the
    /// returned future is the realization of "exactly one of result_cb or
    /// error_cb is scheduled back onto the loop": `Ok` is the result
    /// callback, `Err` (a panicked or cancelled worker) is the error
    /// callback.
    pub async fn call_in_thread<F, T>(&self, f: F) -> Result<T, tokio::task::JoinError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        tokio::task::spawn_blocking(f).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct FixedClock(f64);
    impl Clock for FixedClock {
        fn now(&self) -> f64 {
            self.0
        }
    }

    #[test]
    fn time_uses_the_injected_clock() {
        let reactor = Reactor::with_clock(Arc::new(FixedClock(42.0)));
        assert_eq!(reactor.time(), 42.0);
    }

    #[tokio::test(start_paused = true)]
    async fn call_later_fires_once_after_the_delay() {
        let reactor = Reactor::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        reactor.call_later(Duration::from_secs(5), move || {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_secs(4)).await;
        tokio::task::yield_now().await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_call_stops_a_pending_timer() {
        let reactor = Reactor::new();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let id = reactor.call_later(Duration::from_secs(5), move || {
            flag.store(true, Ordering::SeqCst);
        });
        reactor.cancel_call(id);

        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn fire_invokes_handlers_in_registration_order_and_skips_errors() {
        let reactor = Reactor::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        reactor.call_on("ping", move |_| {
            o1.lock().unwrap().push(1);
            Ok(Value::Null)
        });
        reactor.call_on("ping", |_| Err("boom".to_string()));
        let o3 = order.clone();
        reactor.call_on("ping", move |_| {
            o3.lock().unwrap().push(3);
            Ok(Value::Null)
        });

        let results = reactor.fire("ping", &[]);
        assert_eq!(*order.lock().unwrap(), vec![1, 3]);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn cancel_call_removes_a_listener() {
        let reactor = Reactor::new();
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        let id = reactor.call_on("evt", move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(Value::Null)
        });
        reactor.cancel_call(id);
        reactor.fire("evt", &[]);
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn call_in_thread_runs_blocking_work_and_returns_the_result() {
        let reactor = Reactor::new();
        let result = reactor.call_in_thread(|| 2 + 2).await.unwrap();
        assert_eq!(result, 4);
    }
}
