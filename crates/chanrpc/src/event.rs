//! # Events
//!
//! A multi-listener event source with optional lazy activation.
//!
//! An `Emitter` owns the listener list and fires values; an `Event` is the
//! subscribable view handed to consumers. Hooks run when the first listener
//! attaches and when the last one detaches, which is how remote
//! subscriptions stay idle until someone is listening.
//!
//! ## Invariants
//! - **Snapshot Delivery**: `fire` copies the listener list and calls it outside the lock.
//! - **Ordered Hooks**: first/last hooks of one emitter never interleave.
//! - **Terminal Dispose**: a disposed emitter drops every listener and accepts no new ones.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::task::Context;
use std::task::Poll;

use futures::Stream;
use tokio::sync::mpsc;

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;
type Hook<T> = Box<dyn Fn(&Emitter<T>) + Send + Sync>;

fn lock<X>(m: &Mutex<X>) -> MutexGuard<'_, X> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Listeners<T> {
    next_id: u64,
    entries: Vec<(u64, Listener<T>)>,
    disposed: bool,
}

struct Shared<T> {
    listeners: Mutex<Listeners<T>>,
    /// Serializes attach/detach together with their hooks.
    gate: Mutex<()>,
    on_first: Option<Hook<T>>,
    on_last: Option<Hook<T>>,
}

/// The firing side of an event.
pub struct Emitter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<T: Clone + Send + 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = lock(&self.shared.listeners);
        f.debug_struct("Emitter")
            .field("listeners", &listeners.entries.len())
            .field("disposed", &listeners.disposed)
            .finish()
    }
}

impl<T: Clone + Send + 'static> Emitter<T> {
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// An emitter that calls `on_first` when its listener count goes from
    /// zero to one, and `on_last` when it drops back to zero.
    pub fn with_hooks(
        on_first: impl Fn(&Emitter<T>) + Send + Sync + 'static,
        on_last: impl Fn(&Emitter<T>) + Send + Sync + 'static,
    ) -> Self {
        Self::build(Some(Box::new(on_first)), Some(Box::new(on_last)))
    }

    fn build(on_first: Option<Hook<T>>, on_last: Option<Hook<T>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                listeners: Mutex::new(Listeners { next_id: 0, entries: Vec::new(), disposed: false }),
                gate: Mutex::new(()),
                on_first,
                on_last,
            }),
        }
    }

    /// The subscribable view of this emitter.
    pub fn event(&self) -> Event<T> {
        Event { shared: self.shared.clone() }
    }

    /// Delivers `value` to every current listener, in attach order.
    pub fn fire(&self, value: T) {
        let snapshot: Vec<Listener<T>> = {
            let listeners = lock(&self.shared.listeners);
            listeners.entries.iter().map(|(_, l)| l.clone()).collect()
        };
        for listener in snapshot {
            listener(&value);
        }
    }

    pub fn has_listeners(&self) -> bool {
        !lock(&self.shared.listeners).entries.is_empty()
    }

    /// Detaches every listener without running hooks. Streams end.
    pub fn dispose(&self) {
        let dropped = {
            let mut listeners = lock(&self.shared.listeners);
            listeners.disposed = true;
            std::mem::take(&mut listeners.entries)
        };
        drop(dropped);
    }

    pub fn is_disposed(&self) -> bool {
        lock(&self.shared.listeners).disposed
    }

    pub fn downgrade(&self) -> WeakEmitter<T> {
        WeakEmitter { shared: Arc::downgrade(&self.shared) }
    }
}

/// A non-owning handle to an emitter, for use inside its own hooks.
pub struct WeakEmitter<T> {
    shared: Weak<Shared<T>>,
}

impl<T> Clone for WeakEmitter<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<T> WeakEmitter<T> {
    pub fn upgrade(&self) -> Option<Emitter<T>> {
        self.shared.upgrade().map(|shared| Emitter { shared })
    }
}

/// The subscribable side of an event.
pub struct Event<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone() }
    }
}

impl<T> std::fmt::Debug for Event<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> Event<T> {
    /// An event that never fires.
    pub fn never() -> Self {
        let emitter = Emitter::new();
        emitter.dispose();
        emitter.event()
    }

    /// Attaches a callback. Dropping the returned `Subscription` detaches it.
    pub fn on(&self, f: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let _gate = lock(&self.shared.gate);
            let (id, first) = {
                let mut listeners = lock(&self.shared.listeners);
                if listeners.disposed {
                    return Subscription::inert();
                }
                listeners.next_id += 1;
                let id = listeners.next_id;
                let listener: Listener<T> = Arc::new(f);
                listeners.entries.push((id, listener));
                (id, listeners.entries.len() == 1)
            };
            if first {
                if let Some(hook) = &self.shared.on_first {
                    hook(&Emitter { shared: self.shared.clone() });
                }
            }
            id
        };

        let shared = self.shared.clone();
        Subscription { detach: Some(Box::new(move || detach(&shared, id))) }
    }

    /// Buffers every fired value into a `Stream`. The stream ends when the
    /// emitter is disposed.
    pub fn stream(&self) -> EventStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.on(move |value: &T| {
            let _ = tx.send(value.clone());
        });
        EventStream { rx, _subscription: subscription }
    }

    /// An event that forwards only values matching `predicate`.
    ///
    /// The upstream listener is attached lazily, while the filtered event has listeners.
    pub fn filter(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Event<T> {
        let upstream = self.clone();
        let predicate = Arc::new(predicate);
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let release = slot.clone();

        let emitter = Emitter::with_hooks(
            move |emitter: &Emitter<T>| {
                let downstream = emitter.downgrade();
                let predicate = predicate.clone();
                let subscription = upstream.on(move |value: &T| {
                    if predicate(value) {
                        if let Some(emitter) = downstream.upgrade() {
                            emitter.fire(value.clone());
                        }
                    }
                });
                *lock(&*slot) = Some(subscription);
            },
            move |_| {
                let released = lock(&*release).take();
                drop(released);
            },
        );
        emitter.event()
    }
}

fn detach<T>(shared: &Arc<Shared<T>>, id: u64) {
    let _gate = lock(&shared.gate);
    let (last, removed) = {
        let mut listeners = lock(&shared.listeners);
        let before = listeners.entries.len();
        let removed: Vec<_> = listeners.entries.iter().filter(|(i, _)| *i == id).cloned().collect();
        listeners.entries.retain(|(i, _)| *i != id);
        let last = before != listeners.entries.len() && listeners.entries.is_empty() && !listeners.disposed;
        (last, removed)
    };
    drop(removed);
    if last {
        if let Some(hook) = &shared.on_last {
            hook(&Emitter { shared: shared.clone() });
        }
    }
}

/// A handle to an attached listener. Keeps the event it listens to alive.
///
/// Detaches on drop; `dispose` makes the intent explicit.
#[must_use = "dropping a Subscription detaches its listener"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// A subscription attached to nothing.
    pub fn inert() -> Self {
        Self { detach: None }
    }

    pub fn dispose(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("attached", &self.detach.is_some()).finish()
    }
}

/// Values fired on an event, as a `futures::Stream`.
pub struct EventStream<T> {
    rx: mpsc::UnboundedReceiver<T>,
    _subscription: Subscription,
}

impl<T> EventStream<T> {
    /// Waits for the next value; `None` once the event is disposed.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Returns a value if one is already buffered.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Stream for EventStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}
