//! Synchronous, single-threaded pub/sub core.
//!
//! Listeners are registered per [`EventType`] and run in registration order.
//! Before a non-meta envelope is dispatched, a [`Payload::Dispatch`] meta
//! envelope wrapping it goes to the meta listeners, which lets one listener
//! observe every event type without knowing the types up front.
//!
//! A listener returning `Err` aborts the current pass and the error comes back
//! out of [`Dispatcher::emit`]. Listeners turn recoverable problems into further
//! envelopes instead.

use crate::envelope::{Envelope, EventType, Payload};
use crate::error::Result;
use crate::scheduler::Scheduler;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};
use tracing::warn;

/// Listener ceiling per event type before a leak warning is logged.
pub const DEFAULT_MAX_LISTENERS: usize = 10;

type ListenerFn = dyn Fn(&Envelope, &Dispatcher) -> Result<()>;

/// Capability to undo an attachment: a listener, a plugin, or a group of them.
///
/// Calling [`disconnect`](Binding::disconnect) more than once is a no-op.
/// Dropping a binding does not disconnect it.
pub struct Binding {
    teardown: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl Binding {
    pub fn new<F: FnOnce() + 'static>(teardown: F) -> Self {
        Self {
            teardown: RefCell::new(Some(Box::new(teardown))),
        }
    }

    /// A binding with nothing to undo.
    pub fn noop() -> Self {
        Self {
            teardown: RefCell::new(None),
        }
    }

    /// Disconnect every binding in `bindings`, in order.
    pub fn all(bindings: Vec<Binding>) -> Self {
        Self::new(move || {
            for binding in &bindings {
                binding.disconnect();
            }
        })
    }

    pub fn disconnect(&self) {
        let teardown = self.teardown.borrow_mut().take();
        if let Some(teardown) = teardown {
            teardown();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.teardown.borrow().is_some()
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("connected", &self.is_connected())
            .finish()
    }
}

struct Registered {
    id: u64,
    listener: Rc<ListenerFn>,
}

struct DispatcherInner {
    name: String,
    listeners: RefCell<HashMap<EventType, Vec<Registered>>>,
    next_id: Cell<u64>,
    max_listeners: Cell<Option<usize>>,
    warned: RefCell<HashSet<EventType>>,
    leak_warnings: Cell<usize>,
    scheduler: Scheduler,
}

/// Cheap, clonable handle to a dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Rc<DispatcherInner>,
}

/// Non-owning dispatcher reference.
#[derive(Clone)]
pub struct WeakDispatcher {
    inner: Weak<DispatcherInner>,
}

impl WeakDispatcher {
    pub fn upgrade(&self) -> Option<Dispatcher> {
        self.inner.upgrade().map(|inner| Dispatcher { inner })
    }
}

impl Dispatcher {
    /// A dispatcher with its own deferral queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_scheduler(name, Scheduler::new())
    }

    /// A dispatcher sharing `scheduler` with other dispatchers.
    pub fn with_scheduler(name: impl Into<String>, scheduler: Scheduler) -> Self {
        Self {
            inner: Rc::new(DispatcherInner {
                name: name.into(),
                listeners: RefCell::new(HashMap::new()),
                next_id: Cell::new(0),
                max_listeners: Cell::new(Some(DEFAULT_MAX_LISTENERS)),
                warned: RefCell::new(HashSet::new()),
                leak_warnings: Cell::new(0),
                scheduler,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn downgrade(&self) -> WeakDispatcher {
        WeakDispatcher {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &Dispatcher) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// `None` disables the leak warning.
    pub fn set_max_listeners(&self, max: Option<usize>) {
        self.inner.max_listeners.set(max);
    }

    pub fn max_listeners(&self) -> Option<usize> {
        self.inner.max_listeners.get()
    }

    pub fn listener_count(&self, event_type: EventType) -> usize {
        self.inner
            .listeners
            .borrow()
            .get(&event_type)
            .map_or(0, Vec::len)
    }

    /// Event types that have crossed the listener ceiling, in order.
    pub fn warned_types(&self) -> Vec<EventType> {
        let mut types: Vec<EventType> = self.inner.warned.borrow().iter().copied().collect();
        types.sort();
        types
    }

    /// Listener-leak warnings logged so far.
    pub fn leak_warnings(&self) -> usize {
        self.inner.leak_warnings.get()
    }

    /// Register `listener` for `event_type`.
    pub fn on<F>(&self, event_type: EventType, listener: F) -> Binding
    where
        F: Fn(&Envelope, &Dispatcher) -> Result<()> + 'static,
    {
        let id = self.inner.next_id.get();
        self.inner.next_id.set(id + 1);

        let count = {
            let mut listeners = self.inner.listeners.borrow_mut();
            let entry = listeners.entry(event_type).or_default();
            entry.push(Registered {
                id,
                listener: Rc::new(listener),
            });
            entry.len()
        };

        if let Some(max) = self.inner.max_listeners.get()
            && count > max
            && self.inner.warned.borrow_mut().insert(event_type)
        {
            self.inner.leak_warnings.set(self.inner.leak_warnings.get() + 1);
            warn!(
                "Possible listener leak on dispatcher '{}': {} '{}' listeners (max {})",
                self.inner.name, count, event_type, max
            );
        }

        let weak = Rc::downgrade(&self.inner);
        Binding::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut listeners = inner.listeners.borrow_mut();
                if let Some(entry) = listeners.get_mut(&event_type) {
                    entry.retain(|registered| registered.id != id);
                    if entry.is_empty() {
                        listeners.remove(&event_type);
                    }
                }
            }
        })
    }

    /// Dispatch `envelope` synchronously and hand it back for inspection.
    pub fn emit(&self, envelope: Envelope) -> Result<Envelope> {
        if envelope.event_type() != EventType::Dispatch
            && self.listener_count(EventType::Dispatch) > 0
        {
            let meta = Envelope::builder(Payload::Dispatch(envelope.clone()))
                .target(self)
                .build();
            self.dispatch(&meta)?;
        }
        self.dispatch(&envelope)?;
        Ok(envelope)
    }

    /// Wrap `payload` in a fresh root envelope and emit it.
    pub fn emit_payload(&self, payload: Payload) -> Result<Envelope> {
        self.emit(Envelope::new(payload))
    }

    /// Emit `envelope` once the current call stack has unwound.
    ///
    /// Nothing happens if this dispatcher has been dropped by then.
    pub fn defer_emit(&self, envelope: Envelope) {
        let weak = self.downgrade();
        self.inner.scheduler.defer(move || {
            if let Some(dispatcher) = weak.upgrade() {
                dispatcher.emit(envelope)?;
            }
            Ok(())
        });
    }

    pub fn defer<F>(&self, task: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        self.inner.scheduler.defer(task);
    }

    /// Drop every listener registered on this dispatcher.
    pub fn remove_all_listeners(&self) {
        self.inner.listeners.borrow_mut().clear();
    }

    fn dispatch(&self, envelope: &Envelope) -> Result<()> {
        // Snapshot so removals during the pass do not affect it.
        let snapshot: Vec<Rc<ListenerFn>> = self
            .inner
            .listeners
            .borrow()
            .get(&envelope.event_type())
            .map(|entry| {
                entry
                    .iter()
                    .map(|registered| Rc::clone(&registered.listener))
                    .collect()
            })
            .unwrap_or_default();

        for listener in snapshot {
            listener(envelope, self)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners: usize = self.inner.listeners.borrow().values().map(Vec::len).sum();
        f.debug_struct("Dispatcher")
            .field("name", &self.inner.name)
            .field("listeners", &listeners)
            .finish()
    }
}
