//! The relay: shared state, the server dispatcher and session bookkeeping.
//!
//! Everything here runs on one thread. The host feeds transport notifications
//! in through [`Relay::handle`] and then drains the deferral queue with
//! [`Relay::run_pending`].

use crate::codec;
use crate::command_result;
use crate::config::RelayConfig;
use crate::deletion::{self, Tombstones};
use crate::dispatcher::{Binding, Dispatcher};
use crate::envelope::{Envelope, EventType, Payload, SessionError};
use crate::error::{RelayError, Result};
use crate::ingest;
use crate::lifecycle::{Lifecycle, Plugin, plugin};
use crate::metrics::{self, RelayMetrics};
use crate::protocol;
use crate::relay_info::{self, RelayInformation};
use crate::scheduler::Scheduler;
use crate::session::{Handshake, Session, Transport, TransportEvent, TransportHandle};
use crate::store::EventStore;
use crate::subscription;
use std::cell::{RefCell, RefMut};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// NIPs every relay built here implements.
const CORE_NIPS: &[u16] = &[1, 11];
const DELETION_NIPS: &[u16] = &[9];

/// State shared by every session of one relay.
pub struct RelayContext {
    pub config: RelayConfig,
    pub store: RefCell<EventStore>,
    /// Ids accepted during this process's lifetime
    pub seen: RefCell<HashSet<String>>,
    pub tombstones: RefCell<Tombstones>,
    /// Server-level dispatcher for broadcasts and session lifecycle
    pub server: Dispatcher,
    pub metrics: Arc<RelayMetrics>,
}

struct RelayInner {
    context: Rc<RelayContext>,
    scheduler: Scheduler,
    sessions: RefCell<HashMap<TransportHandle, Session>>,
    session_plugins: RefCell<Vec<Plugin<Session>>>,
    lifecycle: Lifecycle<Relay>,
}

#[derive(Clone)]
pub struct Relay {
    inner: Rc<RelayInner>,
}

impl Relay {
    /// A relay with an in-memory, signature-verifying store. Call
    /// [`connect`](Relay::connect) to attach the server plugins.
    pub fn new(config: RelayConfig) -> Self {
        Self::with_store(config, EventStore::new())
    }

    pub fn with_store(config: RelayConfig, store: EventStore) -> Self {
        let scheduler = Scheduler::new();
        let server = Dispatcher::with_scheduler("server", scheduler.clone());
        // One Broadcast listener per session.
        server.set_max_listeners(None);

        let context = Rc::new(RelayContext {
            config,
            store: RefCell::new(store),
            seen: RefCell::new(HashSet::new()),
            tombstones: RefCell::new(Tombstones::new()),
            server,
            metrics: Arc::new(RelayMetrics::new()),
        });

        let session_plugins = default_session_plugins(&context);
        Self {
            inner: Rc::new(RelayInner {
                context,
                scheduler,
                sessions: RefCell::new(HashMap::new()),
                session_plugins: RefCell::new(session_plugins),
                lifecycle: Lifecycle::with_plugins(server_plugins()),
            }),
        }
    }

    pub fn context(&self) -> &Rc<RelayContext> {
        &self.inner.context
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.context.config
    }

    /// The server-level dispatcher.
    pub fn server(&self) -> &Dispatcher {
        &self.inner.context.server
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn metrics(&self) -> Arc<RelayMetrics> {
        Arc::clone(&self.inner.context.metrics)
    }

    pub fn store(&self) -> RefMut<'_, EventStore> {
        self.inner.context.store.borrow_mut()
    }

    /// Attach the server plugins. Idempotent.
    pub fn connect(&self) {
        self.inner.lifecycle.connect(self);
    }

    pub fn disconnect(&self) {
        self.inner.lifecycle.disconnect();
    }

    /// Add a plugin to every session accepted from now on, after the defaults.
    pub fn add_session_plugin(&self, plugin: Plugin<Session>) {
        self.inner.session_plugins.borrow_mut().push(plugin);
    }

    /// Add a server-level plugin; attaches on the next `connect`.
    pub fn add_plugin(&self, plugin: Plugin<Relay>) {
        self.inner.lifecycle.add_plugin(plugin);
    }

    /// Create and connect a session for a new transport connection.
    ///
    /// `Connected` is emitted on the server dispatcher before the session's
    /// plugins attach, so its listeners can get ahead of the defaults.
    pub fn accept(
        &self,
        handle: TransportHandle,
        handshake: Handshake,
        transport: Rc<dyn Transport>,
    ) -> Result<Session> {
        if self.inner.sessions.borrow().contains_key(&handle) {
            warn!("Rejected duplicate session for transport {}", handle);
            self.server().emit_payload(Payload::SessionError(SessionError::DuplicateTransport(
                handle,
            )))?;
            return Err(RelayError::DuplicateSession(handle));
        }

        let session = Session::new(handle, handshake, transport, self.inner.scheduler.clone());
        for plugin in self.inner.session_plugins.borrow().iter() {
            session.add_plugin(Rc::clone(plugin));
        }
        session.add_plugin(self.registry_cleanup());

        self.inner
            .sessions
            .borrow_mut()
            .insert(handle, session.clone());
        debug!("Session {} accepted", handle);

        self.server().emit(
            Envelope::builder(Payload::Connected(session.clone()))
                .target(self.server())
                .build(),
        )?;
        session.connect();
        Ok(session)
    }

    /// Route a transport notification to its session.
    pub fn handle(&self, handle: TransportHandle, event: TransportEvent) -> Result<()> {
        let Some(session) = self.session(handle) else {
            debug!("Dropping {:?} for unknown transport {}", event, handle);
            return Ok(());
        };
        session.receive(event)?;
        Ok(())
    }

    /// Drain the deferral queue. Returns how many tasks ran.
    pub fn run_pending(&self) -> usize {
        self.inner.scheduler.drain()
    }

    /// Ask a session to disconnect. Listeners may still cancel it.
    pub fn disconnect_session(&self, handle: TransportHandle) -> Result<bool> {
        let Some(session) = self.session(handle) else {
            return Ok(false);
        };
        session.emit(Payload::Disconnect)?;
        Ok(true)
    }

    pub fn session(&self, handle: TransportHandle) -> Option<Session> {
        self.inner.sessions.borrow().get(&handle).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.borrow().len()
    }

    /// The NIP-11 document, after `ServeInfo` listeners have edited it.
    pub fn information_document(&self) -> Result<RelayInformation> {
        let base = RelayInformation::from_config(self.config());
        let envelope = self.server().emit(
            Envelope::builder(Payload::ServeInfo(RefCell::new(base)))
                .target(self.server())
                .build(),
        )?;
        match envelope.payload() {
            Payload::ServeInfo(info) => Ok(info.borrow().clone()),
            _ => unreachable!("ServeInfo envelope changed payload"),
        }
    }

    /// Drop the session from the registry once it really disconnects.
    fn registry_cleanup(&self) -> Plugin<Session> {
        let relay = Rc::downgrade(&self.inner);
        plugin(move |session: &Session| {
            let relay: Weak<RelayInner> = relay.clone();
            let handle = session.handle();
            session
                .dispatcher()
                .on(EventType::Disconnect, move |envelope, _| {
                    if envelope.is_canceled() {
                        return Ok(());
                    }
                    let Some(inner) = relay.upgrade() else {
                        return Ok(());
                    };
                    if inner.sessions.borrow_mut().remove(&handle).is_some() {
                        info!("Session {} closed", handle);
                        let server = &inner.context.server;
                        server.defer_emit(
                            Envelope::builder(Payload::SessionClosed(handle))
                                .parent(envelope)
                                .target(server)
                                .build(),
                        );
                    }
                    Ok(())
                })
        })
    }
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("sessions", &self.session_count())
            .field("store", &*self.inner.context.store.borrow())
            .finish()
    }
}

/// Session plugins in attach order. Order matters: every stage's default
/// listener must come after anything that may want to claim the envelope.
fn default_session_plugins(context: &Rc<RelayContext>) -> Vec<Plugin<Session>> {
    let max_message_size = context.config.max_message_size;
    let with_context = |f: fn(&Session, Rc<RelayContext>) -> Binding| -> Plugin<Session> {
        let context = Rc::clone(context);
        plugin(move |session: &Session| f(session, Rc::clone(&context)))
    };

    let mut plugins = vec![
        plugin(move |session: &Session| codec::text_codec(session, max_message_size)),
        plugin(protocol::message_structure),
        plugin(ingest::event_validation),
        with_context(deletion::tombstone_check),
        with_context(ingest::dedup),
        with_context(ingest::store),
        with_context(deletion::apply_deletions),
        with_context(ingest::broadcast),
    ];
    plugins.extend(command_result::plugins());
    plugins.push(with_context(subscription::subscription_engine));
    plugins.push({
        let metrics = Arc::clone(&context.metrics);
        plugin(move |session: &Session| {
            metrics::count_envelopes(session.dispatcher(), Arc::clone(&metrics))
        })
    });
    plugins
}

fn server_plugins() -> Vec<Plugin<Relay>> {
    vec![
        plugin(|relay: &Relay| relay_info::advertise(relay.server(), CORE_NIPS)),
        plugin(|relay: &Relay| relay_info::advertise(relay.server(), DELETION_NIPS)),
        plugin(|relay: &Relay| metrics::count_envelopes(relay.server(), relay.metrics())),
        plugin(|relay: &Relay| {
            relay.server().on(EventType::SessionError, |envelope, _| {
                if let Payload::SessionError(error) = envelope.payload() {
                    warn!("Session error: {:?}", error);
                }
                Ok(())
            })
        }),
    ]
}
