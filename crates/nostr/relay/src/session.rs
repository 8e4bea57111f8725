//! Client sessions.
//!
//! One [`Session`] exists per accepted connection. It owns the transport, the
//! handshake metadata and its own [`Dispatcher`], and turns raw transport
//! notifications into protocol envelopes through four default plugins:
//!
//! 1. `TransportData` becomes `Message`
//! 2. `TransportClosed` becomes `Close`, and an uncanceled `Close` becomes `Disconnect`
//! 3. an uncanceled `Disconnect` tears the session down
//! 4. an uncanceled `Send` is written to the transport
//!
//! Listeners registered before [`Session::connect`] run ahead of the defaults
//! and may cancel any of these envelopes to substitute their own behavior.

use crate::dispatcher::{Binding, Dispatcher};
use crate::envelope::{Envelope, EventType, Originator, Payload};
use crate::lifecycle::{Lifecycle, Plugin, plugin};
use crate::protocol::RelayMessage;
use crate::scheduler::Scheduler;
use bytes::Bytes;
use std::cell::Cell;
use std::fmt;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use thiserror::Error;
use tracing::{debug, warn};

/// Identifies one transport connection for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportHandle(pub u64);

impl fmt::Display for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Metadata from the connection upgrade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    pub remote_addr: Option<SocketAddr>,
    /// Request path of the upgrade request
    pub path: String,
    pub user_agent: Option<String>,
}

/// One transport message.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Bytes,
    pub is_binary: bool,
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            data: Bytes::from(text.into()),
            is_binary: false,
        }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            is_binary: true,
        }
    }

    /// The payload as UTF-8, if it is a text frame with valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        if self.is_binary {
            return None;
        }
        std::str::from_utf8(&self.data).ok()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) => f.debug_tuple("Frame::Text").field(&text).finish(),
            None => f.debug_tuple("Frame::Binary").field(&self.data.len()).finish(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("transport write failed: {0}")]
    Write(String),
}

/// The connection a session writes to.
pub trait Transport {
    fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Close the connection. Called at most once per session.
    fn close(&self);
}

/// Raw notifications from a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Data(Frame),
    Closed,
}

struct SessionInner {
    handle: TransportHandle,
    handshake: Handshake,
    transport: Rc<dyn Transport>,
    dispatcher: Dispatcher,
    lifecycle: Lifecycle<Session>,
    originator: Originator,
    closed: Cell<bool>,
}

#[derive(Clone)]
pub struct Session {
    inner: Rc<SessionInner>,
}

/// Non-owning session reference, held by listeners to avoid cycles.
#[derive(Clone)]
pub struct WeakSession {
    inner: Weak<SessionInner>,
}

impl WeakSession {
    pub fn upgrade(&self) -> Option<Session> {
        self.inner.upgrade().map(|inner| Session { inner })
    }
}

impl Session {
    /// A new session with the default plugins installed but not yet attached.
    pub fn new(
        handle: TransportHandle,
        handshake: Handshake,
        transport: Rc<dyn Transport>,
        scheduler: Scheduler,
    ) -> Self {
        let dispatcher = Dispatcher::with_scheduler(format!("session {}", handle), scheduler);
        Self {
            inner: Rc::new(SessionInner {
                handle,
                handshake,
                transport,
                dispatcher,
                lifecycle: Lifecycle::with_plugins(default_plugins()),
                originator: Originator::new(),
                closed: Cell::new(false),
            }),
        }
    }

    pub fn handle(&self) -> TransportHandle {
        self.inner.handle
    }

    pub fn handshake(&self) -> &Handshake {
        &self.inner.handshake
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// Token stamped on envelopes this session re-emits at server level.
    pub fn originator(&self) -> Originator {
        self.inner.originator
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            inner: Rc::downgrade(&self.inner),
        }
    }

    pub fn ptr_eq(&self, other: &Session) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lifecycle.is_connected()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    /// Append a plugin after the ones already installed.
    pub fn add_plugin(&self, plugin: Plugin<Session>) {
        self.inner.lifecycle.add_plugin(plugin);
    }

    /// Attach the plugins. Does nothing if already connected or closed.
    pub fn connect(&self) {
        if self.is_closed() {
            return;
        }
        self.inner.lifecycle.connect(self);
    }

    /// Tear down immediately: detach every plugin, close the transport and
    /// release every listener. Idempotent.
    ///
    /// Prefer emitting a `Disconnect` envelope so other listeners see the teardown.
    pub fn disconnect(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        debug!("Session {} disconnected", self.inner.handle);
        self.inner.lifecycle.disconnect();
        self.inner.transport.close();
        self.inner.dispatcher.remove_all_listeners();
    }

    /// Feed a raw transport notification into the session.
    pub fn receive(&self, event: TransportEvent) -> crate::Result<Envelope> {
        let payload = match event {
            TransportEvent::Data(frame) => Payload::TransportData(frame),
            TransportEvent::Closed => Payload::TransportClosed,
        };
        self.emit(payload)
    }

    /// Emit a fresh root envelope on this session.
    pub fn emit(&self, payload: Payload) -> crate::Result<Envelope> {
        let envelope = Envelope::builder(payload)
            .target(&self.inner.dispatcher)
            .build();
        self.inner.dispatcher.emit(envelope)
    }

    /// Queue a protocol message for encoding and delivery.
    pub fn send_message(&self, message: RelayMessage) -> crate::Result<Envelope> {
        self.emit(Payload::Outgoing(message))
    }

    /// Like [`send_message`](Session::send_message), recording `cause` as the parent.
    pub fn reply(&self, cause: &Envelope, message: RelayMessage) -> crate::Result<Envelope> {
        let envelope = Envelope::builder(Payload::Outgoing(message))
            .parent(cause)
            .target(&self.inner.dispatcher)
            .build();
        self.inner.dispatcher.emit(envelope)
    }

    fn write(&self, frame: Frame) {
        if self.is_closed() {
            debug!("Dropping frame for closed session {}", self.inner.handle);
            return;
        }
        if let Err(e) = self.inner.transport.send(frame) {
            warn!("Failed to write to session {}: {}", self.inner.handle, e);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.inner.handle)
            .field("connected", &self.is_connected())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn default_plugins() -> Vec<Plugin<Session>> {
    vec![
        plugin(upgrade_transport_data),
        plugin(upgrade_transport_closed),
        plugin(disconnect_on_request),
        plugin(write_on_send),
    ]
}

fn upgrade_transport_data(session: &Session) -> Binding {
    session
        .dispatcher()
        .on(EventType::TransportData, |envelope, dispatcher| {
            if envelope.is_canceled() {
                return Ok(());
            }
            if let Payload::TransportData(frame) = envelope.payload() {
                dispatcher.defer_emit(envelope.child(Payload::Message(frame.clone())));
            }
            Ok(())
        })
}

fn upgrade_transport_closed(session: &Session) -> Binding {
    let dispatcher = session.dispatcher();
    let closed = dispatcher.on(EventType::TransportClosed, |envelope, dispatcher| {
        if !envelope.is_canceled() {
            dispatcher.defer_emit(envelope.child(Payload::Close));
        }
        Ok(())
    });
    let close = dispatcher.on(EventType::Close, |envelope, dispatcher| {
        if !envelope.is_canceled() {
            dispatcher.defer_emit(envelope.child(Payload::Disconnect));
        }
        Ok(())
    });
    Binding::all(vec![closed, close])
}

fn disconnect_on_request(session: &Session) -> Binding {
    let weak = session.downgrade();
    session
        .dispatcher()
        .on(EventType::Disconnect, move |envelope, _| {
            if !envelope.is_canceled()
                && let Some(session) = weak.upgrade()
            {
                session.disconnect();
            }
            Ok(())
        })
}

fn write_on_send(session: &Session) -> Binding {
    let weak = session.downgrade();
    session.dispatcher().on(EventType::Send, move |envelope, _| {
        if envelope.is_canceled() {
            return Ok(());
        }
        if let (Payload::Send(frame), Some(session)) = (envelope.payload(), weak.upgrade()) {
            session.write(frame.clone());
        }
        Ok(())
    })
}


#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;
    use std::cell::RefCell;

    fn session() -> (Session, Rc<MockTransport>, Scheduler) {
        let transport = Rc::new(MockTransport::default());
        let scheduler = Scheduler::new();
        let session = Session::new(
            TransportHandle(1),
            Handshake::default(),
            transport.clone(),
            scheduler.clone(),
        );
        (session, transport, scheduler)
    }

    #[test]
    fn test_transport_data_becomes_message() {
        let (session, _transport, scheduler) = session();
        let seen = Rc::new(RefCell::new(Vec::new()));
        {
            let seen = Rc::clone(&seen);
            session.dispatcher().on(EventType::Message, move |envelope, _| {
                if let Payload::Message(frame) = envelope.payload() {
                    assert_eq!(envelope.parent().unwrap().event_type(), EventType::TransportData);
                    seen.borrow_mut().push(frame.clone());
                }
                Ok(())
            });
        }
        session.connect();

        session
            .receive(TransportEvent::Data(Frame::text("hello")))
            .unwrap();
        assert!(seen.borrow().is_empty());

        scheduler.drain();
        assert_eq!(*seen.borrow(), vec![Frame::text("hello")]);
    }

    #[test]
    fn test_send_writes_to_transport() {
        let (session, transport, _) = session();
        session.connect();

        session.emit(Payload::Send(Frame::binary(vec![1u8, 2, 3]))).unwrap();
        assert_eq!(*transport.sent.borrow(), vec![Frame::binary(vec![1u8, 2, 3])]);
    }

    #[test]
    fn test_canceled_send_is_not_written() {
        let (session, transport, _) = session();
        session.dispatcher().on(EventType::Send, |envelope, _| {
            envelope.cancel();
            Ok(())
        });
        session.connect();

        let envelope = session.emit(Payload::Send(Frame::text("secret"))).unwrap();
        assert!(envelope.is_canceled());
        assert!(transport.sent.borrow().is_empty());
    }

    #[test]
    fn test_transport_close_cascades_to_disconnect() {
        let (session, transport, scheduler) = session();
        session.connect();

        session.receive(TransportEvent::Closed).unwrap();
        assert!(!session.is_closed());

        scheduler.drain();
        assert!(session.is_closed());
        assert!(!session.is_connected());
        assert!(transport.closed.get());
        assert_eq!(session.dispatcher().listener_count(EventType::Send), 0);
    }

    #[test]
    fn test_canceled_close_keeps_session_alive() {
        let (session, transport, scheduler) = session();
        session.dispatcher().on(EventType::Close, |envelope, _| {
            envelope.cancel();
            Ok(())
        });
        session.connect();

        session.receive(TransportEvent::Closed).unwrap();
        scheduler.drain();
        assert!(!session.is_closed());
        assert!(!transport.closed.get());
    }

    #[test]
    fn test_canceled_disconnect_keeps_session_alive() {
        let (session, _transport, scheduler) = session();
        session.dispatcher().on(EventType::Disconnect, |envelope, _| {
            envelope.cancel();
            Ok(())
        });
        session.connect();

        session.emit(Payload::Disconnect).unwrap();
        scheduler.drain();
        assert!(!session.is_closed());
        assert!(session.is_connected());
    }

    #[test]
    fn test_session_drop_releases_listeners() {
        let (session, _transport, scheduler) = session();
        session.connect();
        let weak = session.downgrade();

        session.receive(TransportEvent::Closed).unwrap();
        drop(session);
        scheduler.drain();
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_frame_text_view() {
        assert_eq!(Frame::text("[]").as_text(), Some("[]"));
        assert_eq!(Frame::binary(vec![b'[']).as_text(), None);
        assert_eq!(TransportHandle(7).to_string(), "#7");
    }
}
