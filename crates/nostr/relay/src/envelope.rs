//! Envelopes: the records that flow through a [`Dispatcher`](crate::Dispatcher).
//!
//! An envelope is created once per occurrence and never mutated afterwards,
//! except for its one-way cancel flag. Envelopes caused by another envelope keep
//! a reference to it as their parent, so every chain of protocol stages forms a
//! causal tree rooted at the transport notification that started it.

use crate::dispatcher::{Dispatcher, WeakDispatcher};
use crate::protocol::{BadMessage, RelayMessage, ReqRequest};
use crate::relay_info::RelayInformation;
use crate::session::{Frame, Session, TransportHandle};
use nostr::Event;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Tag identifying the shape of an envelope's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventType {
    /// Meta envelope announcing that another envelope is about to be dispatched
    Dispatch,
    TransportData,
    TransportClosed,
    Message,
    Close,
    Disconnect,
    Send,
    Inbound,
    SubmitEvent,
    Req,
    Unsubscribe,
    BadMessage,
    EventReceived,
    Stored,
    Duplicate,
    Deleted,
    SubscriptionNotFound,
    Outgoing,
    Connected,
    SessionError,
    SessionClosed,
    Broadcast,
    ServeInfo,
}

impl EventType {
    /// Every event type, in declaration order.
    pub const ALL: [EventType; 23] = [
        EventType::Dispatch,
        EventType::TransportData,
        EventType::TransportClosed,
        EventType::Message,
        EventType::Close,
        EventType::Disconnect,
        EventType::Send,
        EventType::Inbound,
        EventType::SubmitEvent,
        EventType::Req,
        EventType::Unsubscribe,
        EventType::BadMessage,
        EventType::EventReceived,
        EventType::Stored,
        EventType::Duplicate,
        EventType::Deleted,
        EventType::SubscriptionNotFound,
        EventType::Outgoing,
        EventType::Connected,
        EventType::SessionError,
        EventType::SessionClosed,
        EventType::Broadcast,
        EventType::ServeInfo,
    ];

    /// Position in [`EventType::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Dispatch => "dispatch",
            EventType::TransportData => "transport-data",
            EventType::TransportClosed => "transport-closed",
            EventType::Message => "message",
            EventType::Close => "close",
            EventType::Disconnect => "disconnect",
            EventType::Send => "send",
            EventType::Inbound => "inbound",
            EventType::SubmitEvent => "submit-event",
            EventType::Req => "req",
            EventType::Unsubscribe => "unsubscribe",
            EventType::BadMessage => "bad-message",
            EventType::EventReceived => "event-received",
            EventType::Stored => "stored",
            EventType::Duplicate => "duplicate",
            EventType::Deleted => "deleted",
            EventType::SubscriptionNotFound => "subscription-not-found",
            EventType::Outgoing => "outgoing",
            EventType::Connected => "connected",
            EventType::SessionError => "session-error",
            EventType::SessionClosed => "session-closed",
            EventType::Broadcast => "broadcast",
            EventType::ServeInfo => "serve-info",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event that made it into the store, with the store revision it was assigned.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub event: Arc<Event>,
    pub revision: u64,
}

/// Session-level failures reported on the server dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    DuplicateTransport(TransportHandle),
}

/// What an envelope carries. The variant decides the envelope's [`EventType`].
#[derive(Debug)]
pub enum Payload {
    /// Wraps the envelope that is about to be dispatched
    Dispatch(Envelope),

    /// Raw bytes from the transport
    TransportData(Frame),
    /// Raw close notification from the transport
    TransportClosed,
    /// A complete message received on the session
    Message(Frame),
    /// The connection is closing; cancel to keep the session alive
    Close,
    /// Tear the session down
    Disconnect,
    /// Write a frame to the transport
    Send(Frame),

    /// A decoded but unvalidated wire message
    Inbound(Value),
    /// `["EVENT", <event>]` before event validation
    SubmitEvent(Value),
    /// `["REQ", <id>, <filter>...]`
    Req(ReqRequest),
    /// `["CLOSE", <id>]`
    Unsubscribe(String),
    /// A message or event that failed validation
    BadMessage(BadMessage),

    /// A structurally valid event awaiting deduplication and storage
    EventReceived(Arc<Event>),
    Stored(StoredEvent),
    Duplicate(Arc<Event>),
    /// Rejected because its author deleted it earlier
    Deleted(Arc<Event>),
    SubscriptionNotFound(String),

    /// A protocol message for the client, before encoding
    Outgoing(RelayMessage),

    /// A new session, before its plugins attach
    Connected(Session),
    SessionError(SessionError),
    SessionClosed(TransportHandle),
    /// A stored event to fan out to other sessions
    Broadcast(StoredEvent),
    /// The information document about to be served; listeners may edit it
    ServeInfo(RefCell<RelayInformation>),
}

impl Payload {
    pub fn event_type(&self) -> EventType {
        match self {
            Payload::Dispatch(_) => EventType::Dispatch,
            Payload::TransportData(_) => EventType::TransportData,
            Payload::TransportClosed => EventType::TransportClosed,
            Payload::Message(_) => EventType::Message,
            Payload::Close => EventType::Close,
            Payload::Disconnect => EventType::Disconnect,
            Payload::Send(_) => EventType::Send,
            Payload::Inbound(_) => EventType::Inbound,
            Payload::SubmitEvent(_) => EventType::SubmitEvent,
            Payload::Req(_) => EventType::Req,
            Payload::Unsubscribe(_) => EventType::Unsubscribe,
            Payload::BadMessage(_) => EventType::BadMessage,
            Payload::EventReceived(_) => EventType::EventReceived,
            Payload::Stored(_) => EventType::Stored,
            Payload::Duplicate(_) => EventType::Duplicate,
            Payload::Deleted(_) => EventType::Deleted,
            Payload::SubscriptionNotFound(_) => EventType::SubscriptionNotFound,
            Payload::Outgoing(_) => EventType::Outgoing,
            Payload::Connected(_) => EventType::Connected,
            Payload::SessionError(_) => EventType::SessionError,
            Payload::SessionClosed(_) => EventType::SessionClosed,
            Payload::Broadcast(_) => EventType::Broadcast,
            Payload::ServeInfo(_) => EventType::ServeInfo,
        }
    }
}

/// Opaque identity a component stamps on envelopes it emits, so it can
/// recognize and skip them when they come back around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Originator(u64);

impl Originator {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for Originator {
    fn default() -> Self {
        Self::new()
    }
}

struct EnvelopeInner {
    payload: Payload,
    parent: Option<Envelope>,
    originator: Option<Originator>,
    target: Option<WeakDispatcher>,
    canceled: Cell<bool>,
}

/// Shared handle to one envelope. Clones refer to the same envelope and the same cancel flag.
#[derive(Clone)]
pub struct Envelope {
    inner: Rc<EnvelopeInner>,
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self::builder(payload).build()
    }

    pub fn builder(payload: Payload) -> EnvelopeBuilder {
        EnvelopeBuilder {
            payload,
            parent: None,
            originator: None,
            target: None,
        }
    }

    /// A new envelope caused by this one.
    pub fn child(&self, payload: Payload) -> Self {
        Self::builder(payload).parent(self).build()
    }

    pub fn event_type(&self) -> EventType {
        self.inner.payload.event_type()
    }

    pub fn payload(&self) -> &Payload {
        &self.inner.payload
    }

    pub fn parent(&self) -> Option<&Envelope> {
        self.inner.parent.as_ref()
    }

    /// Parent, grandparent, and so on up to the root.
    pub fn ancestors(&self) -> impl Iterator<Item = &Envelope> {
        std::iter::successors(self.parent(), |envelope| envelope.parent())
    }

    pub fn originator(&self) -> Option<Originator> {
        self.inner.originator
    }

    /// The dispatcher this envelope is meant for, if it is still alive.
    pub fn target(&self) -> Option<Dispatcher> {
        self.inner.target.as_ref().and_then(WeakDispatcher::upgrade)
    }

    /// Suppress the default action for this envelope. Idempotent; never clears.
    pub fn cancel(&self) {
        self.inner.canceled.set(true);
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.get()
    }

    pub fn ptr_eq(&self, other: &Envelope) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("type", &self.event_type())
            .field("canceled", &self.is_canceled())
            .field("has_parent", &self.inner.parent.is_some())
            .field("originator", &self.inner.originator)
            .finish()
    }
}

pub struct EnvelopeBuilder {
    payload: Payload,
    parent: Option<Envelope>,
    originator: Option<Originator>,
    target: Option<WeakDispatcher>,
}

impl EnvelopeBuilder {
    pub fn parent(mut self, parent: &Envelope) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn originator(mut self, originator: Originator) -> Self {
        self.originator = Some(originator);
        self
    }

    pub fn target(mut self, dispatcher: &Dispatcher) -> Self {
        self.target = Some(dispatcher.downgrade());
        self
    }

    pub fn build(self) -> Envelope {
        Envelope {
            inner: Rc::new(EnvelopeInner {
                payload: self.payload,
                parent: self.parent,
                originator: self.originator,
                target: self.target,
                canceled: Cell::new(false),
            }),
        }
    }
}
