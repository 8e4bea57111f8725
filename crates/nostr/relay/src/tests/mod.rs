//! End-to-end tests that drive a [`Relay`](crate::Relay) through mock transports.

mod filter_properties;
mod scenarios;

use crate::config::RelayConfig;
use crate::relay::Relay;
use crate::session::mock::MockTransport;
use crate::session::{Frame, Handshake, TransportEvent, TransportHandle};
use nostr::{Event, EventTemplate, finalize_event, generate_secret_key};
use serde_json::Value;
use std::rc::Rc;

/// A connected relay plus helpers to talk to it as a client.
pub(crate) struct Harness {
    pub relay: Relay,
    next_handle: std::cell::Cell<u64>,
}

pub(crate) struct Client {
    pub handle: TransportHandle,
    pub transport: Rc<MockTransport>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_relay(Relay::new(RelayConfig::default()))
    }

    pub fn with_relay(relay: Relay) -> Self {
        relay.connect();
        Self {
            relay,
            next_handle: std::cell::Cell::new(0),
        }
    }

    pub fn client(&self) -> Client {
        let handle = TransportHandle(self.next_handle.get() + 1);
        self.next_handle.set(handle.0);
        let transport = Rc::new(MockTransport::default());
        self.relay
            .accept(handle, Handshake::default(), transport.clone())
            .unwrap();
        Client { handle, transport }
    }

    /// Deliver `message` from `client` and run every deferred stage.
    pub fn send(&self, client: &Client, message: Value) {
        self.send_frame(client, Frame::text(message.to_string()));
    }

    pub fn send_frame(&self, client: &Client, frame: Frame) {
        self.relay
            .handle(client.handle, TransportEvent::Data(frame))
            .unwrap();
        self.relay.run_pending();
    }
}

impl Client {
    /// Everything written to this client since the last call, as JSON.
    pub fn received(&self) -> Vec<Value> {
        self.transport
            .take()
            .iter()
            .map(|frame| serde_json::from_slice(&frame.data).unwrap())
            .collect()
    }
}

pub(crate) fn signed_event(kind: u16, tags: Vec<Vec<String>>, content: &str, created_at: u64) -> Event {
    signed_event_with_key(&generate_secret_key(), kind, tags, content, created_at)
}

pub(crate) fn signed_event_with_key(
    secret_key: &[u8; 32],
    kind: u16,
    tags: Vec<Vec<String>>,
    content: &str,
    created_at: u64,
) -> Event {
    let template = EventTemplate {
        kind,
        tags,
        content: content.to_string(),
        created_at,
    };
    finalize_event(&template, secret_key).unwrap()
}

pub(crate) fn event_json(event: &Event) -> Value {
    serde_json::to_value(event).unwrap()
}
