//! Nostr relay implementation for OpenAgents
//!
//! This crate provides a Nostr relay built from two pieces:
//! - An event-cascade kernel: every protocol step is an [`Envelope`] emitted
//!   on a [`Dispatcher`], and any listener may cancel it to suppress the
//!   default behavior further down the chain
//! - An in-memory [`EventStore`] indexed by creation time, queried with
//!   NIP-01 filters
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │     WebSocket Server (tokio-tungstenite)    │
//! └─────────────────┬───────────────────────────┘
//!                   │ KernelCommand
//! ┌─────────────────▼───────────────────────────┐
//! │        Relay kernel (single thread)         │
//! │   server dispatcher, session registry       │
//! └─────────────────┬───────────────────────────┘
//!                   │
//!   ┌───────────────┼───────────────┐
//!   ▼               ▼               ▼
//! ┌─────────┐  ┌─────────┐  ┌──────────────┐
//! │ Session │  │ Session │  │ Event store  │
//! │ plugins │  │ plugins │  │ time buckets │
//! └─────────┘  └─────────┘  └──────────────┘
//! ```
//!
//! A session's plugins turn raw frames into typed envelopes:
//! `TransportData` → `Message` → `Inbound` → `SubmitEvent` / `Req` /
//! `Unsubscribe` → `EventReceived` → `Stored` → `Broadcast`, with the
//! client-visible `OK`, `EOSE`, `CLOSED` and `NOTICE` replies composed from
//! the outcomes.

mod codec;
mod command_result;
mod config;
mod deletion;
mod dispatcher;
mod envelope;
mod error;
mod filter;
mod ingest;
mod lifecycle;
mod metrics;
mod protocol;
mod relay;
mod relay_info;
mod scheduler;
mod server;
mod session;
mod store;
mod subscription;
mod validation;

#[cfg(test)]
mod tests;

pub use codec::text_codec;
pub use config::{
    DEFAULT_MAX_FILTERS, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MAX_SUBSCRIPTIONS, DEFAULT_PORT,
    InfoConfig, RelayConfig,
};
pub use deletion::Tombstones;
pub use dispatcher::{Binding, DEFAULT_MAX_LISTENERS, Dispatcher, WeakDispatcher};
pub use envelope::{
    Envelope, EnvelopeBuilder, EventType, Originator, Payload, SessionError, StoredEvent,
};
pub use error::{RelayError, Result};
pub use filter::{Filter, FilterError, matches_any, parse_filters};
pub use lifecycle::{Lifecycle, Plugin, plugin};
pub use metrics::{MetricsSnapshot, RelayMetrics, count_envelopes};
pub use protocol::{
    BadMessage, ClientMessage, DELETED_PREFIX, DUPLICATE_PREFIX, ERROR_PREFIX, INVALID_PREFIX,
    MessageError, RelayMessage, ReqRequest,
};
pub use relay::{Relay, RelayContext};
pub use relay_info::{Limitation, RelayInformation};
pub use scheduler::Scheduler;
pub use server::{KernelCommand, Outbound, RelayServer};
pub use session::{
    Frame, Handshake, Session, Transport, TransportError, TransportEvent, TransportHandle,
    WeakSession,
};
pub use store::EventStore;
pub use subscription::{Subscription, SubscriptionManager, SubscriptionState};
pub use validation::{
    EventVerifier, MAX_SUBSCRIPTION_ID_LENGTH, SchnorrVerifier, ValidationError,
    validate_event_structure, validate_subscription_id,
};
