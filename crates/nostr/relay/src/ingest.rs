//! EVENT ingestion.
//!
//! `SubmitEvent` is checked for structure and becomes `EventReceived`. The
//! tombstone, dedup and store plugins see it in registration order, and the
//! first to claim it cancels it: a seen id becomes `Duplicate`, otherwise the
//! store verifies the signature and emits `Stored` or `BadMessage`. Stored
//! events are re-emitted on the server dispatcher as `Broadcast`.

use crate::dispatcher::Binding;
use crate::envelope::{Envelope, EventType, Payload};
use crate::protocol::BadMessage;
use crate::relay::RelayContext;
use crate::session::Session;
use crate::validation::validate_event_structure;
use serde_json::Value;
use std::rc::Rc;
use std::sync::Arc;
use tracing::{debug, info};

/// `SubmitEvent` to `EventReceived` or `BadMessage`.
pub fn event_validation(session: &Session) -> Binding {
    session
        .dispatcher()
        .on(EventType::SubmitEvent, |envelope, dispatcher| {
            if envelope.is_canceled() {
                return Ok(());
            }
            let Payload::SubmitEvent(value) = envelope.payload() else {
                return Ok(());
            };
            let payload = match validate_event_structure(value) {
                Ok(event) => Payload::EventReceived(Arc::new(event)),
                Err(e) => Payload::BadMessage(BadMessage::for_event(e, claimed_id(value))),
            };
            dispatcher.defer_emit(envelope.child(payload));
            Ok(())
        })
}

/// Claim events whose id was already accepted during this process's lifetime.
pub fn dedup(session: &Session, context: Rc<RelayContext>) -> Binding {
    session
        .dispatcher()
        .on(EventType::EventReceived, move |envelope, dispatcher| {
            if envelope.is_canceled() {
                return Ok(());
            }
            let Payload::EventReceived(event) = envelope.payload() else {
                return Ok(());
            };
            if context.seen.borrow().contains(&event.id) {
                debug!("Duplicate event {}", event.id);
                envelope.cancel();
                dispatcher.defer_emit(envelope.child(Payload::Duplicate(Arc::clone(event))));
            }
            Ok(())
        })
}

/// Verify and store unclaimed events.
pub fn store(session: &Session, context: Rc<RelayContext>) -> Binding {
    session
        .dispatcher()
        .on(EventType::EventReceived, move |envelope, dispatcher| {
            if envelope.is_canceled() {
                return Ok(());
            }
            let Payload::EventReceived(event) = envelope.payload() else {
                return Ok(());
            };

            let outcome = context.store.borrow_mut().insert(Arc::clone(event));
            let payload = match outcome {
                Ok(Some(stored)) => {
                    context.seen.borrow_mut().insert(event.id.clone());
                    info!("Stored event {} (kind {})", event.id, event.kind);
                    Payload::Stored(stored)
                }
                Ok(None) => {
                    context.seen.borrow_mut().insert(event.id.clone());
                    Payload::Duplicate(Arc::clone(event))
                }
                Err(e) => {
                    debug!("Rejected event {}: {}", event.id, e);
                    Payload::BadMessage(BadMessage::for_event(e, Some(event.id.clone())))
                }
            };
            envelope.cancel();
            dispatcher.defer_emit(envelope.child(payload));
            Ok(())
        })
}

/// Re-emit `Stored` on the server dispatcher, stamped with the session's originator.
pub fn broadcast(session: &Session, context: Rc<RelayContext>) -> Binding {
    let originator = session.originator();
    session
        .dispatcher()
        .on(EventType::Stored, move |envelope, _| {
            if envelope.is_canceled() {
                return Ok(());
            }
            let Payload::Stored(stored) = envelope.payload() else {
                return Ok(());
            };
            let broadcast = Envelope::builder(Payload::Broadcast(stored.clone()))
                .parent(envelope)
                .originator(originator)
                .target(&context.server)
                .build();
            context.server.defer_emit(broadcast);
            Ok(())
        })
}

/// The `id` a malformed event claims, for correlating the OK.
fn claimed_id(value: &Value) -> Option<String> {
    value
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
}
