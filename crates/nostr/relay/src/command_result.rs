//! Client-visible outcomes.
//!
//! Every terminal EVENT outcome gets exactly one `OK`. Each plugin below
//! listens for one outcome only; a `BadMessage` that carries an event id is
//! canceled by the `OK` plugin so the `NOTICE` fallback skips it.

use crate::dispatcher::Binding;
use crate::envelope::{EventType, Payload};
use crate::lifecycle::{Plugin, plugin};
use crate::protocol::{DELETED_PREFIX, DUPLICATE_PREFIX, INVALID_PREFIX, RelayMessage};
use crate::session::Session;

/// The command-result plugins, in the order they must attach.
pub fn plugins() -> Vec<Plugin<Session>> {
    vec![
        plugin(|session: &Session| {
            ok_on(session, EventType::Stored, |payload| match payload {
                Payload::Stored(stored) => Some(RelayMessage::ok(&stored.event.id, true, "")),
                _ => None,
            })
        }),
        plugin(|session: &Session| {
            ok_on(session, EventType::Duplicate, |payload| match payload {
                Payload::Duplicate(event) => {
                    Some(RelayMessage::ok(&event.id, true, DUPLICATE_PREFIX))
                }
                _ => None,
            })
        }),
        plugin(|session: &Session| {
            ok_on(session, EventType::Deleted, |payload| match payload {
                Payload::Deleted(event) => Some(RelayMessage::ok(&event.id, false, DELETED_PREFIX)),
                _ => None,
            })
        }),
        plugin(rejected_event),
        plugin(notice_on_bad_message),
        plugin(notice_on_unknown_subscription),
    ]
}

fn ok_on<F>(session: &Session, event_type: EventType, compose: F) -> Binding
where
    F: Fn(&Payload) -> Option<RelayMessage> + 'static,
{
    let weak = session.downgrade();
    session.dispatcher().on(event_type, move |envelope, _| {
        if envelope.is_canceled() {
            return Ok(());
        }
        if let (Some(message), Some(session)) = (compose(envelope.payload()), weak.upgrade()) {
            session.reply(envelope, message)?;
        }
        Ok(())
    })
}

/// `OK false` for a malformed or unverifiable EVENT.
fn rejected_event(session: &Session) -> Binding {
    let weak = session.downgrade();
    session
        .dispatcher()
        .on(EventType::BadMessage, move |envelope, _| {
            if envelope.is_canceled() {
                return Ok(());
            }
            let Payload::BadMessage(bad) = envelope.payload() else {
                return Ok(());
            };
            let (Some(event_id), Some(session)) = (&bad.event_id, weak.upgrade()) else {
                return Ok(());
            };
            envelope.cancel();
            session.reply(
                envelope,
                RelayMessage::ok(event_id, false, format!("{} {}", INVALID_PREFIX, bad.reason)),
            )?;
            Ok(())
        })
}

fn notice_on_bad_message(session: &Session) -> Binding {
    let weak = session.downgrade();
    session
        .dispatcher()
        .on(EventType::BadMessage, move |envelope, _| {
            if envelope.is_canceled() {
                return Ok(());
            }
            if let (Payload::BadMessage(bad), Some(session)) = (envelope.payload(), weak.upgrade()) {
                session.reply(
                    envelope,
                    RelayMessage::notice(format!("{} {}", INVALID_PREFIX, bad.reason)),
                )?;
            }
            Ok(())
        })
}

fn notice_on_unknown_subscription(session: &Session) -> Binding {
    let weak = session.downgrade();
    session
        .dispatcher()
        .on(EventType::SubscriptionNotFound, move |envelope, _| {
            if envelope.is_canceled() {
                return Ok(());
            }
            if let (Payload::SubscriptionNotFound(id), Some(session)) =
                (envelope.payload(), weak.upgrade())
            {
                session.reply(
                    envelope,
                    RelayMessage::notice(format!("subscription not found: {}", id)),
                )?;
            }
            Ok(())
        })
}
