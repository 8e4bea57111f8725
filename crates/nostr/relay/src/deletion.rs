//! NIP-09 tombstones.
//!
//! When a deletion request is stored, the relay deletes the referenced events
//! written by the same author and remembers each target id. Later submissions
//! of a tombstoned event by that author are answered `deleted:` before they
//! reach the dedup set or the store. The store itself keeps no record of
//! deletions.

use crate::dispatcher::Binding;
use crate::envelope::{EventType, Payload};
use crate::relay::RelayContext;
use crate::session::Session;
use nostr::{
    DELETION_REQUEST_KIND, Event, get_deleted_event_ids, is_deletion_request, should_delete_event,
};
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

/// Target event id to the pubkeys that requested its deletion.
#[derive(Debug, Default)]
pub struct Tombstones {
    deleted_by: HashMap<String, HashSet<String>>,
}

impl Tombstones {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every target of `deletion`. Returns the recorded ids.
    pub fn record(&mut self, deletion: &Event) -> Vec<String> {
        let targets = get_deleted_event_ids(deletion);
        for target in &targets {
            self.deleted_by
                .entry(target.clone())
                .or_default()
                .insert(deletion.pubkey.clone());
        }
        targets
    }

    /// Whether `event` was deleted by its own author.
    pub fn is_deleted(&self, event: &Event) -> bool {
        self.deleted_by
            .get(&event.id)
            .is_some_and(|pubkeys| pubkeys.contains(&event.pubkey))
    }

    pub fn len(&self) -> usize {
        self.deleted_by.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deleted_by.is_empty()
    }
}

/// Cancel `EventReceived` for tombstoned events and emit `Deleted` instead.
pub fn tombstone_check(session: &Session, context: Rc<RelayContext>) -> Binding {
    session
        .dispatcher()
        .on(EventType::EventReceived, move |envelope, dispatcher| {
            if envelope.is_canceled() {
                return Ok(());
            }
            let Payload::EventReceived(event) = envelope.payload() else {
                return Ok(());
            };
            if context.tombstones.borrow().is_deleted(event) {
                debug!("Rejecting deleted event {}", event.id);
                envelope.cancel();
                dispatcher.defer_emit(envelope.child(Payload::Deleted(Arc::clone(event))));
            }
            Ok(())
        })
}

/// Apply stored deletion requests to the store.
pub fn apply_deletions(session: &Session, context: Rc<RelayContext>) -> Binding {
    session
        .dispatcher()
        .on(EventType::Stored, move |envelope, _| {
            let Payload::Stored(stored) = envelope.payload() else {
                return Ok(());
            };
            if envelope.is_canceled() || !is_deletion_request(&stored.event) {
                return Ok(());
            }

            let targets = context.tombstones.borrow_mut().record(&stored.event);
            let mut store = context.store.borrow_mut();
            for target in targets {
                let Some(existing) = store.get(&target) else {
                    continue;
                };
                // Deletion requests cannot themselves be deleted.
                if existing.kind != DELETION_REQUEST_KIND
                    && should_delete_event(&existing, &stored.event)
                {
                    store.delete(&target);
                    debug!("Deleted event {} at the request of {}", target, stored.event.id);
                }
            }
            Ok(())
        })
}
