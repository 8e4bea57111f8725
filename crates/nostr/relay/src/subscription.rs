//! Subscription engine.
//!
//! Each session keeps its own [`SubscriptionManager`]. A REQ replaces the
//! filter list for its id right away, but the subscription stays pending until
//! a deferred replay has sent the stored matches and EOSE. The replay records
//! the store revision it read as the subscription's watermark, and live
//! delivery only forwards events stored after it. Nothing is sent twice and
//! nothing stored in between is missed.

use crate::dispatcher::Binding;
use crate::envelope::{Envelope, EventType, Payload, StoredEvent};
use crate::error::Result;
use crate::filter::{self, Filter};
use crate::protocol::{ERROR_PREFIX, INVALID_PREFIX, RelayMessage, ReqRequest};
use crate::relay::RelayContext;
use crate::session::{Session, WeakSession};
use nostr::Event;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Waiting for the historical replay
    Pending,
    /// Receiving live events stored after `watermark`
    Live { watermark: u64 },
}

/// A client subscription
#[derive(Debug, Clone)]
pub struct Subscription {
    /// Subscription ID
    pub id: String,

    /// Filters for this subscription
    pub filters: Vec<Filter>,

    generation: u64,
    state: SubscriptionState,
}

impl Subscription {
    pub fn state(&self) -> SubscriptionState {
        self.state
    }

    /// Check if an event matches any filter in this subscription
    pub fn matches(&self, event: &Event) -> bool {
        filter::matches_any(&self.filters, event)
    }

    /// Whether a stored event should be delivered live.
    pub fn wants(&self, stored: &StoredEvent) -> bool {
        match self.state {
            SubscriptionState::Pending => false,
            SubscriptionState::Live { watermark } => {
                stored.revision > watermark && self.matches(&stored.event)
            }
        }
    }
}

/// Manages all subscriptions for a connection
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    subscriptions: HashMap<String, Subscription>,
    next_generation: u64,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `filters` under `id` as a pending subscription, replacing any
    /// previous one. Returns the generation that identifies this REQ.
    pub fn replace(&mut self, id: String, filters: Vec<Filter>) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.subscriptions.insert(
            id.clone(),
            Subscription {
                id,
                filters,
                generation,
                state: SubscriptionState::Pending,
            },
        );
        generation
    }

    /// Whether `generation` is still the latest REQ for `id`.
    pub fn is_current(&self, id: &str, generation: u64) -> bool {
        self.subscriptions
            .get(id)
            .is_some_and(|sub| sub.generation == generation)
    }

    /// Start live delivery. Returns false if the REQ was superseded or closed.
    pub fn activate(&mut self, id: &str, generation: u64, watermark: u64) -> bool {
        match self.subscriptions.get_mut(id) {
            Some(sub) if sub.generation == generation => {
                sub.state = SubscriptionState::Live { watermark };
                true
            }
            _ => false,
        }
    }

    /// Remove a subscription
    pub fn remove(&mut self, subscription_id: &str) -> bool {
        self.subscriptions.remove(subscription_id).is_some()
    }

    /// Get a subscription by ID
    pub fn get(&self, subscription_id: &str) -> Option<&Subscription> {
        self.subscriptions.get(subscription_id)
    }

    pub fn contains(&self, subscription_id: &str) -> bool {
        self.subscriptions.contains_key(subscription_id)
    }

    /// Ids of the live subscriptions that want `stored`, sorted.
    pub fn live_matches(&self, stored: &StoredEvent) -> Vec<String> {
        let mut ids: Vec<String> = self
            .subscriptions
            .values()
            .filter(|sub| sub.wants(stored))
            .map(|sub| sub.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Get all subscription IDs
    pub fn subscription_ids(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}

type SharedSubscriptions = Rc<RefCell<SubscriptionManager>>;

/// Attach REQ, CLOSE and live delivery handling to `session`.
pub fn subscription_engine(session: &Session, context: Rc<RelayContext>) -> Binding {
    let subscriptions: SharedSubscriptions = Rc::new(RefCell::new(SubscriptionManager::new()));

    let req = handle_req(session, Rc::clone(&context), Rc::clone(&subscriptions));
    let close = handle_close(session, Rc::clone(&subscriptions));
    let live = deliver_live(session, &context, Rc::clone(&subscriptions));
    let clear = Binding::new(move || subscriptions.borrow_mut().clear());

    Binding::all(vec![req, close, live, clear])
}

fn handle_req(session: &Session, context: Rc<RelayContext>, subscriptions: SharedSubscriptions) -> Binding {
    let weak = session.downgrade();
    session
        .dispatcher()
        .on(EventType::Req, move |envelope, dispatcher| {
            if envelope.is_canceled() {
                return Ok(());
            }
            let (Payload::Req(request), Some(session)) = (envelope.payload(), weak.upgrade()) else {
                return Ok(());
            };

            let Some(generation) = subscribe(&session, envelope, &context, &subscriptions, request)?
            else {
                return Ok(());
            };

            let weak = weak.clone();
            let context = Rc::clone(&context);
            let subscriptions = Rc::clone(&subscriptions);
            let cause = envelope.clone();
            let id = request.subscription_id.clone();
            dispatcher.defer(move || {
                let Some(session) = weak.upgrade() else {
                    return Ok(());
                };
                replay(&session, &cause, &context, &subscriptions, &id, generation)
            });
            Ok(())
        })
}

/// Validate and install a REQ. `None` if it was refused with CLOSED.
fn subscribe(
    session: &Session,
    cause: &Envelope,
    context: &RelayContext,
    subscriptions: &RefCell<SubscriptionManager>,
    request: &ReqRequest,
) -> Result<Option<u64>> {
    let id = &request.subscription_id;
    let max_filters = context.config.max_filters;
    if request.filters.len() > max_filters {
        session.reply(
            cause,
            RelayMessage::closed(id, format!("{} too many filters (max {})", ERROR_PREFIX, max_filters)),
        )?;
        return Ok(None);
    }

    let filters = match filter::parse_filters(&request.filters) {
        Ok(filters) => filters,
        Err(e) => {
            debug!("Refusing subscription {} on session {}: {}", id, session.handle(), e);
            session.reply(cause, RelayMessage::closed(id, format!("{} {}", INVALID_PREFIX, e)))?;
            return Ok(None);
        }
    };

    let max_subscriptions = context.config.max_subscriptions;
    let generation = {
        let mut subscriptions = subscriptions.borrow_mut();
        if !subscriptions.contains(id) && subscriptions.len() >= max_subscriptions {
            None
        } else {
            Some(subscriptions.replace(id.clone(), filters))
        }
    };

    if generation.is_none() {
        session.reply(
            cause,
            RelayMessage::closed(
                id,
                format!("{} too many subscriptions (max {})", ERROR_PREFIX, max_subscriptions),
            ),
        )?;
    } else {
        debug!("Session {} subscribed to {}", session.handle(), id);
    }
    Ok(generation)
}

fn replay(
    session: &Session,
    cause: &Envelope,
    context: &RelayContext,
    subscriptions: &RefCell<SubscriptionManager>,
    id: &str,
    generation: u64,
) -> Result<()> {
    if session.is_closed() {
        return Ok(());
    }
    let filters = match subscriptions.borrow().get(id) {
        Some(sub) if sub.generation == generation => sub.filters.clone(),
        _ => {
            debug!("Skipping replay of superseded subscription {}", id);
            return Ok(());
        }
    };

    let (events, watermark) = {
        let store = context.store.borrow();
        (store.matching(&filters), store.revision())
    };

    debug!("Replaying {} stored events for subscription {}", events.len(), id);
    for event in events {
        session.reply(
            cause,
            RelayMessage::Event {
                subscription_id: id.to_string(),
                event,
            },
        )?;
    }
    session.reply(cause, RelayMessage::Eose(id.to_string()))?;
    subscriptions.borrow_mut().activate(id, generation, watermark);
    Ok(())
}

fn handle_close(session: &Session, subscriptions: SharedSubscriptions) -> Binding {
    let handle = session.handle();
    session
        .dispatcher()
        .on(EventType::Unsubscribe, move |envelope, dispatcher| {
            if envelope.is_canceled() {
                return Ok(());
            }
            let Payload::Unsubscribe(id) = envelope.payload() else {
                return Ok(());
            };
            if subscriptions.borrow_mut().remove(id) {
                debug!("Session {} closed subscription {}", handle, id);
            } else {
                dispatcher.defer_emit(envelope.child(Payload::SubscriptionNotFound(id.clone())));
            }
            Ok(())
        })
}

/// One server-level listener per session; each broadcast becomes its own
/// deferred task so a failure stays with this session.
fn deliver_live(session: &Session, context: &RelayContext, subscriptions: SharedSubscriptions) -> Binding {
    let weak = session.downgrade();
    let originator = session.originator();
    context
        .server
        .on(EventType::Broadcast, move |envelope, dispatcher| {
            if envelope.is_canceled() || envelope.originator() == Some(originator) {
                return Ok(());
            }
            let Payload::Broadcast(stored) = envelope.payload() else {
                return Ok(());
            };

            let stored = stored.clone();
            let cause = envelope.clone();
            let weak: WeakSession = weak.clone();
            let subscriptions = Rc::clone(&subscriptions);
            dispatcher.defer(move || {
                let Some(session) = weak.upgrade() else {
                    return Ok(());
                };
                if session.is_closed() {
                    return Ok(());
                }
                let ids = subscriptions.borrow().live_matches(&stored);
                for subscription_id in ids {
                    session.reply(
                        &cause,
                        RelayMessage::Event {
                            subscription_id,
                            event: Arc::clone(&stored.event),
                        },
                    )?;
                }
                Ok(())
            });
            Ok(())
        })
}
