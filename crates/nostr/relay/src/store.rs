//! In-memory event store.
//!
//! Events are indexed twice: by id for O(1) membership, and in an ascending
//! array of per-timestamp buckets for newest-first filter queries. Every
//! insert bumps a revision counter; subscriptions use it as a watermark to
//! tell replayed events from live ones.

use crate::envelope::StoredEvent;
use crate::filter::{self, Filter, FilterError};
use crate::validation::{EventVerifier, SchnorrVerifier, ValidationError};
use indexmap::IndexMap;
use nostr::Event;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

struct Bucket {
    created_at: u64,
    /// Insertion order within one timestamp
    events: IndexMap<String, Arc<Event>>,
}

struct Entry {
    event: Arc<Event>,
    revision: u64,
}

pub struct EventStore {
    by_id: HashMap<String, Entry>,
    buckets: Vec<Bucket>,
    revision: u64,
    verifier: Box<dyn EventVerifier>,
}

impl EventStore {
    /// A store that verifies Schnorr signatures.
    pub fn new() -> Self {
        Self::with_verifier(SchnorrVerifier)
    }

    pub fn with_verifier(verifier: impl EventVerifier + 'static) -> Self {
        Self {
            by_id: HashMap::new(),
            buckets: Vec::new(),
            revision: 0,
            verifier: Box::new(verifier),
        }
    }

    pub fn has(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Event>> {
        self.by_id.get(id).map(|entry| Arc::clone(&entry.event))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Revision of the most recent insert; 0 while nothing has been stored.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn revision_of(&self, id: &str) -> Option<u64> {
        self.by_id.get(id).map(|entry| entry.revision)
    }

    /// Verify and insert. `Ok(false)` if an event with this id is already stored.
    pub fn add(&mut self, event: Event) -> Result<bool, ValidationError> {
        Ok(self.insert(Arc::new(event))?.is_some())
    }

    /// Verify and insert, returning the assigned revision for a new event.
    ///
    /// An existing event with the same id is never overwritten.
    pub fn insert(&mut self, event: Arc<Event>) -> Result<Option<StoredEvent>, ValidationError> {
        if !nostr::validate_event(&event) {
            return Err(ValidationError::InvalidField {
                field: "id",
                expected: "64 lowercase hex characters",
            });
        }
        self.verifier.verify(&event)?;
        if self.has(&event.id) {
            return Ok(None);
        }

        self.revision += 1;
        let index = match self.bucket_index(event.created_at) {
            Ok(index) => index,
            Err(index) => {
                self.buckets.insert(
                    index,
                    Bucket {
                        created_at: event.created_at,
                        events: IndexMap::new(),
                    },
                );
                index
            }
        };
        self.buckets[index]
            .events
            .insert(event.id.clone(), Arc::clone(&event));
        self.by_id.insert(
            event.id.clone(),
            Entry {
                event: Arc::clone(&event),
                revision: self.revision,
            },
        );

        Ok(Some(StoredEvent {
            event,
            revision: self.revision,
        }))
    }

    /// Remove an event. Returns false if the id was unknown.
    pub fn delete(&mut self, id: &str) -> bool {
        let Some(entry) = self.by_id.remove(id) else {
            return false;
        };
        if let Ok(index) = self.bucket_index(entry.event.created_at) {
            let bucket = &mut self.buckets[index];
            bucket.events.shift_remove(id);
            if bucket.events.is_empty() {
                self.buckets.remove(index);
            }
        }
        true
    }

    /// Events matching any of `filters`, oldest first, capped at the smallest `limit`.
    ///
    /// The cap keeps the most recent events.
    pub fn matching(&self, filters: &[Filter]) -> Vec<Arc<Event>> {
        let limit = filter::effective_limit(filters)
            .map_or(usize::MAX, |limit| usize::try_from(limit).unwrap_or(usize::MAX));

        let mut events: Vec<Arc<Event>> = self
            .buckets
            .iter()
            .rev()
            .flat_map(|bucket| bucket.events.values().rev())
            .filter(|event| filter::matches_any(filters, event))
            .take(limit)
            .cloned()
            .collect();
        events.reverse();
        events
    }

    /// Parse raw wire filters and query. Any malformed filter fails the whole call.
    pub fn query(&self, filters: &[Value]) -> Result<Vec<Arc<Event>>, FilterError> {
        let filters = filter::parse_filters(filters)?;
        Ok(self.matching(&filters))
    }

    /// Number of distinct `created_at` buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_index(&self, created_at: u64) -> Result<usize, usize> {
        self.buckets
            .binary_search_by_key(&created_at, |bucket| bucket.created_at)
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStore")
            .field("events", &self.by_id.len())
            .field("buckets", &self.buckets.len())
            .field("revision", &self.revision)
            .finish()
    }
}
