//! Relay metrics collection and monitoring
//!
//! Counts every envelope by type. The counting plugin does not list the types
//! it cares about: it watches the about-to-dispatch meta envelope and attaches
//! one counting listener per type the first time that type shows up on a
//! dispatcher. Counters are atomic so the host can read snapshots from other
//! threads.

use crate::dispatcher::{Binding, Dispatcher};
use crate::envelope::{EventType, Payload};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Relay metrics collector
#[derive(Debug)]
pub struct RelayMetrics {
    /// Server start time
    start_time: Instant,

    /// Envelopes dispatched, indexed by [`EventType::index`]
    envelopes: [AtomicU64; EventType::ALL.len()],

    /// Total bytes received
    bytes_received: AtomicU64,

    /// Total bytes sent
    bytes_sent: AtomicU64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            envelopes: std::array::from_fn(|_| AtomicU64::new(0)),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Count one dispatched envelope.
    pub fn record(&self, payload: &Payload) {
        self.envelopes[payload.event_type().index()].fetch_add(1, Ordering::Relaxed);
        match payload {
            Payload::TransportData(frame) => {
                self.bytes_received
                    .fetch_add(frame.len() as u64, Ordering::Relaxed);
            }
            Payload::Send(frame) => {
                self.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn count(&self, event_type: EventType) -> u64 {
        self.envelopes[event_type.index()].load(Ordering::Relaxed)
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let count = |event_type| self.count(event_type);
        let envelopes = EventType::ALL
            .iter()
            .filter(|&&event_type| count(event_type) > 0)
            .map(|&event_type| (event_type.as_str().to_string(), count(event_type)))
            .collect();

        MetricsSnapshot {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |elapsed| elapsed.as_secs()),
            uptime_secs: self.uptime().as_secs(),
            active_connections: count(EventType::Connected)
                .saturating_sub(count(EventType::SessionClosed)),
            events_received: count(EventType::EventReceived),
            events_stored: count(EventType::Stored),
            events_duplicate: count(EventType::Duplicate),
            events_deleted: count(EventType::Deleted),
            bad_messages: count(EventType::BadMessage),
            subscription_requests: count(EventType::Req),
            subscription_closes: count(EventType::Unsubscribe),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            envelopes,
        }
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Unix timestamp when snapshot was taken
    pub timestamp: u64,
    pub uptime_secs: u64,
    pub active_connections: u64,
    pub events_received: u64,
    pub events_stored: u64,
    pub events_duplicate: u64,
    pub events_deleted: u64,
    /// Malformed messages and rejected events
    pub bad_messages: u64,
    pub subscription_requests: u64,
    pub subscription_closes: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// Every envelope type seen so far, by name
    pub envelopes: BTreeMap<String, u64>,
}

impl MetricsSnapshot {
    /// Calculate events per second rate
    pub fn events_per_second(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            self.events_received as f64 / self.uptime_secs as f64
        }
    }

    /// Calculate storage success rate (%)
    pub fn storage_success_rate(&self) -> f64 {
        if self.events_received == 0 {
            100.0
        } else {
            (self.events_stored as f64 / self.events_received as f64) * 100.0
        }
    }
}

/// Count every envelope dispatched on `dispatcher` into `metrics`.
pub fn count_envelopes(dispatcher: &Dispatcher, metrics: Arc<RelayMetrics>) -> Binding {
    let attached: Rc<RefCell<Vec<Binding>>> = Rc::new(RefCell::new(Vec::new()));
    let seen: RefCell<HashSet<EventType>> = RefCell::new(HashSet::new());

    let watcher = {
        let attached = Rc::clone(&attached);
        dispatcher.on(EventType::Dispatch, move |envelope, dispatcher| {
            let Payload::Dispatch(inner) = envelope.payload() else {
                return Ok(());
            };
            let event_type = inner.event_type();
            if !seen.borrow_mut().insert(event_type) {
                return Ok(());
            }
            let metrics = Arc::clone(&metrics);
            let counter = dispatcher.on(event_type, move |envelope, _| {
                metrics.record(envelope.payload());
                Ok(())
            });
            attached.borrow_mut().push(counter);
            Ok(())
        })
    };

    Binding::new(move || {
        watcher.disconnect();
        for binding in attached.borrow_mut().drain(..) {
            binding.disconnect();
        }
    })
}
