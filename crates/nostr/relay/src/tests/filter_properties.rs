//! Property-based tests for Nostr Filter parsing and matching
//!
//! These tests use proptest to check the matching laws (AND within a filter,
//! OR across filters, inclusive time bounds, prefix ids) and that parsing
//! rejects anything it does not understand.

use crate::filter::{Filter, FilterError, matches_any, parse_filters};
use nostr::Event;
use proptest::prelude::*;
use serde_json::json;

// =============================================================================
// Helper Functions
// =============================================================================

fn create_event_with_fields(
    id: &str,
    pubkey: &str,
    kind: u16,
    tags: Vec<Vec<String>>,
    created_at: u64,
) -> Event {
    Event {
        id: id.to_string(),
        pubkey: pubkey.to_string(),
        created_at,
        kind,
        tags,
        content: "test".to_string(),
        sig: "0".repeat(128),
    }
}

fn simple_event(kind: u16, created_at: u64) -> Event {
    create_event_with_fields(&"a".repeat(64), &"b".repeat(64), kind, vec![], created_at)
}

fn hex64() -> impl Strategy<Value = String> {
    "[0-9a-f]{64}"
}

// =============================================================================
// Tests without parameters (outside proptest! macro)
// =============================================================================

#[test]
fn prop_empty_filter_matches_everything() {
    let event = simple_event(1, 1234567890);
    assert!(Filter::new().matches(&event));
    assert!(matches_any(&[], &event));
}

#[test]
fn prop_empty_ids_matches_nothing() {
    let event = simple_event(1, 1234567890);
    let filter = Filter::new().ids(Vec::<String>::new());
    assert!(!filter.matches(&event));
}

#[test]
fn prop_empty_tag_filter_no_match() {
    let event = create_event_with_fields(
        &"a".repeat(64),
        &"b".repeat(64),
        1,
        vec![vec!["e".to_string(), "event123".to_string()]],
        1234567890,
    );
    let filter = Filter::new().tag("e", Vec::<String>::new());
    assert!(!filter.matches(&event));
}

#[test]
fn prop_tag_value_is_exact_not_prefix() {
    let event = create_event_with_fields(
        &"a".repeat(64),
        &"b".repeat(64),
        1,
        vec![vec!["e".to_string(), "event123".to_string()]],
        1234567890,
    );
    assert!(Filter::new().references_events(["event123"]).matches(&event));
    assert!(!Filter::new().references_events(["event"]).matches(&event));
}

#[test]
fn prop_tag_filter_reads_first_value_only() {
    let event = create_event_with_fields(
        &"a".repeat(64),
        &"b".repeat(64),
        1,
        vec![vec![
            "p".to_string(),
            "pubkey456".to_string(),
            "wss://relay.example".to_string(),
        ]],
        1234567890,
    );
    assert!(Filter::new().references_pubkeys(["pubkey456"]).matches(&event));
    assert!(
        !Filter::new()
            .references_pubkeys(["wss://relay.example"])
            .matches(&event)
    );
}

#[test]
fn prop_multiple_tag_filters_and_condition() {
    let event = create_event_with_fields(
        &"a".repeat(64),
        &"b".repeat(64),
        1,
        vec![
            vec!["e".to_string(), "event123".to_string()],
            vec!["p".to_string(), "pubkey456".to_string()],
        ],
        1234567890,
    );

    let both = Filter::new()
        .references_events(["event123"])
        .references_pubkeys(["pubkey456"]);
    let wrong_p = Filter::new()
        .references_events(["event123"])
        .references_pubkeys(["someone-else"]);

    assert!(both.matches(&event));
    assert!(!wrong_p.matches(&event));
}

#[test]
fn prop_search_does_not_affect_matching() {
    let event = simple_event(1, 1234567890);
    let filter = Filter::new().kinds([1]).with_search("no such words");
    assert!(filter.matches(&event));
}

#[test]
fn prop_unknown_field_rejected() {
    assert_eq!(
        Filter::from_value(&json!({"kinds": [1], "color": "red"})),
        Err(FilterError::UnknownField("color".to_string()))
    );
    assert_eq!(
        Filter::from_value(&json!({"#ee": ["x"]})),
        Err(FilterError::UnknownField("#ee".to_string()))
    );
}

#[test]
fn prop_mistyped_fields_rejected() {
    for value in [
        json!({"kinds": "1"}),
        json!({"kinds": [70000]}),
        json!({"since": -1}),
        json!({"until": 1.5}),
        json!({"limit": "10"}),
        json!({"ids": [1]}),
        json!({"#e": "abc"}),
        json!({"search": 5}),
        json!([]),
    ] {
        assert!(Filter::from_value(&value).is_err(), "accepted {}", value);
    }
}

#[test]
fn prop_overlong_prefix_rejected() {
    let value = json!({"authors": ["a".repeat(65)]});
    assert_eq!(
        Filter::from_value(&value),
        Err(FilterError::TooLong {
            field: "authors".to_string()
        })
    );
}

#[test]
fn prop_one_bad_filter_fails_the_list() {
    let filters = [json!({"kinds": [1]}), json!({"bogus": true})];
    assert!(parse_filters(&filters).is_err());
}

#[test]
fn prop_wire_round_trip() {
    let value = json!({"ids": ["ab"], "kinds": [1, 7], "since": 10, "#p": ["cafe"]});
    let filter = Filter::from_value(&value).unwrap();
    assert_eq!(serde_json::to_value(&filter).unwrap(), value);
}

// =============================================================================
// Filter Matching Property Tests - Kinds
// =============================================================================

proptest! {
    /// Property: Filter with empty kinds array matches no events
    #[test]
    fn prop_empty_kinds_matches_nothing(kind in any::<u16>()) {
        let event = simple_event(kind, 1234567890);
        let filter = Filter::new().kinds(Vec::new());
        prop_assert!(!filter.matches(&event));
    }

    /// Property: Filter matches event with exact kind
    #[test]
    fn prop_exact_kind_match(kind in any::<u16>()) {
        let event = simple_event(kind, 1234567890);
        prop_assert!(Filter::new().kinds([kind]).matches(&event));
    }

    /// Property: Filter doesn't match event with different kind
    #[test]
    fn prop_different_kind_no_match(kind1 in any::<u16>(), kind2 in any::<u16>()) {
        prop_assume!(kind1 != kind2);
        let event = simple_event(kind1, 1234567890);
        prop_assert!(!Filter::new().kinds([kind2]).matches(&event));
    }
}

// =============================================================================
// Filter Matching Property Tests - Timestamps
// =============================================================================

proptest! {
    /// Property: since and until are inclusive
    #[test]
    fn prop_bounds_inclusive(timestamp in any::<u64>()) {
        let event = simple_event(1, timestamp);
        prop_assert!(Filter::new().since(timestamp).matches(&event));
        prop_assert!(Filter::new().until(timestamp).matches(&event));
        prop_assert!(Filter::new().since(timestamp).until(timestamp).matches(&event));
    }

    /// Property: Filter with both since and until creates range
    #[test]
    fn prop_since_until_range(
        since in 1000u64..2000u64,
        until in 2000u64..3000u64,
    ) {
        let filter = Filter::new().since(since).until(until);

        prop_assert!(!filter.matches(&simple_event(1, since - 1)));
        prop_assert!(filter.matches(&simple_event(1, (since + until) / 2)));
        prop_assert!(!filter.matches(&simple_event(1, until + 1)));
    }
}

// =============================================================================
// Filter Matching Property Tests - IDs and Authors
// =============================================================================

proptest! {
    /// Property: Partial ID match works (prefix matching)
    #[test]
    fn prop_partial_id_match(id in hex64(), prefix_len in 0usize..=64usize) {
        let event = create_event_with_fields(&id, &"b".repeat(64), 1, vec![], 1234567890);
        prop_assert!(Filter::new().ids([&id[..prefix_len]]).matches(&event));
    }

    /// Property: Partial author match works (prefix matching)
    #[test]
    fn prop_partial_author_match(pubkey in hex64(), prefix_len in 0usize..=64usize) {
        let event = create_event_with_fields(&"a".repeat(64), &pubkey, 1, vec![], 1234567890);
        prop_assert!(Filter::new().authors([&pubkey[..prefix_len]]).matches(&event));
    }

    /// Property: an id prefix that diverges from the event id never matches
    #[test]
    fn prop_diverging_prefix_no_match(id in hex64(), other in hex64(), len in 1usize..=64usize) {
        prop_assume!(id[..len] != other[..len]);
        let event = create_event_with_fields(&id, &"b".repeat(64), 1, vec![], 1234567890);
        prop_assert!(!Filter::new().ids([&other[..len]]).matches(&event));
    }
}

// =============================================================================
// Composition Laws
// =============================================================================

fn arb_filter() -> impl Strategy<Value = Filter> {
    (
        prop::option::of(prop::collection::vec(0u16..4, 0..3)),
        prop::option::of(0u64..20),
        prop::option::of(0u64..20),
        prop::option::of(prop::collection::vec("[ab]", 0..2)),
    )
        .prop_map(|(kinds, since, until, e_tags)| {
            let mut filter = Filter::new();
            filter.kinds = kinds;
            filter.since = since;
            filter.until = until;
            if let Some(values) = e_tags {
                filter = filter.references_events(values);
            }
            filter
        })
}

fn arb_event() -> impl Strategy<Value = Event> {
    (0u16..4, 0u64..20, prop::option::of("[ab]")).prop_map(|(kind, created_at, e_tag)| {
        let tags = e_tag
            .map(|value| vec![vec!["e".to_string(), value]])
            .unwrap_or_default();
        create_event_with_fields(&"a".repeat(64), &"b".repeat(64), kind, tags, created_at)
    })
}

proptest! {
    /// Property: a filter list matches exactly when some member matches
    #[test]
    fn prop_filter_list_is_or(filters in prop::collection::vec(arb_filter(), 1..4), event in arb_event()) {
        let expected = filters.iter().any(|filter| filter.matches(&event));
        prop_assert_eq!(matches_any(&filters, &event), expected);
    }

    /// Property: a filter matches exactly when each of its conditions does
    #[test]
    fn prop_filter_fields_are_and(filter in arb_filter(), event in arb_event()) {
        let conditions = [
            Filter { kinds: filter.kinds.clone(), ..Filter::new() },
            Filter { since: filter.since, ..Filter::new() },
            Filter { until: filter.until, ..Filter::new() },
            Filter { tags: filter.tags.clone(), ..Filter::new() },
        ];
        let expected = conditions.iter().all(|condition| condition.matches(&event));
        prop_assert_eq!(filter.matches(&event), expected);
    }

    /// Property: parsing the serialized form gives back the same filter
    #[test]
    fn prop_serialized_filter_parses_back(filter in arb_filter()) {
        let value = serde_json::to_value(&filter).unwrap();
        prop_assert_eq!(Filter::from_value(&value).unwrap(), filter);
    }
}
