use super::{Harness, event_json, signed_event, signed_event_with_key};
use crate::config::RelayConfig;
use crate::envelope::{EventType, Payload};
use crate::relay::Relay;
use crate::session::Frame;
use crate::store::EventStore;
use nostr::{KIND_METADATA, KIND_SHORT_TEXT_NOTE, generate_secret_key};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use std::cell::RefCell;
use std::rc::Rc;

fn e_tag(id: &str) -> Vec<String> {
    vec!["e".to_string(), id.to_string()]
}

#[test]
fn test_req_replays_matching_events_then_eose() {
    let harness = Harness::new();
    let note = signed_event(KIND_SHORT_TEXT_NOTE, vec![], "hello", 1_700_000_000);
    let metadata = signed_event(KIND_METADATA, vec![], "{}", 1_700_000_001);
    harness.relay.store().add(note.clone()).unwrap();
    harness.relay.store().add(metadata).unwrap();

    let client = harness.client();
    harness.send(&client, json!(["REQ", "sub1", {"kinds": [1]}]));

    assert_eq!(
        client.received(),
        vec![
            json!(["EVENT", "sub1", event_json(&note)]),
            json!(["EOSE", "sub1"]),
        ]
    );
}

#[test]
fn test_replay_keeps_most_recent_under_limit() {
    let harness = Harness::new();
    let events: Vec<_> = (0..5)
        .map(|i| signed_event(1, vec![], &format!("note {}", i), 1_700_000_000 + i))
        .collect();
    for event in &events {
        harness.relay.store().add(event.clone()).unwrap();
    }

    let client = harness.client();
    harness.send(&client, json!(["REQ", "recent", {"limit": 2}]));

    assert_eq!(
        client.received(),
        vec![
            json!(["EVENT", "recent", event_json(&events[3])]),
            json!(["EVENT", "recent", event_json(&events[4])]),
            json!(["EOSE", "recent"]),
        ]
    );
}

#[test]
fn test_event_is_acked_and_broadcast_to_other_sessions() {
    let harness = Harness::new();
    let alice = harness.client();
    let bob = harness.client();

    harness.send(&bob, json!(["REQ", "s2", {"kinds": [1]}]));
    harness.send(&alice, json!(["REQ", "own", {"kinds": [1]}]));
    assert_eq!(bob.received(), vec![json!(["EOSE", "s2"])]);
    assert_eq!(alice.received(), vec![json!(["EOSE", "own"])]);

    let note = signed_event(1, vec![], "hi bob", 1_700_000_000);
    harness.send(&alice, json!(["EVENT", event_json(&note)]));

    // The author gets the OK but not its own event back.
    assert_eq!(alice.received(), vec![json!(["OK", note.id, true, ""])]);
    assert_eq!(bob.received(), vec![json!(["EVENT", "s2", event_json(&note)])]);
    assert!(harness.relay.store().has(&note.id));
}

#[test]
fn test_broadcast_skips_non_matching_subscriptions() {
    let harness = Harness::new();
    let alice = harness.client();
    let bob = harness.client();
    harness.send(&bob, json!(["REQ", "meta", {"kinds": [0]}]));
    bob.received();

    let note = signed_event(1, vec![], "not metadata", 1_700_000_000);
    harness.send(&alice, json!(["EVENT", event_json(&note)]));

    assert!(bob.received().is_empty());
}

#[test]
fn test_duplicate_event_is_acked_without_rebroadcast() {
    let harness = Harness::new();
    let alice = harness.client();
    let bob = harness.client();
    harness.send(&bob, json!(["REQ", "s2", {}]));
    bob.received();

    let note = signed_event(1, vec![], "once", 1_700_000_000);
    harness.send(&alice, json!(["EVENT", event_json(&note)]));
    assert_eq!(bob.received().len(), 1);
    alice.received();

    harness.send(&alice, json!(["EVENT", event_json(&note)]));
    assert_eq!(alice.received(), vec![json!(["OK", note.id, true, "duplicate:"])]);
    assert!(bob.received().is_empty());
    assert_eq!(harness.relay.store().len(), 1);
}

#[test]
fn test_close_unknown_subscription_keeps_session_open() {
    let harness = Harness::new();
    let client = harness.client();

    harness.send(&client, json!(["CLOSE", "nope"]));

    assert_eq!(
        client.received(),
        vec![json!(["NOTICE", "subscription not found: nope"])]
    );
    let session = harness.relay.session(client.handle).unwrap();
    assert!(session.is_connected());
    assert!(!client.transport.closed.get());
}

#[test]
fn test_close_stops_live_delivery() {
    let harness = Harness::new();
    let alice = harness.client();
    let bob = harness.client();
    harness.send(&bob, json!(["REQ", "s", {}]));
    harness.send(&bob, json!(["CLOSE", "s"]));
    assert_eq!(bob.received(), vec![json!(["EOSE", "s"])]);

    let note = signed_event(1, vec![], "late", 1_700_000_000);
    harness.send(&alice, json!(["EVENT", event_json(&note)]));
    assert!(bob.received().is_empty());
}

#[test]
fn test_canceled_req_gets_no_reply() {
    let harness = Harness::new();
    harness.relay.server().on(EventType::Connected, |envelope, _| {
        if let Payload::Connected(session) = envelope.payload() {
            session.dispatcher().on(EventType::Req, |envelope, _| {
                envelope.cancel();
                Ok(())
            });
        }
        Ok(())
    });
    let client = harness.client();

    harness.send(&client, json!(["REQ", "sub", {}]));

    assert!(client.received().is_empty());
}

#[test]
fn test_listener_can_substitute_binary_codec() {
    let harness = Harness::new();
    harness.relay.server().on(EventType::Connected, |envelope, _| {
        if let Payload::Connected(session) = envelope.payload() {
            session.dispatcher().on(EventType::Message, |envelope, dispatcher| {
                if let Payload::Message(frame) = envelope.payload()
                    && frame.is_binary
                {
                    envelope.cancel();
                    let value: Value = serde_json::from_slice(&frame.data)?;
                    dispatcher.defer_emit(envelope.child(Payload::Inbound(value)));
                }
                Ok(())
            });
        }
        Ok(())
    });
    let client = harness.client();

    let req = json!(["REQ", "bin", {"kinds": [1]}]).to_string();
    harness.send_frame(&client, Frame::binary(req.into_bytes()));

    assert_eq!(client.received(), vec![json!(["EOSE", "bin"])]);
}

#[test]
fn test_binary_frame_without_codec_gets_notice() {
    let harness = Harness::new();
    let client = harness.client();

    harness.send_frame(&client, Frame::binary(b"[\"CLOSE\",\"a\"]".to_vec()));

    let received = client.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0][0], "NOTICE");
    assert!(received[0][1].as_str().unwrap().starts_with("invalid:"));
}

#[test]
fn test_deleted_event_is_refused_on_resubmission() {
    let harness = Harness::new();
    let client = harness.client();
    let key = generate_secret_key();

    let note = signed_event_with_key(&key, 1, vec![], "regrettable", 1_700_000_000);
    let deletion = signed_event_with_key(&key, 5, vec![e_tag(&note.id)], "", 1_700_000_010);

    harness.send(&client, json!(["EVENT", event_json(&note)]));
    harness.send(&client, json!(["EVENT", event_json(&deletion)]));
    assert_eq!(
        client.received(),
        vec![
            json!(["OK", note.id, true, ""]),
            json!(["OK", deletion.id, true, ""]),
        ]
    );
    assert!(!harness.relay.store().has(&note.id));
    assert!(harness.relay.store().has(&deletion.id));

    harness.send(&client, json!(["EVENT", event_json(&note)]));
    assert_eq!(client.received(), vec![json!(["OK", note.id, false, "deleted:"])]);
}

#[test]
fn test_deletion_by_another_author_is_ignored() {
    let harness = Harness::new();
    let client = harness.client();

    let note = signed_event(1, vec![], "mine", 1_700_000_000);
    let forged = signed_event(5, vec![e_tag(&note.id)], "", 1_700_000_010);
    harness.send(&client, json!(["EVENT", event_json(&note)]));
    harness.send(&client, json!(["EVENT", event_json(&forged)]));

    assert!(harness.relay.store().has(&note.id));
}

#[test]
fn test_invalid_filter_closes_subscription() {
    let harness = Harness::new();
    let client = harness.client();

    harness.send(&client, json!(["REQ", "bad", {"kinds": "one"}]));

    let received = client.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0][0], "CLOSED");
    assert_eq!(received[0][1], "bad");
    assert!(received[0][2].as_str().unwrap().starts_with("invalid:"));
}

#[test]
fn test_invalid_filter_keeps_previous_subscription() {
    let harness = Harness::new();
    let alice = harness.client();
    let bob = harness.client();
    harness.send(&bob, json!(["REQ", "s", {"kinds": [1]}]));
    harness.send(&bob, json!(["REQ", "s", {"unknown": true}]));
    bob.received();

    let note = signed_event(1, vec![], "still here", 1_700_000_000);
    harness.send(&alice, json!(["EVENT", event_json(&note)]));
    assert_eq!(bob.received(), vec![json!(["EVENT", "s", event_json(&note)])]);
}

#[test]
fn test_too_many_subscriptions_is_refused() {
    let config = RelayConfig {
        max_subscriptions: 1,
        ..RelayConfig::default()
    };
    let harness = Harness::with_relay(Relay::new(config));
    let client = harness.client();

    harness.send(&client, json!(["REQ", "a", {}]));
    harness.send(&client, json!(["REQ", "b", {}]));
    // Replacing an existing id is not a new subscription.
    harness.send(&client, json!(["REQ", "a", {"kinds": [1]}]));

    let received = client.received();
    assert_eq!(received[0], json!(["EOSE", "a"]));
    assert_eq!(received[1][0], "CLOSED");
    assert_eq!(received[1][1], "b");
    assert!(received[1][2].as_str().unwrap().starts_with("error:"));
    assert_eq!(received[2], json!(["EOSE", "a"]));
}

#[test]
fn test_bad_signature_is_rejected() {
    let harness = Harness::new();
    let client = harness.client();

    let mut note = signed_event(1, vec![], "forged", 1_700_000_000);
    let flipped = if note.sig.starts_with('0') { "1" } else { "0" };
    note.sig.replace_range(0..1, flipped);
    harness.send(&client, json!(["EVENT", event_json(&note)]));

    let received = client.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0][0], "OK");
    assert_eq!(received[0][1], note.id.as_str());
    assert_eq!(received[0][2], false);
    assert!(received[0][3].as_str().unwrap().starts_with("invalid:"));
    assert!(!harness.relay.store().has(&note.id));
}

#[test]
fn test_malformed_event_gets_single_ok() {
    let harness = Harness::new();
    let client = harness.client();

    harness.send(&client, json!(["EVENT", {"id": "abc", "kind": 1}]));

    let received = client.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0][0], "OK");
    assert_eq!(received[0][1], "abc");
    assert_eq!(received[0][2], false);
}

#[test]
fn test_event_message_with_extra_items_gets_ok_false() {
    let harness = Harness::new();
    let client = harness.client();
    let note = signed_event(1, vec![], "hello", 1_700_000_000);

    harness.send(&client, json!(["EVENT", event_json(&note), 1]));

    assert_eq!(
        client.received(),
        vec![json!([
            "OK",
            note.id,
            false,
            "invalid: EVENT message must have exactly one event"
        ])]
    );
    assert!(!harness.relay.store().has(&note.id));
}

#[test]
fn test_custom_verifier_gates_storage() {
    let store = EventStore::with_verifier(|event: &nostr::Event| event.content != "spam");
    let harness = Harness::with_relay(Relay::with_store(RelayConfig::default(), store));
    let client = harness.client();

    let spam = signed_event(1, vec![], "spam", 1_700_000_000);
    let ham = signed_event(1, vec![], "ham", 1_700_000_000);
    harness.send(&client, json!(["EVENT", event_json(&spam)]));
    harness.send(&client, json!(["EVENT", event_json(&ham)]));

    let received = client.received();
    assert_eq!(received[0][2], false);
    assert_eq!(received[1], json!(["OK", ham.id, true, ""]));
}

#[test]
fn test_live_event_stored_during_replay_is_delivered_once() {
    let harness = Harness::new();
    let alice = harness.client();
    let bob = harness.client();

    // Both messages are decoded before either stage runs, so the event is
    // stored while the subscription is still pending.
    let note = signed_event(1, vec![], "racing", 1_700_000_000);
    harness
        .relay
        .handle(
            bob.handle,
            crate::session::TransportEvent::Data(Frame::text(json!(["REQ", "s", {}]).to_string())),
        )
        .unwrap();
    harness
        .relay
        .handle(
            alice.handle,
            crate::session::TransportEvent::Data(Frame::text(
                json!(["EVENT", event_json(&note)]).to_string(),
            )),
        )
        .unwrap();
    harness.relay.run_pending();

    let copies = bob
        .received()
        .into_iter()
        .filter(|message| message[0] == "EVENT")
        .count();
    assert_eq!(copies, 1);
}

#[test]
fn test_outgoing_messages_can_be_observed() {
    let harness = Harness::new();
    let sent = Rc::new(RefCell::new(Vec::new()));
    {
        let sent = Rc::clone(&sent);
        harness.relay.add_session_plugin(crate::lifecycle::plugin(move |session: &crate::session::Session| {
            let sent = Rc::clone(&sent);
            session.dispatcher().on(EventType::Outgoing, move |envelope, _| {
                if let Payload::Outgoing(message) = envelope.payload() {
                    sent.borrow_mut().push(message.to_value());
                }
                Ok(())
            })
        }));
    }
    let client = harness.client();

    harness.send(&client, json!(["REQ", "x", {}]));

    assert_eq!(*sent.borrow(), vec![json!(["EOSE", "x"])]);
}

#[test]
fn test_disconnect_releases_session_listeners() {
    let harness = Harness::new();
    let client = harness.client();
    harness.send(&client, json!(["REQ", "s", {}]));
    assert_eq!(harness.relay.server().listener_count(EventType::Broadcast), 1);

    harness
        .relay
        .handle(client.handle, crate::session::TransportEvent::Closed)
        .unwrap();
    harness.relay.run_pending();

    assert_eq!(harness.relay.server().listener_count(EventType::Broadcast), 0);
    assert_eq!(harness.relay.session_count(), 0);
}
