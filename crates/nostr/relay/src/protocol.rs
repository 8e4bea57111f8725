//! NIP-01 wire messages.
//!
//! Client to relay: `EVENT`, `REQ`, `CLOSE`.
//! Relay to client: `EVENT`, `EOSE`, `NOTICE`, `OK`, `CLOSED`.

use crate::dispatcher::Binding;
use crate::envelope::{EventType, Payload};
use crate::session::Session;
use crate::validation::{ValidationError, validate_subscription_id};
use nostr::Event;
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Prefix for rejections caused by malformed input.
pub const INVALID_PREFIX: &str = "invalid:";
pub const DUPLICATE_PREFIX: &str = "duplicate:";
pub const DELETED_PREFIX: &str = "deleted:";
pub const ERROR_PREFIX: &str = "error:";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("message is not valid JSON")]
    NotJson,

    #[error("message must be a JSON array")]
    NotAnArray,

    #[error("message array is empty")]
    Empty,

    #[error("message type must be a string")]
    NonStringTag,

    #[error("unknown message type '{0}'")]
    UnknownTag(String),

    #[error("{tag} message must have {expected}")]
    Arity {
        tag: &'static str,
        expected: &'static str,
    },

    #[error("subscription id must be a string")]
    NonStringSubscriptionId,

    #[error("{0}")]
    SubscriptionId(#[from] ValidationError),

    #[error("binary messages are not supported")]
    Binary,

    #[error("message of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
}

/// A REQ before its filters are parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct ReqRequest {
    pub subscription_id: String,
    /// Raw filter objects, parsed by the subscription engine
    pub filters: Vec<Value>,
}

/// A message or event the relay could not accept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadMessage {
    pub reason: String,
    /// Set when the rejected message was an `EVENT` carrying an id
    pub event_id: Option<String>,
}

impl BadMessage {
    pub fn new(reason: impl ToString) -> Self {
        Self {
            reason: reason.to_string(),
            event_id: None,
        }
    }

    pub fn for_event(reason: impl ToString, event_id: Option<String>) -> Self {
        Self {
            reason: reason.to_string(),
            event_id,
        }
    }
}

/// Messages from a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// `["EVENT", <event>]`, event not yet validated
    Event(Value),
    Req(ReqRequest),
    Close(String),
}

impl ClientMessage {
    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        let Value::Array(mut items) = value else {
            return Err(MessageError::NotAnArray);
        };
        if items.is_empty() {
            return Err(MessageError::Empty);
        }
        let tag = match items.remove(0) {
            Value::String(tag) => tag,
            _ => return Err(MessageError::NonStringTag),
        };

        match tag.as_str() {
            "EVENT" => {
                if items.len() != 1 {
                    return Err(MessageError::Arity {
                        tag: "EVENT",
                        expected: "exactly one event",
                    });
                }
                Ok(ClientMessage::Event(items.remove(0)))
            }
            "REQ" => {
                if items.is_empty() {
                    return Err(MessageError::Arity {
                        tag: "REQ",
                        expected: "a subscription id",
                    });
                }
                let subscription_id = subscription_id(items.remove(0))?;
                Ok(ClientMessage::Req(ReqRequest {
                    subscription_id,
                    filters: items,
                }))
            }
            "CLOSE" => {
                if items.len() != 1 {
                    return Err(MessageError::Arity {
                        tag: "CLOSE",
                        expected: "exactly one subscription id",
                    });
                }
                Ok(ClientMessage::Close(subscription_id(items.remove(0))?))
            }
            _ => Err(MessageError::UnknownTag(tag)),
        }
    }
}

fn subscription_id(value: Value) -> Result<String, MessageError> {
    let Value::String(id) = value else {
        return Err(MessageError::NonStringSubscriptionId);
    };
    validate_subscription_id(&id)?;
    Ok(id)
}

/// Messages to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        subscription_id: String,
        event: Arc<Event>,
    },
    Eose(String),
    Notice(String),
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Closed {
        subscription_id: String,
        message: String,
    },
}

impl RelayMessage {
    pub fn ok(event_id: impl Into<String>, accepted: bool, message: impl Into<String>) -> Self {
        RelayMessage::Ok {
            event_id: event_id.into(),
            accepted,
            message: message.into(),
        }
    }

    pub fn notice(message: impl Into<String>) -> Self {
        RelayMessage::Notice(message.into())
    }

    pub fn closed(subscription_id: impl Into<String>, message: impl Into<String>) -> Self {
        RelayMessage::Closed {
            subscription_id: subscription_id.into(),
            message: message.into(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => json!(["EVENT", subscription_id, event.as_ref()]),
            RelayMessage::Eose(subscription_id) => json!(["EOSE", subscription_id]),
            RelayMessage::Notice(message) => json!(["NOTICE", message]),
            RelayMessage::Ok {
                event_id,
                accepted,
                message,
            } => json!(["OK", event_id, accepted, message]),
            RelayMessage::Closed {
                subscription_id,
                message,
            } => json!(["CLOSED", subscription_id, message]),
        }
    }

    pub fn to_json(&self) -> String {
        self.to_value().to_string()
    }
}

/// The id of the event in an `EVENT` message, even when the message around
/// it is malformed.
fn submitted_event_id(value: &Value) -> Option<String> {
    let items = value.as_array()?;
    if items.first()?.as_str()? != "EVENT" {
        return None;
    }
    let id = items.get(1)?.get("id")?.as_str()?;
    Some(id.to_string())
}

/// Route decoded messages by tag: `Inbound` becomes `SubmitEvent`, `Req`,
/// `Unsubscribe` or `BadMessage`.
pub fn message_structure(session: &Session) -> Binding {
    let handle = session.handle();
    session
        .dispatcher()
        .on(EventType::Inbound, move |envelope, dispatcher| {
            if envelope.is_canceled() {
                return Ok(());
            }
            let Payload::Inbound(value) = envelope.payload() else {
                return Ok(());
            };
            let payload = match ClientMessage::from_value(value.clone()) {
                Ok(ClientMessage::Event(event)) => Payload::SubmitEvent(event),
                Ok(ClientMessage::Req(request)) => Payload::Req(request),
                Ok(ClientMessage::Close(id)) => Payload::Unsubscribe(id),
                Err(e) => {
                    debug!("Malformed message from session {}: {}", handle, e);
                    Payload::BadMessage(BadMessage::for_event(e, submitted_event_id(value)))
                }
            };
            dispatcher.defer_emit(envelope.child(payload));
            Ok(())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_client_messages() {
        assert_eq!(
            ClientMessage::from_value(json!(["EVENT", {"id": "x"}])).unwrap(),
            ClientMessage::Event(json!({"id": "x"}))
        );
        assert_eq!(
            ClientMessage::from_value(json!(["REQ", "s1", {"kinds": [1]}, {}])).unwrap(),
            ClientMessage::Req(ReqRequest {
                subscription_id: "s1".to_string(),
                filters: vec![json!({"kinds": [1]}), json!({})],
            })
        );
        assert_eq!(
            ClientMessage::from_value(json!(["REQ", "s1"])).unwrap(),
            ClientMessage::Req(ReqRequest {
                subscription_id: "s1".to_string(),
                filters: vec![],
            })
        );
        assert_eq!(
            ClientMessage::from_value(json!(["CLOSE", "s1"])).unwrap(),
            ClientMessage::Close("s1".to_string())
        );
    }

    #[test]
    fn test_submitted_event_id_survives_bad_arity() {
        assert_eq!(
            submitted_event_id(&json!(["EVENT", {"id": "abc"}, 1])),
            Some("abc".to_string())
        );
        assert_eq!(submitted_event_id(&json!(["EVENT"])), None);
        assert_eq!(submitted_event_id(&json!(["EVENT", {"id": 7}, 1])), None);
        assert_eq!(submitted_event_id(&json!(["REQ", {"id": "abc"}])), None);
    }

    #[test]
    fn test_structure_errors() {
        let cases = [
            (json!({"EVENT": 1}), MessageError::NotAnArray),
            (json!([]), MessageError::Empty),
            (json!([1, 2]), MessageError::NonStringTag),
            (json!(["AUTH", "x"]), MessageError::UnknownTag("AUTH".to_string())),
            (
                json!(["EVENT"]),
                MessageError::Arity {
                    tag: "EVENT",
                    expected: "exactly one event",
                },
            ),
            (json!(["REQ", 5]), MessageError::NonStringSubscriptionId),
            (
                json!(["CLOSE", ""]),
                MessageError::SubscriptionId(ValidationError::EmptySubscriptionId),
            ),
            (
                json!(["REQ", "s".repeat(65)]),
                MessageError::SubscriptionId(ValidationError::SubscriptionIdTooLong),
            ),
        ];

        for (value, expected) in cases {
            assert_eq!(ClientMessage::from_value(value.clone()), Err(expected), "for {}", value);
        }
    }

    #[test]
    fn test_relay_message_encoding() {
        assert_eq!(RelayMessage::Eose("s1".to_string()).to_json(), r#"["EOSE","s1"]"#);
        assert_eq!(
            RelayMessage::ok("abc", true, DUPLICATE_PREFIX).to_json(),
            r#"["OK","abc",true,"duplicate:"]"#
        );
        assert_eq!(
            RelayMessage::closed("s1", "invalid: bad filter").to_json(),
            r#"["CLOSED","s1","invalid: bad filter"]"#
        );
        assert_eq!(RelayMessage::notice("hi").to_json(), r#"["NOTICE","hi"]"#);
    }
}
