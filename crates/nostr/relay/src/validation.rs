//! Event and subscription id validation.
//!
//! Structure is checked when an `EVENT` message is decoded; the signature is
//! checked by the store, through an [`EventVerifier`], right before insertion.

use nostr::{Event, HEX_KEY_LENGTH, HEX_SIG_LENGTH};
use serde_json::Value;
use thiserror::Error;

pub const MAX_SUBSCRIPTION_ID_LENGTH: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("event must be a JSON object")]
    NotAnObject,

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("unexpected field '{0}'")]
    UnexpectedField(String),

    #[error("field '{field}' must be {expected}")]
    InvalidField {
        field: &'static str,
        expected: &'static str,
    },

    #[error("event id does not match its content")]
    IdMismatch,

    #[error("bad signature")]
    BadSignature,

    #[error("subscription id must not be empty")]
    EmptySubscriptionId,

    #[error("subscription id longer than 64 characters")]
    SubscriptionIdTooLong,
}

/// Decides whether an event's id and signature are genuine.
pub trait EventVerifier {
    fn verify(&self, event: &Event) -> Result<(), ValidationError>;
}

/// BIP-340 verification through the `nostr` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct SchnorrVerifier;

impl EventVerifier for SchnorrVerifier {
    fn verify(&self, event: &Event) -> Result<(), ValidationError> {
        let expected = nostr::get_event_hash(&event.unsigned())
            .map_err(|_| ValidationError::InvalidField {
                field: "pubkey",
                expected: "64 lowercase hex characters",
            })?;
        if expected != event.id {
            return Err(ValidationError::IdMismatch);
        }
        match nostr::verify_event(event) {
            Ok(true) => Ok(()),
            _ => Err(ValidationError::BadSignature),
        }
    }
}

impl<F> EventVerifier for F
where
    F: Fn(&Event) -> bool,
{
    fn verify(&self, event: &Event) -> Result<(), ValidationError> {
        if self(event) {
            Ok(())
        } else {
            Err(ValidationError::BadSignature)
        }
    }
}

const FIELDS: [&str; 7] = ["id", "pubkey", "created_at", "kind", "tags", "content", "sig"];

/// Check the shape of a submitted event object and decode it.
///
/// Does not look at the signature.
pub fn validate_event_structure(value: &Value) -> Result<Event, ValidationError> {
    let object = value.as_object().ok_or(ValidationError::NotAnObject)?;

    if let Some(extra) = object.keys().find(|key| !FIELDS.contains(&key.as_str())) {
        return Err(ValidationError::UnexpectedField(extra.clone()));
    }

    let field = |name: &'static str| object.get(name).ok_or(ValidationError::MissingField(name));

    let id = hex_field("id", field("id")?, HEX_KEY_LENGTH)?;
    let pubkey = hex_field("pubkey", field("pubkey")?, HEX_KEY_LENGTH)?;
    let sig = hex_field("sig", field("sig")?, HEX_SIG_LENGTH)?;

    let created_at = field("created_at")?
        .as_u64()
        .ok_or(ValidationError::InvalidField {
            field: "created_at",
            expected: "a non-negative integer",
        })?;

    let kind = field("kind")?
        .as_u64()
        .and_then(|kind| u16::try_from(kind).ok())
        .ok_or(ValidationError::InvalidField {
            field: "kind",
            expected: "an integer between 0 and 65535",
        })?;

    let content = field("content")?
        .as_str()
        .ok_or(ValidationError::InvalidField {
            field: "content",
            expected: "a string",
        })?
        .to_string();

    let tags = tags_field(field("tags")?)?;

    Ok(Event {
        id,
        pubkey,
        created_at,
        kind,
        tags,
        content,
        sig,
    })
}

pub fn validate_subscription_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() {
        return Err(ValidationError::EmptySubscriptionId);
    }
    if id.chars().count() > MAX_SUBSCRIPTION_ID_LENGTH {
        return Err(ValidationError::SubscriptionIdTooLong);
    }
    Ok(())
}

fn hex_field(name: &'static str, value: &Value, len: usize) -> Result<String, ValidationError> {
    let invalid = ValidationError::InvalidField {
        field: name,
        expected: if len == HEX_SIG_LENGTH {
            "128 lowercase hex characters"
        } else {
            "64 lowercase hex characters"
        },
    };
    let text = value.as_str().ok_or_else(|| invalid.clone())?;
    if text.len() != len || !text.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(invalid);
    }
    Ok(text.to_string())
}

fn tags_field(value: &Value) -> Result<Vec<Vec<String>>, ValidationError> {
    let invalid = ValidationError::InvalidField {
        field: "tags",
        expected: "an array of string arrays",
    };
    let tags = value.as_array().ok_or_else(|| invalid.clone())?;
    tags.iter()
        .map(|tag| {
            tag.as_array()
                .ok_or_else(|| invalid.clone())?
                .iter()
                .map(|item| item.as_str().map(str::to_string).ok_or_else(|| invalid.clone()))
                .collect()
        })
        .collect()
}
