//! Nostr protocol primitives for the OpenAgents relay.
//!
//! This crate provides:
//! - NIP-01: Event structure, canonical serialization, ids and Schnorr signatures
//! - NIP-09: Event Deletion Request helpers
//!
//! # Features
//!
//! - `full` (default): key generation, hashing, signing and verification
//!   (`bitcoin::secp256k1`). Without it only the event type and shape checks remain.

mod nip01;
mod nip09;

pub use nip01::{
    Event, EventTemplate, HEX_KEY_LENGTH, HEX_SIG_LENGTH, KIND_METADATA, KIND_SHORT_TEXT_NOTE,
    Nip01Error, UnsignedEvent, serialize_event, validate_event,
};

#[cfg(feature = "full")]
pub use nip01::{
    finalize_event, generate_secret_key, get_event_hash, get_public_key_hex, verify_event,
};

pub use nip09::{
    DELETION_REQUEST_KIND, get_deleted_event_ids, get_deletion_reason, is_deletion_request,
    should_delete_event,
};
