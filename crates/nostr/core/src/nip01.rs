//! NIP-01: events, ids and signatures.
//!
//! An event id is the sha256 of the canonical serialization
//! `[0, pubkey, created_at, kind, tags, content]`, and the signature is a
//! BIP-340 Schnorr signature over that id by the x-only `pubkey`.
//!
//! Hashing, signing and verification require the `full` feature; the event
//! type and its shape checks are always available.

#[cfg(feature = "full")]
use bitcoin::hashes::{Hash, sha256};
#[cfg(feature = "full")]
use bitcoin::secp256k1::{Keypair, Message, Secp256k1, SecretKey, XOnlyPublicKey, schnorr};
#[cfg(feature = "full")]
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of a hex-encoded event id or public key.
pub const HEX_KEY_LENGTH: usize = 64;

/// Length of a hex-encoded Schnorr signature.
pub const HEX_SIG_LENGTH: usize = 128;

pub const KIND_METADATA: u16 = 0;
pub const KIND_SHORT_TEXT_NOTE: u16 = 1;

#[derive(Debug, Error)]
pub enum Nip01Error {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("signing error: {0}")]
    Signing(String),

    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// A signed Nostr event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Lowercase hex sha256 of the canonical serialization
    pub id: String,
    /// Lowercase hex x-only public key of the author
    pub pubkey: String,
    /// Unix timestamp in seconds
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    /// Lowercase hex Schnorr signature over `id`
    pub sig: String,
}

impl Event {
    /// Values (second element) of every tag named `name`.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().is_some_and(|n| n == name))
            .filter_map(|tag| tag.get(1).map(String::as_str))
    }

    /// The fields covered by the id hash.
    pub fn unsigned(&self) -> UnsignedEvent {
        UnsignedEvent {
            pubkey: self.pubkey.clone(),
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags.clone(),
            content: self.content.clone(),
        }
    }
}

/// The hashed portion of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Event content before a key is applied; the pubkey comes from the signing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventTemplate {
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Check the hex shape of `id`, `pubkey` and `sig`. Says nothing about the signature itself.
pub fn validate_event(event: &Event) -> bool {
    is_lower_hex(&event.id, HEX_KEY_LENGTH)
        && is_lower_hex(&event.pubkey, HEX_KEY_LENGTH)
        && is_lower_hex(&event.sig, HEX_SIG_LENGTH)
}

/// Canonical serialization: `[0, pubkey, created_at, kind, tags, content]`.
pub fn serialize_event(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    if !is_lower_hex(&event.pubkey, HEX_KEY_LENGTH) {
        return Err(Nip01Error::InvalidEvent(
            "pubkey must be 64 lowercase hex characters".to_string(),
        ));
    }

    Ok(serde_json::to_string(&(
        0,
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ))?)
}

#[cfg(feature = "full")]
pub fn generate_secret_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::rng().fill_bytes(&mut key);
    key
}

#[cfg(feature = "full")]
pub fn get_public_key_hex(secret_key: &[u8; 32]) -> Result<String, Nip01Error> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key).map_err(|e| Nip01Error::Signing(e.to_string()))?;
    let (xonly, _parity) = sk.x_only_public_key(&secp);
    Ok(hex::encode(xonly.serialize()))
}

#[cfg(feature = "full")]
fn event_digest(event: &UnsignedEvent) -> Result<[u8; 32], Nip01Error> {
    let serialized = serialize_event(event)?;
    Ok(sha256::Hash::hash(serialized.as_bytes()).to_byte_array())
}

/// The id an event with these fields must carry.
#[cfg(feature = "full")]
pub fn get_event_hash(event: &UnsignedEvent) -> Result<String, Nip01Error> {
    Ok(hex::encode(event_digest(event)?))
}

/// Sign `template` with `secret_key`.
#[cfg(feature = "full")]
pub fn finalize_event(template: &EventTemplate, secret_key: &[u8; 32]) -> Result<Event, Nip01Error> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(secret_key).map_err(|e| Nip01Error::Signing(e.to_string()))?;
    let keypair = Keypair::from_secret_key(&secp, &sk);
    let (xonly, _parity) = keypair.x_only_public_key();

    let unsigned = UnsignedEvent {
        pubkey: hex::encode(xonly.serialize()),
        created_at: template.created_at,
        kind: template.kind,
        tags: template.tags.clone(),
        content: template.content.clone(),
    };
    let digest = event_digest(&unsigned)?;
    let sig = secp.sign_schnorr_no_aux_rand(&Message::from_digest(digest), &keypair);

    Ok(Event {
        id: hex::encode(digest),
        pubkey: unsigned.pubkey,
        created_at: unsigned.created_at,
        kind: unsigned.kind,
        tags: unsigned.tags,
        content: unsigned.content,
        sig: hex::encode(sig.serialize()),
    })
}

/// Recompute the id and check the Schnorr signature.
///
/// Returns `Ok(false)` for any well-formed event that fails verification and
/// `Err` only when the event cannot be decoded at all.
#[cfg(feature = "full")]
pub fn verify_event(event: &Event) -> Result<bool, Nip01Error> {
    if !validate_event(event) {
        return Ok(false);
    }

    let digest = event_digest(&event.unsigned())?;
    if hex::encode(digest) != event.id {
        return Ok(false);
    }

    let sig_bytes = hex::decode(&event.sig)?;
    let pubkey_bytes = hex::decode(&event.pubkey)?;
    let (Ok(sig), Ok(pubkey)) = (
        schnorr::Signature::from_slice(&sig_bytes),
        XOnlyPublicKey::from_slice(&pubkey_bytes),
    ) else {
        return Ok(false);
    };

    let secp = Secp256k1::verification_only();
    Ok(secp
        .verify_schnorr(&sig, &Message::from_digest(digest), &pubkey)
        .is_ok())
}
