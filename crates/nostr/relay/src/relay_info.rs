//! NIP-11: Relay Information Document
//!
//! [`Relay::information_document`](crate::Relay::information_document) emits a
//! `ServeInfo` envelope around a base document; plugins listening for it add
//! the NIPs they implement before the document is returned.

use crate::config::RelayConfig;
use crate::dispatcher::{Binding, Dispatcher};
use crate::envelope::{EventType, Payload};
use crate::validation::MAX_SUBSCRIPTION_ID_LENGTH;
use serde::{Deserialize, Serialize};

/// NIP-11 Relay Information Document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayInformation {
    /// Relay name (should be <30 chars)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Administrative contact pubkey (hex)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,

    /// Administrative contact (URI: mailto:, https:, etc.)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,

    /// Supported NIP numbers, ascending
    pub supported_nips: Vec<u16>,

    /// Relay software URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub software: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limitation: Option<Limitation>,
}

/// Server limitations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limitation {
    /// Maximum message length in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_length: Option<usize>,

    /// Maximum active subscriptions per connection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_subscriptions: Option<usize>,

    /// Maximum filters per REQ
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_filters: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_subid_length: Option<usize>,

    /// Authentication required (NIP-42)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_required: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_required: Option<bool>,
}

impl RelayInformation {
    /// Base document for `config`, advertising no NIPs yet.
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            name: config.info.name.clone(),
            description: config.info.description.clone(),
            pubkey: config.info.pubkey.clone(),
            contact: config.info.contact.clone(),
            supported_nips: Vec::new(),
            software: Some("https://github.com/OpenAgentsInc/openagents".to_string()),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            limitation: Some(Limitation::from_config(config)),
        }
    }

    /// Add `nip` to `supported_nips`, keeping the list sorted and unique.
    pub fn add_nip(&mut self, nip: u16) {
        if let Err(index) = self.supported_nips.binary_search(&nip) {
            self.supported_nips.insert(index, nip);
        }
    }

    pub fn supports(&self, nip: u16) -> bool {
        self.supported_nips.binary_search(&nip).is_ok()
    }
}

impl Limitation {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            max_message_length: Some(config.max_message_size),
            max_subscriptions: Some(config.max_subscriptions),
            max_filters: Some(config.max_filters),
            max_subid_length: Some(MAX_SUBSCRIPTION_ID_LENGTH),
            auth_required: Some(false),
            payment_required: Some(false),
        }
    }
}

/// Advertise `nips` on every information document served through `dispatcher`.
pub fn advertise(dispatcher: &Dispatcher, nips: &'static [u16]) -> Binding {
    dispatcher.on(EventType::ServeInfo, move |envelope, _| {
        if let Payload::ServeInfo(info) = envelope.payload() {
            let mut info = info.borrow_mut();
            for &nip in nips {
                info.add_nip(nip);
            }
        }
        Ok(())
    })
}
