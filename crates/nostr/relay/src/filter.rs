//! NIP-01 subscription filters.
//!
//! A filter is satisfied when every populated field accepts the event. A list
//! of filters is satisfied when any one of them is, and an empty list accepts
//! everything. Supported fields:
//! - `ids` / `authors`: prefix match, each entry at most 64 characters
//! - `kinds`
//! - `#<letter>`: exact match against the first value of tags with that name
//! - `since` / `until`: inclusive bounds on `created_at`
//! - `limit`: cap on historical results
//! - `search`: accepted, not evaluated
//!
//! Parsing is strict: unknown fields and mistyped values are errors.

use nostr::{Event, HEX_KEY_LENGTH};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilterError {
    #[error("filter must be a JSON object")]
    NotAnObject,

    #[error("unknown filter field '{0}'")]
    UnknownField(String),

    #[error("filter field '{field}' must be {expected}")]
    InvalidType {
        field: String,
        expected: &'static str,
    },

    #[error("filter field '{field}' has an entry longer than 64 characters")]
    TooLong { field: String },
}

impl FilterError {
    fn invalid(field: &str, expected: &'static str) -> Self {
        Self::InvalidType {
            field: field.to_string(),
            expected,
        }
    }
}

/// NIP-01 filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Filter {
    /// Event id prefixes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Author pubkey prefixes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    /// Lower bound on `created_at` (inclusive)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// Upper bound on `created_at` (inclusive)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Free-text query; kept for round-tripping, never evaluated
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,

    /// Tag queries keyed with the `#` prefix (`"#e"`, `"#p"`)
    #[serde(flatten)]
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    /// An empty filter (matches all events).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors(mut self, authors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = u16>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// Set the free-text query. It does not affect matching.
    pub fn with_search(mut self, query: impl Into<String>) -> Self {
        self.search = Some(query.into());
        self
    }

    /// Add a tag query. `tag_name` may be given with or without the `#`.
    pub fn tag(mut self, tag_name: &str, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        let key = if tag_name.starts_with('#') {
            tag_name.to_string()
        } else {
            format!("#{}", tag_name)
        };
        self.tags.insert(key, values.into_iter().map(Into::into).collect());
        self
    }

    pub fn references_events(self, event_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tag("e", event_ids)
    }

    pub fn references_pubkeys(self, pubkeys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tag("p", pubkeys)
    }

    /// Parse one filter object from the wire.
    pub fn from_value(value: &Value) -> Result<Self, FilterError> {
        let object = value.as_object().ok_or(FilterError::NotAnObject)?;
        let mut filter = Filter::new();

        for (key, value) in object {
            match key.as_str() {
                "ids" => filter.ids = Some(prefix_list(key, value)?),
                "authors" => filter.authors = Some(prefix_list(key, value)?),
                "kinds" => filter.kinds = Some(kind_list(key, value)?),
                "since" => filter.since = Some(integer(key, value)?),
                "until" => filter.until = Some(integer(key, value)?),
                "limit" => filter.limit = Some(integer(key, value)?),
                "search" => {
                    let search = value
                        .as_str()
                        .ok_or_else(|| FilterError::invalid(key, "a string"))?;
                    filter.search = Some(search.to_string());
                }
                tag if is_tag_key(tag) => {
                    filter.tags.insert(tag.to_string(), string_list(key, value)?);
                }
                other => return Err(FilterError::UnknownField(other.to_string())),
            }
        }

        Ok(filter)
    }

    /// Check if an event matches this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref ids) = self.ids
            && !ids.iter().any(|id| event.id.starts_with(id.as_str()))
        {
            return false;
        }

        if let Some(ref authors) = self.authors
            && !authors.iter().any(|a| event.pubkey.starts_with(a.as_str()))
        {
            return false;
        }

        if let Some(ref kinds) = self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }

        if let Some(since) = self.since
            && event.created_at < since
        {
            return false;
        }

        if let Some(until) = self.until
            && event.created_at > until
        {
            return false;
        }

        self.tags.iter().all(|(key, values)| {
            let name = key.trim_start_matches('#');
            event
                .tag_values(name)
                .any(|tag_value| values.iter().any(|v| v == tag_value))
        })
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Filter::from_value(&value).map_err(serde::de::Error::custom)
    }
}

/// Parse every filter of a REQ. Fails on the first malformed filter.
pub fn parse_filters(values: &[Value]) -> Result<Vec<Filter>, FilterError> {
    values.iter().map(Filter::from_value).collect()
}

/// OR across filters; an empty list matches everything.
pub fn matches_any(filters: &[Filter], event: &Event) -> bool {
    filters.is_empty() || filters.iter().any(|filter| filter.matches(event))
}

/// Smallest `limit` across the filters, if any filter sets one.
pub fn effective_limit(filters: &[Filter]) -> Option<u64> {
    filters.iter().filter_map(|filter| filter.limit).min()
}

fn is_tag_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(
        (chars.next(), chars.next(), chars.next()),
        (Some('#'), Some(c), None) if c.is_ascii_alphabetic()
    )
}

fn array<'a>(field: &str, value: &'a Value, expected: &'static str) -> Result<&'a Vec<Value>, FilterError> {
    value
        .as_array()
        .ok_or_else(|| FilterError::invalid(field, expected))
}

fn string_list(field: &str, value: &Value) -> Result<Vec<String>, FilterError> {
    const EXPECTED: &str = "an array of strings";
    array(field, value, EXPECTED)?
        .iter()
        .map(|entry| {
            entry
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| FilterError::invalid(field, EXPECTED))
        })
        .collect()
}

fn prefix_list(field: &str, value: &Value) -> Result<Vec<String>, FilterError> {
    let list = string_list(field, value)?;
    if list.iter().any(|entry| entry.len() > HEX_KEY_LENGTH) {
        return Err(FilterError::TooLong {
            field: field.to_string(),
        });
    }
    Ok(list)
}

fn kind_list(field: &str, value: &Value) -> Result<Vec<u16>, FilterError> {
    const EXPECTED: &str = "an array of integers between 0 and 65535";
    array(field, value, EXPECTED)?
        .iter()
        .map(|entry| {
            entry
                .as_u64()
                .and_then(|kind| u16::try_from(kind).ok())
                .ok_or_else(|| FilterError::invalid(field, EXPECTED))
        })
        .collect()
}

fn integer(field: &str, value: &Value) -> Result<u64, FilterError> {
    value
        .as_u64()
        .ok_or_else(|| FilterError::invalid(field, "a non-negative integer"))
}
