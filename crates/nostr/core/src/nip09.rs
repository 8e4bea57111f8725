//! NIP-09: Event Deletion Request
//!
//! A kind 5 event asks relays to delete the events referenced by its `e`
//! tags. Only events by the same author may be deleted; the optional content
//! carries the reason.

use crate::Event;

pub const DELETION_REQUEST_KIND: u16 = 5;

pub fn is_deletion_request(event: &Event) -> bool {
    event.kind == DELETION_REQUEST_KIND
}

/// Ids referenced by the `e` tags of a deletion request.
pub fn get_deleted_event_ids(event: &Event) -> Vec<String> {
    if !is_deletion_request(event) {
        return Vec::new();
    }
    event.tag_values("e").map(str::to_string).collect()
}

pub fn get_deletion_reason(event: &Event) -> Option<&str> {
    if is_deletion_request(event) && !event.content.is_empty() {
        Some(event.content.as_str())
    } else {
        None
    }
}

/// Whether `deletion` is allowed to delete `target`.
pub fn should_delete_event(target: &Event, deletion: &Event) -> bool {
    is_deletion_request(deletion)
        && target.pubkey == deletion.pubkey
        && deletion.tag_values("e").any(|id| id == target.id)
}
