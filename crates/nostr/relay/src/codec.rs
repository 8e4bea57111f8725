//! Default text JSON codec.
//!
//! Decodes `Message` frames into `Inbound` values and encodes `Outgoing`
//! messages into text `Send` frames. Another codec takes over a connection by
//! canceling those envelopes from a listener registered ahead of this one.

use crate::dispatcher::Binding;
use crate::envelope::{EventType, Payload};
use crate::protocol::{BadMessage, MessageError};
use crate::session::{Frame, Session};
use serde_json::Value;
use tracing::{debug, warn};

/// Install the text codec on `session`, rejecting frames over `max_message_size` bytes.
pub fn text_codec(session: &Session, max_message_size: usize) -> Binding {
    let handle = session.handle();
    let dispatcher = session.dispatcher();

    let decoder = dispatcher.on(EventType::Message, move |envelope, dispatcher| {
        if envelope.is_canceled() {
            return Ok(());
        }
        let Payload::Message(frame) = envelope.payload() else {
            return Ok(());
        };

        let payload = match decode(frame, max_message_size) {
            Ok(value) => Payload::Inbound(value),
            Err(e) => {
                warn!("Rejected message from session {}: {}", handle, e);
                Payload::BadMessage(BadMessage::new(e))
            }
        };
        dispatcher.defer_emit(envelope.child(payload));
        Ok(())
    });

    let encoder = dispatcher.on(EventType::Outgoing, move |envelope, dispatcher| {
        if envelope.is_canceled() {
            return Ok(());
        }
        if let Payload::Outgoing(message) = envelope.payload() {
            let text = message.to_json();
            debug!("Sending to session {}: {}", handle, text);
            dispatcher.emit(envelope.child(Payload::Send(Frame::text(text))))?;
        }
        Ok(())
    });

    Binding::all(vec![decoder, encoder])
}

fn decode(frame: &Frame, max_message_size: usize) -> Result<Value, MessageError> {
    if frame.len() > max_message_size {
        return Err(MessageError::TooLarge {
            size: frame.len(),
            max: max_message_size,
        });
    }
    if frame.is_binary {
        return Err(MessageError::Binary);
    }
    let text = frame.as_text().ok_or(MessageError::NotJson)?;
    serde_json::from_str(text).map_err(|_| MessageError::NotJson)
}
