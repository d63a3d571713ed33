//! Message envelope codec.
//!
//! A message is a list of opaque frames carrying an event name and a JSON
//! payload. Three shapes are legal on the wire:
//!
//! - `[event_name, event_data]`
//! - `[empty, event_name, event_data]` (sockets that prepend a delimiter)
//! - `[address, empty, event_name, event_data]` (messages received by a router)

use crate::transport::Frame;
use serde::Serialize;
use serde_json::Value;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Failed to encode event data for '{event}': {source}")]
    Encode {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("Failed to decode event data: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Event carried by an envelope.
///
/// Well-known events are matched exhaustively; anything else round-trips as
/// `Custom` so the codec never loses an event name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Heartbeat,
    Message,
    Response,
    Custom(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Heartbeat => "heartbeat",
            EventKind::Message => "message",
            EventKind::Response => "response",
            EventKind::Custom(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "heartbeat" => EventKind::Heartbeat,
            "message" => EventKind::Message,
            "response" => EventKind::Response,
            other => EventKind::Custom(other.to_string()),
        }
    }
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub event: EventKind,
    pub data: Value,
}

impl Envelope {
    /// Deserialize the payload into a typed value.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_value(self.data.clone()).map_err(EnvelopeError::Decode)
    }
}

/// Build the frames for an event.
///
/// With `include_empty_frame` an empty delimiter frame is inserted first, which
/// is what a router peer expects from a dealer.
pub fn create_message<T: Serialize + ?Sized>(
    event: &EventKind,
    data: &T,
    include_empty_frame: bool,
) -> Result<Vec<Frame>, EnvelopeError> {
    let name = event.as_str();
    if name.is_empty() {
        return Err(EnvelopeError::Malformed("event name is empty".to_string()));
    }

    let payload = serde_json::to_vec(data).map_err(|source| EnvelopeError::Encode {
        event: name.to_string(),
        source,
    })?;

    let mut frames = Vec::with_capacity(3);
    if include_empty_frame {
        frames.push(Vec::new());
    }
    frames.push(name.as_bytes().to_vec());
    frames.push(payload);
    Ok(frames)
}

/// Decode frames in any of the three legal shapes.
pub fn parse_message(frames: &[Frame]) -> Result<Envelope, EnvelopeError> {
    if frames.len() < 2 {
        return Err(EnvelopeError::Malformed(format!(
            "expected at least 2 frames, got {}",
            frames.len()
        )));
    }

    let (name, data) = if frames[0].is_empty() {
        match frames.get(1..3) {
            Some([name, data]) => (name, data),
            _ => {
                return Err(EnvelopeError::Malformed(
                    "delimited message is missing its data frame".to_string(),
                ));
            }
        }
    } else if frames.len() == 4 && frames[1].is_empty() {
        (&frames[2], &frames[3])
    } else {
        (&frames[0], &frames[1])
    };

    let name = std::str::from_utf8(name)
        .map_err(|_| EnvelopeError::Malformed("event name is not valid UTF-8".to_string()))?;
    if name.is_empty() {
        return Err(EnvelopeError::Malformed("event name is empty".to_string()));
    }
    let data: Value = serde_json::from_slice(data).map_err(EnvelopeError::Decode)?;

    Ok(Envelope {
        event: EventKind::from_name(name),
        data,
    })
}

/// Routing address of a router-received message, if the message has one.
pub fn routing_address(frames: &[Frame]) -> Option<&[u8]> {
    match frames {
        [address, delimiter, _, _] if !address.is_empty() && delimiter.is_empty() => {
            Some(address.as_slice())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_data() -> Value {
        json!({"node_id": "abc", "nested": {"list": [1, 2, 3]}, "flag": true})
    }

    // ==================== Shapes ====================

    #[test]
    fn test_bare_shape() {
        let frames = create_message(&EventKind::Message, &sample_data(), false).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], b"message");

        let parsed = parse_message(&frames).unwrap();
        assert_eq!(parsed.event, EventKind::Message);
        assert_eq!(parsed.data, sample_data());
    }

    #[test]
    fn test_delimited_shape() {
        let frames = create_message(&EventKind::Heartbeat, &sample_data(), true).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].is_empty());

        let parsed = parse_message(&frames).unwrap();
        assert_eq!(parsed.event, EventKind::Heartbeat);
        assert_eq!(parsed.data, sample_data());
    }

    #[test]
    fn test_routed_shape() {
        let mut frames = create_message(&EventKind::Response, &sample_data(), true).unwrap();
        frames.insert(0, b"peer-7".to_vec());

        let parsed = parse_message(&frames).unwrap();
        assert_eq!(parsed.event, EventKind::Response);
        assert_eq!(parsed.data, sample_data());
        assert_eq!(routing_address(&frames), Some(&b"peer-7"[..]));
    }

    #[test]
    fn test_custom_event_names_survive() {
        let event = EventKind::Custom("register_worker".to_string());
        let frames = create_message(&event, &json!(null), false).unwrap();
        assert_eq!(parse_message(&frames).unwrap().event, event);
    }

    #[test]
    fn test_scalar_payloads() {
        for data in [json!(42), json!("text"), json!([]), json!(null)] {
            let frames = create_message(&EventKind::Message, &data, true).unwrap();
            assert_eq!(parse_message(&frames).unwrap().data, data);
        }
    }

    // ==================== Malformed input ====================

    #[test]
    fn test_too_few_frames() {
        assert!(matches!(
            parse_message(&[b"heartbeat".to_vec()]),
            Err(EnvelopeError::Malformed(_))
        ));
        assert!(matches!(parse_message(&[]), Err(EnvelopeError::Malformed(_))));
    }

    #[test]
    fn test_delimiter_without_data() {
        let frames = vec![Vec::new(), b"heartbeat".to_vec()];
        assert!(matches!(
            parse_message(&frames),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn test_invalid_json_payload() {
        let frames = vec![b"heartbeat".to_vec(), b"{not json".to_vec()];
        assert!(matches!(parse_message(&frames), Err(EnvelopeError::Decode(_))));
    }

    #[test]
    fn test_empty_event_name_rejected() {
        let event = EventKind::Custom(String::new());
        assert!(create_message(&event, &json!({}), false).is_err());
    }

    #[test]
    fn test_decode_typed_payload() {
        #[derive(serde::Deserialize)]
        struct Data {
            node_id: String,
        }
        let frames = create_message(&EventKind::Message, &sample_data(), false).unwrap();
        let data: Data = parse_message(&frames).unwrap().decode().unwrap();
        assert_eq!(data.node_id, "abc");
    }
}
