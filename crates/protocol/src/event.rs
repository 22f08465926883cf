use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix of an SSE data line.
const SSE_DATA_PREFIX: &str = "data:";
/// Terminal sentinel some backends emit instead of closing the body.
const SSE_DONE_SENTINEL: &str = "[DONE]";

/// One decoded protocol event as delivered by the generation backend.
///
/// `data` stays untyped here; the classifier decides whether it is well formed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl ProtocolEvent {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }

    /// Decodes one SSE line into an event.
    ///
    /// Comments, blank lines, non-data fields, the `[DONE]` sentinel and
    /// undecodable payloads all yield `None`; the stream simply does not advance.
    pub fn decode_sse_line(line: &str) -> Option<Self> {
        let payload = line.strip_prefix(SSE_DATA_PREFIX)?.trim();
        if payload.is_empty() || payload == SSE_DONE_SENTINEL {
            return None;
        }

        match serde_json::from_str::<Self>(payload) {
            Ok(event) => Some(event),
            Err(error) => {
                tracing::trace!(error = %error, "dropping undecodable sse payload");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_data_lines() {
        let event = ProtocolEvent::decode_sse_line(
            r#"data: {"type":"data-title","data":{"title":"Trip plan"}}"#,
        )
        .unwrap();
        assert_eq!(event.kind, "data-title");
        assert_eq!(event.data, json!({ "title": "Trip plan" }));
    }

    #[test]
    fn missing_data_defaults_to_null() {
        let event = ProtocolEvent::decode_sse_line(r#"data: {"type":"finish"}"#).unwrap();
        assert_eq!(event.data, Value::Null);
    }

    #[test]
    fn ignores_non_event_lines() {
        assert_eq!(ProtocolEvent::decode_sse_line(": keep-alive"), None);
        assert_eq!(ProtocolEvent::decode_sse_line("event: message"), None);
        assert_eq!(ProtocolEvent::decode_sse_line("data: [DONE]"), None);
        assert_eq!(ProtocolEvent::decode_sse_line("data: {not json"), None);
        assert_eq!(ProtocolEvent::decode_sse_line(""), None);
    }
}
