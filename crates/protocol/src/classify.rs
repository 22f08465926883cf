//! Pure classification of inbound protocol events.
//!
//! Every kind is a predicate + narrowing pair: it matches only when the event
//! tag equals the kind's literal tag and the payload carries every required
//! field with the expected primitive type. Anything else falls through as
//! unrecognized, so callers can run this on every event without guarding.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::event::ProtocolEvent;
use crate::ids::MessageId;
use crate::message::{Source, Step};

pub const TEXT_DELTA_TAG: &str = "text-delta";
pub const REASONING_DELTA_TAG: &str = "reasoning-delta";
pub const CONVERSATION_ID_TAG: &str = "data-conversation-id";
pub const TITLE_TAG: &str = "data-title";
pub const MODEL_TAG: &str = "data-model";
pub const PROGRESS_TAG: &str = "data-progress";
pub const SOURCES_TAG: &str = "data-sources";

/// Predicate + narrowing pair for one event kind.
pub trait EventKind: Sized {
    const TAG: &'static str;

    /// Narrows an untyped payload; `None` means malformed.
    fn narrow_data(data: &Map<String, Value>) -> Option<Self>;

    fn narrow(event: &ProtocolEvent) -> Option<Self> {
        if event.kind != Self::TAG {
            return None;
        }
        Self::narrow_data(event.data.as_object()?)
    }

    fn matches(event: &ProtocolEvent) -> bool {
        Self::narrow(event).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDelta {
    pub delta: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasoningDelta {
    pub delta: String,
}

/// Lifecycle event carrying the server-assigned conversation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationIdAssigned {
    pub conv_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleAssigned {
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelAssigned {
    pub message_id: MessageId,
    pub model_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub steps: Option<Vec<Step>>,
    pub step: Option<Step>,
    pub reset: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourcesUpdate {
    pub sources: Option<Vec<Source>>,
    pub reset: bool,
}

impl EventKind for TextDelta {
    const TAG: &'static str = TEXT_DELTA_TAG;

    fn narrow_data(data: &Map<String, Value>) -> Option<Self> {
        Some(Self {
            delta: required_str(data, "delta")?,
        })
    }
}

impl EventKind for ReasoningDelta {
    const TAG: &'static str = REASONING_DELTA_TAG;

    fn narrow_data(data: &Map<String, Value>) -> Option<Self> {
        Some(Self {
            delta: required_str(data, "delta")?,
        })
    }
}

impl EventKind for ConversationIdAssigned {
    const TAG: &'static str = CONVERSATION_ID_TAG;

    fn narrow_data(data: &Map<String, Value>) -> Option<Self> {
        Some(Self {
            conv_id: required_str(data, "convId")?,
        })
    }
}

impl EventKind for TitleAssigned {
    const TAG: &'static str = TITLE_TAG;

    fn narrow_data(data: &Map<String, Value>) -> Option<Self> {
        Some(Self {
            title: required_str(data, "title")?,
        })
    }
}

impl EventKind for ModelAssigned {
    const TAG: &'static str = MODEL_TAG;

    fn narrow_data(data: &Map<String, Value>) -> Option<Self> {
        Some(Self {
            message_id: MessageId::new(required_str(data, "messageId")?),
            model_id: required_str(data, "modelId")?,
        })
    }
}

impl EventKind for ProgressUpdate {
    const TAG: &'static str = PROGRESS_TAG;

    fn narrow_data(data: &Map<String, Value>) -> Option<Self> {
        Some(Self {
            steps: optional_records(data, "steps")?,
            step: optional_record(data, "step")?,
            reset: optional_bool(data, "reset")?.unwrap_or(false),
        })
    }
}

impl EventKind for SourcesUpdate {
    const TAG: &'static str = SOURCES_TAG;

    fn narrow_data(data: &Map<String, Value>) -> Option<Self> {
        Some(Self {
            sources: optional_records(data, "sources")?,
            reset: optional_bool(data, "reset")?.unwrap_or(false),
        })
    }
}

/// Closed set of recognized event kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifiedEvent {
    TextDelta(TextDelta),
    ReasoningDelta(ReasoningDelta),
    ConversationId(ConversationIdAssigned),
    Title(TitleAssigned),
    Model(ModelAssigned),
    Progress(ProgressUpdate),
    Sources(SourcesUpdate),
}

impl ClassifiedEvent {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::TextDelta(_) => TextDelta::TAG,
            Self::ReasoningDelta(_) => ReasoningDelta::TAG,
            Self::ConversationId(_) => ConversationIdAssigned::TAG,
            Self::Title(_) => TitleAssigned::TAG,
            Self::Model(_) => ModelAssigned::TAG,
            Self::Progress(_) => ProgressUpdate::TAG,
            Self::Sources(_) => SourcesUpdate::TAG,
        }
    }
}

/// Classifies one event. `None` is the generic pass-through kind.
pub fn classify(event: &ProtocolEvent) -> Option<ClassifiedEvent> {
    match event.kind.as_str() {
        TEXT_DELTA_TAG => TextDelta::narrow(event).map(ClassifiedEvent::TextDelta),
        REASONING_DELTA_TAG => ReasoningDelta::narrow(event).map(ClassifiedEvent::ReasoningDelta),
        CONVERSATION_ID_TAG => {
            ConversationIdAssigned::narrow(event).map(ClassifiedEvent::ConversationId)
        }
        TITLE_TAG => TitleAssigned::narrow(event).map(ClassifiedEvent::Title),
        MODEL_TAG => ModelAssigned::narrow(event).map(ClassifiedEvent::Model),
        PROGRESS_TAG => ProgressUpdate::narrow(event).map(ClassifiedEvent::Progress),
        SOURCES_TAG => SourcesUpdate::narrow(event).map(ClassifiedEvent::Sources),
        _ => None,
    }
}

fn required_str(data: &Map<String, Value>, field: &str) -> Option<String> {
    data.get(field)?.as_str().map(str::to_string)
}

// Outer `None` = malformed, inner `None` = absent. Explicit nulls count as absent.
fn optional_bool(data: &Map<String, Value>, field: &str) -> Option<Option<bool>> {
    match data.get(field) {
        None | Some(Value::Null) => Some(None),
        Some(Value::Bool(value)) => Some(Some(*value)),
        Some(_) => None,
    }
}

fn optional_record<T: DeserializeOwned>(
    data: &Map<String, Value>,
    field: &str,
) -> Option<Option<T>> {
    match data.get(field) {
        None | Some(Value::Null) => Some(None),
        Some(value @ Value::Object(_)) => serde_json::from_value(value.clone()).ok().map(Some),
        Some(_) => None,
    }
}

fn optional_records<T: DeserializeOwned>(
    data: &Map<String, Value>,
    field: &str,
) -> Option<Option<Vec<T>>> {
    match data.get(field) {
        None | Some(Value::Null) => Some(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::Object(_) => serde_json::from_value(item.clone()).ok(),
                _ => None,
            })
            .collect::<Option<Vec<T>>>()
            .map(Some),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::message::StepStatus;

    fn event(kind: &str, data: Value) -> ProtocolEvent {
        ProtocolEvent::new(kind, data)
    }

    #[test]
    fn classifies_lifecycle_id() {
        let classified = classify(&event("data-conversation-id", json!({ "convId": "c123" })));
        assert_eq!(
            classified,
            Some(ClassifiedEvent::ConversationId(ConversationIdAssigned {
                conv_id: "c123".to_string()
            }))
        );
    }

    #[test]
    fn wrong_primitive_type_is_unrecognized() {
        assert_eq!(
            classify(&event("data-conversation-id", json!({ "convId": 123 }))),
            None
        );
        assert_eq!(classify(&event("data-title", json!({ "title": null }))), None);
        assert_eq!(
            classify(&event("data-model", json!({ "messageId": "m1" }))),
            None
        );
        assert_eq!(classify(&event("text-delta", json!("raw string"))), None);
    }

    #[test]
    fn matching_payload_under_other_tag_is_unrecognized() {
        assert_eq!(classify(&event("data-unknown", json!({ "title": "x" }))), None);
        assert!(!TitleAssigned::matches(&event("data-name", json!({ "title": "x" }))));
        assert!(TitleAssigned::matches(&event("data-title", json!({ "title": "x" }))));
    }

    #[test]
    fn progress_accepts_any_combination_of_optional_fields() {
        let classified = classify(&event(
            "data-progress",
            json!({
                "step": { "id": "s1", "label": "Searching", "status": "running" },
                "reset": true
            }),
        ));

        assert_eq!(
            classified,
            Some(ClassifiedEvent::Progress(ProgressUpdate {
                steps: None,
                step: Some(Step::new("s1", "Searching", StepStatus::Running)),
                reset: true,
            }))
        );

        assert_eq!(
            classify(&event("data-progress", json!({}))),
            Some(ClassifiedEvent::Progress(ProgressUpdate {
                steps: None,
                step: None,
                reset: false,
            }))
        );
    }

    #[test]
    fn progress_with_malformed_optional_field_is_unrecognized() {
        assert_eq!(
            classify(&event("data-progress", json!({ "reset": "yes" }))),
            None
        );
        assert_eq!(
            classify(&event("data-progress", json!({ "steps": [{ "id": 1 }] }))),
            None
        );
        assert_eq!(
            classify(&event("data-progress", json!({ "steps": {} }))),
            None
        );
    }

    #[test]
    fn sources_list_is_narrowed() {
        let classified = classify(&event(
            "data-sources",
            json!({
                "sources": [
                    { "id": "src-1", "url": "https://a.example", "title": "A" },
                    { "id": "src-2", "url": "https://b.example" }
                ]
            }),
        ));

        let Some(ClassifiedEvent::Sources(update)) = classified else {
            panic!("expected sources event");
        };
        assert!(!update.reset);
        assert_eq!(
            update.sources,
            Some(vec![
                Source::new("src-1", "https://a.example").with_title("A"),
                Source::new("src-2", "https://b.example"),
            ])
        );
    }

    #[test]
    fn text_and_reasoning_deltas_carry_their_tag() {
        let text = classify(&event("text-delta", json!({ "delta": "Hi" }))).unwrap();
        let reasoning = classify(&event("reasoning-delta", json!({ "delta": "hmm" }))).unwrap();
        assert_eq!(text.tag(), TEXT_DELTA_TAG);
        assert_eq!(reasoning.tag(), REASONING_DELTA_TAG);
    }
}
