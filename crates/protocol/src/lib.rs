#![deny(unsafe_code)]

/// Pure event classification (predicate + narrowing per kind).
pub mod classify;
pub mod event;
pub mod ids;
/// Transcript data model shared across crates.
pub mod message;

pub use classify::{
    ClassifiedEvent, ConversationIdAssigned, EventKind, ModelAssigned, ProgressUpdate,
    ReasoningDelta, SourcesUpdate, TextDelta, TitleAssigned, classify,
};
pub use event::ProtocolEvent;
pub use ids::{ConversationId, MessageId};
pub use message::{Message, MessageMetadata, Part, Reaction, Role, Source, Step, StepStatus};
