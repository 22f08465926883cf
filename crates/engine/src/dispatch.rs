use parley_protocol::{
    ClassifiedEvent, ConversationIdAssigned, ModelAssigned, ProgressUpdate, ProtocolEvent,
    ReasoningDelta, SourcesUpdate, TextDelta, TitleAssigned, classify,
};

/// One handler per recognized event kind.
pub trait TurnEventSink {
    fn text_delta(&mut self, event: TextDelta);
    fn reasoning_delta(&mut self, event: ReasoningDelta);
    fn conversation_id(&mut self, event: ConversationIdAssigned);
    fn title(&mut self, event: TitleAssigned);
    fn model(&mut self, event: ModelAssigned);
    fn progress(&mut self, event: ProgressUpdate);
    fn sources(&mut self, event: SourcesUpdate);

    /// Generic pass-through: unknown tags and malformed payloads.
    fn unrecognized(&mut self, _event: &ProtocolEvent) {}
}

/// Classifies `event` and routes it to exactly one handler.
///
/// Returns the tag that handled it, or `None` for pass-through events.
pub fn dispatch(event: &ProtocolEvent, sink: &mut impl TurnEventSink) -> Option<&'static str> {
    let Some(classified) = classify(event) else {
        tracing::trace!(kind = %event.kind, "passing through unrecognized event");
        sink.unrecognized(event);
        return None;
    };

    let tag = classified.tag();
    tracing::trace!(tag, "routing classified event");
    match classified {
        ClassifiedEvent::TextDelta(event) => sink.text_delta(event),
        ClassifiedEvent::ReasoningDelta(event) => sink.reasoning_delta(event),
        ClassifiedEvent::ConversationId(event) => sink.conversation_id(event),
        ClassifiedEvent::Title(event) => sink.title(event),
        ClassifiedEvent::Model(event) => sink.model(event),
        ClassifiedEvent::Progress(event) => sink.progress(event),
        ClassifiedEvent::Sources(event) => sink.sources(event),
    }
    Some(tag)
}
