use std::sync::Arc;

use parking_lot::Mutex;
use parley_protocol::{
    ConversationId, ConversationIdAssigned, Message, MessageId, ModelAssigned, ProgressUpdate,
    ReasoningDelta, Reaction, Source, SourcesUpdate, Step, TextDelta, TitleAssigned,
};
use parley_storage::{ConversationPatch, ConversationRecord, HistoryStore};
use parley_transport::{
    Transport, TurnEvent, TurnEventPayload, TurnEventStream, TurnId, TurnRequest,
    TurnStreamHandle,
};
use snafu::{OptionExt, ResultExt, ensure};
use tokio::sync::watch;

use crate::boards::{ProgressBoard, SourcesBoard};
use crate::collaborators::{
    HostEffect, Navigator, SidebarEntry, SidebarIndex, unix_timestamp_seconds,
};
use crate::dispatch::{TurnEventSink, dispatch};
use crate::error::{
    EmptyPromptSnafu, NoActiveConversationSnafu, SessionResult, StorageSnafu,
    TurnInProgressSnafu, UnknownMessageSnafu,
};
use crate::history::{AbortHandle, HistoryLoader, abort_pair};
use crate::identity::{AssignOutcome, ConversationContext, ConversationIdentity};
use crate::optimistic::{ReactionOverlay, Settlement, toggle_target};
use crate::reconcile::{ReconcileOutcome, Transcript, find_retry_parent};
use crate::settings::EngineSettings;
use crate::stream::{StreamState, StreamStatus, StreamTransition, transition_for};

/// Error text used when a turn's connection ends without a finish signal.
pub const STREAM_CLOSED_MESSAGE: &str = "connection closed before the response finished";

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct SessionDeps {
    pub store: Arc<dyn HistoryStore>,
    pub transport: Arc<dyn Transport>,
    pub navigator: Arc<dyn Navigator>,
    pub sidebar: Arc<dyn SidebarIndex>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    /// Not for the active turn, or arrived after it ended.
    Rejected,
    /// Routed to the handler for this tag; `None` for pass-through events.
    Applied(Option<&'static str>),
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionOutcome {
    /// No active conversation; the reaction lives in the overlay only.
    LocalOnly(Option<Reaction>),
    Confirmed(Option<Reaction>),
    Superseded,
    Reverted { restored: Option<Reaction> },
}

struct ActiveTurn {
    turn: TurnId,
    assistant_message_id: MessageId,
    stop_tx: watch::Sender<bool>,
}

struct InitialLoadSlot {
    generation: u64,
    handle: AbortHandle,
}

struct SessionState {
    transcript: Transcript,
    overlay: ReactionOverlay,
    stream: StreamState,
    active_turn: Option<ActiveTurn>,
    last_turn: TurnId,
    progress: ProgressBoard,
    sources: SourcesBoard,
    title: String,
    initial_load: Option<InitialLoadSlot>,
    initial_generation: u64,
}

impl SessionState {
    fn new(conversation_id: Option<ConversationId>, title: String) -> Self {
        Self {
            transcript: Transcript::new(conversation_id),
            overlay: ReactionOverlay::new(),
            stream: StreamState::Idle,
            active_turn: None,
            last_turn: TurnId::new(0),
            progress: ProgressBoard::new(),
            sources: SourcesBoard::new(),
            title,
            initial_load: None,
            initial_generation: 0,
        }
    }

    fn reset_for(&mut self, conversation_id: Option<ConversationId>, title: String) {
        self.transcript.reset_for(conversation_id);
        self.overlay.clear();
        self.progress.clear();
        self.sources.clear();
        if let Ok(next) = self.stream.apply(StreamTransition::ResetToIdle) {
            self.stream = next;
        }
        self.active_turn = None;
        self.title = title;
    }

    fn begin_turn(&mut self) -> SessionResult<(TurnId, MessageId)> {
        if let Some(active) = self.stream.active_turn() {
            return TurnInProgressSnafu {
                stage: "session-begin-turn",
                active,
            }
            .fail();
        }

        let turn = self.last_turn.next();
        self.last_turn = turn;
        if let Ok(next) = self.stream.apply(StreamTransition::Submit(turn)) {
            self.stream = next;
        }

        let assistant_message_id = MessageId::generate();
        let (stop_tx, _) = watch::channel(false);
        self.active_turn = Some(ActiveTurn {
            turn,
            assistant_message_id: assistant_message_id.clone(),
            stop_tx,
        });
        Ok((turn, assistant_message_id))
    }
}

/// Transcript engine for one mounted chat view.
///
/// Owns the active conversation context, the base transcript, the reaction
/// overlay, the stream lifecycle and the auxiliary boards. Locks are only
/// held for synchronous sections; every `.await` happens without them.
pub struct ChatSession {
    settings: Arc<EngineSettings>,
    context: Arc<ConversationContext>,
    loader: HistoryLoader,
    store: Arc<dyn HistoryStore>,
    transport: Arc<dyn Transport>,
    sidebar: Arc<dyn SidebarIndex>,
    state: Mutex<SessionState>,
    turn_stream: Mutex<Option<TurnEventStream>>,
}

impl ChatSession {
    pub fn open(
        settings: Arc<EngineSettings>,
        deps: SessionDeps,
        url_id: Option<&str>,
        local_pending_id: Option<&str>,
    ) -> Self {
        let context = Arc::new(ConversationContext::new(
            settings.clone(),
            deps.navigator,
            deps.sidebar.clone(),
            url_id,
            local_pending_id,
        ));
        let loader = HistoryLoader::new(deps.store.clone(), context.clone());
        let state = SessionState::new(context.active_id(), settings.default_title.clone());

        Self {
            settings,
            context,
            loader,
            store: deps.store,
            transport: deps.transport,
            sidebar: deps.sidebar,
            state: Mutex::new(state),
            turn_stream: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn context(&self) -> &Arc<ConversationContext> {
        &self.context
    }

    pub fn active_conversation_id(&self) -> Option<ConversationId> {
        self.context.active_id()
    }

    pub fn subscribe_identity(&self) -> watch::Receiver<ConversationIdentity> {
        self.context.subscribe()
    }

    pub fn switch_conversation(&self, conversation_id: ConversationId) {
        tracing::info!(conversation_id = %conversation_id, "switching conversation");
        self.abort_initial_load();
        self.stop();
        self.context.switch_to(conversation_id.clone());
        self.state
            .lock()
            .reset_for(Some(conversation_id), self.settings.default_title.clone());
    }

    pub fn new_conversation(&self) {
        tracing::info!("starting new conversation");
        self.abort_initial_load();
        self.stop();
        self.context.reset();
        self.state
            .lock()
            .reset_for(None, self.settings.default_title.clone());
    }

    /// Fetches the newest page of the active conversation and reconciles it.
    ///
    /// A newer call, a switch or a reset aborts this one. Without an active id
    /// the list is only cleared if it still belongs to a conversation; an
    /// unsaved new chat keeps its messages.
    pub async fn load_initial(&self) -> ReconcileOutcome {
        let Some(conversation_id) = self.context.active_id() else {
            let mut state = self.state.lock();
            if state.transcript.conversation_id().is_none() {
                return ReconcileOutcome::NoProgress;
            }
            return state.transcript.clear();
        };

        let (handle, signal) = abort_pair();
        let generation = {
            let mut state = self.state.lock();
            state.initial_generation += 1;
            let generation = state.initial_generation;
            let previous = state.initial_load.replace(InitialLoadSlot { generation, handle });
            if let Some(previous) = previous {
                previous.handle.abort();
            }
            generation
        };

        let page = self
            .loader
            .load_initial(&conversation_id, self.settings.initial_page_size, signal)
            .await;

        let mut state = self.state.lock();
        if state
            .initial_load
            .as_ref()
            .is_some_and(|slot| slot.generation == generation)
        {
            state.initial_load = None;
        }
        let Some(page) = page else {
            return ReconcileOutcome::Aborted;
        };
        if self.context.active_id().as_ref() != Some(&conversation_id) {
            return ReconcileOutcome::IgnoredForeign;
        }

        let skip = self.context.take_skip(&conversation_id);
        let generating = state.stream.is_generating();
        state.transcript.apply_initial(page, skip, generating)
    }

    pub async fn load_older(&self) -> ReconcileOutcome {
        let (conversation_id, token) = {
            let state = self.state.lock();
            (
                state.transcript.conversation_id().cloned(),
                state.transcript.cursor_token().cloned(),
            )
        };
        let Some(conversation_id) = conversation_id else {
            return ReconcileOutcome::NoProgress;
        };

        let page = self
            .loader
            .load_older(
                &conversation_id,
                self.settings.older_page_size,
                token.as_ref(),
            )
            .await;
        self.state.lock().transcript.apply_older(page)
    }

    pub fn is_loading_older(&self) -> bool {
        self.loader.is_loading_older()
    }

    /// Appends the user message and opens a turn. Must run inside a Tokio runtime.
    ///
    /// A transport that refuses the turn does not fail the call: the refusal
    /// shows up as an error message in the transcript.
    pub fn submit(&self, text: &str) -> SessionResult<TurnId> {
        let text = text.trim();
        ensure!(
            !text.is_empty(),
            EmptyPromptSnafu {
                stage: "session-submit"
            }
        );

        let request = {
            let mut state = self.state.lock();
            let (turn, assistant_message_id) = state.begin_turn()?;
            let user_message = Message::user_text(MessageId::generate(), text);
            state.transcript.upsert_live(user_message.clone());
            TurnRequest::submit(
                turn,
                self.context.active_id(),
                user_message,
                assistant_message_id,
                self.settings.request.clone(),
            )
        };

        let turn = request.turn;
        self.open_turn(request);
        Ok(turn)
    }

    /// Regenerates an assistant message from its nearest preceding user
    /// message. Returns `Ok(None)` without any request when there is none.
    pub fn retry(&self, assistant_message_id: &MessageId) -> SessionResult<Option<TurnId>> {
        let request = {
            let mut state = self.state.lock();
            let Some(parent_message_id) =
                find_retry_parent(state.transcript.messages(), assistant_message_id)
            else {
                tracing::debug!(
                    message_id = %assistant_message_id,
                    "retry refused: no preceding user message"
                );
                return Ok(None);
            };

            let (turn, new_assistant_id) = state.begin_turn()?;
            TurnRequest::regenerate(
                turn,
                self.context.active_id(),
                parent_message_id,
                new_assistant_id,
                self.settings.request.clone(),
            )
        };

        let turn = request.turn;
        self.open_turn(request);
        Ok(Some(turn))
    }

    /// Ends the active turn early. Returns false when nothing was generating.
    pub fn stop(&self) -> bool {
        let turn = {
            let mut state = self.state.lock();
            let Some(turn) = state.stream.active_turn() else {
                return false;
            };
            if let Ok(next) = state.stream.apply(StreamTransition::Stop(turn)) {
                state.stream = next;
            }
            if let Some(active) = state.active_turn.take() {
                active.stop_tx.send_replace(true);
            }
            turn
        };

        if let Some(mut stream) = self.take_stream(turn) {
            stream.stop();
        }
        tracing::info!(turn = ?turn, "turn stopped");
        true
    }

    /// Applies one event of a turn. Events of any other turn are rejected.
    ///
    /// Navigation and sidebar calls run after the session lock is released.
    pub fn handle_turn_event(&self, event: TurnEvent) -> EventDisposition {
        let turn = event.turn;
        let mut effects = Vec::new();
        let disposition = {
            let mut state = self.state.lock();
            if !state.stream.accepts_turn_event(turn) {
                tracing::trace!(turn = ?turn, "rejecting event for inactive turn");
                return EventDisposition::Rejected;
            }
            match state.stream.apply(transition_for(&event)) {
                Ok(next) => state.stream = next,
                Err(rejection) => {
                    tracing::debug!(turn = ?turn, rejection = ?rejection, "rejecting turn event");
                    return EventDisposition::Rejected;
                }
            }

            match event.payload {
                TurnEventPayload::Event(protocol_event) => {
                    let Some(assistant_message_id) = state
                        .active_turn
                        .as_ref()
                        .map(|active| active.assistant_message_id.clone())
                    else {
                        return EventDisposition::Rejected;
                    };
                    let mut sink = SessionSink {
                        state: &mut state,
                        context: &self.context,
                        assistant_message_id,
                        effects: &mut effects,
                    };
                    EventDisposition::Applied(dispatch(&protocol_event, &mut sink))
                }
                TurnEventPayload::Done => {
                    state.active_turn = None;
                    tracing::info!(turn = ?turn, "turn finished");
                    EventDisposition::Completed
                }
                TurnEventPayload::Error(message) => {
                    state.active_turn = None;
                    state.transcript.push_error(&message);
                    tracing::warn!(turn = ?turn, error = %message, "turn failed");
                    EventDisposition::Failed
                }
            }
        };

        for effect in effects {
            self.context.run_effect(effect);
        }
        if matches!(
            disposition,
            EventDisposition::Completed | EventDisposition::Failed
        ) {
            self.take_stream(turn);
        }
        disposition
    }

    /// Drains the active turn until it finishes, fails or is stopped.
    /// Returns the number of events applied.
    pub async fn pump_turn(&self) -> usize {
        let Some((turn, mut stop_rx)) = self
            .state
            .lock()
            .active_turn
            .as_ref()
            .map(|active| (active.turn, active.stop_tx.subscribe()))
        else {
            return 0;
        };
        let Some(mut stream) = self.take_stream(turn) else {
            return 0;
        };

        let mut applied = 0;
        loop {
            if *stop_rx.borrow_and_update() {
                stream.stop();
                break;
            }

            let next = tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        stream.stop();
                        break;
                    }
                    continue;
                }
                event = stream.recv() => event,
            };

            let Some(event) = next else {
                self.handle_turn_event(TurnEvent::new(
                    turn,
                    TurnEventPayload::Error(STREAM_CLOSED_MESSAGE.to_string()),
                ));
                break;
            };
            let terminal = event.is_terminal();
            if self.handle_turn_event(event) != EventDisposition::Rejected {
                applied += 1;
            }
            if terminal {
                break;
            }
        }
        applied
    }

    /// Toggles a reaction optimistically and persists it.
    ///
    /// The overlay changes before the store is called; a failure restores the
    /// value shown right before this call.
    pub async fn toggle_reaction(
        &self,
        message_id: &MessageId,
        requested: Reaction,
    ) -> SessionResult<ReactionOutcome> {
        let pending = {
            let mut state = self.state.lock();
            let base = state
                .transcript
                .get(message_id)
                .map(Message::reaction)
                .context(UnknownMessageSnafu {
                    stage: "session-toggle-reaction",
                    message_id: message_id.clone(),
                })?;
            let effective = state.overlay.effective(message_id, base);
            let target = toggle_target(effective, requested);
            state.overlay.apply(message_id.clone(), target, base)
        };

        let Some(conversation_id) = self.context.active_id() else {
            tracing::debug!(message_id = %message_id, "reaction kept locally without conversation");
            return Ok(ReactionOutcome::LocalOnly(pending.value));
        };

        let result = self
            .store
            .set_reaction(conversation_id.clone(), message_id.clone(), pending.value)
            .await;

        let mut state = self.state.lock();
        match state.overlay.settle(&pending, result) {
            Settlement::Committed { confirmed, .. } => {
                let reaction = confirmed.reaction();
                if state.transcript.conversation_id() == Some(&conversation_id) {
                    state.transcript.confirm_reaction(message_id, reaction);
                }
                Ok(ReactionOutcome::Confirmed(reaction))
            }
            Settlement::Superseded { .. } => Ok(ReactionOutcome::Superseded),
            Settlement::Reverted { restored, error } => {
                tracing::warn!(
                    message_id = %message_id,
                    error = %error,
                    "reaction not saved, reverted"
                );
                Ok(ReactionOutcome::Reverted { restored })
            }
        }
    }

    pub async fn rename_conversation(&self, title: &str) -> SessionResult<ConversationRecord> {
        let conversation_id = self.context.active_id().context(NoActiveConversationSnafu {
            stage: "session-rename",
        })?;
        let record = self
            .store
            .update_conversation(
                conversation_id.clone(),
                ConversationPatch {
                    title: Some(title.trim().to_string()),
                    archived: None,
                },
            )
            .await
            .context(StorageSnafu {
                stage: "session-rename",
            })?;

        if self.context.active_id().as_ref() == Some(&conversation_id) {
            self.state.lock().title = record.title.clone();
        }
        self.sidebar.upsert(SidebarEntry {
            conversation_id: conversation_id.clone(),
            name: record.title.clone(),
            url: self.context.canonical_path(&conversation_id),
            updated_at_unix_seconds: record.updated_at_unix_seconds,
        });
        Ok(record)
    }

    /// Base transcript with optimistic reactions applied, oldest first.
    pub fn merged_messages(&self) -> Vec<Message> {
        let state = self.state.lock();
        state
            .transcript
            .messages()
            .iter()
            .map(|message| {
                let mut message = message.clone();
                if let Some(reaction) = state.overlay.get(&message.id) {
                    message.metadata.reaction = *reaction;
                }
                message
            })
            .collect()
    }

    pub fn has_more_history(&self) -> bool {
        self.state.lock().transcript.has_more()
    }

    pub fn status(&self) -> StreamStatus {
        self.state.lock().stream.status()
    }

    pub fn stream_state(&self) -> StreamState {
        self.state.lock().stream.clone()
    }

    pub fn active_turn(&self) -> Option<TurnId> {
        self.state.lock().stream.active_turn()
    }

    pub fn progress_for(&self, message_id: &MessageId) -> Vec<Step> {
        self.state.lock().progress.get(message_id).to_vec()
    }

    pub fn sources_for(&self, message_id: &MessageId) -> Vec<Source> {
        self.state.lock().sources.get(message_id).to_vec()
    }

    pub fn title(&self) -> String {
        self.state.lock().title.clone()
    }

    fn open_turn(&self, request: TurnRequest) {
        let turn = request.turn;
        match self.transport.open_turn(request) {
            Ok(TurnStreamHandle { stream, worker }) => {
                if !self.state.lock().stream.accepts_turn_event(turn) {
                    tracing::debug!(turn = ?turn, "turn ended before its stream opened");
                    return;
                }
                *self.turn_stream.lock() = Some(stream);
                tokio::spawn(worker);
                tracing::debug!(turn = ?turn, transport = %self.transport.id(), "turn opened");
            }
            Err(error) => {
                tracing::warn!(turn = ?turn, error = %error, "transport refused turn");
                self.handle_turn_event(TurnEvent::new(
                    turn,
                    TurnEventPayload::Error(error.to_string()),
                ));
            }
        }
    }

    fn abort_initial_load(&self) {
        if let Some(slot) = self.state.lock().initial_load.take() {
            slot.handle.abort();
        }
    }

    fn take_stream(&self, turn: TurnId) -> Option<TurnEventStream> {
        let mut slot = self.turn_stream.lock();
        if slot.as_ref().is_some_and(|stream| stream.turn() == turn) {
            return slot.take();
        }
        None
    }
}

/// Routes one turn's classified events into session state.
struct SessionSink<'a> {
    state: &'a mut SessionState,
    context: &'a ConversationContext,
    assistant_message_id: MessageId,
    effects: &'a mut Vec<HostEffect>,
}

impl TurnEventSink for SessionSink<'_> {
    fn text_delta(&mut self, event: TextDelta) {
        self.state
            .transcript
            .append_text_delta(&self.assistant_message_id, &event.delta);
    }

    fn reasoning_delta(&mut self, event: ReasoningDelta) {
        self.state
            .transcript
            .append_reasoning_delta(&self.assistant_message_id, &event.delta);
    }

    fn conversation_id(&mut self, event: ConversationIdAssigned) {
        let (outcome, effects) = self
            .context
            .assign_from_server(&event.conv_id, &self.state.title);
        self.effects.extend(effects);
        if !matches!(outcome, AssignOutcome::Adopted { .. }) {
            return;
        }
        if let Some(conversation_id) = self.context.active_id() {
            self.state.transcript.adopt(conversation_id);
        }
    }

    fn title(&mut self, event: TitleAssigned) {
        let title = event.title.trim();
        if title.is_empty() {
            return;
        }
        self.state.title = title.to_string();

        let Some(conversation_id) = self.context.active_id() else {
            tracing::debug!("title arrived before a conversation id");
            return;
        };
        self.effects.push(HostEffect::UpsertSidebar(SidebarEntry {
            url: self.context.canonical_path(&conversation_id),
            conversation_id,
            name: title.to_string(),
            updated_at_unix_seconds: unix_timestamp_seconds(),
        }));
    }

    fn model(&mut self, event: ModelAssigned) {
        if self
            .state
            .transcript
            .set_model(&event.message_id, &event.model_id)
        {
            return;
        }
        if event.message_id == self.assistant_message_id {
            self.state.transcript.upsert_live(
                Message::assistant_streaming(event.message_id).with_model(event.model_id),
            );
        } else {
            tracing::trace!(message_id = %event.message_id, "model for unknown message");
        }
    }

    fn progress(&mut self, event: ProgressUpdate) {
        self.state
            .progress
            .apply_update(&self.assistant_message_id, event);
    }

    fn sources(&mut self, event: SourcesUpdate) {
        self.state
            .sources
            .apply_update(&self.assistant_message_id, event);
    }
}

#[cfg(test)]
mod tests {
    use parley_protocol::{ProtocolEvent, Role};
    use parley_storage::MemoryStore;
    use parley_transport::{ScriptedTransport, TurnScript};
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::collaborators::{RecordingNavigator, RecordingSidebar};

    struct Harness {
        session: ChatSession,
        transport: Arc<ScriptedTransport>,
    }

    fn harness(url_id: Option<&str>) -> Harness {
        let transport = Arc::new(ScriptedTransport::new());
        let deps = SessionDeps {
            store: Arc::new(MemoryStore::new()),
            transport: transport.clone(),
            navigator: Arc::new(RecordingNavigator::new()),
            sidebar: Arc::new(RecordingSidebar::new()),
        };
        let session = ChatSession::open(Arc::new(EngineSettings::default()), deps, url_id, None);
        Harness { session, transport }
    }

    fn text_event(turn: TurnId, delta: &str) -> TurnEvent {
        TurnEvent::new(
            turn,
            TurnEventPayload::Event(ProtocolEvent::new("text-delta", json!({ "delta": delta }))),
        )
    }

    #[tokio::test]
    async fn submitted_turn_streams_into_one_assistant_message() {
        let Harness { session, transport } = harness(Some("c1"));
        transport.push_script(TurnScript::new().text("Hel").text("lo"));

        let turn = session.submit("  Hi  ").unwrap();
        assert_eq!(session.status(), StreamStatus::Submitted);
        assert_eq!(session.pump_turn().await, 3);

        let messages = session.merged_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].text(), "Hi");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].text(), "Hello");
        assert_eq!(session.stream_state(), StreamState::Done(turn));
        assert_eq!(session.status(), StreamStatus::Ready);

        let requests = transport.requests();
        assert_eq!(requests[0].conversation_id, Some(ConversationId::new("c1")));
        assert_eq!(requests[0].assistant_message_id, messages[1].id);
    }

    #[tokio::test]
    async fn prompts_are_validated_and_turns_do_not_overlap() {
        let Harness { session, transport } = harness(None);
        assert!(matches!(
            session.submit("   "),
            Err(crate::SessionError::EmptyPrompt { .. })
        ));

        transport.push_script(TurnScript::new().wait_for(Arc::new(Notify::new())));
        let turn = session.submit("first").unwrap();
        assert!(matches!(
            session.submit("second"),
            Err(crate::SessionError::TurnInProgress { active, .. }) if active == turn
        ));
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn stopped_turn_rejects_late_events() {
        let Harness { session, transport } = harness(Some("c1"));
        transport.push_script(TurnScript::new().wait_for(Arc::new(Notify::new())));

        let turn = session.submit("Hi").unwrap();
        assert!(session.stop());
        assert_eq!(session.stream_state(), StreamState::Stopped(turn));
        assert_eq!(
            session.handle_turn_event(text_event(turn, "late")),
            EventDisposition::Rejected
        );
        assert!(!session.stop());
        assert_eq!(session.pump_turn().await, 0);
        assert_eq!(session.merged_messages().len(), 1);
    }

    #[tokio::test]
    async fn events_of_an_abandoned_turn_are_rejected() {
        let Harness { session, transport } = harness(Some("c1"));
        transport.push_script(TurnScript::new().wait_for(Arc::new(Notify::new())));
        transport.push_script(TurnScript::new().wait_for(Arc::new(Notify::new())));

        let first = session.submit("one").unwrap();
        session.stop();
        let second = session.submit("two").unwrap();

        assert_eq!(
            session.handle_turn_event(text_event(first, "stale")),
            EventDisposition::Rejected
        );
        assert_eq!(
            session.handle_turn_event(text_event(second, "fresh")),
            EventDisposition::Applied(Some("text-delta"))
        );
        assert_eq!(session.status(), StreamStatus::Streaming);
    }

    #[tokio::test]
    async fn refused_turn_surfaces_as_error_message() {
        let Harness { session, transport } = harness(Some("c1"));
        transport.reject_turns(Some("offline".to_string()));

        session.submit("Hi").unwrap();

        assert_eq!(session.status(), StreamStatus::Error);
        let messages = session.merged_messages();
        assert_eq!(messages.len(), 2);
        assert!(messages[1].is_error());
        assert_eq!(session.active_turn(), None);
    }

    #[tokio::test]
    async fn model_event_before_text_creates_the_assistant_message() {
        let Harness { session, transport } = harness(Some("c1"));
        transport.push_script(TurnScript::new().wait_for(Arc::new(Notify::new())));

        let turn = session.submit("Hi").unwrap();
        let assistant_id = transport.requests()[0].assistant_message_id.clone();
        let event = ProtocolEvent::new(
            "data-model",
            json!({ "messageId": assistant_id.as_str(), "modelId": "m-large" }),
        );
        session.handle_turn_event(TurnEvent::new(turn, TurnEventPayload::Event(event)));
        session.handle_turn_event(text_event(turn, "ok"));

        let messages = session.merged_messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].metadata.model_id.as_deref(), Some("m-large"));
        assert_eq!(messages[1].text(), "ok");
    }

    #[tokio::test]
    async fn failed_turn_appends_an_error_message() {
        let Harness { session, transport } = harness(Some("c1"));
        transport.push_script(TurnScript::new().text("part").fail("upstream timeout"));

        session.submit("Hi").unwrap();
        assert_eq!(session.pump_turn().await, 2);

        assert_eq!(session.status(), StreamStatus::Error);
        let last = session.merged_messages().pop().unwrap();
        assert!(last.is_error());
        assert_eq!(last.text(), "upstream timeout");
        assert_eq!(session.merged_messages().len(), 3);
    }

    #[tokio::test]
    async fn initial_load_in_an_unsaved_chat_keeps_the_submitted_turn() {
        let Harness { session, transport } = harness(None);
        transport.push_script(TurnScript::new().wait_for(Arc::new(Notify::new())));

        session.submit("hello").unwrap();
        assert_eq!(session.load_initial().await, ReconcileOutcome::NoProgress);

        assert_eq!(session.merged_messages().len(), 1);
        assert_eq!(session.status(), StreamStatus::Submitted);
    }

    #[tokio::test]
    async fn initial_load_clears_once_the_id_becomes_empty() {
        let Harness { session, .. } = harness(Some("c1"));
        session.context().reset();

        assert_eq!(session.load_initial().await, ReconcileOutcome::Cleared);
        assert_eq!(session.load_initial().await, ReconcileOutcome::NoProgress);
    }
}
