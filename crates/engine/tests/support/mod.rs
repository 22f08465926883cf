#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use parley::{
    ChatSession, EngineSettings, Navigator, RecordingNavigator, RecordingSidebar, SessionDeps,
    SidebarEntry, SidebarIndex,
};
use parley_protocol::{ConversationId, Message, MessageId, ProtocolEvent, Reaction};
use parley_storage::{
    BoxFuture, ConversationPatch, ConversationRecord, ConversationStore, MemoryStore,
    MessagePage, MessageStore, NewConversation, PageRequest, StorageError, StorageResult,
};
use parley_transport::{
    ScriptedTransport, Transport, TransportResult, TurnEvent, TurnEventPayload, TurnRequest,
    TurnStreamHandle, TurnWorker, make_event_stream,
};
use serde_json::json;
use tokio::sync::Notify;

/// How one queued `set_reaction` call behaves.
pub struct ReactionStep {
    pub gate: Option<Arc<Notify>>,
    pub fail: bool,
}

/// Memory store whose calls can be held open or failed on demand.
#[derive(Default)]
pub struct GatedStore {
    pub inner: MemoryStore,
    list_gate: Mutex<Option<Arc<Notify>>>,
    list_calls: AtomicUsize,
    reaction_steps: Mutex<VecDeque<ReactionStep>>,
}

impl GatedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every following `list_messages` waits for `gate` before answering.
    pub fn hold_lists(&self, gate: Option<Arc<Notify>>) {
        *self.list_gate.lock() = gate;
    }

    /// Number of `list_messages` calls that reached the store.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn queue_reaction(&self, step: ReactionStep) {
        self.reaction_steps.lock().push_back(step);
    }
}

impl ConversationStore for GatedStore {
    fn upsert_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        self.inner.upsert_conversation(input)
    }

    fn list_conversations(
        &self,
        include_archived: bool,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        self.inner.list_conversations(include_archived)
    }

    fn update_conversation(
        &self,
        conversation_id: ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        self.inner.update_conversation(conversation_id, patch)
    }

    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        self.inner.delete_conversation(conversation_id)
    }
}

impl MessageStore for GatedStore {
    fn list_messages(&self, request: PageRequest) -> BoxFuture<'_, StorageResult<MessagePage>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.list_gate.lock().clone();
        Box::pin(async move {
            if let Some(gate) = gate {
                gate.notified().await;
            }
            self.inner.list_messages(request).await
        })
    }

    fn save_message(
        &self,
        conversation_id: ConversationId,
        message: Message,
    ) -> BoxFuture<'_, StorageResult<()>> {
        self.inner.save_message(conversation_id, message)
    }

    fn set_reaction(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        reaction: Option<Reaction>,
    ) -> BoxFuture<'_, StorageResult<Message>> {
        let step = self.reaction_steps.lock().pop_front();
        Box::pin(async move {
            if let Some(step) = step {
                if let Some(gate) = step.gate {
                    gate.notified().await;
                }
                if step.fail {
                    return Err(StorageError::Unavailable {
                        stage: "gated-set-reaction",
                        details: "reaction endpoint offline".to_string(),
                    });
                }
            }
            self.inner
                .set_reaction(conversation_id, message_id, reaction)
                .await
        })
    }
}

/// Transport whose connection drops after one text delta, without a finish signal.
pub struct ClosingTransport;

impl Transport for ClosingTransport {
    fn id(&self) -> &str {
        "closing"
    }

    fn open_turn(&self, request: TurnRequest) -> TransportResult<TurnStreamHandle> {
        let turn = request.turn;
        let (event_tx, stream, _cancel_rx) = make_event_stream(turn);
        let worker: TurnWorker = Box::pin(async move {
            let event = ProtocolEvent::new("text-delta", json!({ "delta": "partial" }));
            let _ = event_tx.send(TurnEvent::new(turn, TurnEventPayload::Event(event)));
        });
        Ok(TurnStreamHandle { stream, worker })
    }
}

/// Router and sidebar whose callbacks read the session back, the way a
/// re-rendering host does.
#[derive(Default)]
pub struct ReadingHost {
    session: Mutex<Option<Weak<ChatSession>>>,
    observed: Mutex<Vec<String>>,
}

impl ReadingHost {
    pub fn attach(&self, session: &Arc<ChatSession>) {
        *self.session.lock() = Some(Arc::downgrade(session));
    }

    /// `callback:message_count:title` for every callback, in call order.
    pub fn observed(&self) -> Vec<String> {
        self.observed.lock().clone()
    }

    fn observe(&self, callback: &str) {
        let session = self.session.lock().as_ref().and_then(Weak::upgrade);
        if let Some(session) = session {
            let line = format!(
                "{callback}:{}:{}",
                session.merged_messages().len(),
                session.title()
            );
            self.observed.lock().push(line);
        }
    }
}

impl Navigator for ReadingHost {
    fn navigate(&self, _path: &str) {
        self.observe("navigate");
    }
}

impl SidebarIndex for ReadingHost {
    fn upsert(&self, _entry: SidebarEntry) {
        self.observe("sidebar");
    }
}

pub struct Fixture<S> {
    pub session: ChatSession,
    pub store: Arc<S>,
    pub navigator: Arc<RecordingNavigator>,
    pub sidebar: Arc<RecordingSidebar>,
}

pub fn open_session<S>(
    settings: EngineSettings,
    store: Arc<S>,
    transport: Arc<dyn Transport>,
    url_id: Option<&str>,
) -> Fixture<S>
where
    S: ConversationStore + MessageStore + 'static,
{
    let navigator = Arc::new(RecordingNavigator::new());
    let sidebar = Arc::new(RecordingSidebar::new());
    let deps = SessionDeps {
        store: store.clone(),
        transport,
        navigator: navigator.clone(),
        sidebar: sidebar.clone(),
    };
    let session = ChatSession::open(Arc::new(settings), deps, url_id, None);
    Fixture {
        session,
        store,
        navigator,
        sidebar,
    }
}

pub fn scripted() -> Arc<ScriptedTransport> {
    Arc::new(ScriptedTransport::new())
}

pub fn conversation(raw: &str) -> ConversationId {
    ConversationId::new(raw)
}

pub fn numbered(index: usize) -> Message {
    let id = MessageId::new(format!("m{index:03}"));
    if index % 2 == 1 {
        Message::user_text(id, format!("question {index}"))
    } else {
        Message::assistant_text(id, format!("answer {index}"))
    }
}

pub fn ids(messages: &[Message]) -> Vec<String> {
    messages
        .iter()
        .map(|message| message.id.as_str().to_string())
        .collect()
}
