use std::future::Future;
use std::pin::Pin;

use parley_protocol::{ConversationId, Message, MessageId, ProtocolEvent};
use serde::{Deserialize, Serialize};
use snafu::ensure;
use tokio::sync::{mpsc, oneshot};

mod error;
mod scripted;

pub use error::{TransportError, TransportResult};
pub use scripted::{ScriptStep, ScriptedTransport, TurnScript};

use error::{EmptyPromptSnafu, MissingParentSnafu};

/// Identifier for one generation turn.
///
/// Every submit or retry gets a fresh id so events from an abandoned turn can
/// be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TurnId(pub u64);

impl TurnId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalSettings {
    pub enabled: bool,
    pub max_sources: u32,
}

/// Request options that travel with every turn.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestContext {
    pub model_id: String,
    pub tool: Option<String>,
    pub retrieval: RetrievalSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnKind {
    Submit { message: Message },
    Regenerate { parent_message_id: MessageId },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnRequest {
    pub turn: TurnId,
    /// `None` until the backend has assigned an id to a new conversation.
    pub conversation_id: Option<ConversationId>,
    pub assistant_message_id: MessageId,
    pub kind: TurnKind,
    pub context: RequestContext,
}

impl TurnRequest {
    pub fn submit(
        turn: TurnId,
        conversation_id: Option<ConversationId>,
        message: Message,
        assistant_message_id: MessageId,
        context: RequestContext,
    ) -> Self {
        Self {
            turn,
            conversation_id,
            assistant_message_id,
            kind: TurnKind::Submit { message },
            context,
        }
    }

    pub fn regenerate(
        turn: TurnId,
        conversation_id: Option<ConversationId>,
        parent_message_id: MessageId,
        assistant_message_id: MessageId,
        context: RequestContext,
    ) -> Self {
        Self {
            turn,
            conversation_id,
            assistant_message_id,
            kind: TurnKind::Regenerate { parent_message_id },
            context,
        }
    }

    pub fn parent_message_id(&self) -> Option<&MessageId> {
        match &self.kind {
            TurnKind::Regenerate { parent_message_id } => Some(parent_message_id),
            TurnKind::Submit { .. } => None,
        }
    }

    /// Rejects requests no backend could serve.
    pub fn validate(&self) -> TransportResult<()> {
        match &self.kind {
            TurnKind::Submit { message } => ensure!(
                !message.parts.is_empty(),
                EmptyPromptSnafu {
                    stage: "turn-request-validate",
                    turn: self.turn,
                }
            ),
            TurnKind::Regenerate { parent_message_id } => ensure!(
                !parent_message_id.is_blank(),
                MissingParentSnafu {
                    stage: "turn-request-validate",
                    turn: self.turn,
                }
            ),
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEventPayload {
    Event(ProtocolEvent),
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnEvent {
    pub turn: TurnId,
    pub payload: TurnEventPayload,
}

impl TurnEvent {
    pub fn new(turn: TurnId, payload: TurnEventPayload) -> Self {
        Self { turn, payload }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.payload,
            TurnEventPayload::Done | TurnEventPayload::Error(_)
        )
    }
}

pub type TurnWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Receiving half of one turn. Dropping it stops the worker.
pub struct TurnEventStream {
    turn: TurnId,
    events: mpsc::UnboundedReceiver<TurnEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

pub struct TurnStreamHandle {
    pub stream: TurnEventStream,
    pub worker: TurnWorker,
}

impl TurnEventStream {
    fn new(
        turn: TurnId,
        events: mpsc::UnboundedReceiver<TurnEvent>,
        cancel_tx: oneshot::Sender<()>,
    ) -> Self {
        Self {
            turn,
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    pub fn turn(&self) -> TurnId {
        self.turn
    }

    pub async fn recv(&mut self) -> Option<TurnEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<TurnEvent> {
        self.events.try_recv().ok()
    }

    /// Asks the worker to end the turn early. Returns false when it already ended.
    pub fn stop(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel_tx.is_none()
    }
}

impl Drop for TurnEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// Opens one event connection per turn.
pub trait Transport: Send + Sync {
    fn id(&self) -> &str;
    fn open_turn(&self, request: TurnRequest) -> TransportResult<TurnStreamHandle>;
}

/// Channel triple used by transport implementations: event sender, the
/// caller-facing stream, and the worker's cancellation signal.
pub fn make_event_stream(
    turn: TurnId,
) -> (
    mpsc::UnboundedSender<TurnEvent>,
    TurnEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        TurnEventStream::new(turn, event_rx, cancel_tx),
        cancel_rx,
    )
}
