use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use parley_protocol::ProtocolEvent;
use serde_json::{Value, json};
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{Notify, mpsc, oneshot};

use crate::error::{RejectedSnafu, ScriptExhaustedSnafu};
use crate::{
    Transport, TransportResult, TurnEvent, TurnEventPayload, TurnId, TurnRequest,
    TurnStreamHandle, TurnWorker, make_event_stream,
};

pub const SCRIPTED_TRANSPORT_ID: &str = "scripted";

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Emit(ProtocolEvent),
    /// Holds the turn open until the gate is notified.
    WaitFor(Arc<Notify>),
    /// Ends the turn with a transport error.
    Fail(String),
}

/// Pre-recorded event sequence for one turn.
#[derive(Debug, Clone, Default)]
pub struct TurnScript {
    steps: Vec<ScriptStep>,
}

impl TurnScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn event(mut self, kind: &str, data: Value) -> Self {
        self.steps
            .push(ScriptStep::Emit(ProtocolEvent::new(kind, data)));
        self
    }

    pub fn text(self, delta: &str) -> Self {
        self.event("text-delta", json!({ "delta": delta }))
    }

    pub fn reasoning(self, delta: &str) -> Self {
        self.event("reasoning-delta", json!({ "delta": delta }))
    }

    pub fn conversation_id(self, conv_id: &str) -> Self {
        self.event("data-conversation-id", json!({ "convId": conv_id }))
    }

    pub fn title(self, title: &str) -> Self {
        self.event("data-title", json!({ "title": title }))
    }

    pub fn model(self, message_id: &str, model_id: &str) -> Self {
        self.event(
            "data-model",
            json!({ "messageId": message_id, "modelId": model_id }),
        )
    }

    pub fn wait_for(mut self, gate: Arc<Notify>) -> Self {
        self.steps.push(ScriptStep::WaitFor(gate));
        self
    }

    pub fn fail(mut self, message: impl Into<String>) -> Self {
        self.steps.push(ScriptStep::Fail(message.into()));
        self
    }

    pub fn steps(&self) -> &[ScriptStep] {
        &self.steps
    }
}

/// Transport double that replays queued scripts and records every request.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<TurnScript>>,
    requests: Mutex<Vec<TurnRequest>>,
    reject_with: Mutex<Option<String>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_script(&self, script: TurnScript) {
        self.scripts.lock().push_back(script);
    }

    /// Makes every following `open_turn` fail before any event is produced.
    pub fn reject_turns(&self, details: Option<String>) {
        *self.reject_with.lock() = details;
    }

    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    async fn run_script_worker(
        turn: TurnId,
        script: TurnScript,
        event_tx: mpsc::UnboundedSender<TurnEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        for step in script.steps {
            if !matches!(cancel_rx.try_recv(), Err(TryRecvError::Empty)) {
                tracing::debug!(turn = ?turn, "scripted turn stopped");
                return;
            }

            match step {
                ScriptStep::Emit(event) => {
                    tracing::trace!(turn = ?turn, kind = %event.kind, "scripted event");
                    if event_tx
                        .send(TurnEvent::new(turn, TurnEventPayload::Event(event)))
                        .is_err()
                    {
                        return;
                    }
                }
                ScriptStep::WaitFor(gate) => {
                    tokio::select! {
                        _ = &mut cancel_rx => {
                            tracing::debug!(turn = ?turn, "scripted turn stopped while waiting");
                            return;
                        }
                        _ = gate.notified() => {}
                    }
                }
                ScriptStep::Fail(message) => {
                    tracing::warn!(turn = ?turn, error = %message, "scripted turn failed");
                    let _ = event_tx.send(TurnEvent::new(turn, TurnEventPayload::Error(message)));
                    return;
                }
            }
        }

        if matches!(cancel_rx.try_recv(), Err(TryRecvError::Empty)) {
            let _ = event_tx.send(TurnEvent::new(turn, TurnEventPayload::Done));
        }
    }
}

impl Transport for ScriptedTransport {
    fn id(&self) -> &str {
        SCRIPTED_TRANSPORT_ID
    }

    fn open_turn(&self, request: TurnRequest) -> TransportResult<TurnStreamHandle> {
        request.validate()?;
        let turn = request.turn;
        self.requests.lock().push(request);

        if let Some(details) = self.reject_with.lock().clone() {
            return RejectedSnafu {
                stage: "scripted-open-turn",
                turn,
                details,
            }
            .fail();
        }

        let Some(script) = self.scripts.lock().pop_front() else {
            return ScriptExhaustedSnafu {
                stage: "scripted-open-turn",
                turn,
            }
            .fail();
        };

        let (event_tx, stream, cancel_rx) = make_event_stream(turn);
        let worker: TurnWorker = Box::pin(Self::run_script_worker(
            turn, script, event_tx, cancel_rx,
        ));
        Ok(TurnStreamHandle { stream, worker })
    }
}
