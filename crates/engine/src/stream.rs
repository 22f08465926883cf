use parley_transport::{TurnEvent, TurnEventPayload, TurnId};
use serde::{Deserialize, Serialize};

/// Status as hosts see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    #[default]
    Ready,
    Submitted,
    Streaming,
    Error,
}

/// Lifecycle of the current generation turn.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StreamState {
    #[default]
    Idle,
    /// Request sent, nothing received yet.
    Submitted(TurnId),
    Streaming(TurnId),
    Done(TurnId),
    Error { turn: TurnId, message: String },
    Stopped(TurnId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransition {
    Submit(TurnId),
    /// First content event of the turn arrived.
    Receive(TurnId),
    Complete(TurnId),
    Fail { turn: TurnId, message: String },
    Stop(TurnId),
    /// Conversation switched or reset; any turn is abandoned.
    ResetToIdle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamTransitionRejection {
    AlreadyActive { active: TurnId, attempted: TurnId },
    NoActiveTurn,
    TurnMismatch { active: TurnId, attempted: TurnId },
}

pub type StreamTransitionResult = Result<StreamState, StreamTransitionRejection>;

impl StreamState {
    pub fn active_turn(&self) -> Option<TurnId> {
        match self {
            Self::Submitted(turn) | Self::Streaming(turn) => Some(*turn),
            Self::Idle | Self::Done(_) | Self::Error { .. } | Self::Stopped(_) => None,
        }
    }

    pub fn is_generating(&self) -> bool {
        self.active_turn().is_some()
    }

    pub fn accepts_turn_event(&self, turn: TurnId) -> bool {
        self.active_turn() == Some(turn)
    }

    pub fn status(&self) -> StreamStatus {
        match self {
            Self::Submitted(_) => StreamStatus::Submitted,
            Self::Streaming(_) => StreamStatus::Streaming,
            Self::Error { .. } => StreamStatus::Error,
            Self::Idle | Self::Done(_) | Self::Stopped(_) => StreamStatus::Ready,
        }
    }

    /// Applies one transition deterministically.
    ///
    /// A new turn may start from any non-active state. Every other transition
    /// must name the active turn exactly.
    pub fn apply(&self, transition: StreamTransition) -> StreamTransitionResult {
        match transition {
            StreamTransition::Submit(turn) => self.apply_submit(turn),
            StreamTransition::Receive(turn) => {
                self.apply_active(turn, |state| match state {
                    Self::Submitted(turn) | Self::Streaming(turn) => Self::Streaming(*turn),
                    other => other.clone(),
                })
            }
            StreamTransition::Complete(turn) => self.apply_active(turn, |_| Self::Done(turn)),
            StreamTransition::Fail { turn, message } => {
                self.apply_active(turn, |_| Self::Error { turn, message })
            }
            StreamTransition::Stop(turn) => self.apply_active(turn, |_| Self::Stopped(turn)),
            StreamTransition::ResetToIdle => Ok(Self::Idle),
        }
    }

    fn apply_submit(&self, turn: TurnId) -> StreamTransitionResult {
        match self.active_turn() {
            Some(active) if active != turn => Err(StreamTransitionRejection::AlreadyActive {
                active,
                attempted: turn,
            }),
            Some(_) => Ok(self.clone()),
            None => Ok(Self::Submitted(turn)),
        }
    }

    fn apply_active(
        &self,
        turn: TurnId,
        next: impl FnOnce(&Self) -> Self,
    ) -> StreamTransitionResult {
        match self.active_turn() {
            Some(active) if active == turn => Ok(next(self)),
            Some(active) => Err(StreamTransitionRejection::TurnMismatch {
                active,
                attempted: turn,
            }),
            None => Err(StreamTransitionRejection::NoActiveTurn),
        }
    }
}

/// Lifecycle transition implied by a turn event, if any.
pub fn transition_for(event: &TurnEvent) -> StreamTransition {
    match &event.payload {
        TurnEventPayload::Event(_) => StreamTransition::Receive(event.turn),
        TurnEventPayload::Done => StreamTransition::Complete(event.turn),
        TurnEventPayload::Error(message) => StreamTransition::Fail {
            turn: event.turn,
            message: message.clone(),
        },
    }
}

#[cfg(test)]
mod tests {
    use parley_protocol::ProtocolEvent;
    use serde_json::json;

    use super::*;

    const TURN_1: TurnId = TurnId::new(1);
    const TURN_2: TurnId = TurnId::new(2);

    #[test]
    fn submit_then_first_event_moves_to_streaming() {
        let state = StreamState::Idle.apply(StreamTransition::Submit(TURN_1)).unwrap();
        assert_eq!(state.status(), StreamStatus::Submitted);

        let event = TurnEvent::new(
            TURN_1,
            TurnEventPayload::Event(ProtocolEvent::new("text-delta", json!({ "delta": "a" }))),
        );
        let state = state.apply(transition_for(&event)).unwrap();
        assert_eq!(state, StreamState::Streaming(TURN_1));
        assert!(state.is_generating());
    }

    #[test]
    fn second_submit_while_active_is_rejected() {
        let state = StreamState::Submitted(TURN_1);
        assert_eq!(
            state.apply(StreamTransition::Submit(TURN_2)),
            Err(StreamTransitionRejection::AlreadyActive {
                active: TURN_1,
                attempted: TURN_2
            })
        );
    }

    #[test]
    fn events_of_another_turn_are_rejected() {
        let state = StreamState::Streaming(TURN_2);
        assert!(!state.accepts_turn_event(TURN_1));
        assert_eq!(
            state.apply(StreamTransition::Complete(TURN_1)),
            Err(StreamTransitionRejection::TurnMismatch {
                active: TURN_2,
                attempted: TURN_1
            })
        );
    }

    #[test]
    fn terminal_states_report_ready_or_error() {
        let streaming = StreamState::Streaming(TURN_1);
        let failed = streaming
            .apply(StreamTransition::Fail {
                turn: TURN_1,
                message: "closed".to_string(),
            })
            .unwrap();
        assert_eq!(failed.status(), StreamStatus::Error);
        assert_eq!(
            failed.apply(StreamTransition::Stop(TURN_1)),
            Err(StreamTransitionRejection::NoActiveTurn)
        );

        let stopped = streaming.apply(StreamTransition::Stop(TURN_1)).unwrap();
        assert_eq!(stopped.status(), StreamStatus::Ready);
        assert_eq!(
            failed.apply(StreamTransition::Submit(TURN_2)).unwrap(),
            StreamState::Submitted(TURN_2)
        );
    }

    #[test]
    fn reset_abandons_any_state() {
        for state in [
            StreamState::Streaming(TURN_1),
            StreamState::Error {
                turn: TURN_2,
                message: "closed".to_string(),
            },
        ] {
            let reset = state.apply(StreamTransition::ResetToIdle).unwrap();
            assert_eq!(reset, StreamState::Idle);
            assert!(!reset.accepts_turn_event(TURN_1));
        }
    }
}
