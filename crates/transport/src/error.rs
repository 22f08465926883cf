use snafu::Snafu;

use crate::TurnId;

pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("turn {turn:?} submits a message without content"))]
    EmptyPrompt { stage: &'static str, turn: TurnId },
    #[snafu(display("turn {turn:?} regenerates without a parent message"))]
    MissingParent { stage: &'static str, turn: TurnId },
    #[snafu(display("no scripted turn is queued for {turn:?}"))]
    ScriptExhausted { stage: &'static str, turn: TurnId },
    #[snafu(display("transport rejected turn {turn:?}: {details}"))]
    Rejected {
        stage: &'static str,
        turn: TurnId,
        details: String,
    },
}
