use parley_protocol::MessageId;
use parley_storage::StorageError;
use parley_transport::TurnId;
use snafu::Snafu;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SessionError {
    #[snafu(display("cannot submit an empty prompt"))]
    EmptyPrompt { stage: &'static str },
    #[snafu(display("turn {active:?} is still generating"))]
    TurnInProgress { stage: &'static str, active: TurnId },
    #[snafu(display("message '{message_id}' is not in the transcript"))]
    UnknownMessage {
        stage: &'static str,
        message_id: MessageId,
    },
    #[snafu(display("no conversation is active on `{stage}`"))]
    NoActiveConversation { stage: &'static str },
    #[snafu(display("history store failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
}
