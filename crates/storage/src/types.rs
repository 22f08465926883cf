use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use parley_protocol::{ConversationId, Message};
use serde::{Deserialize, Serialize};
use snafu::OptionExt;

use super::error::{InvalidContinuationTokenSnafu, InvalidPageSizeSnafu, StorageResult};

/// Default title used until the backend names a conversation.
pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";
/// Upper bound for one page; larger requests are clamped rather than rejected.
pub const MAX_PAGE_SIZE: usize = 200;

/// Opaque cursor pointing at the next older page.
///
/// Stores encode the sequence number of the oldest message already served, but
/// callers must treat the value as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn from_seq(seq: u64) -> Self {
        Self(seq.to_string())
    }

    pub(crate) fn to_seq(&self, stage: &'static str) -> StorageResult<u64> {
        self.0.parse::<u64>().ok().context(InvalidContinuationTokenSnafu {
            stage,
            token: self.0.clone(),
        })
    }
}

impl fmt::Display for ContinuationToken {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub conversation_id: ConversationId,
    pub limit: usize,
    pub continuation_token: Option<ContinuationToken>,
}

impl PageRequest {
    pub fn latest(conversation_id: ConversationId, limit: usize) -> Self {
        Self {
            conversation_id,
            limit,
            continuation_token: None,
        }
    }

    pub fn older(
        conversation_id: ConversationId,
        limit: usize,
        continuation_token: ContinuationToken,
    ) -> Self {
        Self {
            conversation_id,
            limit,
            continuation_token: Some(continuation_token),
        }
    }

    /// Validates and clamps the requested page size.
    pub(crate) fn effective_limit(&self, stage: &'static str) -> StorageResult<usize> {
        if self.limit == 0 {
            return InvalidPageSizeSnafu {
                stage,
                limit: self.limit,
            }
            .fail();
        }
        Ok(self.limit.min(MAX_PAGE_SIZE))
    }
}

/// One page as the store serves it: newest message first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// `None` means no older pages remain.
    pub continuation_token: Option<ContinuationToken>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub title: String,
    pub archived: bool,
    pub updated_at_unix_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub id: ConversationId,
    pub title: String,
}

impl NewConversation {
    pub fn new(id: ConversationId, title: impl Into<String>) -> Self {
        let mut title = title.into();
        if title.trim().is_empty() {
            title = DEFAULT_CONVERSATION_TITLE.to_string();
        }
        Self { id, title }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConversationPatch {
    pub title: Option<String>,
    pub archived: Option<bool>,
}

pub(crate) fn unix_timestamp_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}
