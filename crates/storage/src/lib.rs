use std::future::Future;
use std::pin::Pin;

use parley_protocol::{ConversationId, Message, MessageId, Reaction};

pub mod error;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use types::{
    ContinuationToken, ConversationPatch, ConversationRecord, DEFAULT_CONVERSATION_TITLE,
    MAX_PAGE_SIZE, MessagePage, NewConversation, PageRequest,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Conversation-level operations (sidebar listing, rename, archive, delete).
pub trait ConversationStore: Send + Sync {
    fn upsert_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>>;
    fn list_conversations(
        &self,
        include_archived: bool,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>>;
    fn update_conversation(
        &self,
        conversation_id: ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>>;
    fn delete_conversation(&self, conversation_id: ConversationId)
    -> BoxFuture<'_, StorageResult<()>>;
}

/// Message paging and per-message mutations.
pub trait MessageStore: Send + Sync {
    /// Returns one page, newest message first.
    fn list_messages(&self, request: PageRequest) -> BoxFuture<'_, StorageResult<MessagePage>>;
    /// Inserts a message, or replaces the stored copy when the id already exists.
    fn save_message(
        &self,
        conversation_id: ConversationId,
        message: Message,
    ) -> BoxFuture<'_, StorageResult<()>>;
    /// Sets or clears a reaction and returns the updated message.
    fn set_reaction(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        reaction: Option<Reaction>,
    ) -> BoxFuture<'_, StorageResult<Message>>;
}

pub trait HistoryStore: ConversationStore + MessageStore {}

impl<T> HistoryStore for T where T: ConversationStore + MessageStore {}
