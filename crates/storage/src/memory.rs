use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parley_protocol::{ConversationId, Message, MessageId, Reaction};
use tokio::sync::RwLock;

use super::error::{NotFoundSnafu, StorageResult, UnavailableSnafu};
use super::types::{
    ContinuationToken, ConversationPatch, ConversationRecord, DEFAULT_CONVERSATION_TITLE,
    MessagePage, NewConversation, PageRequest, unix_timestamp_seconds,
};
use super::{BoxFuture, ConversationStore, MessageStore};

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    message: Message,
}

#[derive(Debug, Default)]
struct MemoryState {
    conversations: HashMap<ConversationId, ConversationRecord>,
    // Ascending by `seq` per conversation.
    messages: HashMap<ConversationId, Vec<StoredMessage>>,
    next_seq: u64,
}

impl MemoryState {
    fn touch_conversation(&mut self, conversation_id: &ConversationId) {
        let now = unix_timestamp_seconds();
        self.conversations
            .entry(conversation_id.clone())
            .and_modify(|record| record.updated_at_unix_seconds = now)
            .or_insert_with(|| ConversationRecord {
                id: conversation_id.clone(),
                title: DEFAULT_CONVERSATION_TITLE.to_string(),
                archived: false,
                updated_at_unix_seconds: now,
            });
    }

    fn insert_or_replace(&mut self, conversation_id: &ConversationId, message: Message) {
        self.next_seq = self.next_seq.saturating_add(1);
        let next_seq = self.next_seq;
        let rows = self.messages.entry(conversation_id.clone()).or_default();
        match rows.iter_mut().find(|row| row.message.id == message.id) {
            Some(row) => row.message = message,
            None => rows.push(StoredMessage {
                seq: next_seq,
                message,
            }),
        }
    }
}

/// In-process history store serving the same paging contract as the SQLite store.
///
/// `set_unavailable(true)` makes every call fail, which is how callers exercise
/// their degraded paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends messages oldest-first, creating the conversation when needed.
    pub async fn seed(
        &self,
        conversation_id: &ConversationId,
        messages: impl IntoIterator<Item = Message>,
    ) {
        let mut state = self.state.write().await;
        state.touch_conversation(conversation_id);
        for message in messages {
            state.insert_or_replace(conversation_id, message);
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn message_count(&self, conversation_id: &ConversationId) -> usize {
        self.state
            .read()
            .await
            .messages
            .get(conversation_id)
            .map_or(0, Vec::len)
    }

    fn ensure_available(&self, stage: &'static str) -> StorageResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return UnavailableSnafu {
                stage,
                details: "memory store switched offline".to_string(),
            }
            .fail();
        }
        Ok(())
    }
}

fn page_newest_first(rows: &[StoredMessage], limit: usize, before: Option<u64>) -> MessagePage {
    let eligible = rows
        .iter()
        .filter(|row| before.is_none_or(|before| row.seq < before))
        .collect::<Vec<_>>();
    let start = eligible.len().saturating_sub(limit);
    let page = &eligible[start..];

    // A token is only handed out when something older than this page remains.
    let continuation_token = if start > 0 {
        page.first().map(|row| ContinuationToken::from_seq(row.seq))
    } else {
        None
    };

    MessagePage {
        messages: page.iter().rev().map(|row| row.message.clone()).collect(),
        continuation_token,
    }
}

impl ConversationStore for MemoryStore {
    fn upsert_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            self.ensure_available("memory-upsert-conversation")?;
            let mut state = self.state.write().await;
            let now = unix_timestamp_seconds();
            let record = state
                .conversations
                .entry(input.id.clone())
                .and_modify(|record| {
                    record.title = input.title.clone();
                    record.updated_at_unix_seconds = now;
                })
                .or_insert_with(|| ConversationRecord {
                    id: input.id.clone(),
                    title: input.title.clone(),
                    archived: false,
                    updated_at_unix_seconds: now,
                });
            Ok(record.clone())
        })
    }

    fn list_conversations(
        &self,
        include_archived: bool,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            self.ensure_available("memory-list-conversations")?;
            let state = self.state.read().await;
            let mut records = state
                .conversations
                .values()
                .filter(|record| include_archived || !record.archived)
                .cloned()
                .collect::<Vec<_>>();
            records.sort_by(|left, right| {
                right
                    .updated_at_unix_seconds
                    .cmp(&left.updated_at_unix_seconds)
                    .then_with(|| right.id.cmp(&left.id))
            });
            Ok(records)
        })
    }

    fn update_conversation(
        &self,
        conversation_id: ConversationId,
        patch: ConversationPatch,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            self.ensure_available("memory-update-conversation")?;
            let mut state = self.state.write().await;
            let Some(record) = state.conversations.get_mut(&conversation_id) else {
                return NotFoundSnafu {
                    stage: "memory-update-conversation-lookup",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            };

            if let Some(title) = patch.title {
                record.title = title;
            }
            if let Some(archived) = patch.archived {
                record.archived = archived;
            }
            record.updated_at_unix_seconds = unix_timestamp_seconds();
            Ok(record.clone())
        })
    }

    fn delete_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.ensure_available("memory-delete-conversation")?;
            let mut state = self.state.write().await;
            if state.conversations.remove(&conversation_id).is_none() {
                return NotFoundSnafu {
                    stage: "memory-delete-conversation-lookup",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }
            state.messages.remove(&conversation_id);
            Ok(())
        })
    }
}

impl MessageStore for MemoryStore {
    fn list_messages(&self, request: PageRequest) -> BoxFuture<'_, StorageResult<MessagePage>> {
        Box::pin(async move {
            self.ensure_available("memory-list-messages")?;
            let limit = request.effective_limit("memory-list-messages-limit")?;
            let before = request
                .continuation_token
                .as_ref()
                .map(|token| token.to_seq("memory-list-messages-token"))
                .transpose()?;

            let state = self.state.read().await;
            let rows = state
                .messages
                .get(&request.conversation_id)
                .map_or(&[][..], Vec::as_slice);
            Ok(page_newest_first(rows, limit, before))
        })
    }

    fn save_message(
        &self,
        conversation_id: ConversationId,
        message: Message,
    ) -> BoxFuture<'_, StorageResult<()>> {
        Box::pin(async move {
            self.ensure_available("memory-save-message")?;
            let mut state = self.state.write().await;
            state.touch_conversation(&conversation_id);
            state.insert_or_replace(&conversation_id, message);
            Ok(())
        })
    }

    fn set_reaction(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        reaction: Option<Reaction>,
    ) -> BoxFuture<'_, StorageResult<Message>> {
        Box::pin(async move {
            self.ensure_available("memory-set-reaction")?;
            let mut state = self.state.write().await;
            let row = state
                .messages
                .get_mut(&conversation_id)
                .and_then(|rows| rows.iter_mut().find(|row| row.message.id == message_id));

            let Some(row) = row else {
                return NotFoundSnafu {
                    stage: "memory-set-reaction-lookup",
                    entity: "message",
                    id: message_id.to_string(),
                }
                .fail();
            };

            row.message.metadata.reaction = reaction;
            Ok(row.message.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StorageError;

    fn numbered(count: usize) -> Vec<Message> {
        (1..=count)
            .map(|index| Message::user_text(MessageId::new(format!("m{index}")), format!("#{index}")))
            .collect()
    }

    fn ids(page: &MessagePage) -> Vec<&str> {
        page.messages.iter().map(|message| message.id.as_str()).collect()
    }

    #[tokio::test]
    async fn pages_walk_backward_until_token_is_null() {
        let store = MemoryStore::new();
        let conversation_id = ConversationId::new("c1");
        store.seed(&conversation_id, numbered(40)).await;

        let first = store
            .list_messages(PageRequest::latest(conversation_id.clone(), 30))
            .await
            .unwrap();
        assert_eq!(first.messages.len(), 30);
        assert_eq!(first.messages[0].id.as_str(), "m40");
        assert_eq!(first.messages[29].id.as_str(), "m11");
        let token = first.continuation_token.clone().expect("older page remains");

        let second = store
            .list_messages(PageRequest::older(conversation_id, 30, token))
            .await
            .unwrap();
        assert_eq!(second.messages.len(), 10);
        assert_eq!(ids(&second).first(), Some(&"m10"));
        assert_eq!(ids(&second).last(), Some(&"m1"));
        assert_eq!(second.continuation_token, None);
    }

    #[tokio::test]
    async fn unknown_conversation_serves_empty_final_page() {
        let store = MemoryStore::new();
        let page = store
            .list_messages(PageRequest::latest(ConversationId::new("missing"), 10))
            .await
            .unwrap();
        assert_eq!(page, MessagePage::default());
    }

    #[tokio::test]
    async fn malformed_token_is_rejected() {
        let store = MemoryStore::new();
        let result = store
            .list_messages(PageRequest::older(
                ConversationId::new("c1"),
                10,
                ContinuationToken::new("not-a-seq"),
            ))
            .await;
        assert!(matches!(
            result,
            Err(StorageError::InvalidContinuationToken { .. })
        ));
    }

    #[tokio::test]
    async fn save_replaces_existing_message_in_place() {
        let store = MemoryStore::new();
        let conversation_id = ConversationId::new("c1");
        store.seed(&conversation_id, numbered(3)).await;

        store
            .save_message(
                conversation_id.clone(),
                Message::user_text(MessageId::new("m2"), "edited"),
            )
            .await
            .unwrap();

        let page = store
            .list_messages(PageRequest::latest(conversation_id.clone(), 10))
            .await
            .unwrap();
        assert_eq!(ids(&page), vec!["m3", "m2", "m1"]);
        assert_eq!(page.messages[1].text(), "edited");
        assert_eq!(store.message_count(&conversation_id).await, 3);
    }

    #[tokio::test]
    async fn reaction_updates_and_clears() {
        let store = MemoryStore::new();
        let conversation_id = ConversationId::new("c1");
        store.seed(&conversation_id, numbered(1)).await;

        let liked = store
            .set_reaction(conversation_id.clone(), MessageId::new("m1"), Some(Reaction::Like))
            .await
            .unwrap();
        assert_eq!(liked.reaction(), Some(Reaction::Like));

        let cleared = store
            .set_reaction(conversation_id.clone(), MessageId::new("m1"), None)
            .await
            .unwrap();
        assert_eq!(cleared.reaction(), None);

        let missing = store
            .set_reaction(conversation_id, MessageId::new("nope"), None)
            .await;
        assert!(matches!(missing, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn offline_store_fails_every_call() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let result = store
            .list_messages(PageRequest::latest(ConversationId::new("c1"), 10))
            .await;
        assert!(matches!(result, Err(StorageError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn archived_conversations_are_hidden_by_default() {
        let store = MemoryStore::new();
        store
            .upsert_conversation(NewConversation::new(ConversationId::new("c1"), "Trip"))
            .await
            .unwrap();
        store
            .update_conversation(
                ConversationId::new("c1"),
                ConversationPatch {
                    archived: Some(true),
                    ..ConversationPatch::default()
                },
            )
            .await
            .unwrap();

        assert!(store.list_conversations(false).await.unwrap().is_empty());
        assert_eq!(store.list_conversations(true).await.unwrap().len(), 1);

        store
            .delete_conversation(ConversationId::new("c1"))
            .await
            .unwrap();
        assert!(store.list_conversations(true).await.unwrap().is_empty());
    }
}
