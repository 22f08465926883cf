use std::collections::HashSet;

use parley_protocol::{ConversationId, Message, MessageId, Reaction, Role};
use parley_storage::ContinuationToken;

use crate::history::{CursorUpdate, HistoryPage};

/// Pagination cursor, valid only for the conversation that issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageCursor {
    pub conversation_id: ConversationId,
    pub token: Option<ContinuationToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No active conversation; list and cursor were emptied.
    Cleared,
    /// First fetch after a server-assigned id; the live stream is fresher.
    Skipped,
    /// Initial page shorter than what the live stream already holds.
    DiscardedStale { held: usize, fetched: usize },
    Replaced { count: usize, kept_live: usize },
    Prepended { added: usize, duplicates: usize },
    /// Page was issued for another conversation than the one shown.
    IgnoredForeign,
    NoProgress,
    Aborted,
}

/// Whether an initial page would roll back a generating transcript.
///
/// While a turn is submitted or streaming, a page with fewer messages than
/// are held, or an empty page when anything is held, predates the turn.
/// The empty-page clause is already covered by `fetched < held`; it stays
/// so the check reads like the two-part rule it implements.
pub fn is_stale_initial_page(held: usize, fetched: usize, generating: bool) -> bool {
    generating && (fetched < held || (fetched == 0 && held > 0))
}

/// Base message list of the active conversation plus its cursor.
///
/// This is the only writer of the base list. Messages written by the live
/// stream or by local submission are tracked so that a page arriving later
/// never replaces or drops them.
#[derive(Debug, Default)]
pub struct Transcript {
    conversation_id: Option<ConversationId>,
    messages: Vec<Message>,
    cursor: Option<PageCursor>,
    live_ids: HashSet<MessageId>,
}

impl Transcript {
    pub fn new(conversation_id: Option<ConversationId>) -> Self {
        Self {
            conversation_id,
            ..Self::default()
        }
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, message_id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == message_id)
    }

    pub fn contains(&self, message_id: &MessageId) -> bool {
        self.get(message_id).is_some()
    }

    pub fn cursor(&self) -> Option<&PageCursor> {
        self.cursor.as_ref()
    }

    /// Token for the next older page, only if it belongs to the shown conversation.
    pub fn cursor_token(&self) -> Option<&ContinuationToken> {
        let cursor = self.cursor.as_ref()?;
        if self.conversation_id.as_ref() != Some(&cursor.conversation_id) {
            return None;
        }
        cursor.token.as_ref()
    }

    pub fn has_more(&self) -> bool {
        self.cursor_token().is_some()
    }

    pub fn clear(&mut self) -> ReconcileOutcome {
        self.conversation_id = None;
        self.messages.clear();
        self.cursor = None;
        self.live_ids.clear();
        ReconcileOutcome::Cleared
    }

    /// Empties the list and tags it with another conversation.
    pub fn reset_for(&mut self, conversation_id: Option<ConversationId>) {
        self.clear();
        self.conversation_id = conversation_id;
    }

    /// Tags the current list with a newly assigned id, keeping its content.
    pub fn adopt(&mut self, conversation_id: ConversationId) {
        if self.conversation_id.as_ref() == Some(&conversation_id) {
            return;
        }
        // A cursor issued under the old tag must not leak into the new one.
        self.cursor = None;
        self.conversation_id = Some(conversation_id);
    }

    pub fn apply_initial(
        &mut self,
        page: HistoryPage,
        skip: bool,
        generating: bool,
    ) -> ReconcileOutcome {
        if self.conversation_id.as_ref() != Some(&page.conversation_id) {
            tracing::debug!(
                conversation_id = %page.conversation_id,
                "ignoring initial page for a conversation that is not shown"
            );
            return ReconcileOutcome::IgnoredForeign;
        }
        if skip {
            tracing::debug!(
                conversation_id = %page.conversation_id,
                "suppressing first fetch after server-assigned id"
            );
            return ReconcileOutcome::Skipped;
        }
        let CursorUpdate::Advance(token) = page.cursor else {
            return ReconcileOutcome::NoProgress;
        };

        let held = self.messages.len();
        let fetched = page.messages.len();
        if is_stale_initial_page(held, fetched, generating) {
            tracing::debug!(
                conversation_id = %page.conversation_id,
                held,
                fetched,
                "discarding stale initial page while generating"
            );
            return ReconcileOutcome::DiscardedStale { held, fetched };
        }

        let mut merged = Vec::with_capacity(fetched.max(held));
        let mut seen = HashSet::with_capacity(fetched);
        for fetched_message in page.messages {
            if !seen.insert(fetched_message.id.clone()) {
                continue;
            }
            // The live version of a message wins over the stored one.
            let message = if self.live_ids.contains(&fetched_message.id) {
                self.get(&fetched_message.id)
                    .cloned()
                    .unwrap_or(fetched_message)
            } else {
                fetched_message
            };
            merged.push(message);
        }

        let mut kept_live = 0;
        for message in &self.messages {
            if self.live_ids.contains(&message.id) && !seen.contains(&message.id) {
                merged.push(message.clone());
                kept_live += 1;
            }
        }

        let count = merged.len();
        self.messages = merged;
        self.cursor = Some(PageCursor {
            conversation_id: page.conversation_id,
            token,
        });
        ReconcileOutcome::Replaced { count, kept_live }
    }

    pub fn apply_older(&mut self, page: HistoryPage) -> ReconcileOutcome {
        if page.is_no_progress() {
            return ReconcileOutcome::NoProgress;
        }
        let tagged = self.conversation_id.as_ref() == Some(&page.conversation_id);
        let cursor_matches = self
            .cursor
            .as_ref()
            .is_some_and(|cursor| cursor.conversation_id == page.conversation_id);
        if !tagged || !cursor_matches {
            tracing::debug!(
                conversation_id = %page.conversation_id,
                "ignoring older page for a conversation that is not shown"
            );
            return ReconcileOutcome::IgnoredForeign;
        }
        let CursorUpdate::Advance(token) = page.cursor else {
            return ReconcileOutcome::NoProgress;
        };

        let mut seen = self
            .messages
            .iter()
            .map(|message| message.id.clone())
            .collect::<HashSet<_>>();
        let mut duplicates = 0;
        let mut older = Vec::with_capacity(page.messages.len());
        for message in page.messages {
            if seen.insert(message.id.clone()) {
                older.push(message);
            } else {
                duplicates += 1;
            }
        }

        let added = older.len();
        if added > 0 {
            older.append(&mut self.messages);
            self.messages = older;
        }
        self.cursor = Some(PageCursor {
            conversation_id: page.conversation_id,
            token,
        });

        tracing::debug!(added, duplicates, "prepended older history");
        ReconcileOutcome::Prepended { added, duplicates }
    }

    /// Inserts or replaces a message owned by the live stream or local input.
    pub fn upsert_live(&mut self, message: Message) {
        self.live_ids.insert(message.id.clone());
        match self.messages.iter_mut().find(|held| held.id == message.id) {
            Some(held) => *held = message,
            None => self.messages.push(message),
        }
    }

    pub fn append_text_delta(&mut self, message_id: &MessageId, delta: &str) {
        self.streaming_message(message_id).append_text_delta(delta);
    }

    pub fn append_reasoning_delta(&mut self, message_id: &MessageId, delta: &str) {
        self.streaming_message(message_id)
            .append_reasoning_delta(delta);
    }

    /// Returns false when no message with that id is held.
    pub fn set_model(&mut self, message_id: &MessageId, model_id: &str) -> bool {
        match self.messages.iter_mut().find(|held| &held.id == message_id) {
            Some(held) => {
                held.metadata.model_id = Some(model_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Folds a server-confirmed reaction into the base list.
    pub fn confirm_reaction(&mut self, message_id: &MessageId, reaction: Option<Reaction>) -> bool {
        match self.messages.iter_mut().find(|held| &held.id == message_id) {
            Some(held) => {
                held.metadata.reaction = reaction;
                true
            }
            None => false,
        }
    }

    /// Appends a synthetic error message and returns its id.
    pub fn push_error(&mut self, text: &str) -> MessageId {
        let message = Message::error(MessageId::generate(), text);
        let id = message.id.clone();
        self.upsert_live(message);
        id
    }

    fn streaming_message(&mut self, message_id: &MessageId) -> &mut Message {
        let index = match self.messages.iter().position(|held| &held.id == message_id) {
            Some(index) => index,
            None => {
                self.live_ids.insert(message_id.clone());
                self.messages
                    .push(Message::assistant_streaming(message_id.clone()));
                self.messages.len() - 1
            }
        };
        &mut self.messages[index]
    }
}

/// Nearest user message before `assistant_id`, scanning backward.
pub fn find_retry_parent(messages: &[Message], assistant_id: &MessageId) -> Option<MessageId> {
    let index = messages
        .iter()
        .position(|message| &message.id == assistant_id)?;
    messages[..index]
        .iter()
        .rev()
        .find(|message| message.role == Role::User)
        .map(|message| message.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(raw: &str) -> ConversationId {
        ConversationId::new(raw)
    }

    fn user(raw: &str) -> Message {
        Message::user_text(MessageId::new(raw), raw)
    }

    fn ids(transcript: &Transcript) -> Vec<&str> {
        transcript
            .messages()
            .iter()
            .map(|message| message.id.as_str())
            .collect()
    }

    fn page(conversation: &str, messages: Vec<Message>, token: Option<&str>) -> HistoryPage {
        HistoryPage {
            conversation_id: conv(conversation),
            messages,
            cursor: CursorUpdate::Advance(token.map(ContinuationToken::new)),
        }
    }

    #[test]
    fn stale_page_heuristic_only_applies_while_generating() {
        assert!(is_stale_initial_page(3, 0, true));
        assert!(is_stale_initial_page(3, 2, true));
        assert!(!is_stale_initial_page(3, 3, true));
        assert!(!is_stale_initial_page(0, 0, true));
        assert!(!is_stale_initial_page(3, 0, false));
    }

    #[test]
    fn live_messages_survive_an_empty_page_while_streaming() {
        let mut transcript = Transcript::new(Some(conv("c1")));
        transcript.upsert_live(user("u1"));
        transcript.append_text_delta(&MessageId::new("a1"), "Hel");
        transcript.upsert_live(user("u2"));

        let outcome = transcript.apply_initial(page("c1", Vec::new(), None), false, true);

        assert_eq!(outcome, ReconcileOutcome::DiscardedStale { held: 3, fetched: 0 });
        assert_eq!(transcript.len(), 3);
    }

    #[test]
    fn replace_keeps_live_version_and_unsaved_live_messages() {
        let mut transcript = Transcript::new(Some(conv("c1")));
        transcript.upsert_live(user("u1"));
        transcript.append_text_delta(&MessageId::new("a1"), "streamed");

        let stored = vec![
            user("old"),
            user("u1"),
            Message::assistant_text(MessageId::new("a1"), "partial"),
        ];
        let outcome = transcript.apply_initial(page("c1", stored, Some("T1")), false, false);

        assert_eq!(outcome, ReconcileOutcome::Replaced { count: 3, kept_live: 0 });
        assert_eq!(ids(&transcript), vec!["old", "u1", "a1"]);
        assert_eq!(transcript.messages()[2].text(), "streamed");
        assert_eq!(transcript.cursor_token(), Some(&ContinuationToken::new("T1")));

        transcript.upsert_live(user("u3"));
        let outcome =
            transcript.apply_initial(page("c1", vec![user("old"), user("u1")], None), false, false);
        assert_eq!(outcome, ReconcileOutcome::Replaced { count: 4, kept_live: 2 });
        assert_eq!(ids(&transcript), vec!["old", "u1", "a1", "u3"]);
        assert!(!transcript.has_more());
    }

    #[test]
    fn skipped_and_failed_pages_change_nothing() {
        let mut transcript = Transcript::new(Some(conv("c1")));
        transcript.upsert_live(user("u1"));

        assert_eq!(
            transcript.apply_initial(page("c1", vec![user("x")], Some("T")), true, false),
            ReconcileOutcome::Skipped
        );
        assert_eq!(
            transcript.apply_initial(HistoryPage::no_progress(conv("c1")), false, false),
            ReconcileOutcome::NoProgress
        );
        assert_eq!(ids(&transcript), vec!["u1"]);
        assert_eq!(transcript.cursor(), None);
    }

    #[test]
    fn older_pages_are_deduplicated_and_prepended() {
        let mut transcript = Transcript::new(Some(conv("c1")));
        transcript.apply_initial(page("c1", vec![user("m3"), user("m4")], Some("T1")), false, false);

        let outcome = transcript.apply_older(page(
            "c1",
            vec![user("m1"), user("m2"), user("m2"), user("m3")],
            None,
        ));

        assert_eq!(outcome, ReconcileOutcome::Prepended { added: 2, duplicates: 2 });
        assert_eq!(ids(&transcript), vec!["m1", "m2", "m3", "m4"]);
        assert!(!transcript.has_more());
    }

    #[test]
    fn cursor_advances_even_when_nothing_new_arrives() {
        let mut transcript = Transcript::new(Some(conv("c1")));
        transcript.apply_initial(page("c1", vec![user("m3")], Some("T1")), false, false);

        let outcome = transcript.apply_older(page("c1", vec![user("m3")], Some("T2")));
        assert_eq!(outcome, ReconcileOutcome::Prepended { added: 0, duplicates: 1 });
        assert_eq!(transcript.cursor_token(), Some(&ContinuationToken::new("T2")));
    }

    #[test]
    fn cursors_never_cross_conversations() {
        let mut transcript = Transcript::new(Some(conv("a")));
        transcript.apply_initial(page("a", vec![user("a1")], Some("TA")), false, false);
        assert!(transcript.has_more());

        transcript.reset_for(Some(conv("b")));
        assert_eq!(transcript.cursor_token(), None);
        assert_eq!(
            transcript.apply_older(page("a", vec![user("a0")], None)),
            ReconcileOutcome::IgnoredForeign
        );
        assert!(transcript.is_empty());
    }

    #[test]
    fn adopting_an_id_keeps_content_but_drops_cursor() {
        let mut transcript = Transcript::new(None);
        transcript.upsert_live(user("u1"));
        transcript.adopt(conv("c123"));

        assert_eq!(transcript.conversation_id(), Some(&conv("c123")));
        assert_eq!(transcript.len(), 1);
        assert!(!transcript.has_more());
    }

    #[test]
    fn retry_parent_is_the_nearest_preceding_user_message() {
        let messages = vec![
            user("u1"),
            Message::assistant_text(MessageId::new("a1"), "one"),
            user("u2"),
            Message::assistant_text(MessageId::new("a2"), "two"),
            Message::assistant_text(MessageId::new("a3"), "three"),
        ];
        assert_eq!(
            find_retry_parent(&messages, &MessageId::new("a3")),
            Some(MessageId::new("u2"))
        );
        assert_eq!(
            find_retry_parent(&messages, &MessageId::new("a1")),
            Some(MessageId::new("u1"))
        );

        let orphan = vec![Message::assistant_text(MessageId::new("a0"), "hi")];
        assert_eq!(find_retry_parent(&orphan, &MessageId::new("a0")), None);
        assert_eq!(find_retry_parent(&messages, &MessageId::new("ghost")), None);
    }
}
