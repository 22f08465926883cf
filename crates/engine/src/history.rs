use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parley_protocol::{ConversationId, Message};
use parley_storage::{ContinuationToken, HistoryStore, PageRequest};
use tokio::sync::oneshot;

use crate::identity::ConversationContext;

/// How a fetched page moves the pagination cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorUpdate {
    /// Store the token; `None` means the start of history was reached.
    Advance(Option<ContinuationToken>),
    /// The fetch made no progress; keep whatever cursor is held.
    Unchanged,
}

/// One page of history, oldest message first.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPage {
    pub conversation_id: ConversationId,
    pub messages: Vec<Message>,
    pub cursor: CursorUpdate,
}

impl HistoryPage {
    pub fn no_progress(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
            cursor: CursorUpdate::Unchanged,
        }
    }

    pub fn is_no_progress(&self) -> bool {
        self.cursor == CursorUpdate::Unchanged
    }
}

/// Cancels an in-flight initial load. Dropping the handle cancels as well.
#[derive(Debug)]
pub struct AbortHandle {
    tx: oneshot::Sender<()>,
}

impl AbortHandle {
    pub fn abort(self) {
        let _ = self.tx.send(());
    }
}

#[derive(Debug)]
pub struct AbortSignal {
    rx: oneshot::Receiver<()>,
}

pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = oneshot::channel();
    (AbortHandle { tx }, AbortSignal { rx })
}

struct InFlightGuard<'a>(&'a AtomicBool);

impl<'a> InFlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Fetches history pages and turns store results into [`HistoryPage`]s.
///
/// Store failures never surface as errors here: they become "no progress"
/// pages, and the caller simply keeps its current cursor.
pub struct HistoryLoader {
    store: Arc<dyn HistoryStore>,
    context: Arc<ConversationContext>,
    older_in_flight: AtomicBool,
}

impl HistoryLoader {
    pub fn new(store: Arc<dyn HistoryStore>, context: Arc<ConversationContext>) -> Self {
        Self {
            store,
            context,
            older_in_flight: AtomicBool::new(false),
        }
    }

    pub fn is_loading_older(&self) -> bool {
        self.older_in_flight.load(Ordering::Acquire)
    }

    /// Loads the newest page. Returns `None` when aborted before resolution.
    pub async fn load_initial(
        &self,
        conversation_id: &ConversationId,
        page_size: usize,
        signal: AbortSignal,
    ) -> Option<HistoryPage> {
        let AbortSignal { mut rx } = signal;
        let request = PageRequest::latest(conversation_id.clone(), page_size);

        let result = tokio::select! {
            biased;
            _ = &mut rx => {
                tracing::debug!(conversation_id = %conversation_id, "initial history load aborted");
                return None;
            }
            result = self.store.list_messages(request) => result,
        };

        match result {
            Ok(page) => {
                let mut messages = page.messages;
                messages.reverse();
                tracing::debug!(
                    conversation_id = %conversation_id,
                    message_count = messages.len(),
                    has_more = page.continuation_token.is_some(),
                    "initial history page loaded"
                );
                Some(HistoryPage {
                    conversation_id: conversation_id.clone(),
                    messages,
                    cursor: CursorUpdate::Advance(page.continuation_token),
                })
            }
            Err(error) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %error,
                    "initial history load failed"
                );
                Some(HistoryPage::no_progress(conversation_id.clone()))
            }
        }
    }

    /// Loads the page older than `token`.
    ///
    /// Resolves to no progress without touching the store when another older
    /// load is running or there is no token, and discards the result when the
    /// active conversation changed while the request was out.
    pub async fn load_older(
        &self,
        conversation_id: &ConversationId,
        page_size: usize,
        token: Option<&ContinuationToken>,
    ) -> HistoryPage {
        let Some(token) = token else {
            tracing::trace!(conversation_id = %conversation_id, "no older history to load");
            return HistoryPage::no_progress(conversation_id.clone());
        };
        let Some(_guard) = InFlightGuard::acquire(&self.older_in_flight) else {
            tracing::debug!(conversation_id = %conversation_id, "older history load already in flight");
            return HistoryPage::no_progress(conversation_id.clone());
        };

        let request = PageRequest::older(conversation_id.clone(), page_size, token.clone());
        let result = self.store.list_messages(request).await;

        if self.context.active_id().as_ref() != Some(conversation_id) {
            tracing::debug!(
                conversation_id = %conversation_id,
                "discarding older page for inactive conversation"
            );
            return HistoryPage::no_progress(conversation_id.clone());
        }

        match result {
            Ok(page) => {
                let mut messages = page.messages;
                messages.reverse();
                tracing::debug!(
                    conversation_id = %conversation_id,
                    message_count = messages.len(),
                    has_more = page.continuation_token.is_some(),
                    "older history page loaded"
                );
                HistoryPage {
                    conversation_id: conversation_id.clone(),
                    messages,
                    cursor: CursorUpdate::Advance(page.continuation_token),
                }
            }
            Err(error) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    error = %error,
                    "older history load failed"
                );
                HistoryPage::no_progress(conversation_id.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parley_protocol::MessageId;
    use parley_storage::MemoryStore;

    use super::*;
    use crate::collaborators::{RecordingNavigator, RecordingSidebar};
    use crate::settings::EngineSettings;

    async fn seeded(count: usize) -> (Arc<MemoryStore>, Arc<ConversationContext>) {
        let store = Arc::new(MemoryStore::new());
        let messages = (1..=count)
            .map(|index| Message::user_text(MessageId::new(format!("m{index}")), "x"))
            .collect::<Vec<_>>();
        store.seed(&ConversationId::new("c1"), messages).await;

        let context = Arc::new(ConversationContext::new(
            Arc::new(EngineSettings::default()),
            Arc::new(RecordingNavigator::new()),
            Arc::new(RecordingSidebar::new()),
            Some("c1"),
            None,
        ));
        (store, context)
    }

    #[tokio::test]
    async fn initial_page_is_oldest_first() {
        let (store, context) = seeded(5).await;
        let loader = HistoryLoader::new(store, context);
        let (_handle, signal) = abort_pair();

        let page = loader
            .load_initial(&ConversationId::new("c1"), 3, signal)
            .await
            .unwrap();
        let ids = page
            .messages
            .iter()
            .map(|message| message.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["m3", "m4", "m5"]);
        assert!(matches!(page.cursor, CursorUpdate::Advance(Some(_))));
    }

    #[tokio::test]
    async fn aborted_initial_load_resolves_to_none() {
        let (store, context) = seeded(5).await;
        let loader = HistoryLoader::new(store, context);
        let (handle, signal) = abort_pair();
        handle.abort();

        assert!(
            loader
                .load_initial(&ConversationId::new("c1"), 3, signal)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn failures_make_no_progress() {
        let (store, context) = seeded(5).await;
        store.set_unavailable(true);
        let loader = HistoryLoader::new(store, context);
        let (_handle, signal) = abort_pair();

        let page = loader
            .load_initial(&ConversationId::new("c1"), 3, signal)
            .await
            .unwrap();
        assert!(page.is_no_progress());

        let older = loader
            .load_older(
                &ConversationId::new("c1"),
                3,
                Some(&ContinuationToken::new("3")),
            )
            .await;
        assert!(older.is_no_progress());
        assert!(!loader.is_loading_older());
    }

    #[tokio::test]
    async fn older_load_without_token_is_a_no_op() {
        let (store, context) = seeded(5).await;
        let loader = HistoryLoader::new(store, context);
        let page = loader.load_older(&ConversationId::new("c1"), 3, None).await;
        assert!(page.is_no_progress());
    }

    #[tokio::test]
    async fn older_page_for_switched_conversation_is_discarded() {
        let (store, context) = seeded(5).await;
        let loader = HistoryLoader::new(store, context.clone());
        context.switch_to(ConversationId::new("c2"));

        let page = loader
            .load_older(
                &ConversationId::new("c1"),
                3,
                Some(&ContinuationToken::new("3")),
            )
            .await;
        assert!(page.is_no_progress());
    }
}
