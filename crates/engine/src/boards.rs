use std::collections::HashMap;

use parley_protocol::{MessageId, ProgressUpdate, Source, SourcesUpdate, Step};

/// Record kept on an auxiliary board, keyed within its message.
pub trait BoardItem: Clone {
    fn key(&self) -> &str;
}

impl BoardItem for Step {
    fn key(&self) -> &str {
        &self.id
    }
}

impl BoardItem for Source {
    fn key(&self) -> &str {
        &self.id
    }
}

/// Per-message records produced by dedicated event kinds, kept apart from
/// message parts.
#[derive(Debug, Clone)]
pub struct AuxiliaryBoard<T> {
    items: HashMap<MessageId, Vec<T>>,
}

impl<T> Default for AuxiliaryBoard<T> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
        }
    }
}

impl<T: BoardItem> AuxiliaryBoard<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, message_id: &MessageId) -> &[T] {
        self.items.get(message_id).map_or(&[][..], Vec::as_slice)
    }

    /// Optionally clears the message's records, then upserts `incoming` by key
    /// keeping first-seen order.
    pub fn apply(
        &mut self,
        message_id: &MessageId,
        incoming: impl IntoIterator<Item = T>,
        reset: bool,
    ) {
        let items = self.items.entry(message_id.clone()).or_default();
        if reset {
            items.clear();
        }
        for item in incoming {
            match items.iter_mut().find(|held| held.key() == item.key()) {
                Some(held) => *held = item,
                None => items.push(item),
            }
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

pub type ProgressBoard = AuxiliaryBoard<Step>;
pub type SourcesBoard = AuxiliaryBoard<Source>;

impl ProgressBoard {
    pub fn apply_update(&mut self, message_id: &MessageId, update: ProgressUpdate) {
        let incoming = update.steps.into_iter().flatten().chain(update.step);
        self.apply(message_id, incoming, update.reset);
    }
}

impl SourcesBoard {
    pub fn apply_update(&mut self, message_id: &MessageId, update: SourcesUpdate) {
        self.apply(message_id, update.sources.into_iter().flatten(), update.reset);
    }
}

#[cfg(test)]
mod tests {
    use parley_protocol::StepStatus;

    use super::*;

    #[test]
    fn steps_upsert_by_id_and_reset_clears() {
        let message_id = MessageId::new("a1");
        let mut board = ProgressBoard::new();
        board.apply_update(
            &message_id,
            ProgressUpdate {
                steps: Some(vec![
                    Step::new("s1", "Search", StepStatus::Running),
                    Step::new("s2", "Read", StepStatus::Pending),
                ]),
                step: None,
                reset: false,
            },
        );
        board.apply_update(
            &message_id,
            ProgressUpdate {
                steps: None,
                step: Some(Step::new("s1", "Search", StepStatus::Done)),
                reset: false,
            },
        );

        let steps = board.get(&message_id);
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].status, StepStatus::Done);

        board.apply_update(
            &message_id,
            ProgressUpdate {
                steps: None,
                step: Some(Step::new("s3", "Write", StepStatus::Running)),
                reset: true,
            },
        );
        assert_eq!(board.get(&message_id).len(), 1);
        assert!(board.get(&MessageId::new("other")).is_empty());
    }

    #[test]
    fn sources_accumulate_without_duplicates() {
        let message_id = MessageId::new("a1");
        let mut board = SourcesBoard::new();
        let update = |sources: Vec<Source>| SourcesUpdate {
            sources: Some(sources),
            reset: false,
        };

        board.apply_update(&message_id, update(vec![Source::new("1", "https://a.example")]));
        board.apply_update(
            &message_id,
            update(vec![
                Source::new("1", "https://a.example").with_title("A"),
                Source::new("2", "https://b.example"),
            ]),
        );

        let sources = board.get(&message_id);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].title.as_deref(), Some("A"));
    }
}
