use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use parley_protocol::ConversationId;

/// Host router. The engine only ever asks for canonical conversation paths.
pub trait Navigator: Send + Sync {
    fn navigate(&self, path: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidebarEntry {
    pub conversation_id: ConversationId,
    pub name: String,
    pub url: String,
    pub updated_at_unix_seconds: u64,
}

/// Host-side conversation list.
pub trait SidebarIndex: Send + Sync {
    fn upsert(&self, entry: SidebarEntry);
}

/// Host call decided under the session lock and run after it is released,
/// so hosts may read the session from inside their callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEffect {
    Navigate(String),
    UpsertSidebar(SidebarEntry),
}

#[derive(Debug, Default)]
pub struct RecordingNavigator {
    paths: Mutex<Vec<String>>,
}

impl RecordingNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paths(&self) -> Vec<String> {
        self.paths.lock().clone()
    }
}

impl Navigator for RecordingNavigator {
    fn navigate(&self, path: &str) {
        self.paths.lock().push(path.to_string());
    }
}

#[derive(Debug, Default)]
pub struct RecordingSidebar {
    entries: Mutex<Vec<SidebarEntry>>,
}

impl RecordingSidebar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every upsert in call order.
    pub fn entries(&self) -> Vec<SidebarEntry> {
        self.entries.lock().clone()
    }

    pub fn latest_for(&self, conversation_id: &ConversationId) -> Option<SidebarEntry> {
        self.entries
            .lock()
            .iter()
            .rev()
            .find(|entry| &entry.conversation_id == conversation_id)
            .cloned()
    }
}

impl SidebarIndex for RecordingSidebar {
    fn upsert(&self, entry: SidebarEntry) {
        self.entries.lock().push(entry);
    }
}

pub(crate) fn unix_timestamp_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}
