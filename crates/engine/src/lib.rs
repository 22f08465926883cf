//! Client-side transcript engine for streaming chat.
//!
//! [`ChatSession`] ties the pieces together: it owns the active
//! conversation identity, reconciles paged history with the live stream,
//! applies optimistic reactions and drives one generation turn at a time.
//! [`ScrollAnchor`] is separate and lives next to the host's viewport.

pub mod boards;
pub mod collaborators;
pub mod dispatch;
mod error;
pub mod history;
pub mod identity;
pub mod optimistic;
pub mod reconcile;
pub mod scroll;
pub mod session;
pub mod settings;
pub mod stream;

pub use boards::{AuxiliaryBoard, BoardItem, ProgressBoard, SourcesBoard};
pub use collaborators::{
    HostEffect, Navigator, RecordingNavigator, RecordingSidebar, SidebarEntry, SidebarIndex,
};
pub use dispatch::{TurnEventSink, dispatch};
pub use error::{SessionError, SessionResult};
pub use history::{AbortHandle, AbortSignal, CursorUpdate, HistoryLoader, HistoryPage, abort_pair};
pub use identity::{
    AssignOutcome, ConversationContext, ConversationIdentity, IdentitySource, resolve_initial,
};
pub use optimistic::{OptimisticOverlay, Pending, ReactionOverlay, Settlement, Ticket, toggle_target};
pub use reconcile::{
    PageCursor, ReconcileOutcome, Transcript, find_retry_parent, is_stale_initial_page,
};
pub use scroll::{ScrollAnchor, SentinelDecision, Viewport, ViewportMetrics};
pub use session::{
    ChatSession, EventDisposition, ReactionOutcome, STREAM_CLOSED_MESSAGE, SessionDeps,
};
pub use settings::{EngineSettings, SettingsError, SettingsStore};
pub use stream::{StreamState, StreamStatus, StreamTransition, StreamTransitionRejection};
