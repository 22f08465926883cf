use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use parley_protocol::ConversationId;
use tokio::sync::watch;

use crate::collaborators::{
    HostEffect, Navigator, SidebarEntry, SidebarIndex, unix_timestamp_seconds,
};
use crate::settings::EngineSettings;

/// Where the active conversation id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentitySource {
    Url,
    #[default]
    LocalPending,
    ServerAssigned,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConversationIdentity {
    pub active_id: Option<ConversationId>,
    pub source: IdentitySource,
}

impl ConversationIdentity {
    pub fn is_empty(&self) -> bool {
        self.active_id.is_none()
    }
}

/// Picks the id a freshly mounted session starts with: URL first, then a
/// locally pending id, else nothing.
pub fn resolve_initial(url_id: Option<&str>, local_pending_id: Option<&str>) -> ConversationIdentity {
    if let Some(id) = url_id.and_then(ConversationId::parse) {
        return ConversationIdentity {
            active_id: Some(id),
            source: IdentitySource::Url,
        };
    }

    ConversationIdentity {
        active_id: local_pending_id.and_then(ConversationId::parse),
        source: IdentitySource::LocalPending,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOutcome {
    IgnoredBlank,
    Unchanged,
    Adopted { navigated: bool },
}

#[derive(Debug, Default)]
struct RouteState {
    url_id: Option<ConversationId>,
    skip_fetch_for: Option<ConversationId>,
}

/// Owner of the active conversation id.
///
/// Readers either take the synchronous snapshot (`active_id`) or subscribe to
/// changes. Writers go through the methods below, which keep both views and
/// the route bookkeeping consistent under one lock.
pub struct ConversationContext {
    snapshot: ArcSwap<ConversationIdentity>,
    reactive: watch::Sender<ConversationIdentity>,
    route: Mutex<RouteState>,
    settings: Arc<EngineSettings>,
    navigator: Arc<dyn Navigator>,
    sidebar: Arc<dyn SidebarIndex>,
}

impl ConversationContext {
    pub fn new(
        settings: Arc<EngineSettings>,
        navigator: Arc<dyn Navigator>,
        sidebar: Arc<dyn SidebarIndex>,
        url_id: Option<&str>,
        local_pending_id: Option<&str>,
    ) -> Self {
        let identity = resolve_initial(url_id, local_pending_id);
        let (reactive, _) = watch::channel(identity.clone());
        tracing::debug!(
            conversation_id = ?identity.active_id,
            source = ?identity.source,
            "resolved initial conversation"
        );

        Self {
            snapshot: ArcSwap::from_pointee(identity),
            reactive,
            route: Mutex::new(RouteState {
                url_id: url_id.and_then(ConversationId::parse),
                skip_fetch_for: None,
            }),
            settings,
            navigator,
            sidebar,
        }
    }

    pub fn active_id(&self) -> Option<ConversationId> {
        self.snapshot.load().active_id.clone()
    }

    pub fn identity(&self) -> Arc<ConversationIdentity> {
        self.snapshot.load_full()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConversationIdentity> {
        self.reactive.subscribe()
    }

    pub fn url_id(&self) -> Option<ConversationId> {
        self.route.lock().url_id.clone()
    }

    pub fn canonical_path(&self, conversation_id: &ConversationId) -> String {
        self.settings.canonical_path(conversation_id)
    }

    /// Adopts an id announced by the backend mid-turn.
    ///
    /// Repeated or blank announcements are no-ops. The first history fetch for
    /// the adopted id is marked to be skipped, since the live stream already
    /// holds the freshest content. Navigation and the sidebar entry only happen
    /// when the URL did not name a conversation yet.
    pub fn on_server_assigned(&self, raw_id: &str, display_name: &str) -> AssignOutcome {
        let (outcome, effects) = self.assign_from_server(raw_id, display_name);
        for effect in effects {
            self.run_effect(effect);
        }
        outcome
    }

    /// Same as [`on_server_assigned`](Self::on_server_assigned), but leaves
    /// the navigation and sidebar calls to the caller.
    pub fn assign_from_server(
        &self,
        raw_id: &str,
        display_name: &str,
    ) -> (AssignOutcome, Vec<HostEffect>) {
        let Some(new_id) = ConversationId::parse(raw_id) else {
            tracing::debug!("ignoring blank server-assigned conversation id");
            return (AssignOutcome::IgnoredBlank, Vec::new());
        };

        let mut route = self.route.lock();
        if self.snapshot.load().active_id.as_ref() == Some(&new_id) {
            return (AssignOutcome::Unchanged, Vec::new());
        }

        route.skip_fetch_for = Some(new_id.clone());
        self.publish(ConversationIdentity {
            active_id: Some(new_id.clone()),
            source: IdentitySource::ServerAssigned,
        });

        if route.url_id.is_some() {
            tracing::info!(conversation_id = %new_id, "adopted server-assigned conversation id");
            return (AssignOutcome::Adopted { navigated: false }, Vec::new());
        }

        let path = self.canonical_path(&new_id);
        route.url_id = Some(new_id.clone());
        drop(route);

        tracing::info!(
            conversation_id = %new_id,
            path = %path,
            "adopted server-assigned conversation id and navigated"
        );
        let effects = vec![
            HostEffect::Navigate(path.clone()),
            HostEffect::UpsertSidebar(SidebarEntry {
                conversation_id: new_id,
                name: display_name.to_string(),
                url: path,
                updated_at_unix_seconds: unix_timestamp_seconds(),
            }),
        ];
        (AssignOutcome::Adopted { navigated: true }, effects)
    }

    pub fn run_effect(&self, effect: HostEffect) {
        match effect {
            HostEffect::Navigate(path) => self.navigator.navigate(&path),
            HostEffect::UpsertSidebar(entry) => self.sidebar.upsert(entry),
        }
    }

    /// The user opened an existing conversation.
    pub fn switch_to(&self, conversation_id: ConversationId) {
        let mut route = self.route.lock();
        route.url_id = Some(conversation_id.clone());
        route.skip_fetch_for = None;
        self.publish(ConversationIdentity {
            active_id: Some(conversation_id),
            source: IdentitySource::Url,
        });
    }

    /// Back to an empty, not yet persisted conversation.
    pub fn reset(&self) {
        let mut route = self.route.lock();
        route.url_id = None;
        route.skip_fetch_for = None;
        self.publish(ConversationIdentity::default());
    }

    /// Consumes the skip mark if it was set for `conversation_id`.
    pub fn take_skip(&self, conversation_id: &ConversationId) -> bool {
        let mut route = self.route.lock();
        if route.skip_fetch_for.as_ref() == Some(conversation_id) {
            route.skip_fetch_for = None;
            return true;
        }
        false
    }

    pub fn is_skip_pending(&self, conversation_id: &ConversationId) -> bool {
        self.route.lock().skip_fetch_for.as_ref() == Some(conversation_id)
    }

    fn publish(&self, identity: ConversationIdentity) {
        self.snapshot.store(Arc::new(identity.clone()));
        self.reactive.send_replace(identity);
    }
}
