use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use parley_protocol::ConversationId;
use parley_storage::DEFAULT_CONVERSATION_TITLE;
use parley_transport::{RequestContext, RetrievalSettings};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "parley";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "PARLEY_";
pub const DEFAULT_PAGE_SIZE: usize = 30;
pub const DEFAULT_PRE_TRIGGER_MARGIN_PX: f32 = 200.0;
pub const DEFAULT_CONVERSATION_PATH_PREFIX: &str = "/c/";
pub const DEFAULT_MODEL_ID: &str = "default";
pub const DEFAULT_MAX_SOURCES: u32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub initial_page_size: usize,
    pub older_page_size: usize,
    pub pre_trigger_margin_px: f32,
    pub conversation_path_prefix: String,
    pub default_title: String,
    pub request: RequestContext,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            initial_page_size: DEFAULT_PAGE_SIZE,
            older_page_size: DEFAULT_PAGE_SIZE,
            pre_trigger_margin_px: DEFAULT_PRE_TRIGGER_MARGIN_PX,
            conversation_path_prefix: DEFAULT_CONVERSATION_PATH_PREFIX.to_string(),
            default_title: DEFAULT_CONVERSATION_TITLE.to_string(),
            request: default_request_context(),
        }
    }
}

impl EngineSettings {
    pub fn normalized(mut self) -> Self {
        if self.initial_page_size == 0 {
            self.initial_page_size = DEFAULT_PAGE_SIZE;
        }
        if self.older_page_size == 0 {
            self.older_page_size = DEFAULT_PAGE_SIZE;
        }
        if !self.pre_trigger_margin_px.is_finite() || self.pre_trigger_margin_px < 0.0 {
            self.pre_trigger_margin_px = DEFAULT_PRE_TRIGGER_MARGIN_PX;
        }

        self.conversation_path_prefix = self.conversation_path_prefix.trim().to_string();
        if self.conversation_path_prefix.is_empty() {
            self.conversation_path_prefix = DEFAULT_CONVERSATION_PATH_PREFIX.to_string();
        }
        self.default_title = self.default_title.trim().to_string();
        if self.default_title.is_empty() {
            self.default_title = DEFAULT_CONVERSATION_TITLE.to_string();
        }

        self.request.model_id = self.request.model_id.trim().to_string();
        if self.request.model_id.is_empty() {
            self.request.model_id = DEFAULT_MODEL_ID.to_string();
        }
        self.request.tool = self
            .request
            .tool
            .take()
            .map(|tool| tool.trim().to_string())
            .filter(|tool| !tool.is_empty());

        self
    }

    /// URL path the host shows for a conversation.
    pub fn canonical_path(&self, conversation_id: &ConversationId) -> String {
        format!("{}{}", self.conversation_path_prefix, conversation_id)
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<EngineSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".parley"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn settings(&self) -> Arc<EngineSettings> {
        self.settings.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn update(&self, settings: EngineSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> EngineSettings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(EngineSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX).split("__"));

        match figment.extract::<EngineSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                EngineSettings::default()
            }
        }
    }

    fn persist(&self, settings: &EngineSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_request_context() -> RequestContext {
    RequestContext {
        model_id: DEFAULT_MODEL_ID.to_string(),
        tool: None,
        retrieval: RetrievalSettings {
            enabled: false,
            max_sources: DEFAULT_MAX_SOURCES,
        },
    }
}
