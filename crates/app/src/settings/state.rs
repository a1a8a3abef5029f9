use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use aetheris_llm::{
    DEFAULT_GEMINI_MODEL, DEFAULT_TEMPERATURE, ProviderConfig, RIG_GEMINI_PROVIDER_ID,
    StreamOptions,
};
use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::chat::ExchangeConfig;

pub const SETTINGS_DIRECTORY_NAME: &str = "aetheris";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "AETHERIS_";
/// Unprefixed variable accepted for the API key.
pub const RAW_API_KEY_ENV: &str = "API_KEY";
pub const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_ECHO_DELAY_MS: u64 = 30;
pub const MAX_TEMPERATURE: f64 = 2.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_provider_id")]
    pub provider_id: String,
    #[serde(default)]
    pub api_key: String,
    /// Empty means the provider's own endpoint.
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_enable_grounded_search")]
    pub enable_grounded_search: bool,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Zero disables the idle timeout.
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
    #[serde(default = "default_echo_delay_ms")]
    pub echo_delay_ms: u64,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            provider_id: default_provider_id(),
            api_key: String::new(),
            base_url: String::new(),
            model: default_model(),
            enable_grounded_search: default_enable_grounded_search(),
            temperature: default_temperature(),
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
            echo_delay_ms: default_echo_delay_ms(),
        }
    }
}

impl ChatSettings {
    pub fn normalized(mut self) -> Self {
        self.provider_id = if self.provider_id.trim().is_empty() {
            default_provider_id()
        } else {
            self.provider_id.trim().to_ascii_lowercase()
        };
        self.api_key = self.api_key.trim().to_string();
        self.base_url = self.base_url.trim().to_string();
        self.model = if self.model.trim().is_empty() {
            default_model()
        } else {
            self.model.trim().to_string()
        };
        self.temperature = if self.temperature.is_finite() {
            self.temperature.clamp(0.0, MAX_TEMPERATURE)
        } else {
            default_temperature()
        };

        self
    }

    pub fn to_provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(&self.provider_id, &self.api_key, &self.base_url)
    }

    pub fn stream_options(&self) -> StreamOptions {
        StreamOptions {
            enable_grounded_search: self.enable_grounded_search,
            temperature: self.temperature,
        }
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.stream_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.stream_idle_timeout_secs))
    }

    pub fn echo_delay(&self) -> Duration {
        Duration::from_millis(self.echo_delay_ms)
    }

    pub fn exchange_config(&self) -> ExchangeConfig {
        ExchangeConfig {
            model_id: self.model.clone(),
            options: self.stream_options(),
            idle_timeout: self.idle_timeout(),
        }
    }
}

/// Layered settings: defaults, then the JSON file, then the environment.
///
/// Only the file layer is ever written back, so secrets taken from the environment never
/// land on disk.
pub struct SettingsStore {
    settings: Arc<ArcSwap<ChatSettings>>,
    config_path: PathBuf,
    read_env: bool,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".aetheris"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        Self::with_env(config_path, true)
    }

    /// Store that ignores environment variables.
    pub fn without_env(config_path: PathBuf) -> Self {
        Self::with_env(config_path, false)
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    fn with_env(config_path: PathBuf, read_env: bool) -> Self {
        let settings = Self::load_layers(&config_path, read_env);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
            read_env,
        }
    }

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Applies `change` to the persisted settings and reloads every layer.
    pub fn update(
        &self,
        change: impl FnOnce(&mut ChatSettings),
    ) -> Result<Arc<ChatSettings>, SettingsError> {
        let mut persisted = Self::load_layers(&self.config_path, false);
        change(&mut persisted);
        self.persist(&persisted.normalized())?;

        let settings = Arc::new(Self::load_layers(&self.config_path, self.read_env));
        self.settings.store(settings.clone());
        Ok(settings)
    }

    fn load_layers(path: &Path, read_env: bool) -> ChatSettings {
        if !path.exists() {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }

        let mut figment =
            Figment::from(Serialized::defaults(ChatSettings::default())).merge(Json::file(path));
        if read_env {
            figment = figment
                .merge(Env::raw().only(&[RAW_API_KEY_ENV]))
                .merge(Env::prefixed(ENV_PREFIX));
        }

        match figment.extract::<ChatSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                ChatSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
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

        tracing::info!("saved settings to {:?}", self.config_path);
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

fn default_provider_id() -> String {
    RIG_GEMINI_PROVIDER_ID.to_string()
}

fn default_model() -> String {
    DEFAULT_GEMINI_MODEL.to_string()
}

fn default_enable_grounded_search() -> bool {
    true
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_stream_idle_timeout_secs() -> u64 {
    DEFAULT_STREAM_IDLE_TIMEOUT_SECS
}

fn default_echo_delay_ms() -> u64 {
    DEFAULT_ECHO_DELAY_MS
}
