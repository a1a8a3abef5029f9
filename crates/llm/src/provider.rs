use std::future::Future;
use std::pin::Pin;

use aetheris_storage::{Message, MessageRole, Part, Source};
use futures::stream::BoxStream;
use snafu::Snafu;

pub const DEFAULT_TEMPERATURE: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub base_url: String,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            base_url: base_url.into().trim().to_string(),
        }
    }
}

/// One prior turn of the conversation as the model sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTurn {
    pub role: MessageRole,
    pub parts: Vec<Part>,
}

impl HistoryTurn {
    pub fn new(role: MessageRole, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }
}

impl From<&Message> for HistoryTurn {
    fn from(message: &Message) -> Self {
        Self::new(message.role, message.parts.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamOptions {
    pub enable_grounded_search: bool,
    pub temperature: f64,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            enable_grounded_search: true,
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub model_id: String,
    pub history: Vec<HistoryTurn>,
    pub new_user_parts: Vec<Part>,
    pub options: StreamOptions,
}

impl StreamRequest {
    pub fn new(
        model_id: impl Into<String>,
        history: Vec<HistoryTurn>,
        new_user_parts: Vec<Part>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            history,
            new_user_parts,
            options: StreamOptions::default(),
        }
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    /// Text of the new user turn, used by adapters that cannot send images.
    pub fn user_text(&self) -> String {
        self.new_user_parts
            .iter()
            .filter_map(Part::as_text)
            .collect()
    }
}

/// Full response so far. Adapters resend the whole text on every event, never a delta.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamEvent {
    pub cumulative_text: String,
    pub sources: Vec<Source>,
    pub terminal: bool,
}

impl StreamEvent {
    pub fn new(cumulative_text: impl Into<String>, sources: Vec<Source>, terminal: bool) -> Self {
        Self {
            cumulative_text: cumulative_text.into(),
            sources,
            terminal,
        }
    }
}

/// Provider-side increment before accumulation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamDelta {
    pub text: String,
    pub sources: Vec<Source>,
}

impl StreamDelta {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sources: Vec::new(),
        }
    }

    pub fn with_sources(mut self, sources: Vec<Source>) -> Self {
        self.sources = sources;
        self
    }
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
pub type EventStream = BoxStream<'static, ProviderResult<StreamEvent>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("stream request for model '{model_id}' has an empty user turn"))]
    EmptyUserTurn {
        stage: &'static str,
        model_id: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("invalid provider payload on `{stage}`, {source}"))]
    InvalidPayload {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("provider stream interrupted on `{stage}`: {details}"))]
    Interrupted {
        stage: &'static str,
        details: String,
    },
}

impl ProviderError {
    pub fn interrupted(stage: &'static str, details: impl Into<String>) -> Self {
        Self::Interrupted {
            stage,
            details: details.into(),
        }
    }
}

/// Boundary to a remote model. The core relies only on the [`StreamEvent`] contract.
pub trait ModelAdapter: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
    fn open_stream<'a>(&'a self, request: StreamRequest) -> BoxFuture<'a, ProviderResult<EventStream>>;
}
