use std::sync::Arc;
use std::time::Duration;

mod accumulate;
mod echo;
mod model;
mod provider;
mod rig_adapter;

pub use accumulate::accumulate;
pub use echo::{ECHO_PROVIDER_ID, EchoAdapter};
pub use model::{
    DEFAULT_GEMINI_MODEL, FLASH_MODEL_ID, Model, PRO_MODEL_ID, default_gemini_models,
    resolve_model,
};
pub use provider::{
    BoxFuture, DEFAULT_TEMPERATURE, EventStream, HistoryTurn, ModelAdapter, ProviderConfig,
    ProviderError, ProviderResult, StreamDelta, StreamEvent, StreamOptions, StreamRequest,
};
pub use rig_adapter::{RIG_GEMINI_PROVIDER_ID, RigGeminiAdapter};

/// Builds the adapter named by `config.provider_id`. An empty id selects Gemini.
///
/// `echo_delay` only applies to the offline echo provider.
pub fn create_adapter(
    mut config: ProviderConfig,
    echo_delay: Duration,
) -> ProviderResult<Arc<dyn ModelAdapter>> {
    if config.provider_id.trim().is_empty() {
        config.provider_id = RIG_GEMINI_PROVIDER_ID.to_string();
    }

    match config.provider_id.as_str() {
        "gemini" | "google" => {
            config.provider_id = RIG_GEMINI_PROVIDER_ID.to_string();
            Ok(Arc::new(RigGeminiAdapter::new(config)?))
        }
        ECHO_PROVIDER_ID => Ok(Arc::new(EchoAdapter::new(echo_delay))),
        _ => Err(ProviderError::UnsupportedProvider {
            stage: "create-adapter",
            provider_id: config.provider_id,
        }),
    }
}
