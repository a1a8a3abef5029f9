use futures::{StreamExt, stream};
use rig::http_client::sse::{Event, GenericEventSource};
use rig::providers::gemini;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};
use tokio::sync::mpsc;

use aetheris_storage::{MessageRole, Part, Source};

use super::accumulate::accumulate;
use super::model::DEFAULT_GEMINI_MODEL;
use super::provider::{
    BoxFuture, EmptyUserTurnSnafu, EventStream, HistoryTurn, HttpClientSnafu,
    InvalidPayloadSnafu, MissingApiKeySnafu, ModelAdapter, ProviderConfig, ProviderError,
    ProviderResult, StreamDelta, StreamRequest,
};

pub const RIG_GEMINI_PROVIDER_ID: &str = "gemini";

/// Gemini adapter using the rig-core client for transport.
///
/// The request body and the streamed chunks are handled here so that generation settings
/// and grounding metadata survive the round trip. Each chunk becomes one [`StreamDelta`],
/// which [`accumulate`] folds into cumulative events.
pub struct RigGeminiAdapter {
    config: ProviderConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<ContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum ContentPart {
    Text(String),
    InlineData(InlineData),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Tool {
    google_search: GoogleSearch,
}

#[derive(Debug, Serialize)]
struct GoogleSearch {}

#[derive(Debug, Default, Deserialize)]
struct GenerateContentChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Debug, Deserialize)]
struct GroundingChunk {
    web: Option<WebSource>,
}

#[derive(Debug, Deserialize)]
struct WebSource {
    uri: Option<String>,
    title: Option<String>,
}

/// One decoded SSE chunk.
#[derive(Debug, PartialEq, Eq)]
struct ParsedChunk {
    delta: StreamDelta,
    finished: bool,
}

impl RigGeminiAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "rig-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self { config })
    }

    fn build_client(config: &ProviderConfig) -> ProviderResult<gemini::Client> {
        let mut builder = gemini::Client::builder().api_key(config.api_key.as_str());
        if !config.base_url.is_empty() {
            builder = builder.base_url(config.base_url.as_str());
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }

    fn user_content(parts: &[Part]) -> Option<Content> {
        let parts = parts
            .iter()
            .filter_map(|part| match part {
                Part::Text(text) if text.trim().is_empty() => None,
                Part::Text(text) => Some(ContentPart::Text(text.clone())),
                Part::InlineImage(image) => Some(ContentPart::InlineData(InlineData {
                    mime_type: image.mime_type.clone(),
                    data: image.data.clone(),
                })),
            })
            .collect::<Vec<_>>();

        if parts.is_empty() {
            return None;
        }
        Some(Content {
            role: "user",
            parts,
        })
    }

    fn history_content(turn: &HistoryTurn) -> Option<Content> {
        match turn.role {
            MessageRole::User => Self::user_content(&turn.parts),
            MessageRole::Model => {
                let text = turn.parts.iter().filter_map(Part::as_text).collect::<String>();
                if text.trim().is_empty() {
                    None
                } else {
                    Some(Content {
                        role: "model",
                        parts: vec![ContentPart::Text(text)],
                    })
                }
            }
        }
    }

    fn build_request_body(request: &StreamRequest) -> ProviderResult<GenerateContentRequest> {
        let mut contents = request
            .history
            .iter()
            .filter_map(Self::history_content)
            .collect::<Vec<_>>();

        let Some(prompt) = Self::user_content(&request.new_user_parts) else {
            tracing::warn!(
                model_id = %request.model_id,
                history_len = contents.len(),
                "cannot open stream because the new user turn has no content"
            );
            return EmptyUserTurnSnafu {
                stage: "build-request-body",
                model_id: request.model_id.clone(),
            }
            .fail();
        };
        contents.push(prompt);

        let tools = if request.options.enable_grounded_search {
            vec![Tool {
                google_search: GoogleSearch {},
            }]
        } else {
            Vec::new()
        };

        Ok(GenerateContentRequest {
            contents,
            generation_config: GenerationConfig {
                temperature: request.options.temperature,
            },
            tools,
        })
    }

    /// Decodes one `data:` payload. Only the first candidate is read; thought parts are
    /// not part of the reply.
    fn parse_chunk(data: &str) -> ProviderResult<ParsedChunk> {
        let chunk: GenerateContentChunk =
            serde_json::from_str(data).context(InvalidPayloadSnafu {
                stage: "parse-stream-chunk",
            })?;

        let Some(candidate) = chunk.candidates.into_iter().next() else {
            return Ok(ParsedChunk {
                delta: StreamDelta::default(),
                finished: false,
            });
        };

        let text = candidate
            .content
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter(|part| !part.thought)
                    .filter_map(|part| part.text)
                    .collect::<String>()
            })
            .unwrap_or_default();

        let sources = candidate
            .grounding_metadata
            .map(|metadata| {
                metadata
                    .grounding_chunks
                    .into_iter()
                    .filter_map(|chunk| chunk.web)
                    .filter_map(|web| {
                        let uri = web.uri.filter(|uri| !uri.trim().is_empty())?;
                        let title = web
                            .title
                            .filter(|title| !title.trim().is_empty())
                            .unwrap_or_else(|| uri.clone());
                        Some(Source::new(title, uri))
                    })
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Ok(ParsedChunk {
            delta: StreamDelta::text(text).with_sources(sources),
            finished: candidate.finish_reason.is_some(),
        })
    }

    async fn open_event_stream(
        config: ProviderConfig,
        request: StreamRequest,
    ) -> ProviderResult<EventStream> {
        let client = Self::build_client(&config)?;
        let body = Self::build_request_body(&request)?;
        let body = serde_json::to_vec(&body).context(InvalidPayloadSnafu {
            stage: "encode-request-body",
        })?;

        let http_request = client
            .post_sse(format!(
                "/v1beta/models/{}:streamGenerateContent",
                request.model_id
            ))
            .context(HttpClientSnafu {
                stage: "build-stream-request",
            })?
            .header("Content-Type", "application/json")
            .body(body)
            .map_err(|source| ProviderError::HttpClient {
                stage: "build-stream-request",
                source: source.into(),
            })?;

        let mut event_source = GenericEventSource::new(client, http_request);
        let model_id = request.model_id;
        let (delta_tx, mut delta_rx) = mpsc::unbounded_channel::<ProviderResult<StreamDelta>>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = delta_tx.closed() => {
                        // Consumer dropped the event stream; stop provider IO promptly.
                        tracing::debug!(model_id = %model_id, "provider stream abandoned");
                        break;
                    }
                    next_event = event_source.next() => {
                        match next_event {
                            Some(Ok(Event::Open)) => {
                                tracing::debug!(model_id = %model_id, "provider stream opened");
                            }
                            Some(Ok(Event::Message(message))) => {
                                if message.data.trim().is_empty() {
                                    continue;
                                }
                                match Self::parse_chunk(&message.data) {
                                    Ok(chunk) => {
                                        let sent = delta_tx.send(Ok(chunk.delta)).is_ok();
                                        if !sent || chunk.finished {
                                            break;
                                        }
                                    }
                                    Err(error) => {
                                        tracing::warn!(
                                            model_id = %model_id,
                                            error = %error,
                                            "skipping undecodable provider chunk"
                                        );
                                    }
                                }
                            }
                            Some(Err(rig::http_client::Error::StreamEnded)) | None => break,
                            Some(Err(source)) => {
                                tracing::warn!(
                                    model_id = %model_id,
                                    error = %source,
                                    "provider stream emitted an error"
                                );
                                let _ = delta_tx.send(Err(ProviderError::HttpClient {
                                    stage: "stream-chunk",
                                    source,
                                }));
                                break;
                            }
                        }
                    }
                }
            }
            event_source.close();
        });

        let deltas = stream::poll_fn(move |cx| delta_rx.poll_recv(cx));
        Ok(accumulate(deltas))
    }
}

impl ModelAdapter for RigGeminiAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Rig Gemini"
    }

    fn default_model(&self) -> &str {
        DEFAULT_GEMINI_MODEL
    }

    fn open_stream<'a>(
        &'a self,
        request: StreamRequest,
    ) -> BoxFuture<'a, ProviderResult<EventStream>> {
        let config = self.config.clone();
        Box::pin(async move {
            let model_id = request.model_id.clone();
            let result = Self::open_event_stream(config, request).await;
            if let Err(error) = &result {
                tracing::error!(
                    model_id = %model_id,
                    error = %error,
                    "failed to open provider stream"
                );
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::StreamOptions;
    use aetheris_storage::InlineImage;
    use serde_json::json;

    const FLASH: &str = crate::model::FLASH_MODEL_ID;

    fn body_json(request: &StreamRequest) -> serde_json::Value {
        let body = RigGeminiAdapter::build_request_body(request).unwrap();
        serde_json::to_value(body).unwrap()
    }

    #[test]
    fn rejects_missing_api_key() {
        let error = RigGeminiAdapter::new(ProviderConfig::new("gemini", "  ", ""))
            .err()
            .unwrap();
        assert!(matches!(error, ProviderError::MissingApiKey { .. }));
    }

    #[test]
    fn request_body_carries_temperature_and_search_tool() {
        let request = StreamRequest::new(FLASH, Vec::new(), vec![Part::text("hi")])
            .with_options(StreamOptions {
                enable_grounded_search: true,
                temperature: 0.3,
            });

        assert_eq!(
            body_json(&request),
            json!({
                "contents": [{ "role": "user", "parts": [{ "text": "hi" }] }],
                "generationConfig": { "temperature": 0.3 },
                "tools": [{ "googleSearch": {} }],
            })
        );
    }

    #[test]
    fn request_body_omits_tools_when_search_is_off() {
        let request = StreamRequest::new(FLASH, Vec::new(), vec![Part::text("hi")])
            .with_options(StreamOptions {
                enable_grounded_search: false,
                temperature: 0.7,
            });

        let body = body_json(&request);
        assert!(body.get("tools").is_none());
        assert_eq!(body["generationConfig"]["temperature"], json!(0.7));
    }

    #[test]
    fn request_body_maps_history_and_drops_empty_model_turns() {
        let history = vec![
            HistoryTurn::new(MessageRole::User, vec![Part::text("first")]),
            HistoryTurn::new(MessageRole::Model, vec![Part::text("")]),
            HistoryTurn::new(MessageRole::User, vec![Part::text("again")]),
            HistoryTurn::new(MessageRole::Model, vec![Part::text("Sure.")]),
        ];
        let request = StreamRequest::new(
            FLASH,
            history,
            vec![
                Part::text(""),
                Part::InlineImage(InlineImage::new("image/png", "iVBORw0KGgo=")),
            ],
        );

        let body = body_json(&request);
        let roles = body["contents"]
            .as_array()
            .unwrap()
            .iter()
            .map(|content| content["role"].as_str().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(roles, ["user", "user", "model", "user"]);
        assert_eq!(
            body["contents"][3]["parts"],
            json!([{ "inlineData": { "mimeType": "image/png", "data": "iVBORw0KGgo=" } }])
        );
    }

    #[test]
    fn request_body_rejects_a_blank_user_turn() {
        let request = StreamRequest::new(FLASH, Vec::new(), vec![Part::text("   ")]);
        let error = RigGeminiAdapter::build_request_body(&request).err().unwrap();
        assert!(matches!(error, ProviderError::EmptyUserTurn { .. }));
    }

    #[test]
    fn chunk_with_grounding_yields_text_and_sources() {
        let data = json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": "Paris is " }] },
                "groundingMetadata": {
                    "webSearchQueries": ["capital of france"],
                    "groundingChunks": [
                        { "web": { "uri": "https://a.example", "title": "A" } },
                        { "web": { "uri": "https://b.example" } },
                        { "retrievedContext": { "uri": "ignored" } }
                    ]
                }
            }]
        })
        .to_string();

        let chunk = RigGeminiAdapter::parse_chunk(&data).unwrap();
        assert!(!chunk.finished);
        assert_eq!(chunk.delta.text, "Paris is ");
        assert_eq!(
            chunk.delta.sources,
            vec![
                Source::new("A", "https://a.example"),
                Source::new("https://b.example", "https://b.example"),
            ]
        );
    }

    #[test]
    fn chunk_skips_thought_parts_and_reports_finish() {
        let data = json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "planning the answer", "thought": true },
                    { "text": "the capital." }
                ] },
                "finishReason": "STOP"
            }],
            "usageMetadata": { "totalTokenCount": 12 }
        })
        .to_string();

        let chunk = RigGeminiAdapter::parse_chunk(&data).unwrap();
        assert!(chunk.finished);
        assert_eq!(chunk.delta, StreamDelta::text("the capital."));
    }

    #[test]
    fn chunk_without_candidates_is_empty() {
        let chunk = RigGeminiAdapter::parse_chunk(r#"{"usageMetadata":{}}"#).unwrap();
        assert_eq!(
            chunk,
            ParsedChunk {
                delta: StreamDelta::default(),
                finished: false,
            }
        );
        assert!(matches!(
            RigGeminiAdapter::parse_chunk("not json"),
            Err(ProviderError::InvalidPayload { .. })
        ));
    }

    #[tokio::test]
    async fn parsed_chunks_accumulate_into_events_with_sources() {
        let chunks = [
            r#"{"candidates":[{"content":{"parts":[{"text":"Hello"}]}}]}"#,
            r#"{"candidates":[{"content":{"parts":[{"text":" world"}]},"finishReason":"STOP","groundingMetadata":{"groundingChunks":[{"web":{"uri":"https://w.example","title":"W"}}]}}]}"#,
        ];
        let deltas = chunks
            .iter()
            .map(|data| RigGeminiAdapter::parse_chunk(data).map(|chunk| chunk.delta))
            .collect::<Vec<_>>();

        let events = accumulate(stream::iter(deltas))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect::<Vec<_>>();

        let last = events.last().unwrap();
        assert!(last.terminal);
        assert_eq!(last.cumulative_text, "Hello world");
        assert_eq!(last.sources, vec![Source::new("W", "https://w.example")]);
    }
}
