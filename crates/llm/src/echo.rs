use std::time::Duration;

use futures::{StreamExt, stream};
use snafu::ensure;

use super::accumulate::accumulate;
use super::model::DEFAULT_GEMINI_MODEL;
use super::provider::{
    BoxFuture, EmptyUserTurnSnafu, EventStream, ModelAdapter, ProviderResult, StreamDelta,
    StreamRequest,
};

pub const ECHO_PROVIDER_ID: &str = "echo";
const IMAGE_ONLY_REPLY: &str = "(image received)";

/// Offline adapter that streams the user's own words back.
pub struct EchoAdapter {
    delay: Duration,
}

impl EchoAdapter {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    fn reply_for(request: &StreamRequest) -> String {
        let text = request.user_text();
        if text.trim().is_empty() {
            IMAGE_ONLY_REPLY.to_string()
        } else {
            text
        }
    }
}

impl Default for EchoAdapter {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl ModelAdapter for EchoAdapter {
    fn id(&self) -> &str {
        ECHO_PROVIDER_ID
    }

    fn name(&self) -> &str {
        "Echo"
    }

    fn default_model(&self) -> &str {
        DEFAULT_GEMINI_MODEL
    }

    fn open_stream<'a>(
        &'a self,
        request: StreamRequest,
    ) -> BoxFuture<'a, ProviderResult<EventStream>> {
        let delay = self.delay;
        Box::pin(async move {
            ensure!(
                !request.new_user_parts.is_empty(),
                EmptyUserTurnSnafu {
                    stage: "echo-open-stream",
                    model_id: request.model_id.clone(),
                }
            );

            let words = Self::reply_for(&request)
                .split_inclusive(' ')
                .map(str::to_string)
                .collect::<Vec<_>>();

            let deltas = stream::iter(words).then(move |word| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(StreamDelta::text(word))
            });

            Ok(accumulate(deltas))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aetheris_storage::{InlineImage, Part};

    async fn collect(adapter: &EchoAdapter, parts: Vec<Part>) -> Vec<(String, bool)> {
        let request = StreamRequest::new(DEFAULT_GEMINI_MODEL, Vec::new(), parts);
        adapter
            .open_stream(request)
            .await
            .unwrap()
            .map(|event| {
                let event = event.unwrap();
                (event.cumulative_text, event.terminal)
            })
            .collect()
            .await
    }

    #[tokio::test]
    async fn echoes_words_cumulatively() {
        let events = collect(&EchoAdapter::default(), vec![Part::text("hello there world")]).await;
        assert_eq!(
            events,
            vec![
                ("hello ".to_string(), false),
                ("hello there ".to_string(), false),
                ("hello there world".to_string(), false),
                ("hello there world".to_string(), true),
            ]
        );
    }

    #[tokio::test]
    async fn image_only_turn_gets_a_placeholder_reply() {
        let events = collect(
            &EchoAdapter::default(),
            vec![Part::InlineImage(InlineImage::new("image/png", "AAAA"))],
        )
        .await;
        assert_eq!(events.last().unwrap(), &(IMAGE_ONLY_REPLY.to_string(), true));
    }

    #[tokio::test(start_paused = true)]
    async fn delay_paces_each_word() {
        let adapter = EchoAdapter::new(Duration::from_millis(40));
        let started = tokio::time::Instant::now();
        let events = collect(&adapter, vec![Part::text("a b c")]).await;
        assert_eq!(events.len(), 4);
        assert!(started.elapsed() >= Duration::from_millis(120));
    }
}
