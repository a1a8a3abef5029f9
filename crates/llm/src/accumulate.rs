use aetheris_storage::Source;
use futures::stream::{self, BoxStream, Stream, StreamExt};

use super::provider::{EventStream, ProviderResult, StreamDelta, StreamEvent};

struct Accumulator {
    // `None` once the upstream has ended or failed.
    deltas: Option<BoxStream<'static, ProviderResult<StreamDelta>>>,
    text: String,
    sources: Vec<Source>,
}

/// Folds provider deltas into cumulative [`StreamEvent`]s.
///
/// Every non-empty delta yields the full text so far together with every source seen so
/// far. Deltas without text only extend the sources. When the upstream ends, a final
/// `terminal` event repeats the complete response. An upstream error is forwarded and ends
/// the stream without a terminal event.
pub fn accumulate<S>(deltas: S) -> EventStream
where
    S: Stream<Item = ProviderResult<StreamDelta>> + Send + 'static,
{
    let state = Accumulator {
        deltas: Some(deltas.boxed()),
        text: String::new(),
        sources: Vec::new(),
    };

    stream::unfold(state, |mut state| async move {
        let Some(deltas) = state.deltas.as_mut() else {
            return None;
        };
        loop {
            match deltas.next().await {
                Some(Ok(delta)) => {
                    state.sources.extend(delta.sources);
                    if delta.text.is_empty() {
                        continue;
                    }
                    state.text.push_str(&delta.text);
                    let event = StreamEvent::new(state.text.clone(), state.sources.clone(), false);
                    return Some((Ok(event), state));
                }
                Some(Err(error)) => {
                    state.deltas = None;
                    return Some((Err(error), state));
                }
                None => {
                    state.deltas = None;
                    let event = StreamEvent::new(
                        std::mem::take(&mut state.text),
                        std::mem::take(&mut state.sources),
                        true,
                    );
                    return Some((Ok(event), state));
                }
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderError;

    fn texts(events: &[StreamEvent]) -> Vec<(&str, bool)> {
        events
            .iter()
            .map(|event| (event.cumulative_text.as_str(), event.terminal))
            .collect()
    }

    #[tokio::test]
    async fn yields_cumulative_text_then_terminal() {
        let deltas = stream::iter(vec![
            Ok(StreamDelta::text("Pla")),
            Ok(StreamDelta::text("n: ")),
            Ok(StreamDelta::text("Day1...")),
        ]);

        let events = accumulate(deltas)
            .map(|item| item.unwrap())
            .collect::<Vec<_>>()
            .await;

        assert_eq!(
            texts(&events),
            vec![
                ("Pla", false),
                ("Plan: ", false),
                ("Plan: Day1...", false),
                ("Plan: Day1...", true),
            ]
        );
    }

    #[tokio::test]
    async fn empty_deltas_only_extend_sources() {
        let source = Source::new("X", "http://x");
        let deltas = stream::iter(vec![
            Ok(StreamDelta::text("a")),
            Ok(StreamDelta::text("").with_sources(vec![source.clone()])),
            Ok(StreamDelta::text("b")),
        ]);

        let events = accumulate(deltas)
            .map(|item| item.unwrap())
            .collect::<Vec<_>>()
            .await;

        assert_eq!(events.len(), 3);
        assert!(events[0].sources.is_empty());
        assert_eq!(events[1].cumulative_text, "ab");
        assert_eq!(events[1].sources, vec![source.clone()]);
        assert_eq!(events[2], StreamEvent::new("ab", vec![source], true));
    }

    #[tokio::test]
    async fn empty_upstream_still_terminates() {
        let events = accumulate(stream::iter(Vec::<ProviderResult<StreamDelta>>::new()))
            .map(|item| item.unwrap())
            .collect::<Vec<_>>()
            .await;
        assert_eq!(events, vec![StreamEvent::new("", Vec::new(), true)]);
    }

    #[tokio::test]
    async fn upstream_error_ends_without_terminal() {
        let deltas = stream::iter(vec![
            Ok(StreamDelta::text("partial")),
            Err(ProviderError::interrupted("test", "connection reset")),
            Ok(StreamDelta::text("never")),
        ]);

        let items = accumulate(deltas).collect::<Vec<_>>().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().cumulative_text, "partial");
        assert!(matches!(items[1], Err(ProviderError::Interrupted { .. })));
    }
}
