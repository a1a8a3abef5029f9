use std::sync::Arc;
use std::time::Duration;

use aetheris_llm::{EventStream, StreamEvent};
use aetheris_storage::{
    ConversationStore, Message, MessageId, MessageStatus, Part, SessionId, StoreError,
};
use futures::StreamExt;
use snafu::{IntoError, ResultExt};

use super::error::{AdapterSnafu, CancelledSnafu, CommitSnafu, IdleTimeoutSnafu, StreamError};
use super::exchange::GenerationToken;

/// Folds one exchange's event stream into its model message.
///
/// Every event replaces the message content wholesale, so applying a monotonic stream is
/// idempotent and the message always shows the latest event. Nothing is buffered between
/// events.
pub struct StreamReconciler {
    store: Arc<ConversationStore>,
    idle_timeout: Option<Duration>,
}

impl StreamReconciler {
    pub fn new(store: Arc<ConversationStore>) -> Self {
        Self {
            store,
            idle_timeout: None,
        }
    }

    /// Fails the stream when no event arrives within `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout.filter(|timeout| !timeout.is_zero());
        self
    }

    pub async fn reconcile(
        &self,
        session_id: SessionId,
        message_id: MessageId,
        token: &GenerationToken,
        mut events: EventStream,
    ) -> Result<Arc<Message>, StreamError> {
        let mut last_committed: Option<StreamEvent> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::debug!(
                        session_id = %session_id,
                        message_id = %message_id,
                        generation = %token.generation(),
                        "exchange cancelled while awaiting the next event"
                    );
                    return CancelledSnafu {
                        stage: "await-event",
                        generation: token.generation(),
                    }
                    .fail();
                }
                next = self.next_event(&mut events) => next,
            };

            match next {
                Ok(Some(event)) => {
                    let terminal = event.terminal;
                    self.apply(session_id, message_id, token, &event, last_committed.as_ref())?;
                    last_committed = Some(event);
                    if terminal {
                        break;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    return Err(self.fail(
                        session_id,
                        message_id,
                        token,
                        last_committed.as_ref(),
                        error,
                    ));
                }
            }
        }

        self.store
            .finalize_message_if(session_id, message_id, MessageStatus::Done, || {
                token.is_current()
            })
            .map_err(|error| Self::commit_error("finalize-message", token, error))
    }

    async fn next_event(
        &self,
        events: &mut EventStream,
    ) -> Result<Option<StreamEvent>, StreamError> {
        let next = match self.idle_timeout {
            Some(timeout) => tokio::time::timeout(timeout, events.next())
                .await
                .context(IdleTimeoutSnafu {
                    stage: "await-event",
                    timeout,
                })?,
            None => events.next().await,
        };

        next.transpose().context(AdapterSnafu {
            stage: "stream-event",
        })
    }

    /// A write refused because the token was retired is a cancellation, not a store fault.
    fn commit_error(
        stage: &'static str,
        token: &GenerationToken,
        error: StoreError,
    ) -> StreamError {
        match error {
            StoreError::Superseded { .. } => {
                tracing::debug!(
                    generation = %token.generation(),
                    stage,
                    "discarding write from a stale exchange"
                );
                StreamError::Cancelled {
                    stage,
                    generation: token.generation(),
                }
            }
            source => CommitSnafu { stage }.into_error(source),
        }
    }

    fn apply(
        &self,
        session_id: SessionId,
        message_id: MessageId,
        token: &GenerationToken,
        event: &StreamEvent,
        previous: Option<&StreamEvent>,
    ) -> Result<Arc<Message>, StreamError> {
        if let Some(previous) = previous
            && event.cumulative_text.len() < previous.cumulative_text.len()
        {
            // Adapters promise monotonic text; the latest event still wins.
            tracing::warn!(
                session_id = %session_id,
                message_id = %message_id,
                previous_len = previous.cumulative_text.len(),
                next_len = event.cumulative_text.len(),
                "cumulative text shrank between stream events"
            );
        }

        let message = self
            .store
            .replace_message_content_if(
                session_id,
                message_id,
                vec![Part::text(event.cumulative_text.clone())],
                event.sources.clone(),
                || token.is_current(),
            )
            .map_err(|error| Self::commit_error("apply-event", token, error))?;

        tracing::debug!(
            session_id = %session_id,
            message_id = %message_id,
            text_len = event.cumulative_text.len(),
            source_count = message.grounding_sources.len(),
            terminal = event.terminal,
            "applied stream event"
        );
        Ok(message)
    }

    /// Re-commits the last applied event and marks the message failed.
    fn fail(
        &self,
        session_id: SessionId,
        message_id: MessageId,
        token: &GenerationToken,
        last_committed: Option<&StreamEvent>,
        error: StreamError,
    ) -> StreamError {
        if !token.is_current() {
            return error;
        }

        tracing::warn!(
            session_id = %session_id,
            message_id = %message_id,
            generation = %token.generation(),
            error = %error,
            "stream failed; keeping last committed content"
        );

        let (text, sources) = last_committed
            .map(|event| (event.cumulative_text.clone(), event.sources.clone()))
            .unwrap_or_default();

        let committed = self
            .store
            .replace_message_content_if(
                session_id,
                message_id,
                vec![Part::text(text)],
                sources,
                || token.is_current(),
            )
            .and_then(|_| {
                self.store.finalize_message_if(
                    session_id,
                    message_id,
                    MessageStatus::Failed(error.to_string()),
                    || token.is_current(),
                )
            });

        if let Err(store_error) = committed {
            tracing::warn!(
                session_id = %session_id,
                message_id = %message_id,
                error = %store_error,
                "failed to mark interrupted message"
            );
        }

        error
    }
}
