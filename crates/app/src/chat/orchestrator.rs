use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aetheris_llm::{
    DEFAULT_GEMINI_MODEL, EventStream, HistoryTurn, ModelAdapter, StreamOptions, StreamRequest,
};
use aetheris_storage::{
    ConversationStore, InlineImage, Message, MessageId, MessageRole, MessageStatus, Part, Session,
    SessionId,
};
use parking_lot::{Mutex, RwLock};
use snafu::ResultExt;

use super::error::{
    AdapterSnafu, BusySnafu, CancelledSnafu, ChatResult, StoreSnafu, StreamError, StreamSnafu,
};
use super::exchange::{
    ExchangeState, ExchangeTransition, Generation, GenerationCounter, GenerationSwitch,
    GenerationToken,
};
use super::reconciler::StreamReconciler;

/// Result of a [`ChatOrchestrator::send_message`] call that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Nothing to send; the store was left untouched.
    Skipped,
    Completed(Arc<Message>),
}

/// Per-exchange knobs taken from settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeConfig {
    pub model_id: String,
    pub options: StreamOptions,
    pub idle_timeout: Option<Duration>,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_GEMINI_MODEL.to_string(),
            options: StreamOptions::default(),
            idle_timeout: None,
        }
    }
}

#[derive(Debug, Default)]
struct ExchangeSlot {
    state: ExchangeState,
    live: GenerationSwitch,
}

/// Drives user turns through the model adapter into the conversation store.
///
/// Each session runs at most one exchange at a time. Sessions are independent of each other.
pub struct ChatOrchestrator {
    store: Arc<ConversationStore>,
    adapter: Arc<dyn ModelAdapter>,
    config: RwLock<ExchangeConfig>,
    slots: Mutex<HashMap<SessionId, ExchangeSlot>>,
    generations: GenerationCounter,
}

impl ChatOrchestrator {
    pub fn new(
        store: Arc<ConversationStore>,
        adapter: Arc<dyn ModelAdapter>,
        config: ExchangeConfig,
    ) -> Self {
        Self {
            store,
            adapter,
            config: RwLock::new(config),
            slots: Mutex::new(HashMap::new()),
            generations: GenerationCounter::new(),
        }
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn adapter(&self) -> &Arc<dyn ModelAdapter> {
        &self.adapter
    }

    pub fn config(&self) -> ExchangeConfig {
        self.config.read().clone()
    }

    /// Model used by exchanges started after this call.
    pub fn set_model(&self, model_id: impl Into<String>) {
        self.config.write().model_id = model_id.into();
    }

    pub fn set_grounded_search(&self, enabled: bool) {
        self.config.write().options.enable_grounded_search = enabled;
    }

    pub fn create_session(&self) -> Arc<Session> {
        self.store.create_session()
    }

    pub fn select_session(&self, session_id: SessionId) -> ChatResult<()> {
        self.store.select_session(session_id).context(StoreSnafu {
            stage: "select-session",
        })
    }

    /// Deletes a session, cancelling its in-flight exchange first.
    pub fn delete_session(&self, session_id: SessionId) -> ChatResult<()> {
        self.cancel_exchange(session_id);
        self.store.delete_session(session_id).context(StoreSnafu {
            stage: "delete-session",
        })?;
        self.slots.lock().remove(&session_id);
        Ok(())
    }

    /// Unknown sessions read as [`ExchangeState::Idle`].
    pub fn exchange_state(&self, session_id: SessionId) -> ExchangeState {
        self.slots
            .lock()
            .get(&session_id)
            .map(|slot| slot.state.clone())
            .unwrap_or_default()
    }

    /// Sends one user turn and streams the model's reply into the store.
    ///
    /// Returns `Skipped` for an empty turn and `ChatError::Busy` while another exchange of
    /// the same session is in flight. Dropping the returned future cancels the exchange.
    pub async fn send_message(
        &self,
        session_id: SessionId,
        text: &str,
        image: Option<InlineImage>,
    ) -> ChatResult<SendOutcome> {
        let text = text.trim();
        if text.is_empty() && image.is_none() {
            tracing::debug!(session_id = %session_id, "skipping empty user turn");
            return Ok(SendOutcome::Skipped);
        }

        let generation = self.generations.next();
        let token = self.begin_exchange(session_id, generation)?;
        let mut guard = InFlightExchange {
            orchestrator: self,
            session_id,
            generation,
            armed: true,
        };

        let mut user_parts = vec![Part::text(text)];
        if let Some(image) = image {
            user_parts.push(Part::InlineImage(image));
        }

        let result = self
            .run_exchange(session_id, generation, &token, user_parts)
            .await;
        guard.armed = false;

        self.settle(session_id, generation, &result);
        result.map(SendOutcome::Completed)
    }

    /// Cancels the in-flight exchange of `session_id`. Returns `false` when there is none.
    ///
    /// The model message keeps whatever content was committed so far and turns `Cancelled`.
    /// Events that arrive afterwards are discarded.
    pub fn cancel_exchange(&self, session_id: SessionId) -> bool {
        self.cancel_generation(session_id, None)
    }

    fn begin_exchange(
        &self,
        session_id: SessionId,
        generation: Generation,
    ) -> ChatResult<GenerationToken> {
        let mut slots = self.slots.lock();
        let slot = slots.entry(session_id).or_default();
        match slot.state.apply(ExchangeTransition::Begin(generation)) {
            Ok(state) => {
                slot.state = state;
                slot.live.switch_to(generation);
                Ok(slot.live.token())
            }
            Err(rejection) => {
                tracing::debug!(
                    session_id = %session_id,
                    generation = %generation,
                    ?rejection,
                    "rejected exchange while another is in flight"
                );
                BusySnafu {
                    stage: "begin-exchange",
                    session_id,
                }
                .fail()
            }
        }
    }

    async fn run_exchange(
        &self,
        session_id: SessionId,
        generation: Generation,
        token: &GenerationToken,
        user_parts: Vec<Part>,
    ) -> ChatResult<Arc<Message>> {
        let history = self.history_snapshot(session_id);

        self.store
            .append_message(session_id, Message::user(user_parts.clone()))
            .context(StoreSnafu {
                stage: "append-user-message",
            })?;

        let placeholder = Message::model_placeholder();
        let message_id = placeholder.id;
        self.store
            .append_message(session_id, placeholder)
            .context(StoreSnafu {
                stage: "append-model-placeholder",
            })?;

        if !self.transition(
            session_id,
            ExchangeTransition::StartStreaming {
                generation,
                message_id,
            },
        ) {
            // Cancelled before the placeholder existed, so nobody has finalized it yet.
            self.finalize_quietly(session_id, message_id, MessageStatus::Cancelled);
            return Err(StreamError::Cancelled {
                stage: "start-streaming",
                generation,
            })
            .context(StreamSnafu {
                stage: "start-streaming",
            });
        }

        let config = self.config();
        let request = StreamRequest::new(config.model_id.clone(), history, user_parts)
            .with_options(config.options);

        tracing::info!(
            session_id = %session_id,
            message_id = %message_id,
            generation = %generation,
            model_id = %config.model_id,
            provider_id = %self.adapter.id(),
            history_len = request.history.len(),
            "exchange started"
        );

        let events = self
            .open_stream(session_id, message_id, token, request)
            .await
            .context(StreamSnafu {
                stage: "open-stream",
            })?;

        StreamReconciler::new(self.store.clone())
            .with_idle_timeout(config.idle_timeout)
            .reconcile(session_id, message_id, token, events)
            .await
            .context(StreamSnafu {
                stage: "reconcile-stream",
            })
    }

    async fn open_stream(
        &self,
        session_id: SessionId,
        message_id: MessageId,
        token: &GenerationToken,
        request: StreamRequest,
    ) -> Result<EventStream, StreamError> {
        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => {
                return CancelledSnafu {
                    stage: "open-stream",
                    generation: token.generation(),
                }
                .fail();
            }
            opened = self.adapter.open_stream(request) => opened,
        };

        match opened.context(AdapterSnafu {
            stage: "open-stream",
        }) {
            Ok(events) => Ok(events),
            Err(error) => {
                let recorded = self.store.finalize_message_if(
                    session_id,
                    message_id,
                    MessageStatus::Failed(error.to_string()),
                    || token.is_current(),
                );
                if let Err(store_error) = recorded {
                    tracing::debug!(
                        session_id = %session_id,
                        message_id = %message_id,
                        error = %store_error,
                        "open failure left to the exchange that replaced it"
                    );
                }
                Err(error)
            }
        }
    }

    /// Prior turns as the model should see them. Model turns that never produced text are
    /// left out.
    fn history_snapshot(&self, session_id: SessionId) -> Vec<HistoryTurn> {
        self.store
            .get_session(session_id)
            .map(|session| {
                session
                    .messages
                    .iter()
                    .filter(|message| message.role == MessageRole::User || message.has_text())
                    .map(HistoryTurn::from)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn settle(
        &self,
        session_id: SessionId,
        generation: Generation,
        result: &ChatResult<Arc<Message>>,
    ) {
        let transition = match result {
            Ok(message) => {
                tracing::info!(
                    session_id = %session_id,
                    message_id = %message.id,
                    generation = %generation,
                    text_len = message.text().len(),
                    source_count = message.grounding_sources.len(),
                    "exchange completed"
                );
                ExchangeTransition::Complete(generation)
            }
            Err(error) if error.is_cancelled() => {
                tracing::info!(
                    session_id = %session_id,
                    generation = %generation,
                    "exchange cancelled"
                );
                return;
            }
            Err(error) => {
                tracing::warn!(
                    session_id = %session_id,
                    generation = %generation,
                    error = %error,
                    "exchange failed"
                );
                ExchangeTransition::Fail {
                    generation,
                    reason: error.to_string(),
                }
            }
        };

        if self.store.get_session(session_id).is_none() {
            self.slots.lock().remove(&session_id);
            return;
        }
        self.transition(session_id, transition);
    }

    /// Applies `transition` to the session's slot. Rejections mean a newer generation owns
    /// the slot, so they are dropped.
    fn transition(&self, session_id: SessionId, transition: ExchangeTransition) -> bool {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(&session_id) else {
            return false;
        };

        match slot.state.apply(transition) {
            Ok(state) => {
                slot.state = state;
                true
            }
            Err(rejection) => {
                tracing::debug!(
                    session_id = %session_id,
                    ?rejection,
                    "ignored exchange transition"
                );
                false
            }
        }
    }

    /// Cancels the in-flight exchange, optionally only when it belongs to `expected`.
    fn cancel_generation(&self, session_id: SessionId, expected: Option<Generation>) -> bool {
        let (generation, message_id) = {
            let mut slots = self.slots.lock();
            let Some(slot) = slots.get_mut(&session_id) else {
                return false;
            };
            let Some(active) = slot.state.in_flight() else {
                return false;
            };
            if expected.is_some_and(|expected| expected != active) {
                return false;
            }
            let Ok(state) = slot.state.apply(ExchangeTransition::Cancel(active)) else {
                return false;
            };

            let message_id = state.message_id();
            slot.state = state;
            // Retire the cancelled generation so its token turns stale.
            slot.live.switch_to(self.generations.next());
            (active, message_id)
        };

        if let Some(message_id) = message_id {
            self.finalize_quietly(session_id, message_id, MessageStatus::Cancelled);
        }

        tracing::info!(
            session_id = %session_id,
            generation = %generation,
            "cancelled in-flight exchange"
        );
        true
    }

    fn finalize_quietly(&self, session_id: SessionId, message_id: MessageId, status: MessageStatus) {
        if let Err(error) = self.store.finalize_message(session_id, message_id, status) {
            tracing::debug!(
                session_id = %session_id,
                message_id = %message_id,
                error = %error,
                "message was already final"
            );
        }
    }
}

/// Cancels its exchange when a `send_message` future is dropped before it finishes.
struct InFlightExchange<'a> {
    orchestrator: &'a ChatOrchestrator,
    session_id: SessionId,
    generation: Generation,
    armed: bool,
}

impl Drop for InFlightExchange<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(
                session_id = %self.session_id,
                generation = %self.generation,
                "send future dropped mid-exchange"
            );
            self.orchestrator
                .cancel_generation(self.session_id, Some(self.generation));
        }
    }
}
