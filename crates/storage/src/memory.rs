use std::sync::Arc;

use parking_lot::RwLock;
use snafu::{OptionExt, ensure};
use tokio::sync::broadcast;

use super::error::{
    ConflictSnafu, MessageFinalizedSnafu, NotFoundSnafu, StoreResult, SupersededSnafu,
};
use super::events::{SessionSubscription, StoreEvent};
use super::ids::{MessageId, SessionId};
use super::types::{GroundingSources, Message, MessageStatus, Part, Session, Source, derive_title};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct StoreState {
    // Front of the list is the most recently created session.
    sessions: Vec<Arc<Session>>,
    current: Option<SessionId>,
}

impl StoreState {
    fn position(&self, session_id: SessionId) -> Option<usize> {
        self.sessions
            .iter()
            .position(|session| session.id == session_id)
    }

    fn session_mut(
        &mut self,
        stage: &'static str,
        session_id: SessionId,
    ) -> StoreResult<&mut Session> {
        let index = self.position(session_id).context(NotFoundSnafu {
            stage,
            entity: "session",
            id: session_id.to_string(),
        })?;
        // Clones only when an observer still holds the previous snapshot.
        Ok(Arc::make_mut(&mut self.sessions[index]))
    }
}

/// In-memory owner of every chat session and its message log.
///
/// Each operation is atomic with respect to readers: snapshots handed out by
/// [`ConversationStore::get_session`] and [`ConversationStore::list_sessions`] are
/// immutable `Arc`s and never observe a half-applied write.
pub struct ConversationStore {
    state: RwLock<StoreState>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(StoreState::default()),
            events,
        }
    }

    /// Creates an empty session at the front of the list and makes it current.
    pub fn create_session(&self) -> Arc<Session> {
        let session = Arc::new(Session::new());
        {
            let mut state = self.state.write();
            state.sessions.insert(0, session.clone());
            state.current = Some(session.id);
        }

        tracing::debug!(session_id = %session.id, "created session");
        self.emit(StoreEvent::SessionCreated {
            session_id: session.id,
        });
        self.emit(StoreEvent::CurrentSessionChanged {
            session_id: Some(session.id),
        });
        session
    }

    pub fn select_session(&self, session_id: SessionId) -> StoreResult<()> {
        {
            let mut state = self.state.write();
            ensure!(
                state.position(session_id).is_some(),
                NotFoundSnafu {
                    stage: "select-session",
                    entity: "session",
                    id: session_id.to_string(),
                }
            );
            if state.current == Some(session_id) {
                return Ok(());
            }
            state.current = Some(session_id);
        }

        self.emit(StoreEvent::CurrentSessionChanged {
            session_id: Some(session_id),
        });
        Ok(())
    }

    pub fn current_session_id(&self) -> Option<SessionId> {
        self.state.read().current
    }

    pub fn current_session(&self) -> Option<Arc<Session>> {
        let state = self.state.read();
        let current = state.current?;
        state
            .sessions
            .iter()
            .find(|session| session.id == current)
            .cloned()
    }

    /// Removes a session. When it was current, the front-most remaining session takes over.
    pub fn delete_session(&self, session_id: SessionId) -> StoreResult<()> {
        let current_changed = {
            let mut state = self.state.write();
            let index = state.position(session_id).context(NotFoundSnafu {
                stage: "delete-session",
                entity: "session",
                id: session_id.to_string(),
            })?;
            state.sessions.remove(index);

            if state.current == Some(session_id) {
                state.current = state.sessions.first().map(|session| session.id);
                Some(state.current)
            } else {
                None
            }
        };

        self.emit(StoreEvent::SessionDeleted { session_id });
        if let Some(current) = current_changed {
            self.emit(StoreEvent::CurrentSessionChanged {
                session_id: current,
            });
        }
        Ok(())
    }

    /// Appends `message` to the session log.
    ///
    /// The first message of a session freezes its title.
    pub fn append_message(&self, session_id: SessionId, message: Message) -> StoreResult<()> {
        let message_id = message.id;
        let title_derived = {
            let mut state = self.state.write();
            let session = state.session_mut("append-message", session_id)?;
            ensure!(
                session.message(message_id).is_none(),
                ConflictSnafu {
                    stage: "append-message",
                    entity: "message",
                    details: format!("message '{message_id}' already exists in session '{session_id}'"),
                }
            );

            let title_derived = session.messages.is_empty();
            if title_derived {
                session.title = derive_title(&message.text());
            }
            session.messages.push(message);
            title_derived
        };

        self.emit(StoreEvent::MessageAppended {
            session_id,
            message_id,
        });
        if title_derived {
            self.emit(StoreEvent::TitleChanged { session_id });
        }
        Ok(())
    }

    /// Replaces the parts and sources of a streaming message wholesale.
    ///
    /// Sources are deduplicated by uri, keeping the first occurrence.
    pub fn replace_message_content(
        &self,
        session_id: SessionId,
        message_id: MessageId,
        parts: Vec<Part>,
        sources: Vec<Source>,
    ) -> StoreResult<Arc<Message>> {
        self.replace_message_content_if(session_id, message_id, parts, sources, || true)
    }

    /// Like [`ConversationStore::replace_message_content`], but only while `is_live` holds.
    ///
    /// `is_live` runs under the store lock, so a writer retired before the call never lands
    /// content. A retired writer gets [`StoreError::Superseded`](crate::StoreError::Superseded).
    pub fn replace_message_content_if(
        &self,
        session_id: SessionId,
        message_id: MessageId,
        parts: Vec<Part>,
        sources: Vec<Source>,
        is_live: impl FnOnce() -> bool,
    ) -> StoreResult<Arc<Message>> {
        let updated = {
            let mut state = self.state.write();
            ensure!(
                is_live(),
                SupersededSnafu {
                    stage: "replace-message-content",
                    message_id,
                }
            );
            let message = Self::streaming_message_mut(
                &mut state,
                "replace-message-content",
                session_id,
                message_id,
            )?;
            message.parts = parts;
            message.grounding_sources = sources.into_iter().collect::<GroundingSources>();
            Arc::new(message.clone())
        };

        self.emit(StoreEvent::MessageUpdated {
            session_id,
            message_id,
        });
        Ok(updated)
    }

    /// Moves a streaming message into a final status. A final message never changes again.
    pub fn finalize_message(
        &self,
        session_id: SessionId,
        message_id: MessageId,
        status: MessageStatus,
    ) -> StoreResult<Arc<Message>> {
        self.finalize_message_if(session_id, message_id, status, || true)
    }

    /// Like [`ConversationStore::finalize_message`], guarded the same way as
    /// [`ConversationStore::replace_message_content_if`].
    pub fn finalize_message_if(
        &self,
        session_id: SessionId,
        message_id: MessageId,
        status: MessageStatus,
        is_live: impl FnOnce() -> bool,
    ) -> StoreResult<Arc<Message>> {
        let finalized = {
            let mut state = self.state.write();
            ensure!(
                is_live(),
                SupersededSnafu {
                    stage: "finalize-message",
                    message_id,
                }
            );
            let message =
                Self::streaming_message_mut(&mut state, "finalize-message", session_id, message_id)?;
            // Finalizing to `Streaming` would reopen the message, so it collapses to `Done`.
            message.status = if status.is_final() {
                status
            } else {
                MessageStatus::Done
            };
            Arc::new(message.clone())
        };

        self.emit(StoreEvent::MessageFinalized {
            session_id,
            message_id,
        });
        Ok(finalized)
    }

    /// Snapshot of every session, front to back.
    pub fn list_sessions(&self) -> Vec<Arc<Session>> {
        self.state.read().sessions.clone()
    }

    pub fn get_session(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.state
            .read()
            .sessions
            .iter()
            .find(|session| session.id == session_id)
            .cloned()
    }

    pub fn get_message(&self, session_id: SessionId, message_id: MessageId) -> Option<Message> {
        self.get_session(session_id)?.message(message_id).cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_session(&self, session_id: SessionId) -> SessionSubscription {
        SessionSubscription::new(session_id, self.events.subscribe())
    }

    fn streaming_message_mut<'a>(
        state: &'a mut StoreState,
        stage: &'static str,
        session_id: SessionId,
        message_id: MessageId,
    ) -> StoreResult<&'a mut Message> {
        let session = state.session_mut(stage, session_id)?;
        let message = session.message_mut(message_id).context(NotFoundSnafu {
            stage,
            entity: "message",
            id: message_id.to_string(),
        })?;
        ensure!(
            !message.is_final(),
            MessageFinalizedSnafu { stage, message_id }
        );
        Ok(message)
    }

    fn emit(&self, event: StoreEvent) {
        // No receivers is the normal case for headless use.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::types::{DEFAULT_SESSION_TITLE, InlineImage, MessageRole};

    fn store_with_placeholder() -> (ConversationStore, SessionId, MessageId) {
        let store = ConversationStore::new();
        let session_id = store.create_session().id;
        store
            .append_message(session_id, Message::user(vec![Part::text("hello")]))
            .unwrap();
        let placeholder = Message::model_placeholder();
        let message_id = placeholder.id;
        store.append_message(session_id, placeholder).unwrap();
        (store, session_id, message_id)
    }

    #[test]
    fn create_session_inserts_at_front_and_becomes_current() {
        let store = ConversationStore::new();
        assert!(store.current_session_id().is_none());

        let first = store.create_session();
        let second = store.create_session();

        let ids = store
            .list_sessions()
            .iter()
            .map(|session| session.id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![second.id, first.id]);
        assert_eq!(store.current_session_id(), Some(second.id));
        assert_eq!(second.title, DEFAULT_SESSION_TITLE);
        assert!(second.messages.is_empty());
    }

    #[test]
    fn append_to_unknown_session_is_not_found() {
        let store = ConversationStore::new();
        let error = store
            .append_message(SessionId::new_v7(), Message::user(vec![Part::text("hi")]))
            .unwrap_err();
        assert!(matches!(error, StoreError::NotFound { entity: "session", .. }));
    }

    #[test]
    fn first_message_freezes_title() {
        let store = ConversationStore::new();
        let session_id = store.create_session().id;

        store
            .append_message(
                session_id,
                Message::user(vec![Part::text("Which museums open late on Fridays in Lisbon?")]),
            )
            .unwrap();
        let title = store.get_session(session_id).unwrap().title.clone();
        assert_eq!(title, "Which museums open late on Fri...");

        store
            .append_message(session_id, Message::model_placeholder())
            .unwrap();
        store
            .append_message(session_id, Message::user(vec![Part::text("Something else")]))
            .unwrap();
        assert_eq!(store.get_session(session_id).unwrap().title, title);
    }

    #[test]
    fn image_only_first_message_keeps_placeholder_title() {
        let store = ConversationStore::new();
        let session_id = store.create_session().id;
        store
            .append_message(
                session_id,
                Message::user(vec![
                    Part::text(""),
                    Part::InlineImage(InlineImage::new("image/jpeg", "/9j/")),
                ]),
            )
            .unwrap();
        store
            .append_message(session_id, Message::user(vec![Part::text("later text")]))
            .unwrap();

        assert_eq!(
            store.get_session(session_id).unwrap().title,
            DEFAULT_SESSION_TITLE
        );
    }

    #[test]
    fn duplicate_message_id_is_a_conflict() {
        let store = ConversationStore::new();
        let session_id = store.create_session().id;
        let message = Message::user(vec![Part::text("once")]);
        store.append_message(session_id, message.clone()).unwrap();

        let error = store.append_message(session_id, message).unwrap_err();
        assert!(matches!(error, StoreError::Conflict { entity: "message", .. }));
        assert_eq!(store.get_session(session_id).unwrap().messages.len(), 1);
    }

    #[test]
    fn replace_converges_to_last_cumulative_text() {
        let (store, session_id, message_id) = store_with_placeholder();

        for text in ["P", "Pl", "Pla", "Plan: Day1..."] {
            store
                .replace_message_content(session_id, message_id, vec![Part::text(text)], Vec::new())
                .unwrap();
        }

        let message = store.get_message(session_id, message_id).unwrap();
        assert_eq!(message.text(), "Plan: Day1...");
        assert_eq!(message.parts.len(), 1);
    }

    #[test]
    fn replace_swaps_sources_wholesale_and_dedups() {
        let (store, session_id, message_id) = store_with_placeholder();

        store
            .replace_message_content(
                session_id,
                message_id,
                vec![Part::text("a")],
                vec![Source::new("X", "http://x"), Source::new("Y", "http://y")],
            )
            .unwrap();
        let updated = store
            .replace_message_content(
                session_id,
                message_id,
                vec![Part::text("ab")],
                vec![
                    Source::new("Y", "http://y"),
                    Source::new("Z", "http://z"),
                    Source::new("Y duplicate", "http://y"),
                ],
            )
            .unwrap();

        assert_eq!(
            updated.grounding_sources.as_slice(),
            &[Source::new("Y", "http://y"), Source::new("Z", "http://z")]
        );
    }

    #[test]
    fn replace_unknown_message_is_not_found() {
        let (store, session_id, _) = store_with_placeholder();
        let error = store
            .replace_message_content(session_id, MessageId::new_v7(), Vec::new(), Vec::new())
            .unwrap_err();
        assert!(matches!(error, StoreError::NotFound { entity: "message", .. }));
    }

    #[test]
    fn finalized_message_rejects_further_writes() {
        let (store, session_id, message_id) = store_with_placeholder();
        store
            .replace_message_content(session_id, message_id, vec![Part::text("done")], Vec::new())
            .unwrap();
        store
            .finalize_message(session_id, message_id, MessageStatus::Done)
            .unwrap();

        let replace_error = store
            .replace_message_content(session_id, message_id, vec![Part::text("done")], Vec::new())
            .unwrap_err();
        assert!(replace_error.is_recoverable());

        let finalize_error = store
            .finalize_message(session_id, message_id, MessageStatus::Done)
            .unwrap_err();
        assert!(matches!(finalize_error, StoreError::MessageFinalized { .. }));

        let message = store.get_message(session_id, message_id).unwrap();
        assert_eq!(message.text(), "done");
        assert_eq!(message.status, MessageStatus::Done);
    }

    #[test]
    fn retired_writer_cannot_touch_the_message() {
        let (store, session_id, message_id) = store_with_placeholder();
        let mut events = store.subscribe();
        store
            .replace_message_content_if(
                session_id,
                message_id,
                vec![Part::text("kept")],
                Vec::new(),
                || true,
            )
            .unwrap();

        let replace_error = store
            .replace_message_content_if(
                session_id,
                message_id,
                vec![Part::text("late")],
                vec![Source::new("X", "http://x")],
                || false,
            )
            .unwrap_err();
        assert!(matches!(replace_error, StoreError::Superseded { .. }));
        assert!(replace_error.is_recoverable());

        let finalize_error = store
            .finalize_message_if(session_id, message_id, MessageStatus::Done, || false)
            .unwrap_err();
        assert!(matches!(finalize_error, StoreError::Superseded { .. }));

        let message = store.get_message(session_id, message_id).unwrap();
        assert_eq!(message.text(), "kept");
        assert!(message.grounding_sources.is_empty());
        assert_eq!(message.status, MessageStatus::Streaming);

        // Only the live write was announced.
        assert!(matches!(
            events.try_recv(),
            Ok(StoreEvent::MessageUpdated { .. })
        ));
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn user_messages_are_immutable_from_creation() {
        let store = ConversationStore::new();
        let session_id = store.create_session().id;
        let user = Message::user(vec![Part::text("fixed")]);
        let user_id = user.id;
        store.append_message(session_id, user).unwrap();

        let error = store
            .replace_message_content(session_id, user_id, vec![Part::text("edited")], Vec::new())
            .unwrap_err();
        assert!(matches!(error, StoreError::MessageFinalized { .. }));
    }

    #[test]
    fn snapshots_are_isolated_from_later_writes() {
        let (store, session_id, message_id) = store_with_placeholder();
        let before = store.get_session(session_id).unwrap();

        store
            .replace_message_content(session_id, message_id, vec![Part::text("new")], Vec::new())
            .unwrap();

        assert_eq!(before.message(message_id).unwrap().text(), "");
        assert_eq!(
            store
                .get_session(session_id)
                .unwrap()
                .message(message_id)
                .unwrap()
                .text(),
            "new"
        );
    }

    #[test]
    fn deleting_current_session_hands_over_to_front() {
        let store = ConversationStore::new();
        let older = store.create_session().id;
        let newer = store.create_session().id;

        store.delete_session(newer).unwrap();
        assert_eq!(store.current_session_id(), Some(older));

        store.delete_session(older).unwrap();
        assert!(store.current_session_id().is_none());
        assert!(store.list_sessions().is_empty());

        let error = store.delete_session(older).unwrap_err();
        assert!(matches!(error, StoreError::NotFound { .. }));
    }

    #[test]
    fn select_unknown_session_keeps_current() {
        let store = ConversationStore::new();
        let session_id = store.create_session().id;
        assert!(store.select_session(SessionId::new_v7()).is_err());
        assert_eq!(store.current_session_id(), Some(session_id));
    }

    #[tokio::test]
    async fn session_subscription_only_sees_its_session() {
        let store = ConversationStore::new();
        let watched = store.create_session().id;
        let other = store.create_session().id;
        let mut subscription = store.subscribe_session(watched);

        store
            .append_message(other, Message::user(vec![Part::text("elsewhere")]))
            .unwrap();
        let message = Message::user(vec![Part::text("here")]);
        let message_id = message.id;
        store.append_message(watched, message).unwrap();

        assert_eq!(
            subscription.recv().await,
            Some(StoreEvent::MessageAppended {
                session_id: watched,
                message_id,
            })
        );
        assert_eq!(
            subscription.recv().await,
            Some(StoreEvent::TitleChanged {
                session_id: watched
            })
        );

        store.delete_session(watched).unwrap();
        assert_eq!(subscription.recv().await, None);
    }

    #[test]
    fn roles_survive_round_trip_through_store() {
        let (store, session_id, message_id) = store_with_placeholder();
        let session = store.get_session(session_id).unwrap();
        assert_eq!(session.messages[0].role, MessageRole::User);
        assert_eq!(session.message(message_id).unwrap().role, MessageRole::Model);
    }
}
