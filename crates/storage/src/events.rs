use tokio::sync::broadcast;

use super::ids::{MessageId, SessionId};

/// Targeted change notification. Observers re-read the snapshots they care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    SessionCreated {
        session_id: SessionId,
    },
    SessionDeleted {
        session_id: SessionId,
    },
    CurrentSessionChanged {
        session_id: Option<SessionId>,
    },
    TitleChanged {
        session_id: SessionId,
    },
    MessageAppended {
        session_id: SessionId,
        message_id: MessageId,
    },
    MessageUpdated {
        session_id: SessionId,
        message_id: MessageId,
    },
    MessageFinalized {
        session_id: SessionId,
        message_id: MessageId,
    },
}

impl StoreEvent {
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::CurrentSessionChanged { session_id } => *session_id,
            Self::SessionCreated { session_id }
            | Self::SessionDeleted { session_id }
            | Self::TitleChanged { session_id }
            | Self::MessageAppended { session_id, .. }
            | Self::MessageUpdated { session_id, .. }
            | Self::MessageFinalized { session_id, .. } => Some(*session_id),
        }
    }

    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Self::MessageAppended { message_id, .. }
            | Self::MessageUpdated { message_id, .. }
            | Self::MessageFinalized { message_id, .. } => Some(*message_id),
            Self::SessionCreated { .. }
            | Self::SessionDeleted { .. }
            | Self::CurrentSessionChanged { .. }
            | Self::TitleChanged { .. } => None,
        }
    }
}

/// Events for a single session, filtered out of the store-wide channel.
pub struct SessionSubscription {
    session_id: SessionId,
    events: broadcast::Receiver<StoreEvent>,
}

impl SessionSubscription {
    pub(crate) fn new(session_id: SessionId, events: broadcast::Receiver<StoreEvent>) -> Self {
        Self { session_id, events }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Waits for the next event of this session.
    ///
    /// Returns `None` once the store is dropped or the session is deleted. A lagging
    /// subscriber skips the dropped events, which is safe because every event only
    /// tells the observer to re-read a snapshot.
    pub async fn recv(&mut self) -> Option<StoreEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) if event.session_id() == Some(self.session_id) => {
                    if matches!(event, StoreEvent::SessionDeleted { .. }) {
                        return None;
                    }
                    return Some(event);
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(
                        session_id = %self.session_id,
                        skipped,
                        "session subscriber lagged behind store events"
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
