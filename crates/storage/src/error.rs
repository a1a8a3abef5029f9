use snafu::Snafu;

use super::ids::MessageId;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StoreError {
    #[snafu(display("store entity '{entity}' with id '{id}' was not found"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("store conflict for '{entity}': {details}"))]
    Conflict {
        stage: &'static str,
        entity: &'static str,
        details: String,
    },
    #[snafu(display("message '{message_id}' is finalized and can no longer change"))]
    MessageFinalized {
        stage: &'static str,
        message_id: MessageId,
    },
    #[snafu(display("writer of message '{message_id}' was retired before `{stage}`"))]
    Superseded {
        stage: &'static str,
        message_id: MessageId,
    },
    #[snafu(display("store id '{raw}' is invalid for {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
        source: uuid::Error,
    },
}

impl StoreError {
    /// True for rejections a caller can recover from without a programming fix.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::MessageFinalized { .. } | Self::Superseded { .. }
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
