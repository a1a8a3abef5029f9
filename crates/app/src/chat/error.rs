use std::time::Duration;

use aetheris_llm::ProviderError;
use aetheris_storage::{SessionId, StoreError};
use snafu::Snafu;

use super::exchange::Generation;

/// Failure of one reconciled stream.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StreamError {
    #[snafu(display("model adapter failed on `{stage}`: {source}"))]
    Adapter {
        stage: &'static str,
        source: ProviderError,
    },
    #[snafu(display("no stream event arrived within {timeout:?}"))]
    IdleTimeout {
        stage: &'static str,
        timeout: Duration,
        source: tokio::time::error::Elapsed,
    },
    #[snafu(display("exchange generation {generation} was cancelled"))]
    Cancelled {
        stage: &'static str,
        generation: Generation,
    },
    #[snafu(display("failed to commit stream event on `{stage}`: {source}"))]
    Commit {
        stage: &'static str,
        source: StoreError,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("an exchange is already in flight for session '{session_id}'"))]
    Busy {
        stage: &'static str,
        session_id: SessionId,
    },
    #[snafu(display("conversation store rejected `{stage}`: {source}"))]
    Store {
        stage: &'static str,
        source: StoreError,
    },
    #[snafu(display("exchange failed on `{stage}`: {source}"))]
    Stream {
        stage: &'static str,
        source: StreamError,
    },
}

impl ChatError {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Stream {
                source: StreamError::Cancelled { .. },
                ..
            }
        )
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
