use std::sync::atomic::{AtomicU64, Ordering};

use aetheris_storage::MessageId;
use tokio::sync::watch;

/// Marker for one exchange. Every submit mints a fresh one so stale events can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(pub u64);

impl Generation {
    /// Live value of a session that never ran an exchange.
    pub const NONE: Self = Self(0);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Monotonic source of generations shared by every session.
#[derive(Debug)]
pub struct GenerationCounter {
    next: AtomicU64,
}

impl GenerationCounter {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> Generation {
        Generation(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for GenerationCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the generation that is currently allowed to mutate one session.
#[derive(Debug)]
pub struct GenerationSwitch {
    live: watch::Sender<Generation>,
}

impl GenerationSwitch {
    pub fn new(generation: Generation) -> Self {
        let (live, _) = watch::channel(generation);
        Self { live }
    }

    pub fn current(&self) -> Generation {
        *self.live.borrow()
    }

    /// Token for whatever generation is live right now.
    pub fn token(&self) -> GenerationToken {
        GenerationToken {
            generation: self.current(),
            live: self.live.subscribe(),
        }
    }

    /// Makes `generation` live. Tokens of every other generation turn stale.
    pub fn switch_to(&self, generation: Generation) {
        self.live.send_replace(generation);
    }
}

impl Default for GenerationSwitch {
    fn default() -> Self {
        Self::new(Generation::NONE)
    }
}

/// Capability to mutate an exchange's message while its generation stays live.
#[derive(Debug, Clone)]
pub struct GenerationToken {
    generation: Generation,
    live: watch::Receiver<Generation>,
}

impl GenerationToken {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn is_current(&self) -> bool {
        *self.live.borrow() == self.generation
    }

    /// Resolves once this generation is no longer live, or its switch is gone.
    pub async fn cancelled(&self) {
        let generation = self.generation;
        let mut live = self.live.clone();
        let _ = live.wait_for(|current| *current != generation).await;
    }
}

/// Per-session exchange lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExchangeState {
    #[default]
    Idle,
    UserTurnCommitted {
        generation: Generation,
    },
    Streaming {
        generation: Generation,
        message_id: MessageId,
    },
    Completed {
        generation: Generation,
        message_id: MessageId,
    },
    Failed {
        generation: Generation,
        message_id: Option<MessageId>,
        reason: String,
    },
    Cancelled {
        generation: Generation,
        message_id: Option<MessageId>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeTransition {
    Begin(Generation),
    StartStreaming {
        generation: Generation,
        message_id: MessageId,
    },
    Complete(Generation),
    Fail {
        generation: Generation,
        reason: String,
    },
    Cancel(Generation),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeRejection {
    Busy {
        active: Generation,
        attempted: Generation,
    },
    NoActiveExchange,
    GenerationMismatch {
        active: Generation,
        attempted: Generation,
    },
}

pub type ExchangeTransitionResult = Result<ExchangeState, ExchangeRejection>;

impl ExchangeState {
    /// Generation of the exchange occupying the session, if one is in flight.
    pub fn in_flight(&self) -> Option<Generation> {
        match self {
            Self::UserTurnCommitted { generation } | Self::Streaming { generation, .. } => {
                Some(*generation)
            }
            Self::Idle | Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. } => {
                None
            }
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight().is_some()
    }

    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Self::Streaming { message_id, .. } | Self::Completed { message_id, .. } => {
                Some(*message_id)
            }
            Self::Failed { message_id, .. } | Self::Cancelled { message_id, .. } => *message_id,
            Self::Idle | Self::UserTurnCommitted { .. } => None,
        }
    }

    /// Applies one transition. Only the in-flight generation may move an exchange forward.
    pub fn apply(&self, transition: ExchangeTransition) -> ExchangeTransitionResult {
        match transition {
            ExchangeTransition::Begin(generation) => match self.in_flight() {
                Some(active) => Err(ExchangeRejection::Busy {
                    active,
                    attempted: generation,
                }),
                None => Ok(Self::UserTurnCommitted { generation }),
            },
            ExchangeTransition::StartStreaming {
                generation,
                message_id,
            } => match self {
                Self::UserTurnCommitted { generation: active } if *active == generation => {
                    Ok(Self::Streaming {
                        generation,
                        message_id,
                    })
                }
                _ => Err(self.reject(generation)),
            },
            ExchangeTransition::Complete(generation) => match self {
                Self::Streaming {
                    generation: active,
                    message_id,
                } if *active == generation => Ok(Self::Completed {
                    generation,
                    message_id: *message_id,
                }),
                _ => Err(self.reject(generation)),
            },
            ExchangeTransition::Fail { generation, reason } => {
                self.finish(generation, |message_id| Self::Failed {
                    generation,
                    message_id,
                    reason,
                })
            }
            ExchangeTransition::Cancel(generation) => {
                self.finish(generation, |message_id| Self::Cancelled {
                    generation,
                    message_id,
                })
            }
        }
    }

    fn finish(
        &self,
        generation: Generation,
        build: impl FnOnce(Option<MessageId>) -> Self,
    ) -> ExchangeTransitionResult {
        match self.in_flight() {
            Some(active) if active == generation => Ok(build(self.message_id())),
            _ => Err(self.reject(generation)),
        }
    }

    fn reject(&self, attempted: Generation) -> ExchangeRejection {
        match self.in_flight() {
            Some(active) if active != attempted => {
                ExchangeRejection::GenerationMismatch { active, attempted }
            }
            _ => ExchangeRejection::NoActiveExchange,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_reaches_completed() {
        let generation = Generation::new(1);
        let message_id = MessageId::new_v7();

        let state = ExchangeState::Idle
            .apply(ExchangeTransition::Begin(generation))
            .unwrap();
        assert!(state.is_in_flight());

        let state = state
            .apply(ExchangeTransition::StartStreaming {
                generation,
                message_id,
            })
            .unwrap();
        let state = state.apply(ExchangeTransition::Complete(generation)).unwrap();

        assert_eq!(
            state,
            ExchangeState::Completed {
                generation,
                message_id
            }
        );
        assert!(!state.is_in_flight());
    }

    #[test]
    fn begin_while_in_flight_is_busy() {
        let state = ExchangeState::UserTurnCommitted {
            generation: Generation::new(3),
        };
        assert_eq!(
            state.apply(ExchangeTransition::Begin(Generation::new(4))),
            Err(ExchangeRejection::Busy {
                active: Generation::new(3),
                attempted: Generation::new(4),
            })
        );
    }

    #[test]
    fn finished_exchanges_accept_a_new_begin() {
        let finished = [
            ExchangeState::Completed {
                generation: Generation::new(1),
                message_id: MessageId::new_v7(),
            },
            ExchangeState::Failed {
                generation: Generation::new(1),
                message_id: None,
                reason: "boom".to_string(),
            },
            ExchangeState::Cancelled {
                generation: Generation::new(1),
                message_id: None,
            },
        ];

        for state in finished {
            assert_eq!(
                state.apply(ExchangeTransition::Begin(Generation::new(2))),
                Ok(ExchangeState::UserTurnCommitted {
                    generation: Generation::new(2)
                })
            );
        }
    }

    #[test]
    fn stale_generation_cannot_finish_newer_exchange() {
        let state = ExchangeState::Streaming {
            generation: Generation::new(7),
            message_id: MessageId::new_v7(),
        };

        assert_eq!(
            state.apply(ExchangeTransition::Complete(Generation::new(6))),
            Err(ExchangeRejection::GenerationMismatch {
                active: Generation::new(7),
                attempted: Generation::new(6),
            })
        );
        assert_eq!(
            ExchangeState::Idle.apply(ExchangeTransition::Cancel(Generation::new(6))),
            Err(ExchangeRejection::NoActiveExchange)
        );
    }

    #[test]
    fn failure_before_streaming_has_no_message() {
        let generation = Generation::new(2);
        let state = ExchangeState::UserTurnCommitted { generation }
            .apply(ExchangeTransition::Fail {
                generation,
                reason: "store rejected".to_string(),
            })
            .unwrap();
        assert_eq!(state.message_id(), None);
        assert!(matches!(state, ExchangeState::Failed { .. }));
    }

    #[test]
    fn complete_requires_streaming() {
        let generation = Generation::new(1);
        let state = ExchangeState::UserTurnCommitted { generation };
        assert_eq!(
            state.apply(ExchangeTransition::Complete(generation)),
            Err(ExchangeRejection::NoActiveExchange)
        );
    }

    #[test]
    fn counter_is_strictly_increasing() {
        let counter = GenerationCounter::new();
        let first = counter.next();
        let second = counter.next();
        assert!(first > Generation::NONE);
        assert!(second > first);
    }

    #[tokio::test]
    async fn switching_generation_stales_old_tokens() {
        let switch = GenerationSwitch::default();
        switch.switch_to(Generation::new(5));
        let token = switch.token();
        assert!(token.is_current());

        switch.switch_to(Generation::new(6));
        assert!(!token.is_current());
        // Already stale, so this resolves immediately.
        token.cancelled().await;
        assert!(switch.token().is_current());
    }
}
