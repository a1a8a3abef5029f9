pub mod error;
/// Exchange lifecycle and the generation tokens that gate store mutations.
pub mod exchange;
pub mod orchestrator;
pub mod reconciler;

pub use error::{ChatError, ChatResult, StreamError};
pub use exchange::{
    ExchangeRejection, ExchangeState, ExchangeTransition, ExchangeTransitionResult, Generation,
    GenerationCounter, GenerationSwitch, GenerationToken,
};
pub use orchestrator::{ChatOrchestrator, ExchangeConfig, SendOutcome};
pub use reconciler::StreamReconciler;
