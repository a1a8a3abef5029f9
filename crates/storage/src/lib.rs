pub mod error;
pub mod events;
pub mod ids;
pub mod memory;
pub mod types;

pub use error::{StoreError, StoreResult};
pub use events::{SessionSubscription, StoreEvent};
pub use ids::{MessageId, SessionId};
pub use memory::ConversationStore;
pub use types::{
    DEFAULT_SESSION_TITLE, GroundingSources, InlineImage, Message, MessageRole, MessageStatus,
    Part, Session, Source, TITLE_MAX_CHARS, derive_title, now_unix_millis,
};
