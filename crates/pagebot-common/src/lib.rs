pub mod error;
pub mod message;
pub mod types;

pub use error::{Error, Result};
pub use message::{
    AiResponse, ConversationMode, ConversationRequest, ConversationTurn, PageConfig, Product,
    ReplyImage, TurnRole,
};
pub use types::{ProviderKind, TokenUsage};
