use serde::{Deserialize, Serialize};

use crate::types::{ProviderKind, TokenUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One prior message in the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub text: String,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            text: text.into(),
        }
    }
}

/// `External` pages get a minimal free-text persona; `Internal` pages get the
/// full rules document and the structured JSON reply contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationMode {
    External,
    #[default]
    Internal,
}

/// Per-page settings read from the configuration store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PageConfig {
    pub page_id: String,
    /// Owner account id, used to scope product search.
    pub owner_id: String,
    pub bot_name: Option<String>,
    pub text_prompt: Option<String>,
    pub image_prompt: Option<String>,
    pub chat_model: Option<String>,
    pub provider: Option<ProviderKind>,
    pub api_key: Option<String>,
    /// Serve this page from the managed key pool instead of its own key.
    pub cheap_engine: bool,
}

impl PageConfig {
    /// Whether the page runs on its own credential (phase 1 only).
    pub fn uses_own_key(&self) -> bool {
        !self.cheap_engine
            && self
                .api_key
                .as_deref()
                .is_some_and(|key| !key.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRequest {
    pub page_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub owner_name: String,
    pub user_message: String,
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
    #[serde(default)]
    pub image_refs: Vec<String>,
    #[serde(default)]
    pub audio_refs: Vec<String>,
    pub page_config: PageConfig,
    #[serde(default)]
    pub mode: ConversationMode,
}

impl ConversationRequest {
    pub fn has_media(&self) -> bool {
        !self.image_refs.is_empty() || !self.audio_refs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyImage {
    pub url: String,
    #[serde(default)]
    pub title: String,
}

/// Structured reply returned to the caller.
///
/// Invariant: when `error` is set, `reply` is `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AiResponse {
    pub reply: Option<String>,
    pub images: Vec<ReplyImage>,
    pub sentiment: Option<String>,
    pub dm_message: Option<String>,
    pub bad_words: bool,
    pub order_details: Option<serde_json::Value>,
    pub token_usage: TokenUsage,
    pub model_used: Option<String>,
    pub error: Option<String>,
}

impl AiResponse {
    /// A plain text reply with no structured extras.
    pub fn text(reply: impl Into<String>) -> Self {
        Self {
            reply: Some(reply.into()),
            ..Default::default()
        }
    }

    /// A failed response. The reply is always cleared.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// A catalog row returned by the product-search collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Product {
    pub name: String,
    pub price: f64,
    pub currency: String,
    pub stock: Option<i64>,
    pub description: String,
    pub image_url: Option<String>,
    pub variants: Vec<String>,
}
