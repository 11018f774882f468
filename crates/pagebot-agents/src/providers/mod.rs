use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use pagebot_common::{Error, ProviderKind, Result, TokenUsage};
use pagebot_config::EngineConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

pub mod gemini;
pub mod openai_compat;
pub mod whisper;

pub use gemini::GeminiProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use whisper::WhisperTranscriber;

/// Trait for inference backends (Groq, Gemini, OpenRouter, OpenAI).
///
/// Providers are stateless with respect to credentials: the key for each call
/// is issued per attempt and passed in.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Chat completion. When `request.structured_output` is set the provider
    /// asks the model for a JSON object.
    async fn complete(&self, api_key: &str, request: &LlmRequest) -> Result<LlmResponse>;

    /// Single-turn completion over one image or audio payload.
    async fn complete_with_media(&self, api_key: &str, request: &MediaRequest)
    -> Result<LlmResponse>;

    /// Public model catalog, for providers that publish one.
    async fn list_models(&self) -> Result<Vec<CatalogModel>> {
        Err(Error::Config(format!(
            "{} does not expose a model catalog",
            self.kind()
        )))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub structured_output: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// Raw media bytes with their normalized MIME type.
#[derive(Debug, Clone)]
pub struct MediaPayload {
    pub bytes: Bytes,
    pub mime_type: String,
}

impl MediaPayload {
    pub fn is_audio(&self) -> bool {
        self.mime_type.starts_with("audio/")
    }
}

#[derive(Debug, Clone)]
pub struct MediaRequest {
    pub model: String,
    pub prompt: String,
    pub media: MediaPayload,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
}

/// One entry of a provider's public model catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogModel {
    pub id: String,
    pub name: String,
    pub prompt_price: Option<f64>,
    pub completion_price: Option<f64>,
    pub input_modalities: Vec<String>,
}

impl CatalogModel {
    /// Zero-cost for both prompt and completion tokens.
    pub fn is_free(&self) -> bool {
        matches!(
            (self.prompt_price, self.completion_price),
            (Some(p), Some(c)) if p == 0.0 && c == 0.0
        )
    }

    pub fn supports(&self, modality: &str) -> bool {
        self.input_modalities.iter().any(|m| m == modality)
    }
}

/// Provider lookup by kind.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the HTTP providers for every known kind using the configured routes.
    pub fn from_config(config: &EngineConfig, client: reqwest::Client) -> Self {
        let mut registry = Self::new();
        for kind in ProviderKind::ALL {
            let base_url = config.route(kind).base_url;
            let provider: Arc<dyn LlmProvider> = match kind {
                ProviderKind::Gemini => Arc::new(GeminiProvider::new(client.clone(), base_url)),
                _ => Arc::new(OpenAiCompatProvider::new(kind, client.clone(), base_url)),
            };
            registry.register(provider);
        }
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        let kind = provider.kind();
        info!("registered LLM provider: {}", kind);
        self.providers.insert(kind, provider);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        let mut kinds: Vec<_> = self.providers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}
