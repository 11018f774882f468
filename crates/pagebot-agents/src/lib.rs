pub mod cache;
pub mod dispatcher;
pub mod engine;
pub mod failure;
pub mod media;
pub mod models;
pub mod parser;
pub mod prompt;
pub mod providers;
pub mod refresher;
pub mod tools;

pub use cache::{CacheKey, ResponseCache};
pub use dispatcher::{DispatchOutcome, DispatchState, Dispatcher};
pub use engine::ReplyEngine;
pub use failure::FailureClass;
pub use media::{
    AUDIO_TRANSCRIPTION_UNAVAILABLE, IMAGE_ANALYSIS_UNAVAILABLE, MediaPreprocessor, MediaText,
    VisionOptions,
};
pub use models::{BestModelTable, BestModels, ModelResolver};
pub use parser::{ModelOutput, StructuredReply, ToolCall};
pub use providers::{
    CatalogModel, ChatMessage, ChatRole, GeminiProvider, LlmProvider, LlmRequest, LlmResponse,
    MediaPayload, MediaRequest, OpenAiCompatProvider, ProviderRegistry, WhisperTranscriber,
};
pub use refresher::{FreeModelRefresher, RefreshOutcome, RefresherHandle};
pub use tools::{NoProductSearch, ProductSearch};
