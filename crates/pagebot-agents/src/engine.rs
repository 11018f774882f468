use std::sync::Arc;

use futures::future::{join, join_all};
use pagebot_common::{AiResponse, ConversationMode, ConversationRequest, PageConfig, TokenUsage};
use pagebot_config::EngineConfig;
use pagebot_security::KeyPool;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cache::{CacheKey, ResponseCache};
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::media::{MediaPreprocessor, MediaText, VisionOptions};
use crate::models::{BestModelTable, BestModels, ModelResolver};
use crate::prompt::{PromptContext, build_messages, format_product_listing};
use crate::providers::ProviderRegistry;
use crate::refresher::FreeModelRefresher;
use crate::tools::ProductSearch;

/// `model_used` reported for replies served from the cache.
pub const CACHE_MODEL: &str = "cache";

/// Entry point: turns a conversation request into a reply.
///
/// All shared state (provider registry, key pool, best-model table, cache)
/// is owned here and lives as long as the engine.
pub struct ReplyEngine {
    config: Arc<EngineConfig>,
    registry: Arc<ProviderRegistry>,
    pool: Arc<dyn KeyPool>,
    products: Arc<dyn ProductSearch>,
    best_models: Arc<BestModelTable>,
    cache: Option<ResponseCache>,
    media: MediaPreprocessor,
    dispatcher: Dispatcher,
}

impl ReplyEngine {
    /// Build an engine with HTTP providers for every configured route.
    pub fn new(
        config: EngineConfig,
        pool: Arc<dyn KeyPool>,
        products: Arc<dyn ProductSearch>,
    ) -> Self {
        let client = reqwest::Client::new();
        let registry = ProviderRegistry::from_config(&config, client.clone());
        Self::with_registry(config, registry, pool, products, client)
    }

    pub fn with_registry(
        config: EngineConfig,
        registry: ProviderRegistry,
        pool: Arc<dyn KeyPool>,
        products: Arc<dyn ProductSearch>,
        client: reqwest::Client,
    ) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(registry);
        let resolver = Arc::new(ModelResolver::from_config(&config));
        let best_models = Arc::new(BestModelTable::new(BestModels::initial(&config.models)));

        let cache = config
            .cache
            .enabled
            .then(|| ResponseCache::from_config(&config.cache));
        let media = MediaPreprocessor::new(
            client,
            Arc::clone(&registry),
            Arc::clone(&pool),
            Arc::clone(&best_models),
            Arc::clone(&config),
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&pool),
            resolver,
            Arc::clone(&products),
            Arc::clone(&config),
        );

        info!(
            providers = registry.kinds().len(),
            cache = cache.is_some(),
            "reply engine ready"
        );

        Self {
            config,
            registry,
            pool,
            products,
            best_models,
            cache,
            media,
            dispatcher,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn best_models(&self) -> Arc<BestModelTable> {
        Arc::clone(&self.best_models)
    }

    /// Refresher that writes into this engine's best-model table.
    pub fn refresher(&self) -> Arc<FreeModelRefresher> {
        Arc::new(FreeModelRefresher::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.pool),
            Arc::clone(&self.best_models),
            self.config.models.clone(),
            self.config.quarantine.clone(),
        ))
    }

    /// Generate a reply.
    ///
    /// Returns `Some` with `error` set when the page's own key could not be
    /// used, and `None` when the managed pool is exhausted.
    #[instrument(skip_all, fields(page_id = %request.page_id, request_id = %Uuid::new_v4()))]
    pub async fn generate(&self, request: &ConversationRequest) -> Option<AiResponse> {
        let cache_key = if request.has_media() {
            None
        } else {
            CacheKey::new(&request.page_id, &request.sender_id, &request.user_message)
        };
        if let (Some(cache), Some(key)) = (&self.cache, &cache_key) {
            if let Some(mut hit) = cache.get(key) {
                debug!("serving reply from cache");
                hit.token_usage = TokenUsage::default();
                hit.model_used = Some(CACHE_MODEL.to_string());
                return Some(hit);
            }
        }

        let (media_notes, media_usage) = self.preprocess_media(request).await;
        let products = match request.mode {
            ConversationMode::Internal => self.prefetch_products(request).await,
            ConversationMode::External => None,
        };

        let context = PromptContext {
            products: products.as_deref(),
            media_notes: &media_notes,
        };
        let messages = build_messages(request, &context);

        match self.dispatcher.dispatch(request, &messages).await {
            DispatchOutcome::Reply(mut response) => {
                response.token_usage += media_usage;
                if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
                    cache.insert(key, response.clone());
                }
                Some(response)
            }
            DispatchOutcome::ConfigError(message) => {
                let mut response = AiResponse::failure(message);
                response.token_usage = media_usage;
                Some(response)
            }
            DispatchOutcome::Exhausted => {
                warn!("managed pool exhausted, no reply generated");
                None
            }
        }
    }

    pub async fn describe_image(
        &self,
        reference: &str,
        page: &PageConfig,
        options: &VisionOptions,
    ) -> MediaText {
        self.media.describe_image(reference, page, options).await
    }

    pub async fn transcribe_audio(&self, reference: &str, page: &PageConfig) -> MediaText {
        self.media.transcribe_audio(reference, page).await
    }

    /// Describe every image and transcribe every voice message concurrently.
    async fn preprocess_media(&self, request: &ConversationRequest) -> (Vec<String>, TokenUsage) {
        if !request.has_media() {
            return (Vec::new(), TokenUsage::default());
        }

        let page = &request.page_config;
        let options = VisionOptions::default();
        let images = join_all(
            request
                .image_refs
                .iter()
                .map(|reference| self.media.describe_image(reference, page, &options)),
        );
        let voices = join_all(
            request
                .audio_refs
                .iter()
                .map(|reference| self.media.transcribe_audio(reference, page)),
        );
        let (images, voices) = join(images, voices).await;

        let mut usage = TokenUsage::default();
        let mut notes = Vec::with_capacity(images.len() + voices.len());
        for image in images {
            usage += image.token_usage;
            notes.push(if image.is_unavailable() {
                "[The customer sent an image that could not be analyzed]".to_string()
            } else {
                format!("[The customer sent an image: {}]", image.text)
            });
        }
        for voice in voices {
            usage += voice.token_usage;
            notes.push(if voice.is_unavailable() {
                "[The customer sent a voice message that could not be transcribed]".to_string()
            } else {
                format!("[The customer sent a voice message: {}]", voice.text)
            });
        }
        (notes, usage)
    }

    async fn prefetch_products(&self, request: &ConversationRequest) -> Option<String> {
        let limit = self.config.tools.product_prefetch_limit;
        let query = request.user_message.trim();
        if limit == 0 || query.is_empty() {
            return None;
        }

        match self
            .products
            .search(&request.page_config.owner_id, query, &request.page_id)
            .await
        {
            Ok(mut products) => {
                products.truncate(limit);
                debug!(found = products.len(), "prefetched products");
                (!products.is_empty()).then(|| format_product_listing(&products))
            }
            Err(e) => {
                warn!("product prefetch failed: {e}");
                None
            }
        }
    }
}
