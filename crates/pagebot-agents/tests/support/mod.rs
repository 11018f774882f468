#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pagebot_agents::{
    CatalogModel, LlmProvider, LlmRequest, LlmResponse, MediaRequest, ProductSearch,
    ProviderRegistry, ReplyEngine,
};
use pagebot_common::{
    ConversationMode, ConversationRequest, Error, PageConfig, Product, ProviderKind, Result,
    TokenUsage,
};
use pagebot_config::EngineConfig;
use pagebot_security::{
    Credential, CredentialId, KeyPool, MemoryKeyPool, PooledKey, QuarantineReason,
};

/// What a mock provider does on one call.
#[derive(Debug, Clone)]
pub enum Step {
    Reply(&'static str),
    Fail(u16),
}

/// Provider that plays a fixed script, repeating the last step once it runs out.
pub struct StaticMockProvider {
    kind: ProviderKind,
    script: Vec<Step>,
    catalog: Vec<CatalogModel>,
    catalog_delay: Duration,
    pub calls: Arc<AtomicUsize>,
    pub media_calls: Arc<AtomicUsize>,
    pub keys: Arc<Mutex<Vec<String>>>,
    pub requests: Arc<Mutex<Vec<LlmRequest>>>,
}

impl StaticMockProvider {
    pub fn new(kind: ProviderKind, script: Vec<Step>) -> Self {
        Self {
            kind,
            script,
            catalog: Vec::new(),
            catalog_delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            media_calls: Arc::new(AtomicUsize::new(0)),
            keys: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_catalog(mut self, catalog: Vec<CatalogModel>, delay: Duration) -> Self {
        self.catalog = catalog;
        self.catalog_delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn keys_seen(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Option<LlmRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    fn play(&self, call: usize, api_key: &str, model: &str) -> Result<LlmResponse> {
        self.keys.lock().unwrap().push(api_key.to_string());
        let step = self
            .script
            .get(call)
            .or_else(|| self.script.last())
            .cloned()
            .unwrap_or(Step::Fail(500));
        match step {
            Step::Reply(content) => Ok(LlmResponse {
                content: content.to_string(),
                model: model.to_string(),
                usage: TokenUsage::new(10, 5),
            }),
            Step::Fail(status) => Err(Error::http(self.kind.as_str(), status, "mock failure")),
        }
    }
}

#[async_trait]
impl LlmProvider for StaticMockProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn complete(&self, api_key: &str, request: &LlmRequest) -> Result<LlmResponse> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        self.play(call, api_key, &request.model)
    }

    async fn complete_with_media(
        &self,
        api_key: &str,
        request: &MediaRequest,
    ) -> Result<LlmResponse> {
        let call = self.media_calls.fetch_add(1, Ordering::SeqCst);
        self.play(call, api_key, &request.model)
    }

    async fn list_models(&self) -> Result<Vec<CatalogModel>> {
        if !self.catalog_delay.is_zero() {
            tokio::time::sleep(self.catalog_delay).await;
        }
        if self.catalog.is_empty() {
            return Err(Error::http(self.kind.as_str(), 503, "catalog unavailable"));
        }
        Ok(self.catalog.clone())
    }
}

/// Pool wrapper that counts every acquire and records every quarantine.
pub struct CountingPool {
    pub inner: MemoryKeyPool,
    pub acquires: AtomicUsize,
    pub quarantines: Mutex<Vec<(CredentialId, QuarantineReason)>>,
}

impl CountingPool {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self {
            inner: MemoryKeyPool::new(credentials),
            acquires: AtomicUsize::new(0),
            quarantines: Mutex::new(Vec::new()),
        }
    }

    pub fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    pub fn quarantined(&self) -> Vec<(CredentialId, QuarantineReason)> {
        self.quarantines.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyPool for CountingPool {
    async fn acquire(&self, provider: ProviderKind, model: &str) -> Option<PooledKey> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        self.inner.acquire(provider, model).await
    }

    async fn quarantine(&self, key: &PooledKey, duration: Duration, reason: QuarantineReason) {
        self.quarantines.lock().unwrap().push((key.id, reason));
        self.inner.quarantine(key, duration, reason).await;
    }

    async fn record_usage(&self, key: &PooledKey, tokens: u64) {
        self.inner.record_usage(key, tokens).await;
    }

    async fn is_managed_secret(&self, secret: &str) -> bool {
        self.inner.is_managed_secret(secret).await
    }
}

/// Product search over a fixed list that counts its calls.
pub struct FixedSearch {
    pub products: Vec<Product>,
    pub calls: AtomicUsize,
}

impl FixedSearch {
    pub fn new(products: Vec<Product>) -> Self {
        Self {
            products,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProductSearch for FixedSearch {
    async fn search(&self, _owner_id: &str, _query: &str, _page_id: &str) -> Result<Vec<Product>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.products.clone())
    }
}

pub fn red_shirt() -> Product {
    Product {
        name: "Red Cotton Shirt".to_string(),
        price: 650.0,
        currency: "BDT".to_string(),
        stock: Some(12),
        description: "Half sleeve, sizes M-XL".to_string(),
        image_url: Some("https://cdn.shop.test/red-shirt.jpg".to_string()),
        variants: vec!["M".to_string(), "L".to_string(), "XL".to_string()],
    }
}

pub fn groq_credential(id: CredentialId, secret: &str) -> Credential {
    Credential::new(id, ProviderKind::Groq, "llama-3.3-70b-versatile", secret)
}

/// Configuration with the response cache and product prefetch turned off.
pub fn quiet_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.cache.enabled = false;
    config.tools.product_prefetch_limit = 0;
    config
}

pub fn own_key_page(api_key: &str) -> PageConfig {
    PageConfig {
        page_id: "page-1".to_string(),
        owner_id: "owner-1".to_string(),
        bot_name: Some("ShopBot".to_string()),
        api_key: Some(api_key.to_string()),
        ..Default::default()
    }
}

pub fn managed_page() -> PageConfig {
    PageConfig {
        page_id: "page-1".to_string(),
        owner_id: "owner-1".to_string(),
        bot_name: Some("ShopBot".to_string()),
        cheap_engine: true,
        ..Default::default()
    }
}

pub fn request(page_config: PageConfig, sender_id: &str, message: &str) -> ConversationRequest {
    ConversationRequest {
        page_id: page_config.page_id.clone(),
        sender_id: sender_id.to_string(),
        sender_name: "Rahim".to_string(),
        owner_name: "Shop".to_string(),
        user_message: message.to_string(),
        history: Vec::new(),
        image_refs: Vec::new(),
        audio_refs: Vec::new(),
        page_config,
        mode: ConversationMode::Internal,
    }
}

pub fn engine(
    config: EngineConfig,
    providers: Vec<Arc<dyn LlmProvider>>,
    pool: Arc<dyn KeyPool>,
    search: Arc<dyn ProductSearch>,
) -> ReplyEngine {
    let mut registry = ProviderRegistry::new();
    for provider in providers {
        registry.register(provider);
    }
    ReplyEngine::with_registry(config, registry, pool, search, reqwest::Client::new())
}
