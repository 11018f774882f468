use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use pagebot_common::ProviderKind;
use serde::{Deserialize, Serialize};

/// Top-level engine configuration. Every section falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub providers: BTreeMap<ProviderKind, ProviderRoute>,
    pub dispatch: DispatchConfig,
    pub quarantine: QuarantineConfig,
    pub media: MediaConfig,
    pub models: ModelsConfig,
    pub cache: CacheConfig,
    pub tools: ToolsConfig,
    pub database: DatabaseConfig,
}

impl EngineConfig {
    /// Route for a provider, falling back to the built-in endpoint and aliases.
    pub fn route(&self, provider: ProviderKind) -> ProviderRoute {
        self.providers
            .get(&provider)
            .cloned()
            .unwrap_or_else(|| ProviderRoute::builtin(provider))
    }
}

/// Endpoint base and legacy-name alias table for one provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderRoute {
    pub base_url: String,
    /// Requested model name -> canonical model name.
    pub aliases: HashMap<String, String>,
}

impl ProviderRoute {
    pub fn builtin(provider: ProviderKind) -> Self {
        let (base_url, aliases): (&str, &[(&str, &str)]) = match provider {
            ProviderKind::Groq => (
                "https://api.groq.com/openai/v1",
                &[
                    ("llama3-70b-8192", "llama-3.3-70b-versatile"),
                    ("llama-3.1-70b-versatile", "llama-3.3-70b-versatile"),
                    ("mixtral-8x7b-32768", "llama-3.3-70b-versatile"),
                    ("llama3-8b-8192", "llama-3.1-8b-instant"),
                    ("gemma-7b-it", "llama-3.1-8b-instant"),
                ],
            ),
            ProviderKind::Gemini => (
                "https://generativelanguage.googleapis.com/v1beta",
                &[
                    ("gemini-pro", "gemini-2.5-flash"),
                    ("gemini-1.5-flash", "gemini-2.5-flash"),
                    ("gemini-1.5-flash-latest", "gemini-2.5-flash"),
                    ("gemini-2.0-flash", "gemini-2.5-flash"),
                    ("gemini-1.5-pro", "gemini-2.5-pro"),
                    ("gemini-2.0-flash-lite", "gemini-2.5-flash-lite"),
                ],
            ),
            ProviderKind::OpenRouter => ("https://openrouter.ai/api/v1", &[]),
            ProviderKind::OpenAi => (
                "https://api.openai.com/v1",
                &[("gpt-3.5-turbo", "gpt-4o-mini"), ("gpt-4", "gpt-4o")],
            ),
        };
        Self {
            base_url: base_url.to_string(),
            aliases: aliases
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
        }
    }
}

/// A concrete provider/model pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTarget {
    pub provider: ProviderKind,
    pub model: String,
}

impl ModelTarget {
    pub fn new(provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub user_key_timeout_secs: u64,
    pub swarm_timeout_secs: u64,
    pub swarm_attempts: usize,
    pub swarm_provider: ProviderKind,
    pub swarm_model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    /// Model used for an own-key page that has not chosen one.
    pub default_models: BTreeMap<ProviderKind, String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            user_key_timeout_secs: 25,
            swarm_timeout_secs: 25,
            swarm_attempts: 3,
            swarm_provider: ProviderKind::Groq,
            swarm_model: "llama-3.3-70b-versatile".to_string(),
            max_tokens: 1024,
            temperature: 0.4,
            default_models: BTreeMap::from([
                (ProviderKind::Groq, "llama-3.3-70b-versatile".to_string()),
                (ProviderKind::Gemini, "gemini-2.5-flash".to_string()),
                (
                    ProviderKind::OpenRouter,
                    "meta-llama/llama-3.3-70b-instruct:free".to_string(),
                ),
                (ProviderKind::OpenAi, "gpt-4o-mini".to_string()),
            ]),
        }
    }
}

impl DispatchConfig {
    pub fn user_key_timeout(&self) -> Duration {
        Duration::from_secs(self.user_key_timeout_secs)
    }

    pub fn swarm_timeout(&self) -> Duration {
        Duration::from_secs(self.swarm_timeout_secs)
    }

    pub fn default_model(&self, provider: ProviderKind) -> Option<&str> {
        self.default_models.get(&provider).map(String::as_str)
    }
}

/// How long a credential is kept out of the pool, per failure class.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarantineConfig {
    pub quota_secs: u64,
    pub rate_limit_secs: u64,
    pub auth_secs: u64,
    pub server_secs: u64,
    pub network_secs: u64,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            quota_secs: 6 * 60 * 60,
            rate_limit_secs: 60,
            auth_secs: 24 * 60 * 60,
            server_secs: 60,
            network_secs: 60,
        }
    }
}

/// Adds an auth header to media downloads whose host ends with `host_suffix`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAuthRule {
    pub host_suffix: String,
    pub header: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub vision_timeout_secs: u64,
    pub audio_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub vision_primary: ModelTarget,
    pub vision_lightweight: ModelTarget,
    pub audio_primary: ModelTarget,
    pub audio_lightweight: ModelTarget,
    /// Provider serving the pool-selected free vision/voice model.
    pub pooled_provider: ProviderKind,
    pub speech_to_text: ModelTarget,
    pub language_hint: String,
    pub default_image_prompt: String,
    pub auth_rules: Vec<MediaAuthRule>,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            vision_timeout_secs: 20,
            audio_timeout_secs: 20,
            download_timeout_secs: 15,
            vision_primary: ModelTarget::new(ProviderKind::Gemini, "gemini-2.5-flash"),
            vision_lightweight: ModelTarget::new(ProviderKind::Gemini, "gemini-2.5-flash-lite"),
            audio_primary: ModelTarget::new(ProviderKind::Gemini, "gemini-2.5-flash"),
            audio_lightweight: ModelTarget::new(ProviderKind::Gemini, "gemini-2.5-flash-lite"),
            pooled_provider: ProviderKind::OpenRouter,
            speech_to_text: ModelTarget::new(ProviderKind::Groq, "whisper-large-v3"),
            language_hint: "bn".to_string(),
            default_image_prompt: "Describe this image in detail. If it shows a product, \
                                   name it and mention its color, size, text and any visible price."
                .to_string(),
            auth_rules: Vec::new(),
        }
    }
}

impl MediaConfig {
    pub fn vision_timeout(&self) -> Duration {
        Duration::from_secs(self.vision_timeout_secs)
    }

    pub fn audio_timeout(&self) -> Duration {
        Duration::from_secs(self.audio_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub refresh_interval_secs: u64,
    pub catalog_provider: ProviderKind,
    pub ranker: ModelTarget,
    /// Substrings of model ids that are never selected.
    pub denylist: Vec<String>,
    /// Model id prefixes favoured by the deterministic ranking, best first.
    pub preferred_families: Vec<String>,
    /// Table used until the first successful refresh.
    pub initial_text: String,
    pub initial_vision: String,
    pub initial_voice: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 2 * 60 * 60,
            catalog_provider: ProviderKind::OpenRouter,
            ranker: ModelTarget::new(ProviderKind::Groq, "llama-3.1-8b-instant"),
            denylist: vec![
                "openrouter/auto".to_string(),
                "guard".to_string(),
                "embed".to_string(),
                "moderation".to_string(),
            ],
            preferred_families: vec![
                "google/".to_string(),
                "meta-llama/".to_string(),
                "mistralai/".to_string(),
                "qwen/".to_string(),
                "deepseek/".to_string(),
            ],
            initial_text: "meta-llama/llama-3.3-70b-instruct:free".to_string(),
            initial_vision: "google/gemma-3-27b-it:free".to_string(),
            initial_voice: "google/gemini-2.0-flash-exp:free".to_string(),
        }
    }
}

impl ModelsConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 60 * 60,
            max_entries: 1000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub product_prefetch_limit: usize,
    /// Build the swarm reply straight from search rows instead of a second call.
    pub swarm_direct_synthesis: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            product_prefetch_limit: 5,
            swarm_direct_synthesis: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("pagebot-keys.db"),
        }
    }
}
