//! Vision and audio fallback chains. Neither chain ever returns an error:
//! exhaustion yields a fixed sentinel with zero usage.

use std::sync::Arc;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use pagebot_common::{Error, PageConfig, Result, TokenUsage};
use pagebot_config::{EngineConfig, MediaAuthRule, ModelTarget};
use pagebot_security::KeyPool;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::failure::report_failure;
use crate::models::BestModelTable;
use crate::providers::{
    LlmResponse, MediaPayload, MediaRequest, ProviderRegistry, WhisperTranscriber,
};

pub const IMAGE_ANALYSIS_UNAVAILABLE: &str = "[Image analysis unavailable]";
pub const AUDIO_TRANSCRIPTION_UNAVAILABLE: &str = "[Voice message could not be transcribed]";

const DEFAULT_IMAGE_MIME: &str = "image/jpeg";
const DEFAULT_AUDIO_MIME: &str = "audio/mpeg";

/// Text derived from one media reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaText {
    pub text: String,
    pub token_usage: TokenUsage,
}

impl MediaText {
    fn unavailable(sentinel: &str) -> Self {
        Self {
            text: sentinel.to_string(),
            token_usage: TokenUsage::default(),
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.text == IMAGE_ANALYSIS_UNAVAILABLE || self.text == AUDIO_TRANSCRIPTION_UNAVAILABLE
    }
}

/// Caller overrides for the vision chain.
#[derive(Debug, Clone, Default)]
pub struct VisionOptions {
    /// Tried before the configured chain.
    pub priority: Option<ModelTarget>,
    /// Key for the priority stage; a pooled key is used when absent.
    pub priority_api_key: Option<String>,
    /// Replaces the page's image prompt.
    pub prompt: Option<String>,
}

/// Where media bytes come from.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaRef {
    Inline { mime_type: Option<String>, data: Bytes },
    Remote(Url),
}

impl MediaRef {
    /// Accepts `data:` URLs, http(s) URLs, or bare base64.
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if let Some(rest) = reference.strip_prefix("data:") {
            let (meta, payload) = rest
                .split_once(',')
                .ok_or_else(|| Error::Media("data URL has no payload".to_string()))?;
            if !meta.ends_with(";base64") {
                return Err(Error::Media("only base64 data URLs are supported".to_string()));
            }
            let mime = meta.trim_end_matches(";base64").split(';').next().unwrap_or_default();
            let data = BASE64
                .decode(payload.trim())
                .map_err(|e| Error::Media(format!("invalid base64 payload: {e}")))?;
            return Ok(Self::Inline {
                mime_type: (!mime.is_empty()).then(|| mime.to_string()),
                data: Bytes::from(data),
            });
        }

        if let Ok(url) = Url::parse(reference) {
            if matches!(url.scheme(), "http" | "https") {
                return Ok(Self::Remote(url));
            }
            return Err(Error::Media(format!("unsupported media scheme '{}'", url.scheme())));
        }

        let data = BASE64
            .decode(reference)
            .map_err(|_| Error::Media("media reference is neither a URL nor base64".to_string()))?;
        Ok(Self::Inline {
            mime_type: None,
            data: Bytes::from(data),
        })
    }
}

/// Strip parameters and lower-case; fall back to `default` for generic types.
pub fn normalize_mime(header: Option<&str>, default: &str) -> String {
    let mime = header
        .and_then(|h| h.split(';').next())
        .map(|m| m.trim().to_ascii_lowercase())
        .unwrap_or_default();
    match mime.as_str() {
        "" | "application/octet-stream" | "binary/octet-stream" => default.to_string(),
        "audio/mp3" => "audio/mpeg".to_string(),
        "image/jpg" => "image/jpeg".to_string(),
        _ => mime,
    }
}

fn auth_header_for<'a>(url: &Url, rules: &'a [MediaAuthRule]) -> Option<&'a MediaAuthRule> {
    let host = url.host_str()?.to_ascii_lowercase();
    rules.iter().find(|rule| {
        let suffix = rule.host_suffix.trim_start_matches('.').to_ascii_lowercase();
        host == suffix || host.ends_with(&format!(".{suffix}"))
    })
}

struct Stage {
    label: &'static str,
    target: ModelTarget,
    api_key: Option<String>,
}

pub struct MediaPreprocessor {
    client: reqwest::Client,
    registry: Arc<ProviderRegistry>,
    pool: Arc<dyn KeyPool>,
    best_models: Arc<BestModelTable>,
    config: Arc<EngineConfig>,
    transcriber: WhisperTranscriber,
}

impl MediaPreprocessor {
    pub fn new(
        client: reqwest::Client,
        registry: Arc<ProviderRegistry>,
        pool: Arc<dyn KeyPool>,
        best_models: Arc<BestModelTable>,
        config: Arc<EngineConfig>,
    ) -> Self {
        let stt_provider = config.media.speech_to_text.provider;
        let transcriber = WhisperTranscriber::new(
            stt_provider,
            client.clone(),
            config.route(stt_provider).base_url,
        );
        Self {
            client,
            registry,
            pool,
            best_models,
            config,
            transcriber,
        }
    }

    /// Fetch media bytes once, normalizing the MIME type.
    pub async fn load(&self, reference: &str, default_mime: &str) -> Result<MediaPayload> {
        match MediaRef::parse(reference)? {
            MediaRef::Inline { mime_type, data } => Ok(MediaPayload {
                bytes: data,
                mime_type: normalize_mime(mime_type.as_deref(), default_mime),
            }),
            MediaRef::Remote(url) => {
                let mut request = self
                    .client
                    .get(url.clone())
                    .timeout(self.config.media.download_timeout());
                if let Some(rule) = auth_header_for(&url, &self.config.media.auth_rules) {
                    request = request.header(rule.header.as_str(), rule.value.as_str());
                }

                let response = request
                    .send()
                    .await
                    .map_err(|e| Error::Media(format!("download failed: {e}")))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(Error::Media(format!("download returned status={status}")));
                }
                let mime_type = normalize_mime(
                    response
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok()),
                    default_mime,
                );
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| Error::Media(format!("download body failed: {e}")))?;
                if bytes.is_empty() {
                    return Err(Error::Media("downloaded media is empty".to_string()));
                }
                Ok(MediaPayload { bytes, mime_type })
            }
        }
    }

    /// Describe an image. Falls through priority, primary, lightweight and
    /// pooled free vision models; returns the sentinel when all fail.
    #[instrument(skip_all, fields(page_id = %page.page_id))]
    pub async fn describe_image(
        &self,
        reference: &str,
        page: &PageConfig,
        options: &VisionOptions,
    ) -> MediaText {
        let media = match self.load(reference, DEFAULT_IMAGE_MIME).await {
            Ok(media) => media,
            Err(e) => {
                warn!(trail = ?vec![format!("load: {e}")], "vision chain exhausted");
                return MediaText::unavailable(IMAGE_ANALYSIS_UNAVAILABLE);
            }
        };

        let prompt = options
            .prompt
            .clone()
            .or_else(|| page.image_prompt.clone())
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.config.media.default_image_prompt.clone());

        let media_config = &self.config.media;
        let mut stages = Vec::with_capacity(4);
        if let Some(priority) = &options.priority {
            stages.push(Stage {
                label: "priority",
                target: priority.clone(),
                api_key: options.priority_api_key.clone(),
            });
        }
        stages.push(Stage {
            label: "primary",
            target: media_config.vision_primary.clone(),
            api_key: None,
        });
        stages.push(Stage {
            label: "lightweight",
            target: media_config.vision_lightweight.clone(),
            api_key: None,
        });
        stages.push(Stage {
            label: "pooled",
            target: ModelTarget::new(media_config.pooled_provider, self.best_models.get().vision),
            api_key: None,
        });

        let (text, trail) = self
            .run_chain(&stages, &prompt, &media, media_config.vision_timeout())
            .await;
        match text {
            Some(text) => text,
            None => {
                warn!(trail = ?trail, "vision chain exhausted");
                MediaText::unavailable(IMAGE_ANALYSIS_UNAVAILABLE)
            }
        }
    }

    /// Transcribe a voice message. Generation models first, then the
    /// dedicated speech-to-text endpoint with the language hint.
    #[instrument(skip_all, fields(page_id = %page.page_id))]
    pub async fn transcribe_audio(&self, reference: &str, page: &PageConfig) -> MediaText {
        let media = match self.load(reference, DEFAULT_AUDIO_MIME).await {
            Ok(media) => media,
            Err(e) => {
                warn!(trail = ?vec![format!("load: {e}")], "audio chain exhausted");
                return MediaText::unavailable(AUDIO_TRANSCRIPTION_UNAVAILABLE);
            }
        };

        let media_config = &self.config.media;
        let stages = [
            Stage {
                label: "primary",
                target: media_config.audio_primary.clone(),
                api_key: None,
            },
            Stage {
                label: "lightweight",
                target: media_config.audio_lightweight.clone(),
                api_key: None,
            },
            Stage {
                label: "pooled",
                target: ModelTarget::new(media_config.pooled_provider, self.best_models.get().voice),
                api_key: None,
            },
        ];

        let prompt = transcription_prompt(&media_config.language_hint);
        let (text, mut trail) = self
            .run_chain(&stages, &prompt, &media, media_config.audio_timeout())
            .await;
        if let Some(text) = text {
            return text;
        }

        match tokio::time::timeout(media_config.audio_timeout(), self.speech_to_text(&media)).await {
            Ok(Ok(text)) if !text.is_empty() => {
                return MediaText {
                    text,
                    token_usage: TokenUsage::default(),
                };
            }
            Ok(Ok(_)) => trail.push("speech_to_text: empty transcript".to_string()),
            Ok(Err(e)) => trail.push(format!("speech_to_text: {e}")),
            Err(_) => trail.push("speech_to_text: timed out".to_string()),
        }

        warn!(page_id = %page.page_id, trail = ?trail, "audio chain exhausted");
        MediaText::unavailable(AUDIO_TRANSCRIPTION_UNAVAILABLE)
    }

    async fn run_chain(
        &self,
        stages: &[Stage],
        prompt: &str,
        media: &MediaPayload,
        timeout: Duration,
    ) -> (Option<MediaText>, Vec<String>) {
        let mut trail = Vec::new();
        for stage in stages {
            let request = MediaRequest {
                model: stage.target.model.clone(),
                prompt: prompt.to_string(),
                media: media.clone(),
                max_tokens: Some(self.config.dispatch.max_tokens),
            };
            let label = format!("{} {}/{}", stage.label, stage.target.provider, stage.target.model);

            match tokio::time::timeout(timeout, self.run_stage(stage, &request)).await {
                Ok(Ok(response)) if !response.content.trim().is_empty() => {
                    debug!(stage = %label, "media stage succeeded");
                    return (
                        Some(MediaText {
                            text: response.content.trim().to_string(),
                            token_usage: response.usage,
                        }),
                        trail,
                    );
                }
                Ok(Ok(_)) => trail.push(format!("{label}: empty output")),
                Ok(Err(e)) => trail.push(format!("{label}: {e}")),
                Err(_) => trail.push(format!("{label}: timed out after {timeout:?}")),
            }
        }
        (None, trail)
    }

    async fn run_stage(&self, stage: &Stage, request: &MediaRequest) -> Result<LlmResponse> {
        let target = &stage.target;
        let provider = self
            .registry
            .get(target.provider)
            .ok_or_else(|| Error::Config(format!("provider {} is not registered", target.provider)))?;

        if let Some(api_key) = &stage.api_key {
            return provider.complete_with_media(api_key, request).await;
        }

        let key = self
            .pool
            .acquire(target.provider, &target.model)
            .await
            .ok_or_else(|| Error::KeyPool(format!("no credential for {}/{}", target.provider, target.model)))?;
        match provider.complete_with_media(key.secret(), request).await {
            Ok(response) => {
                self.pool.record_usage(&key, response.usage.total()).await;
                Ok(response)
            }
            Err(e) => {
                report_failure(self.pool.as_ref(), &key, &e, &self.config.quarantine).await;
                Err(e)
            }
        }
    }

    async fn speech_to_text(&self, media: &MediaPayload) -> Result<String> {
        let target = &self.config.media.speech_to_text;
        let key = self
            .pool
            .acquire(target.provider, &target.model)
            .await
            .ok_or_else(|| Error::KeyPool(format!("no credential for {}/{}", target.provider, target.model)))?;
        let language = Some(self.config.media.language_hint.as_str());
        match self
            .transcriber
            .transcribe(key.secret(), &target.model, media, language)
            .await
        {
            Ok(text) => Ok(text),
            Err(e) => {
                report_failure(self.pool.as_ref(), &key, &e, &self.config.quarantine).await;
                Err(e)
            }
        }
    }
}

fn transcription_prompt(language_hint: &str) -> String {
    let mut prompt = String::from(
        "Transcribe this voice message exactly as spoken. Keep the original language and script \
         (write Bengali in Bengali script, not romanized). Do not translate, summarize or answer \
         it. Return only the transcript.",
    );
    if !language_hint.trim().is_empty() {
        prompt.push_str(&format!(
            " The speaker most likely uses language code '{}'.",
            language_hint.trim()
        ));
    }
    prompt
}
