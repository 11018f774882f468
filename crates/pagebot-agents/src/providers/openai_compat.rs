use async_trait::async_trait;
use base64::Engine;
use pagebot_common::{Error, ProviderKind, Result, TokenUsage};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{
    CatalogModel, ChatMessage, ChatRole, LlmProvider, LlmRequest, LlmResponse, MediaRequest,
};

/// Chat-completions client for the OpenAI wire format (Groq, OpenRouter, OpenAI).
#[derive(Clone)]
pub struct OpenAiCompatProvider {
    kind: ProviderKind,
    client: Client,
    base_url: String,
}

impl OpenAiCompatProvider {
    pub fn new(kind: ProviderKind, client: Client, base_url: impl Into<String>) -> Self {
        Self {
            kind,
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn send(&self, api_key: &str, body: &OpenAiRequest) -> Result<LlmResponse> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {api_key}"))
            .json(body)
            .send()
            .await
            .map_err(|e| Error::transport(self.kind.as_str(), format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::http(self.kind.as_str(), status.as_u16(), error_text));
        }

        let parsed: OpenAiResponse = response.json().await.map_err(|e| {
            Error::Parse(format!("failed to parse {} response: {e}", self.kind))
        })?;

        convert_response(parsed, &body.model)
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn complete(&self, api_key: &str, request: &LlmRequest) -> Result<LlmResponse> {
        let body = OpenAiRequest {
            model: request.model.clone(),
            messages: request.messages.iter().map(convert_message).collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format: request
                .structured_output
                .then(|| ResponseFormat {
                    kind: "json_object".to_string(),
                }),
        };
        self.send(api_key, &body).await
    }

    async fn complete_with_media(
        &self,
        api_key: &str,
        request: &MediaRequest,
    ) -> Result<LlmResponse> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(&request.media.bytes);
        let media_part = if request.media.is_audio() {
            ContentPart::InputAudio {
                input_audio: InputAudio {
                    data: encoded,
                    format: audio_format(&request.media.mime_type).to_string(),
                },
            }
        } else {
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: format!("data:{};base64,{encoded}", request.media.mime_type),
                },
            }
        };

        let body = OpenAiRequest {
            model: request.model.clone(),
            messages: vec![OpenAiMessage::User {
                content: UserContent::Parts(vec![
                    ContentPart::Text {
                        text: request.prompt.clone(),
                    },
                    media_part,
                ]),
            }],
            max_tokens: request.max_tokens,
            temperature: None,
            response_format: None,
        };
        self.send(api_key, &body).await
    }

    async fn list_models(&self) -> Result<Vec<CatalogModel>> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::transport(self.kind.as_str(), format!("catalog request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::http(self.kind.as_str(), status.as_u16(), error_text));
        }

        let listing: ModelListing = response
            .json()
            .await
            .map_err(|e| Error::Parse(format!("failed to parse model catalog: {e}")))?;

        Ok(listing
            .data
            .into_iter()
            .map(|entry| {
                let pricing = entry.pricing.unwrap_or_default();
                CatalogModel {
                    name: entry.name.unwrap_or_else(|| entry.id.clone()),
                    id: entry.id,
                    prompt_price: pricing.prompt.as_deref().and_then(parse_price),
                    completion_price: pricing.completion.as_deref().and_then(parse_price),
                    input_modalities: entry
                        .architecture
                        .map(|a| a.input_modalities)
                        .unwrap_or_else(|| vec!["text".to_string()]),
                }
            })
            .collect())
    }
}

fn convert_message(msg: &ChatMessage) -> OpenAiMessage {
    match msg.role {
        ChatRole::System => OpenAiMessage::System {
            content: msg.content.clone(),
        },
        ChatRole::User => OpenAiMessage::User {
            content: UserContent::Text(msg.content.clone()),
        },
        ChatRole::Assistant => OpenAiMessage::Assistant {
            content: msg.content.clone(),
        },
    }
}

fn convert_response(response: OpenAiResponse, requested_model: &str) -> Result<LlmResponse> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::Parse("no choices in response".to_string()))?;

    Ok(LlmResponse {
        content: choice.message.content.unwrap_or_default(),
        model: response
            .model
            .unwrap_or_else(|| requested_model.to_string()),
        usage: response
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default(),
    })
}

fn audio_format(mime_type: &str) -> &'static str {
    match mime_type {
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/ogg" | "audio/opus" => "ogg",
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" | "audio/aac" => "m4a",
        _ => "mp3",
    }
}

fn parse_price(raw: &str) -> Option<f64> {
    raw.trim().parse().ok()
}

// Request Types
#[derive(Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum OpenAiMessage {
    System { content: String },
    User { content: UserContent },
    Assistant { content: String },
}

#[derive(Serialize)]
#[serde(untagged)]
enum UserContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
    InputAudio { input_audio: InputAudio },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Serialize)]
struct InputAudio {
    data: String,
    format: String,
}

// Response Types
#[derive(Deserialize)]
struct OpenAiResponse {
    model: Option<String>,
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiResponseMessage,
}

#[derive(Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

// Catalog Types
#[derive(Deserialize)]
struct ModelListing {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
    name: Option<String>,
    pricing: Option<ModelPricing>,
    architecture: Option<ModelArchitecture>,
}

#[derive(Deserialize, Default)]
struct ModelPricing {
    prompt: Option<String>,
    completion: Option<String>,
}

#[derive(Deserialize)]
struct ModelArchitecture {
    #[serde(default)]
    input_modalities: Vec<String>,
}
