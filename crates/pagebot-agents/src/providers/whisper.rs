use pagebot_common::{Error, ProviderKind, Result};
use reqwest::Client;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use super::MediaPayload;

/// Speech-to-text over the OpenAI-compatible `/audio/transcriptions` endpoint.
#[derive(Clone)]
pub struct WhisperTranscriber {
    kind: ProviderKind,
    client: Client,
    base_url: String,
}

impl WhisperTranscriber {
    pub fn new(kind: ProviderKind, client: Client, base_url: impl Into<String>) -> Self {
        Self {
            kind,
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    /// Transcribe `audio` with `model`, hinting the spoken language.
    pub async fn transcribe(
        &self,
        api_key: &str,
        model: &str,
        audio: &MediaPayload,
        language: Option<&str>,
    ) -> Result<String> {
        let url = format!("{}/audio/transcriptions", self.base_url);

        let file = Part::bytes(audio.bytes.to_vec())
            .file_name(format!("voice.{}", file_extension(&audio.mime_type)))
            .mime_str(&audio.mime_type)
            .map_err(|e| Error::Media(format!("invalid audio mime type: {e}")))?;

        let mut form = Form::new()
            .part("file", file)
            .text("model", model.to_string())
            .text("response_format", "json");
        if let Some(language) = language.filter(|l| !l.trim().is_empty()) {
            form = form.text("language", language.to_string());
        }

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {api_key}"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::transport(self.kind.as_str(), format!("transcription failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(Error::http(self.kind.as_str(), status.as_u16(), error_text));
        }

        let parsed: Transcription = response
            .json()
            .await
            .map_err(|e| Error::Parse(format!("failed to parse transcription: {e}")))?;
        Ok(parsed.text.trim().to_string())
    }
}

fn file_extension(mime_type: &str) -> &'static str {
    match mime_type {
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/ogg" | "audio/opus" => "ogg",
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => "m4a",
        "audio/aac" => "aac",
        "audio/webm" => "webm",
        _ => "mp3",
    }
}

#[derive(Deserialize)]
struct Transcription {
    #[serde(default)]
    text: String,
}
