use bytes::Bytes;
use pagebot_agents::{
    ChatMessage, GeminiProvider, LlmProvider, LlmRequest, MediaPayload, MediaRequest,
    OpenAiCompatProvider, WhisperTranscriber,
};
use pagebot_common::{Error, ProviderKind, TokenUsage};
use serde_json::json;
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn chat_request(structured: bool) -> LlmRequest {
    LlmRequest {
        model: "llama-3.3-70b-versatile".to_string(),
        messages: vec![
            ChatMessage::system("You are a shop assistant."),
            ChatMessage::user("Do you have red shirts?"),
        ],
        max_tokens: Some(256),
        temperature: Some(0.4),
        structured_output: structured,
    }
}

#[tokio::test]
async fn test_openai_compat_completion() {
    let mock_server = MockServer::start().await;

    let response_body = json!({
        "id": "chatcmpl-123",
        "object": "chat.completion",
        "created": 1677652288,
        "model": "llama-3.3-70b-versatile",
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": "{\"reply\": \"Yes, we have red shirts.\"}"
            },
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": 42,
            "completion_tokens": 12,
            "total_tokens": 54
        }
    });

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("Authorization", "Bearer gsk_test"))
        .and(body_partial_json(json!({
            "model": "llama-3.3-70b-versatile",
            "response_format": { "type": "json_object" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(response_body))
        .expect(1)
        .mount(&mock_server)
        .await;

    let provider =
        OpenAiCompatProvider::new(ProviderKind::Groq, reqwest::Client::new(), mock_server.uri());
    let response = provider
        .complete("gsk_test", &chat_request(true))
        .await
        .unwrap();

    assert_eq!(response.content, "{\"reply\": \"Yes, we have red shirts.\"}");
    assert_eq!(response.model, "llama-3.3-70b-versatile");
    assert_eq!(response.usage, TokenUsage::new(42, 12));
}

#[tokio::test]
async fn test_openai_compat_rate_limit_keeps_status() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": { "message": "Rate limit reached for requests", "type": "requests" }
        })))
        .mount(&mock_server)
        .await;

    let provider =
        OpenAiCompatProvider::new(ProviderKind::Groq, reqwest::Client::new(), mock_server.uri());
    let err = provider
        .complete("gsk_test", &chat_request(false))
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(429));
    assert!(matches!(err, Error::Provider { .. }));
}

#[tokio::test]
async fn test_openai_compat_empty_choices_is_parse_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .mount(&mock_server)
        .await;

    let provider =
        OpenAiCompatProvider::new(ProviderKind::OpenAi, reqwest::Client::new(), mock_server.uri());
    let err = provider
        .complete("sk-test", &chat_request(false))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Parse(_)));
}

#[tokio::test]
async fn test_openai_compat_image_request_uses_data_url() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_string_contains("data:image/png;base64,iVBORw0K"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "A red cotton shirt." } }]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let provider = OpenAiCompatProvider::new(
        ProviderKind::OpenRouter,
        reqwest::Client::new(),
        mock_server.uri(),
    );
    let request = MediaRequest {
        model: "google/gemma-3-27b-it:free".to_string(),
        prompt: "Describe this image.".to_string(),
        media: MediaPayload {
            bytes: Bytes::from_static(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A]),
            mime_type: "image/png".to_string(),
        },
        max_tokens: Some(200),
    };
    let response = provider
        .complete_with_media("sk-or-test", &request)
        .await
        .unwrap();

    assert_eq!(response.content, "A red cotton shirt.");
    assert_eq!(response.model, "google/gemma-3-27b-it:free");
    assert!(response.usage.is_zero());
}

#[tokio::test]
async fn test_openai_compat_lists_catalog() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/models"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": [
                {
                    "id": "google/gemma-3-27b-it:free",
                    "name": "Gemma 3 27B (free)",
                    "pricing": { "prompt": "0", "completion": "0" },
                    "architecture": { "input_modalities": ["text", "image"] }
                },
                {
                    "id": "openai/gpt-4o",
                    "pricing": { "prompt": "0.0000025", "completion": "0.00001" }
                }
            ]
        })))
        .mount(&mock_server)
        .await;

    let provider = OpenAiCompatProvider::new(
        ProviderKind::OpenRouter,
        reqwest::Client::new(),
        format!("{}/", mock_server.uri()),
    );
    let catalog = provider.list_models().await.unwrap();

    assert_eq!(catalog.len(), 2);
    assert!(catalog[0].is_free());
    assert!(catalog[0].supports("image"));
    assert_eq!(catalog[1].name, "openai/gpt-4o");
    assert!(!catalog[1].is_free());
    assert!(!catalog[1].supports("image"));
}

#[tokio::test]
async fn test_gemini_generate_content() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/models/gemini-2.5-flash:generateContent"))
        .and(header("x-goog-api-key", "AIzaTest"))
        .and(body_partial_json(json!({
            "systemInstruction": { "parts": [{ "text": "You are a shop assistant." }] },
            "generationConfig": { "responseMimeType": "application/json" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{ "text": "{\"reply\": " }, { "text": "\"We do!\"}" }]
                }
            }],
            "usageMetadata": { "promptTokenCount": 30, "candidatesTokenCount": 6 },
            "modelVersion": "gemini-2.5-flash"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let provider = GeminiProvider::new(reqwest::Client::new(), mock_server.uri());
    let mut request = chat_request(true);
    request.model = "gemini-2.5-flash".to_string();
    let response = provider.complete("AIzaTest", &request).await.unwrap();

    assert_eq!(response.content, "{\"reply\": \"We do!\"}");
    assert_eq!(response.usage, TokenUsage::new(30, 6));
}

#[tokio::test]
async fn test_gemini_invalid_key_is_provider_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/models/gemini-2.5-flash:generateContent"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "code": 400, "message": "API key not valid. Please pass a valid API key." }
        })))
        .mount(&mock_server)
        .await;

    let provider = GeminiProvider::new(reqwest::Client::new(), mock_server.uri());
    let mut request = chat_request(false);
    request.model = "gemini-2.5-flash".to_string();
    let err = provider.complete("AIzaBad", &request).await.unwrap_err();

    assert_eq!(err.status(), Some(400));
    assert!(err.to_string().contains("API key not valid"));
}

#[tokio::test]
async fn test_whisper_transcription() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/audio/transcriptions"))
        .and(header("Authorization", "Bearer gsk_stt"))
        .and(body_string_contains("whisper-large-v3"))
        .and(body_string_contains("name=\"language\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "text": "  আমি একটা লাল শার্ট চাই  "
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let transcriber =
        WhisperTranscriber::new(ProviderKind::Groq, reqwest::Client::new(), mock_server.uri());
    let media = MediaPayload {
        bytes: Bytes::from_static(b"OggS fake voice note"),
        mime_type: "audio/ogg".to_string(),
    };
    let text = transcriber
        .transcribe("gsk_stt", "whisper-large-v3", &media, Some("bn"))
        .await
        .unwrap();

    assert_eq!(text, "আমি একটা লাল শার্ট চাই");
}
