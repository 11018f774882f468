//! Turns raw model output into a structured reply, a tool call, or plain text.
//!
//! Parsing never fails: anything that is not usable JSON degrades to the
//! stripped raw text.

use std::sync::LazyLock;

use pagebot_common::{AiResponse, ReplyImage};
use regex::Regex;
use serde_json::{Map, Value};

/// Reply used when the model asks for a tool the engine does not offer.
pub const UNSUPPORTED_TOOL_REPLY: &str =
    "Sorry, I couldn't look that up right now. Could you tell me a bit more about what you need?";

/// Tool names accepted as a product search request.
const SEARCH_TOOL_NAMES: [&str; 4] = [
    "search_products",
    "search_product",
    "product_search",
    "search",
];

const REPLY_SYNONYMS: [&str; 4] = ["response", "text", "message", "answer"];

static REASONING_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<think>.*?</think>").expect("parser regex should compile")
});

static UNCLOSED_REASONING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)^\s*<think>.*$").expect("parser regex should compile"));

static REPLY_FIELD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""reply"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("parser regex should compile")
});

/// A parsed structured reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StructuredReply {
    pub reply: String,
    pub images: Vec<ReplyImage>,
    pub sentiment: Option<String>,
    pub dm_message: Option<String>,
    pub bad_words: bool,
    pub order_details: Option<Value>,
}

impl StructuredReply {
    pub fn text(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            ..Default::default()
        }
    }

    pub fn into_response(self) -> AiResponse {
        AiResponse {
            reply: Some(self.reply),
            images: self.images,
            sentiment: self.sentiment,
            dm_message: self.dm_message,
            bad_words: self.bad_words,
            order_details: self.order_details,
            ..Default::default()
        }
    }
}

/// A tool request emitted in place of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCall {
    pub name: String,
    pub query: Option<String>,
}

impl ToolCall {
    /// The search query, when this is a product search the engine can serve.
    pub fn search_query(&self) -> Option<&str> {
        let name = self.name.trim().to_ascii_lowercase();
        if !SEARCH_TOOL_NAMES.contains(&name.as_str()) {
            return None;
        }
        self.query.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutput {
    Reply(StructuredReply),
    ToolCall(ToolCall),
    PlainText(String),
}

impl ModelOutput {
    /// Convert to a response. Tool calls that reach this point were not
    /// served and become the fixed apology.
    pub fn into_response(self) -> AiResponse {
        match self {
            Self::Reply(reply) => reply.into_response(),
            Self::ToolCall(_) => AiResponse::text(UNSUPPORTED_TOOL_REPLY),
            Self::PlainText(text) => AiResponse::text(text),
        }
    }
}

/// Remove `<think>` reasoning blocks, including an unterminated leading one.
pub fn strip_reasoning(raw: &str) -> String {
    let stripped = REASONING_BLOCK.replace_all(raw, "");
    let stripped = UNCLOSED_REASONING.replace(&stripped, "");
    stripped.trim().to_string()
}

fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest
        .strip_prefix("json")
        .or_else(|| rest.strip_prefix("JSON"))
        .unwrap_or(rest);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// The substring from the first `{` to the last `}`, if any.
fn json_slice(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Parse output produced under the structured JSON contract.
pub fn parse_model_output(raw: &str) -> ModelOutput {
    let cleaned = strip_reasoning(raw);
    let body = strip_code_fences(&cleaned);

    if let Some(Value::Object(object)) = json_slice(body)
        .and_then(|slice| serde_json::from_str::<Value>(slice).ok())
    {
        if let Some(call) = tool_call_from(&object) {
            if call.search_query().is_some() || reply_text(&object).is_none() {
                return ModelOutput::ToolCall(call);
            }
        }
        if let Some(reply) = reply_text(&object) {
            return ModelOutput::Reply(structured_from(&object, reply));
        }
        return ModelOutput::PlainText(body.to_string());
    }

    if let Some(captures) = REPLY_FIELD.captures(body) {
        let escaped = &captures[1];
        let reply = serde_json::from_str::<String>(&format!("\"{escaped}\""))
            .unwrap_or_else(|_| escaped.to_string());
        return ModelOutput::Reply(StructuredReply::text(reply));
    }

    ModelOutput::PlainText(body.to_string())
}

/// Parse free-text output; only reasoning blocks are removed.
pub fn parse_plain_output(raw: &str) -> ModelOutput {
    ModelOutput::PlainText(strip_reasoning(raw))
}

fn reply_text(object: &Map<String, Value>) -> Option<String> {
    std::iter::once("reply")
        .chain(REPLY_SYNONYMS)
        .find_map(|key| object.get(key).and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
}

fn tool_call_from(object: &Map<String, Value>) -> Option<ToolCall> {
    let (name, args) = if let Some(name) = object.get("tool").and_then(Value::as_str) {
        (name, object)
    } else if let Some(Value::Object(call)) = object.get("tool_call") {
        let name = call
            .get("name")
            .or_else(|| call.get("tool"))
            .and_then(Value::as_str)?;
        (name, call)
    } else if let Some(name) = object.get("action").and_then(Value::as_str) {
        (name, object)
    } else {
        let name = object.get("name").and_then(Value::as_str)?;
        if !(object.contains_key("arguments") || object.contains_key("parameters")) {
            return None;
        }
        (name, object)
    };

    let query = args
        .get("query")
        .and_then(Value::as_str)
        .or_else(|| {
            ["arguments", "parameters", "input", "args"]
                .iter()
                .find_map(|key| match args.get(*key) {
                    Some(Value::Object(nested)) => nested.get("query").and_then(Value::as_str),
                    _ => None,
                })
        })
        .map(str::to_string)
        .or_else(|| string_encoded_query(args));

    Some(ToolCall {
        name: name.to_string(),
        query,
    })
}

/// Some models send `"arguments": "{\"query\": \"...\"}"`.
fn string_encoded_query(args: &Map<String, Value>) -> Option<String> {
    ["arguments", "parameters"].iter().find_map(|key| {
        let raw = args.get(*key)?.as_str()?;
        let nested: Value = serde_json::from_str(raw).ok()?;
        nested.get("query")?.as_str().map(str::to_string)
    })
}

fn structured_from(object: &Map<String, Value>, reply: String) -> StructuredReply {
    StructuredReply {
        reply,
        images: object.get("images").map(images_from).unwrap_or_default(),
        sentiment: object
            .get("sentiment")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        dm_message: object
            .get("dm_message")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
        bad_words: object.get("bad_words").is_some_and(truthy),
        order_details: object
            .get("order_details")
            .filter(|v| !v.is_null())
            .filter(|v| !matches!(v, Value::Object(m) if m.is_empty()))
            .cloned(),
    }
}

fn images_from(value: &Value) -> Vec<ReplyImage> {
    let Value::Array(items) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(url) => Some(ReplyImage {
                url: url.trim().to_string(),
                title: String::new(),
            }),
            Value::Object(fields) => {
                let url = fields
                    .get("url")
                    .or_else(|| fields.get("image_url"))
                    .and_then(Value::as_str)?;
                Some(ReplyImage {
                    url: url.trim().to_string(),
                    title: fields
                        .get("title")
                        .or_else(|| fields.get("name"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                })
            }
            _ => None,
        })
        .filter(|image| !image.url.is_empty())
        .collect()
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Array(items) => !items.is_empty(),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "yes"),
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        _ => false,
    }
}

/// Drop images whose URL does not appear in the grounding context.
/// Returns how many were removed.
pub fn retain_grounded_images(images: &mut Vec<ReplyImage>, context: &str) -> usize {
    let before = images.len();
    images.retain(|image| context.contains(image.url.as_str()));
    before - images.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply_of(output: ModelOutput) -> StructuredReply {
        match output {
            ModelOutput::Reply(reply) => reply,
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[test]
    fn strips_reasoning_and_fences() {
        let bare = r#"{"reply": "It costs 500 tk", "images": [{"url": "https://cdn.example/a.jpg", "title": "Red shirt"}], "sentiment": "Neutral"}"#;
        let wrapped = format!("<think>the user wants a price</think>\n```json\n{bare}\n```");
        assert_eq!(parse_model_output(&wrapped), parse_model_output(bare));
        assert_eq!(reply_of(parse_model_output(&wrapped)).reply, "It costs 500 tk");
    }

    #[test]
    fn structured_fields_round_trip_unchanged() {
        let raw = r#"{"reply": "Hello", "images": [{"url": "https://cdn.example/a.jpg", "title": "A"}], "sentiment": "Positive"}"#;
        let reply = reply_of(parse_model_output(raw));
        assert_eq!(reply.reply, "Hello");
        assert_eq!(reply.images.len(), 1);
        assert_eq!(reply.images[0].url, "https://cdn.example/a.jpg");
        assert_eq!(reply.images[0].title, "A");
        assert_eq!(reply.sentiment.as_deref(), Some("Positive"));

        let padded = reply_of(parse_model_output(r#"{"reply": "Hi", "sentiment": "  Negative "}"#));
        assert_eq!(padded.sentiment.as_deref(), Some("Negative"));
    }

    #[test]
    fn unterminated_reasoning_is_dropped() {
        assert_eq!(strip_reasoning("<think>still thinking"), "");
        assert_eq!(strip_reasoning("answer <think>x</think> done"), "answer  done");
    }

    #[test]
    fn full_structured_reply() {
        let raw = json!({
            "reply": "Here you go",
            "images": [{"url": "https://cdn.example/a.jpg", "title": "Red shirt"}, "https://cdn.example/b.jpg"],
            "sentiment": "Positive",
            "dm_message": "",
            "bad_words": false,
            "order_details": {"product": "Red shirt", "quantity": 2}
        })
        .to_string();

        let reply = reply_of(parse_model_output(&raw));
        assert_eq!(reply.images.len(), 2);
        assert_eq!(reply.images[0].title, "Red shirt");
        assert_eq!(reply.images[1].title, "");
        assert_eq!(reply.sentiment.as_deref(), Some("Positive"));
        assert!(reply.dm_message.is_none());
        assert!(!reply.bad_words);
        assert_eq!(reply.order_details.unwrap()["quantity"], 2);
    }

    #[test]
    fn synonym_fields_fill_missing_reply() {
        let reply = reply_of(parse_model_output(r#"{"response": "hello"}"#));
        assert_eq!(reply.reply, "hello");
        let reply = reply_of(parse_model_output(r#"{"reply": null, "message": "hi"}"#));
        assert_eq!(reply.reply, "hi");
    }

    #[test]
    fn json_embedded_in_prose_is_sliced() {
        let raw = "Sure! Here is the answer: {\"reply\": \"ok\"} hope it helps";
        assert_eq!(reply_of(parse_model_output(raw)).reply, "ok");
    }

    #[test]
    fn truncated_json_falls_back_to_reply_regex() {
        let raw = r#"{"reply": "Price is \"500\" taka", "images": [{"url": "#;
        assert_eq!(
            reply_of(parse_model_output(raw)).reply,
            "Price is \"500\" taka"
        );
    }

    #[test]
    fn bare_string_is_returned_verbatim() {
        assert_eq!(
            parse_model_output("Hello! How can I help?"),
            ModelOutput::PlainText("Hello! How can I help?".to_string())
        );
    }

    #[test]
    fn json_without_reply_falls_back_to_text() {
        let raw = r#"{"foo": 1}"#;
        assert_eq!(parse_model_output(raw), ModelOutput::PlainText(raw.to_string()));
    }

    #[test]
    fn detects_search_tool_calls() {
        let output = parse_model_output(r#"{"tool": "search_products", "query": "red saree"}"#);
        let ModelOutput::ToolCall(call) = output else {
            panic!("expected tool call");
        };
        assert_eq!(call.search_query(), Some("red saree"));

        let output = parse_model_output(
            r#"{"tool_call": {"name": "search_products", "arguments": {"query": "shoes"}}}"#,
        );
        let ModelOutput::ToolCall(call) = output else {
            panic!("expected tool call");
        };
        assert_eq!(call.search_query(), Some("shoes"));

        let output = parse_model_output(
            r#"{"name": "search", "arguments": "{\"query\": \"bags\"}"}"#,
        );
        let ModelOutput::ToolCall(call) = output else {
            panic!("expected tool call");
        };
        assert_eq!(call.search_query(), Some("bags"));
    }

    #[test]
    fn unknown_tool_becomes_apology() {
        let output = parse_model_output(r#"{"tool": "send_email", "to": "x"}"#);
        assert!(matches!(&output, ModelOutput::ToolCall(call) if call.search_query().is_none()));
        assert_eq!(
            output.into_response().reply.as_deref(),
            Some(UNSUPPORTED_TOOL_REPLY)
        );
    }

    #[test]
    fn reply_wins_over_unknown_tool_field() {
        let reply = reply_of(parse_model_output(r#"{"action": "greet", "reply": "Hi!"}"#));
        assert_eq!(reply.reply, "Hi!");
    }

    #[test]
    fn bad_words_accepts_lenient_shapes() {
        assert!(reply_of(parse_model_output(r#"{"reply": "x", "bad_words": ["idiot"]}"#)).bad_words);
        assert!(reply_of(parse_model_output(r#"{"reply": "x", "bad_words": "yes"}"#)).bad_words);
        assert!(!reply_of(parse_model_output(r#"{"reply": "x", "bad_words": []}"#)).bad_words);
    }

    #[test]
    fn plain_output_keeps_text() {
        assert_eq!(
            parse_plain_output("<think>hm</think>Hi {there}"),
            ModelOutput::PlainText("Hi {there}".to_string())
        );
    }

    #[test]
    fn ungrounded_images_are_removed() {
        let mut images = vec![
            ReplyImage {
                url: "https://cdn.example/real.jpg".to_string(),
                title: String::new(),
            },
            ReplyImage {
                url: "https://made.up/fake.jpg".to_string(),
                title: String::new(),
            },
        ];
        let removed = retain_grounded_images(&mut images, "Image: https://cdn.example/real.jpg");
        assert_eq!(removed, 1);
        assert_eq!(images[0].url, "https://cdn.example/real.jpg");
    }
}
