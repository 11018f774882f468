//! Legacy credential-string handling.
//!
//! Stored credentials carry their provider explicitly. Prefix sniffing is only
//! used when importing raw key strings that predate that field, and for the
//! own-key string on pages that never chose a provider.

use pagebot_common::ProviderKind;

/// Guess the provider from a key's well-known prefix.
pub fn infer_provider(secret: &str) -> Option<ProviderKind> {
    let secret = secret.trim();
    if secret.starts_with("gsk_") {
        Some(ProviderKind::Groq)
    } else if secret.starts_with("AIza") {
        Some(ProviderKind::Gemini)
    } else if secret.starts_with("sk-or-") {
        Some(ProviderKind::OpenRouter)
    } else if secret.starts_with("sk-") {
        Some(ProviderKind::OpenAi)
    } else {
        None
    }
}

/// Split a user-supplied key field into distinct candidate keys.
///
/// Keys may be separated by commas, semicolons or any whitespace.
pub fn split_key_list(raw: &str) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for candidate in raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace()) {
        let candidate = candidate.trim();
        if candidate.is_empty() || keys.iter().any(|k| k == candidate) {
            continue;
        }
        keys.push(candidate.to_string());
    }
    keys
}
