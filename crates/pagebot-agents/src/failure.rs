//! Classification of provider failures into quarantine decisions.

use std::time::Duration;

use pagebot_common::Error;
use pagebot_config::QuarantineConfig;
use pagebot_security::{KeyPool, PooledKey, QuarantineReason};
use tracing::debug;

/// Why an inference attempt failed, as far as credential health is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    QuotaExceeded,
    RateLimited,
    Auth,
    Server,
    Network,
    /// Request-shaped failures (bad request, unparsable body). The credential
    /// is not at fault.
    Other,
}

impl FailureClass {
    pub fn quarantine_reason(&self) -> Option<QuarantineReason> {
        match self {
            Self::QuotaExceeded => Some(QuarantineReason::QuotaExceeded),
            Self::RateLimited => Some(QuarantineReason::RateLimited),
            Self::Auth => Some(QuarantineReason::AuthError),
            Self::Server => Some(QuarantineReason::ServerError),
            Self::Network => Some(QuarantineReason::NetworkError),
            Self::Other => None,
        }
    }

    /// Human-readable cause used in own-key failure messages.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::QuotaExceeded => "the key has run out of quota",
            Self::RateLimited => "the key is being rate limited",
            Self::Auth => "the key was rejected as invalid or unauthorized",
            Self::Server => "the provider returned a server error",
            Self::Network => "the provider could not be reached in time",
            Self::Other => "the provider rejected the request",
        }
    }
}

const QUOTA_FRAGMENTS: [&str; 5] = [
    "quota",
    "resource_exhausted",
    "insufficient_quota",
    "billing",
    "credits",
];

const AUTH_FRAGMENTS: [&str; 5] = [
    "api key not valid",
    "api_key_invalid",
    "invalid api key",
    "invalid_api_key",
    "unauthorized",
];

const NETWORK_FRAGMENTS: [&str; 8] = [
    "timed out",
    "timeout",
    "connection refused",
    "connection reset",
    "connection aborted",
    "temporarily unavailable",
    "dns error",
    "network error",
];

pub fn classify(error: &Error) -> FailureClass {
    match error {
        Error::Timeout(_) => FailureClass::Network,
        Error::Provider {
            status, message, ..
        } => {
            let message = message.to_ascii_lowercase();
            match status.or_else(|| extract_status_code(&message)) {
                Some(status) => classify_status(status, &message),
                None if NETWORK_FRAGMENTS.iter().any(|f| message.contains(f)) => {
                    FailureClass::Network
                }
                None => FailureClass::Other,
            }
        }
        _ => FailureClass::Other,
    }
}

fn classify_status(status: u16, message: &str) -> FailureClass {
    let mentions_quota = QUOTA_FRAGMENTS.iter().any(|f| message.contains(f));
    match status {
        401 | 403 => FailureClass::Auth,
        402 => FailureClass::QuotaExceeded,
        429 if mentions_quota => FailureClass::QuotaExceeded,
        429 => FailureClass::RateLimited,
        400 if AUTH_FRAGMENTS.iter().any(|f| message.contains(f)) => FailureClass::Auth,
        408 => FailureClass::Network,
        500..=599 => FailureClass::Server,
        _ => FailureClass::Other,
    }
}

fn extract_status_code(message: &str) -> Option<u16> {
    for marker in ["status=", "status:", "status code"] {
        let mut search_start = 0usize;
        while let Some(offset) = message[search_start..].find(marker) {
            let after_marker = search_start + offset + marker.len();
            let digits: String = message[after_marker..]
                .trim_start()
                .chars()
                .take_while(|ch| ch.is_ascii_digit())
                .collect();

            if digits.len() >= 3 {
                if let Ok(status) = digits[..3].parse::<u16>() {
                    return Some(status);
                }
            }
            search_start = after_marker;
        }
    }
    None
}

pub fn quarantine_duration(reason: QuarantineReason, config: &QuarantineConfig) -> Duration {
    let secs = match reason {
        QuarantineReason::QuotaExceeded => config.quota_secs,
        QuarantineReason::RateLimited => config.rate_limit_secs,
        QuarantineReason::AuthError => config.auth_secs,
        QuarantineReason::ServerError => config.server_secs,
        QuarantineReason::NetworkError => config.network_secs,
    };
    Duration::from_secs(secs)
}

/// Classify `error` and quarantine `key` accordingly. Returns the class.
pub async fn report_failure(
    pool: &dyn KeyPool,
    key: &PooledKey,
    error: &Error,
    config: &QuarantineConfig,
) -> FailureClass {
    let class = classify(error);
    match class.quarantine_reason() {
        Some(reason) => {
            pool.quarantine(key, quarantine_duration(reason, config), reason)
                .await;
        }
        None => debug!(credential = key.id, "failure not attributable to credential: {error}"),
    }
    class
}
