use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, PoisonError};
use std::time::{Duration, Instant};

use pagebot_common::AiResponse;
use pagebot_config::CacheConfig;
use regex::Regex;
use tracing::debug;

static PUNCTUATION: LazyLock<Regex> = LazyLock::new(|| {
    // Keeps word characters, whitespace and the Bengali block.
    Regex::new(r"[^\w\s\x{0980}-\x{09FF}]").expect("cache regex should compile")
});

/// Lower-case, strip punctuation and collapse whitespace.
pub fn normalize_message(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let stripped = PUNCTUATION.replace_all(&lowered, " ");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Cache key. Always scoped to one sender on one page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    page_id: String,
    sender_id: String,
    message: String,
}

impl CacheKey {
    /// `None` when any component is blank, which disables caching for the request.
    pub fn new(page_id: &str, sender_id: &str, message: &str) -> Option<Self> {
        let message = normalize_message(message);
        if page_id.trim().is_empty() || sender_id.trim().is_empty() || message.is_empty() {
            return None;
        }
        Some(Self {
            page_id: page_id.to_string(),
            sender_id: sender_id.to_string(),
            message,
        })
    }
}

struct CacheEntry {
    response: AiResponse,
    inserted_at: Instant,
}

/// In-memory TTL cache of successful replies.
pub struct ResponseCache {
    ttl: Duration,
    max_entries: usize,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries: max_entries.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.ttl(), config.max_entries)
    }

    pub fn get(&self, key: &CacheKey) -> Option<AiResponse> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let expired = match entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                return Some(entry.response.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: CacheKey, response: AiResponse) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.inserted_at.elapsed() < ttl);

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.inserted_at)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                debug!("evicting oldest cached reply");
                entries.remove(&oldest);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                response,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
