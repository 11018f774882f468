use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pagebot_common::{Error, ProviderKind};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub type CredentialId = i64;

/// Model value on a credential that matches any model of its provider.
pub const ANY_MODEL: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Alive,
    QuotaExceeded,
    Dead,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alive => "alive",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Dead => "dead",
        }
    }
}

impl FromStr for CredentialStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alive" => Ok(Self::Alive),
            "quota_exceeded" => Ok(Self::QuotaExceeded),
            "dead" => Ok(Self::Dead),
            other => Err(Error::KeyPool(format!("unknown credential status '{other}'"))),
        }
    }
}

/// Why a credential was pulled from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuarantineReason {
    QuotaExceeded,
    RateLimited,
    AuthError,
    ServerError,
    NetworkError,
}

impl QuarantineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuotaExceeded => "quota_exceeded",
            Self::RateLimited => "rate_limited",
            Self::AuthError => "auth_error",
            Self::ServerError => "server_error",
            Self::NetworkError => "network_error",
        }
    }

    /// Status a credential takes while quarantined for this reason.
    pub fn status(&self) -> CredentialStatus {
        match self {
            Self::QuotaExceeded => CredentialStatus::QuotaExceeded,
            Self::AuthError => CredentialStatus::Dead,
            Self::RateLimited | Self::ServerError | Self::NetworkError => CredentialStatus::Alive,
        }
    }
}

impl fmt::Display for QuarantineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pooled API key and its health state.
#[derive(Clone)]
pub struct Credential {
    pub id: CredentialId,
    pub provider: ProviderKind,
    pub model: String,
    pub secret: String,
    pub status: CredentialStatus,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub cumulative_tokens: u64,
    pub last_used: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(
        id: CredentialId,
        provider: ProviderKind,
        model: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            id,
            provider,
            model: model.into(),
            secret: secret.into(),
            status: CredentialStatus::Alive,
            cooldown_until: None,
            cumulative_tokens: 0,
            last_used: None,
        }
    }

    pub fn matches(&self, provider: ProviderKind, model: &str) -> bool {
        self.provider == provider && (self.model == model || self.model == ANY_MODEL)
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("secret", &mask(&self.secret))
            .field("status", &self.status)
            .field("cooldown_until", &self.cooldown_until)
            .field("cumulative_tokens", &self.cumulative_tokens)
            .finish()
    }
}

/// Handle to a credential issued for a single attempt.
#[derive(Clone)]
pub struct PooledKey {
    pub id: CredentialId,
    pub provider: ProviderKind,
    pub model: String,
    secret: String,
}

impl PooledKey {
    pub fn new(
        id: CredentialId,
        provider: ProviderKind,
        model: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            id,
            provider,
            model: model.into(),
            secret: secret.into(),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }
}

impl fmt::Debug for PooledKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledKey")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("secret", &mask(&self.secret))
            .finish()
    }
}

fn mask(secret: &str) -> String {
    let prefix: String = secret.chars().take(4).collect();
    format!("{prefix}***")
}

/// Contract the engine uses to obtain and report on managed credentials.
#[async_trait]
pub trait KeyPool: Send + Sync {
    /// Issue the least-recently-used healthy credential for `(provider, model)`.
    async fn acquire(&self, provider: ProviderKind, model: &str) -> Option<PooledKey>;

    /// Take a credential out of rotation for `duration`.
    async fn quarantine(&self, key: &PooledKey, duration: Duration, reason: QuarantineReason);

    async fn record_usage(&self, key: &PooledKey, tokens: u64);

    /// Whether `secret` belongs to the managed pool.
    async fn is_managed_secret(&self, secret: &str) -> bool;
}

struct Slot {
    credential: Credential,
    /// Logical clock value of the last issue; 0 means never issued.
    tick: u64,
}

struct PoolState {
    slots: Vec<Slot>,
    clock: u64,
}

/// In-process key pool. Health state lives behind one async mutex so issuing
/// and quarantining are atomic with respect to each other.
pub struct MemoryKeyPool {
    state: Mutex<PoolState>,
}

impl Default for MemoryKeyPool {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl MemoryKeyPool {
    pub fn new(credentials: Vec<Credential>) -> Self {
        info!("key pool initialised with {} credentials", credentials.len());
        Self {
            state: Mutex::new(PoolState {
                slots: credentials
                    .into_iter()
                    .map(|credential| Slot {
                        credential,
                        tick: 0,
                    })
                    .collect(),
                clock: 0,
            }),
        }
    }

    pub async fn insert(&self, credential: Credential) {
        let mut state = self.state.lock().await;
        state.slots.retain(|slot| slot.credential.id != credential.id);
        state.slots.push(Slot {
            credential,
            tick: 0,
        });
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Copy of every credential's current state, for persistence.
    pub async fn snapshot(&self) -> Vec<Credential> {
        self.state
            .lock()
            .await
            .slots
            .iter()
            .map(|slot| slot.credential.clone())
            .collect()
    }
}

#[async_trait]
impl KeyPool for MemoryKeyPool {
    async fn acquire(&self, provider: ProviderKind, model: &str) -> Option<PooledKey> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        let index = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| {
                slot.credential.matches(provider, model) && !slot.credential.in_cooldown(now)
            })
            .min_by_key(|(_, slot)| slot.tick)
            .map(|(index, _)| index);

        let Some(index) = index else {
            debug!(%provider, model, "no healthy credential available");
            return None;
        };

        state.clock += 1;
        let tick = state.clock;
        let slot = &mut state.slots[index];
        slot.tick = tick;

        let credential = &mut slot.credential;
        if credential.status != CredentialStatus::Alive {
            debug!(credential = credential.id, "cooldown elapsed; credential back in rotation");
            credential.status = CredentialStatus::Alive;
            credential.cooldown_until = None;
        }
        credential.last_used = Some(now);

        Some(PooledKey::new(
            credential.id,
            credential.provider,
            model,
            credential.secret.clone(),
        ))
    }

    async fn quarantine(&self, key: &PooledKey, duration: Duration, reason: QuarantineReason) {
        let until = chrono::Duration::from_std(duration)
            .ok()
            .and_then(|delta| Utc::now().checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut state = self.state.lock().await;
        match state
            .slots
            .iter_mut()
            .find(|slot| slot.credential.id == key.id)
        {
            Some(slot) => {
                slot.credential.status = reason.status();
                slot.credential.cooldown_until = Some(until);
                warn!(
                    credential = key.id,
                    provider = %key.provider,
                    reason = %reason,
                    cooldown_secs = duration.as_secs(),
                    "credential quarantined"
                );
            }
            None => warn!(credential = key.id, "quarantine for unknown credential ignored"),
        }
    }

    async fn record_usage(&self, key: &PooledKey, tokens: u64) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state
            .slots
            .iter_mut()
            .find(|slot| slot.credential.id == key.id)
        {
            slot.credential.cumulative_tokens =
                slot.credential.cumulative_tokens.saturating_add(tokens);
        }
    }

    async fn is_managed_secret(&self, secret: &str) -> bool {
        let secret = secret.trim();
        self.state
            .lock()
            .await
            .slots
            .iter()
            .any(|slot| slot.credential.secret == secret)
    }
}
