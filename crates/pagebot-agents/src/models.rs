use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use pagebot_common::ProviderKind;
use pagebot_config::{EngineConfig, ModelsConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Maps requested (possibly legacy) model names to canonical names per provider.
///
/// Unknown names pass through unchanged.
#[derive(Debug, Clone, Default)]
pub struct ModelResolver {
    aliases: HashMap<ProviderKind, HashMap<String, String>>,
}

impl ModelResolver {
    pub fn from_config(config: &EngineConfig) -> Self {
        let aliases = ProviderKind::ALL
            .into_iter()
            .map(|kind| (kind, config.route(kind).aliases))
            .collect();
        Self { aliases }
    }

    pub fn resolve(&self, provider: ProviderKind, requested: &str) -> String {
        let requested = requested.trim();
        match self
            .aliases
            .get(&provider)
            .and_then(|table| table.get(requested))
        {
            Some(canonical) => {
                debug!(%provider, requested, canonical = %canonical, "resolved model alias");
                canonical.clone()
            }
            None => requested.to_string(),
        }
    }
}

/// Current best free model per role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestModels {
    pub text: String,
    pub vision: String,
    pub voice: String,
}

impl BestModels {
    pub fn initial(config: &ModelsConfig) -> Self {
        Self {
            text: config.initial_text.clone(),
            vision: config.initial_vision.clone(),
            voice: config.initial_voice.clone(),
        }
    }
}

/// Shared best-model table. Readers never block on a refresh in progress;
/// a refresh swaps the whole table at once.
#[derive(Debug)]
pub struct BestModelTable {
    inner: RwLock<BestModels>,
}

impl BestModelTable {
    pub fn new(models: BestModels) -> Self {
        Self {
            inner: RwLock::new(models),
        }
    }

    pub fn get(&self) -> BestModels {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, models: BestModels) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = models;
    }
}
