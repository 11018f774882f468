//! Periodic recomputation of the best free model per role.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use pagebot_common::{Error, Result};
use pagebot_config::{ModelsConfig, QuarantineConfig};
use pagebot_security::KeyPool;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::failure::report_failure;
use crate::models::{BestModelTable, BestModels};
use crate::parser::strip_reasoning;
use crate::providers::{CatalogModel, ChatMessage, LlmRequest, ProviderRegistry};

/// Variants favoured for the voice role.
const FAST_MARKERS: [&str; 5] = ["flash", "instant", "lite", "fast", "mini"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Updated(BestModels),
    /// Another refresh was already running.
    Skipped,
}

pub struct FreeModelRefresher {
    registry: Arc<ProviderRegistry>,
    pool: Arc<dyn KeyPool>,
    table: Arc<BestModelTable>,
    config: ModelsConfig,
    quarantine: QuarantineConfig,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag when a refresh ends, however it ends.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl FreeModelRefresher {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        pool: Arc<dyn KeyPool>,
        table: Arc<BestModelTable>,
        config: ModelsConfig,
        quarantine: QuarantineConfig,
    ) -> Self {
        Self {
            registry,
            pool,
            table,
            config,
            quarantine,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn table(&self) -> Arc<BestModelTable> {
        Arc::clone(&self.table)
    }

    /// Run one refresh now. A call made while another is running is a no-op.
    /// On error the previous table stays in place.
    pub async fn refresh_now(&self) -> Result<RefreshOutcome> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("model refresh already in flight, skipping");
            return Ok(RefreshOutcome::Skipped);
        }
        let _guard = InFlightGuard(&self.in_flight);

        let catalog_provider = self.registry.get(self.config.catalog_provider).ok_or_else(|| {
            Error::Config(format!(
                "catalog provider {} is not registered",
                self.config.catalog_provider
            ))
        })?;
        let catalog = catalog_provider.list_models().await?;
        let candidates = free_candidates(catalog, &self.config.denylist);
        if candidates.is_empty() {
            return Err(Error::Exhausted("catalog has no free models".to_string()));
        }

        let current = self.table.get();
        let best = match self.rank_with_model(&candidates).await {
            Ok(best) => best,
            Err(e) => {
                warn!("model ranking call failed, using deterministic ranking: {e}");
                rank_deterministic(&candidates, &self.config.preferred_families, &current)
            }
        };

        info!(
            text = %best.text,
            vision = %best.vision,
            voice = %best.voice,
            candidates = candidates.len(),
            "best free models refreshed"
        );
        self.table.replace(best.clone());
        Ok(RefreshOutcome::Updated(best))
    }

    async fn rank_with_model(&self, candidates: &[CatalogModel]) -> Result<BestModels> {
        let ranker = &self.config.ranker;
        let provider = self
            .registry
            .get(ranker.provider)
            .ok_or_else(|| Error::Config(format!("ranker provider {} is not registered", ranker.provider)))?;
        let key = self
            .pool
            .acquire(ranker.provider, &ranker.model)
            .await
            .ok_or_else(|| Error::KeyPool(format!("no credential for ranker {}", ranker.model)))?;

        let request = LlmRequest {
            model: ranker.model.clone(),
            messages: vec![
                ChatMessage::system(RANKING_INSTRUCTIONS),
                ChatMessage::user(candidate_table(candidates)),
            ],
            max_tokens: Some(300),
            temperature: Some(0.0),
            structured_output: true,
        };

        let response = match provider.complete(key.secret(), &request).await {
            Ok(response) => response,
            Err(e) => {
                report_failure(self.pool.as_ref(), &key, &e, &self.quarantine).await;
                return Err(e);
            }
        };
        self.pool.record_usage(&key, response.usage.total()).await;
        validate_ranking(&response.content, candidates)
    }

    /// Spawn the background task: one refresh immediately, then one per interval.
    pub fn start(self: Arc<Self>) -> RefresherHandle {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let period = self.config.refresh_interval();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!(interval_secs = period.as_secs(), "model refresher started");

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.refresh_now().await {
                            warn!(error = %e, "model refresh failed, keeping previous table");
                        }
                    }
                    _ = task_cancel.cancelled() => {
                        info!("model refresher shutting down");
                        break;
                    }
                }
            }
        });

        RefresherHandle { cancel, task }
    }
}

/// Handle to the running refresher task.
pub struct RefresherHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl RefresherHandle {
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("model refresher task ended abnormally: {e}");
        }
    }
}

const RANKING_INSTRUCTIONS: &str = "You pick models for a customer support chatbot. From the \
candidate list, choose the best model for each role: \"text\" (general chat quality), \
\"vision\" (must list image input) and \"voice\" (fast model that accepts audio or is a quick \
general model). Respond with only a JSON object of the form \
{\"text\": \"<model id>\", \"vision\": \"<model id>\", \"voice\": \"<model id>\"} using ids \
exactly as listed.";

fn candidate_table(candidates: &[CatalogModel]) -> String {
    candidates
        .iter()
        .map(|m| format!("{} | inputs: {}", m.id, m.input_modalities.join(",")))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Zero-cost entries whose id contains no denylisted fragment.
pub fn free_candidates(catalog: Vec<CatalogModel>, denylist: &[String]) -> Vec<CatalogModel> {
    let mut seen = HashSet::new();
    catalog
        .into_iter()
        .filter(CatalogModel::is_free)
        .filter(|m| {
            let id = m.id.to_ascii_lowercase();
            !denylist
                .iter()
                .any(|blocked| id.contains(&blocked.to_ascii_lowercase()))
        })
        .filter(|m| seen.insert(m.id.clone()))
        .collect()
}

#[derive(Deserialize)]
struct RankingReply {
    text: String,
    vision: String,
    voice: String,
}

/// Accept the ranker's answer only if every id is a candidate and the vision
/// pick takes images.
fn validate_ranking(raw: &str, candidates: &[CatalogModel]) -> Result<BestModels> {
    let cleaned = strip_reasoning(raw);
    let start = cleaned.find('{');
    let end = cleaned.rfind('}');
    let slice = match (start, end) {
        (Some(start), Some(end)) if end > start => &cleaned[start..=end],
        _ => return Err(Error::Parse("ranking reply has no JSON object".to_string())),
    };
    let reply: RankingReply = serde_json::from_str(slice)
        .map_err(|e| Error::Parse(format!("ranking reply is malformed: {e}")))?;

    let find = |id: &str| candidates.iter().find(|m| m.id == id.trim());
    for id in [&reply.text, &reply.vision, &reply.voice] {
        if find(id).is_none() {
            return Err(Error::Parse(format!("ranker chose unknown model '{id}'")));
        }
    }
    if !find(&reply.vision).is_some_and(|m| m.supports("image")) {
        return Err(Error::Parse(format!(
            "ranker chose non-vision model '{}' for vision",
            reply.vision
        )));
    }

    Ok(BestModels {
        text: reply.text.trim().to_string(),
        vision: reply.vision.trim().to_string(),
        voice: reply.voice.trim().to_string(),
    })
}

/// Rule-based ranking. Roles with no eligible candidate keep their current model.
pub fn rank_deterministic(
    candidates: &[CatalogModel],
    preferred_families: &[String],
    current: &BestModels,
) -> BestModels {
    let family_rank = |id: &str| {
        preferred_families
            .iter()
            .position(|family| id.starts_with(family.as_str()))
            .unwrap_or(preferred_families.len())
    };
    let is_fast = |id: &str| FAST_MARKERS.iter().any(|marker| id.contains(marker));

    let text = candidates
        .iter()
        .min_by_key(|m| (family_rank(&m.id), m.id.clone()))
        .map(|m| m.id.clone());

    let vision = candidates
        .iter()
        .filter(|m| m.supports("image"))
        .min_by_key(|m| (family_rank(&m.id), m.id.clone()))
        .map(|m| m.id.clone());

    let voice = candidates
        .iter()
        .min_by_key(|m| (!m.supports("audio"), !is_fast(&m.id), family_rank(&m.id), m.id.clone()))
        .map(|m| m.id.clone());

    BestModels {
        text: text.unwrap_or_else(|| current.text.clone()),
        vision: vision.unwrap_or_else(|| current.vision.clone()),
        voice: voice.unwrap_or_else(|| current.voice.clone()),
    }
}
