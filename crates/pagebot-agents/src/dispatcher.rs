//! Phase-gated execution of inference attempts.
//!
//! `INIT -> PHASE1_USER_KEY | PHASE2_MANAGED_SWARM -> DONE | FAILED`. A page
//! that runs on its own key is never served from the managed pool: every
//! phase 1 failure ends in `FAILED` with a configuration error.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use pagebot_common::{AiResponse, ConversationMode, ConversationRequest, Error, Result};
use pagebot_config::EngineConfig;
use pagebot_security::{KeyPool, infer_provider, split_key_list};
use rand::seq::SliceRandom;
use tracing::{debug, info, instrument, warn};

use crate::failure::{FailureClass, classify, report_failure};
use crate::models::ModelResolver;
use crate::parser::{ModelOutput, parse_model_output, parse_plain_output, retain_grounded_images};
use crate::providers::{ChatMessage, LlmProvider, LlmRequest, ProviderRegistry};
use crate::tools::{ProductSearch, ToolLoop};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Init,
    Phase1UserKey,
    Phase2ManagedSwarm,
    Done,
    Failed,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "INIT",
            Self::Phase1UserKey => "PHASE1_USER_KEY",
            Self::Phase2ManagedSwarm => "PHASE2_MANAGED_SWARM",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Reply(AiResponse),
    /// Own-key failure, reported to the page owner.
    ConfigError(String),
    /// Every managed attempt failed. The caller owns the user-facing message.
    Exhausted,
}

impl DispatchOutcome {
    pub fn final_state(&self) -> DispatchState {
        match self {
            Self::Reply(_) => DispatchState::Done,
            _ => DispatchState::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Path {
    UserKey,
    Swarm,
}

pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
    pool: Arc<dyn KeyPool>,
    resolver: Arc<ModelResolver>,
    products: Arc<dyn ProductSearch>,
    config: Arc<EngineConfig>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        pool: Arc<dyn KeyPool>,
        resolver: Arc<ModelResolver>,
        products: Arc<dyn ProductSearch>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            registry,
            pool,
            resolver,
            products,
            config,
        }
    }

    #[instrument(skip_all, fields(page_id = %request.page_id, sender_id = %request.sender_id))]
    pub async fn dispatch(
        &self,
        request: &ConversationRequest,
        messages: &[ChatMessage],
    ) -> DispatchOutcome {
        let phase = if request.page_config.uses_own_key() {
            DispatchState::Phase1UserKey
        } else {
            DispatchState::Phase2ManagedSwarm
        };
        debug!("dispatch state {} -> {}", DispatchState::Init, phase);

        let outcome = match phase {
            DispatchState::Phase1UserKey => self.run_user_key_phase(request, messages).await,
            _ => self.run_swarm_phase(request, messages).await,
        };

        debug!("dispatch state {} -> {}", phase, outcome.final_state());
        outcome
    }

    async fn run_user_key_phase(
        &self,
        request: &ConversationRequest,
        messages: &[ChatMessage],
    ) -> DispatchOutcome {
        let page = &request.page_config;
        let mut keys = split_key_list(page.api_key.as_deref().unwrap_or_default());
        let Some(first_key) = keys.first() else {
            return DispatchOutcome::ConfigError(
                "No API key is configured for this page. Add a key in the page settings or enable the managed engine."
                    .to_string(),
            );
        };

        let kind = match page.provider {
            Some(kind) => Some(kind),
            None => infer_provider(first_key)
                .filter(|kind| keys.iter().all(|key| infer_provider(key) == Some(*kind))),
        };
        let Some(kind) = kind else {
            return DispatchOutcome::ConfigError(
                "Could not tell which AI provider your API keys belong to. Select the provider in the page settings, or use keys from a single provider."
                    .to_string(),
            );
        };

        for key in &keys {
            if self.pool.is_managed_secret(key).await {
                warn!(provider = %kind, "page key is a managed pool credential, rejecting");
                return DispatchOutcome::ConfigError(
                    "The configured API key cannot be used as a page key. Please add your own key."
                        .to_string(),
                );
            }
        }

        let Some(provider) = self.registry.get(kind) else {
            return DispatchOutcome::ConfigError(format!(
                "The {kind} provider is not available right now."
            ));
        };

        let requested = page
            .chat_model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .or_else(|| self.config.dispatch.default_model(kind));
        let Some(requested) = requested else {
            return DispatchOutcome::ConfigError(format!(
                "No chat model is configured for {kind}. Choose a model in the page settings."
            ));
        };
        let model = self.resolver.resolve(kind, requested);

        keys.shuffle(&mut rand::rng());
        let mut last_failure = FailureClass::Other;
        for (attempt, key) in keys.iter().enumerate() {
            match self
                .attempt(&provider, key, &model, request, messages, Path::UserKey)
                .await
            {
                Ok(response) => {
                    info!(provider = %kind, model = %model, attempt = attempt + 1, "own key attempt succeeded");
                    return DispatchOutcome::Reply(response);
                }
                Err(e) => {
                    last_failure = classify(&e);
                    warn!(provider = %kind, model = %model, attempt = attempt + 1, "own key attempt failed: {e}");
                }
            }
        }

        DispatchOutcome::ConfigError(format!(
            "Your {kind} API key could not be used: {}. Please check the key and model in your page settings.",
            last_failure.describe()
        ))
    }

    async fn run_swarm_phase(
        &self,
        request: &ConversationRequest,
        messages: &[ChatMessage],
    ) -> DispatchOutcome {
        let dispatch = &self.config.dispatch;
        let kind = dispatch.swarm_provider;
        let model = self.resolver.resolve(kind, &dispatch.swarm_model);

        let Some(provider) = self.registry.get(kind) else {
            warn!(provider = %kind, "swarm provider is not registered");
            return DispatchOutcome::Exhausted;
        };

        for attempt in 1..=dispatch.swarm_attempts {
            let Some(key) = self.pool.acquire(kind, &model).await else {
                warn!(provider = %kind, model = %model, attempt, "no healthy pooled credential");
                break;
            };

            match self
                .attempt(&provider, key.secret(), &model, request, messages, Path::Swarm)
                .await
            {
                Ok(response) => {
                    self.pool
                        .record_usage(&key, response.token_usage.total())
                        .await;
                    info!(provider = %kind, model = %model, attempt, credential = key.id, "swarm attempt succeeded");
                    return DispatchOutcome::Reply(response);
                }
                Err(e) => {
                    let class =
                        report_failure(self.pool.as_ref(), &key, &e, &self.config.quarantine).await;
                    warn!(
                        provider = %kind,
                        model = %model,
                        attempt,
                        credential = key.id,
                        class = ?class,
                        "swarm attempt failed: {e}"
                    );
                }
            }
        }

        DispatchOutcome::Exhausted
    }

    /// One inference attempt, including the tool round-trip when requested.
    async fn attempt(
        &self,
        provider: &Arc<dyn LlmProvider>,
        secret: &str,
        model: &str,
        request: &ConversationRequest,
        messages: &[ChatMessage],
        path: Path,
    ) -> Result<AiResponse> {
        let limit = match path {
            Path::UserKey => self.config.dispatch.user_key_timeout(),
            Path::Swarm => self.config.dispatch.swarm_timeout(),
        };
        let structured = request.mode == ConversationMode::Internal;
        let llm_request = LlmRequest {
            model: model.to_string(),
            messages: messages.to_vec(),
            max_tokens: Some(self.config.dispatch.max_tokens),
            temperature: Some(self.config.dispatch.temperature),
            structured_output: structured,
        };

        let first = with_timeout(provider.complete(secret, &llm_request), limit).await?;
        let mut output = if structured {
            parse_model_output(&first.content)
        } else {
            parse_plain_output(&first.content)
        };
        let mut usage = first.usage;
        let mut grounding = messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let query = match &output {
            ModelOutput::ToolCall(call) => call.search_query().map(str::to_string),
            _ => None,
        };
        if let Some(query) = query {
            let tool_loop = ToolLoop {
                search: self.products.as_ref(),
                owner_id: &request.page_config.owner_id,
                page_id: &request.page_id,
                direct_synthesis: path == Path::Swarm && self.config.tools.swarm_direct_synthesis,
            };
            let round = tool_loop
                .run(&query, &first, messages, |follow_up| {
                    let follow_up_request = LlmRequest {
                        messages: follow_up,
                        ..llm_request.clone()
                    };
                    async move {
                        with_timeout(provider.complete(secret, &follow_up_request), limit).await
                    }
                })
                .await?;
            output = round.output;
            usage = round.usage;
            grounding.push('\n');
            grounding.push_str(&round.listing);
        }

        let mut response = output.into_response();
        if response
            .reply
            .as_deref()
            .is_none_or(|reply| reply.trim().is_empty())
        {
            return Err(Error::Parse("model returned an empty reply".to_string()));
        }
        if structured {
            let removed = retain_grounded_images(&mut response.images, &grounding);
            if removed > 0 {
                debug!(removed, "dropped reply images not present in context");
            }
        }
        response.token_usage = usage;
        response.model_used = Some(format!("{}/{model}", provider.kind()));
        Ok(response)
    }
}

async fn with_timeout<T>(future: impl Future<Output = Result<T>>, limit: Duration) -> Result<T> {
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| Error::Timeout(limit))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_render_as_labels() {
        assert_eq!(DispatchState::Phase1UserKey.to_string(), "PHASE1_USER_KEY");
        assert_eq!(DispatchState::Phase2ManagedSwarm.to_string(), "PHASE2_MANAGED_SWARM");
    }

    #[test]
    fn outcome_final_state() {
        assert_eq!(
            DispatchOutcome::Reply(AiResponse::text("hi")).final_state(),
            DispatchState::Done
        );
        assert_eq!(DispatchOutcome::Exhausted.final_state(), DispatchState::Failed);
        assert_eq!(
            DispatchOutcome::ConfigError("x".to_string()).final_state(),
            DispatchState::Failed
        );
    }
}
