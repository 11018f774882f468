mod support;

use std::sync::Arc;
use std::time::Duration;

use pagebot_agents::{BestModels, CatalogModel, LlmProvider, NoProductSearch, RefreshOutcome};
use pagebot_common::ProviderKind;
use pagebot_security::Credential;

use support::{CountingPool, StaticMockProvider, Step, engine, quiet_config};

const RANKING: &str = r#"{"text": "meta-llama/llama-3.3-70b-instruct:free", "vision": "google/gemma-3-27b-it:free", "voice": "mistralai/mistral-7b-instruct:free"}"#;

fn catalog_entry(id: &str, modalities: &[&str], price: &str) -> CatalogModel {
    let price = price.parse().ok();
    CatalogModel {
        id: id.to_string(),
        name: id.to_string(),
        prompt_price: price,
        completion_price: price,
        input_modalities: modalities.iter().map(|m| m.to_string()).collect(),
    }
}

fn catalog() -> Vec<CatalogModel> {
    vec![
        catalog_entry("google/gemma-3-27b-it:free", &["text", "image"], "0"),
        catalog_entry("meta-llama/llama-3.3-70b-instruct:free", &["text"], "0"),
        catalog_entry("mistralai/mistral-7b-instruct:free", &["text"], "0"),
        catalog_entry("openai/gpt-4o", &["text", "image"], "0.0000025"),
        catalog_entry("meta-llama/llama-guard-4-12b:free", &["text"], "0"),
    ]
}

fn ranker_pool() -> Arc<CountingPool> {
    Arc::new(CountingPool::new(vec![Credential::new(
        1,
        ProviderKind::Groq,
        "llama-3.1-8b-instant",
        "gsk_ranker",
    )]))
}

fn refresh_providers(
    ranker_reply: &'static str,
    catalog_delay: Duration,
) -> (Arc<StaticMockProvider>, Vec<Arc<dyn LlmProvider>>) {
    let ranker = Arc::new(StaticMockProvider::new(
        ProviderKind::Groq,
        vec![Step::Reply(ranker_reply)],
    ));
    let catalog = Arc::new(
        StaticMockProvider::new(ProviderKind::OpenRouter, Vec::new())
            .with_catalog(catalog(), catalog_delay),
    );
    (
        ranker.clone(),
        vec![ranker as Arc<dyn LlmProvider>, catalog as Arc<dyn LlmProvider>],
    )
}

#[tokio::test]
async fn refresh_applies_valid_ranking() {
    let (ranker, providers) = refresh_providers(RANKING, Duration::ZERO);
    let engine = engine(quiet_config(), providers, ranker_pool(), Arc::new(NoProductSearch));
    let refresher = engine.refresher();

    let outcome = refresher.refresh_now().await.unwrap();
    let expected = BestModels {
        text: "meta-llama/llama-3.3-70b-instruct:free".to_string(),
        vision: "google/gemma-3-27b-it:free".to_string(),
        voice: "mistralai/mistral-7b-instruct:free".to_string(),
    };

    assert_eq!(outcome, RefreshOutcome::Updated(expected.clone()));
    assert_eq!(engine.best_models().get(), expected);
    assert_eq!(ranker.keys_seen(), vec!["gsk_ranker".to_string()]);

    let candidates = &ranker.last_request().unwrap().messages[1].content;
    assert!(!candidates.contains("openai/gpt-4o"));
    assert!(!candidates.contains("llama-guard"));
}

#[tokio::test]
async fn invalid_ranking_falls_back_to_rules() {
    let (_, providers) = refresh_providers(
        r#"{"text": "openai/gpt-4o", "vision": "openai/gpt-4o", "voice": "openai/gpt-4o"}"#,
        Duration::ZERO,
    );
    let engine = engine(quiet_config(), providers, ranker_pool(), Arc::new(NoProductSearch));

    let outcome = engine.refresher().refresh_now().await.unwrap();
    let RefreshOutcome::Updated(best) = outcome else {
        panic!("expected an updated table");
    };

    assert_eq!(best.text, "google/gemma-3-27b-it:free");
    assert_eq!(best.vision, "google/gemma-3-27b-it:free");
    assert_eq!(engine.best_models().get(), best);
}

#[tokio::test]
async fn concurrent_refreshes_are_coalesced() {
    let (ranker, providers) = refresh_providers(RANKING, Duration::from_millis(200));
    let engine = engine(quiet_config(), providers, ranker_pool(), Arc::new(NoProductSearch));
    let refresher = engine.refresher();

    let (first, second) = tokio::join!(refresher.refresh_now(), refresher.refresh_now());

    let outcomes = [first.unwrap(), second.unwrap()];
    let skipped = outcomes
        .iter()
        .filter(|o| **o == RefreshOutcome::Skipped)
        .count();
    assert_eq!(skipped, 1);
    assert_eq!(ranker.calls(), 1);

    // The flag is released once the refresh ends.
    assert!(matches!(
        refresher.refresh_now().await.unwrap(),
        RefreshOutcome::Updated(_)
    ));
}

#[tokio::test]
async fn catalog_failure_keeps_previous_table() {
    let ranker = Arc::new(StaticMockProvider::new(
        ProviderKind::Groq,
        vec![Step::Reply(RANKING)],
    ));
    let catalog = Arc::new(StaticMockProvider::new(ProviderKind::OpenRouter, Vec::new()));
    let engine = engine(
        quiet_config(),
        vec![ranker.clone() as Arc<dyn LlmProvider>, catalog as Arc<dyn LlmProvider>],
        ranker_pool(),
        Arc::new(NoProductSearch),
    );
    let before = engine.best_models().get();

    assert!(engine.refresher().refresh_now().await.is_err());
    assert_eq!(engine.best_models().get(), before);
    assert_eq!(ranker.calls(), 0);
}

#[tokio::test]
async fn background_task_refreshes_and_stops() {
    let (_, providers) = refresh_providers(RANKING, Duration::ZERO);
    let engine = engine(quiet_config(), providers, ranker_pool(), Arc::new(NoProductSearch));
    let before = engine.best_models().get();

    let handle = engine.refresher().start();
    let mut refreshed = false;
    for _ in 0..50 {
        if engine.best_models().get() != before {
            refreshed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    handle.stop().await;

    assert!(refreshed);
    assert_eq!(
        engine.best_models().get().text,
        "meta-llama/llama-3.3-70b-instruct:free"
    );
}
