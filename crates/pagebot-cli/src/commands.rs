use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use pagebot_agents::{MediaText, NoProductSearch, RefreshOutcome, ReplyEngine, VisionOptions};
use pagebot_common::{ConversationRequest, PageConfig, ProviderKind};
use pagebot_config::EngineConfig;
use pagebot_db::KeyStore;
use pagebot_security::{Credential, MemoryKeyPool};
use serde_json::json;
use tracing::{info, warn};

/// Engine backed by the credentials in the key store.
struct Session {
    store: KeyStore,
    pool: Arc<MemoryKeyPool>,
    engine: ReplyEngine,
}

impl Session {
    fn open(config: EngineConfig) -> Result<Self> {
        let store = open_store(&config)?;
        let credentials = store.load_all()?;
        info!(credentials = credentials.len(), "loaded pooled credentials");

        let pool = Arc::new(MemoryKeyPool::new(credentials));
        let engine = ReplyEngine::new(config, pool.clone(), Arc::new(NoProductSearch));
        Ok(Self {
            store,
            pool,
            engine,
        })
    }

    /// Write back cooldowns and usage gathered during this run.
    async fn close(self) -> Result<()> {
        let snapshot = self.pool.snapshot().await;
        self.store.save_health(&snapshot)?;
        Ok(())
    }
}

fn open_store(config: &EngineConfig) -> Result<KeyStore> {
    let path = &config.database.path;
    KeyStore::open(path).with_context(|| format!("failed to open key store {}", path.display()))
}

fn read_request(path: &Path) -> Result<ConversationRequest> {
    let raw = if path.as_os_str() == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read request {}", path.display()))?
    };
    serde_json::from_str(&raw).context("request is not a valid conversation request")
}

fn print_media(result: &MediaText) -> Result<()> {
    let output = json!({
        "text": result.text,
        "available": !result.is_unavailable(),
        "token_usage": result.token_usage,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

pub async fn ask(config: EngineConfig, request: &Path) -> Result<()> {
    let request = read_request(request)?;
    let session = Session::open(config)?;

    let response = session.engine.generate(&request).await;
    session.close().await?;

    match response {
        Some(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        None => bail!("no reply generated: every managed attempt failed"),
    }
}

pub async fn describe_image(
    config: EngineConfig,
    reference: &str,
    prompt: Option<String>,
) -> Result<()> {
    let session = Session::open(config)?;
    let options = VisionOptions {
        prompt,
        ..Default::default()
    };
    let result = session
        .engine
        .describe_image(reference, &PageConfig::default(), &options)
        .await;
    session.close().await?;
    print_media(&result)
}

pub async fn transcribe(config: EngineConfig, reference: &str) -> Result<()> {
    let session = Session::open(config)?;
    let result = session
        .engine
        .transcribe_audio(reference, &PageConfig::default())
        .await;
    session.close().await?;
    print_media(&result)
}

pub async fn refresh_models(config: EngineConfig) -> Result<()> {
    let session = Session::open(config)?;
    let outcome = session.engine.refresher().refresh_now().await;
    session.close().await?;

    match outcome? {
        RefreshOutcome::Updated(best) => println!("{}", serde_json::to_string_pretty(&best)?),
        RefreshOutcome::Skipped => println!("a refresh is already running"),
    }
    Ok(())
}

pub fn import_keys(
    config: &EngineConfig,
    file: &Path,
    model: &str,
    provider: Option<ProviderKind>,
) -> Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read key file {}", file.display()))?;
    let store = open_store(config)?;
    let report = store.import_legacy(&contents, model, provider)?;
    if report.unrecognized > 0 {
        warn!(
            unrecognized = report.unrecognized,
            "some keys were skipped; pass --provider to import them"
        );
    }
    println!(
        "imported {}, already present {}, unrecognized {}",
        report.imported, report.duplicates, report.unrecognized
    );
    Ok(())
}

pub fn list_keys(config: &EngineConfig) -> Result<()> {
    let store = open_store(config)?;
    for credential in store.load_all()? {
        println!("{}", describe_credential(&credential));
    }
    Ok(())
}

pub fn remove_key(config: &EngineConfig, id: i64) -> Result<()> {
    let store = open_store(config)?;
    if !store.remove(id)? {
        bail!("no credential with id {id}");
    }
    println!("removed credential {id}");
    Ok(())
}

fn describe_credential(credential: &Credential) -> String {
    let cooldown = credential
        .cooldown_until
        .map(|until| format!(" until {}", until.to_rfc3339()))
        .unwrap_or_default();
    format!(
        "{:>4}  {:<10} {:<40} {}  {}{}  tokens={}",
        credential.id,
        credential.provider.as_str(),
        credential.model,
        mask_secret(&credential.secret),
        credential.status.as_str(),
        cooldown,
        credential.cumulative_tokens
    )
}

/// Keep only the last four characters of a key.
fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("****{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_all_but_last_four() {
        assert_eq!(mask_secret("gsk_abcdefgh1234"), "****1234");
        assert_eq!(mask_secret("abc"), "****abc");
    }

    #[test]
    fn reads_request_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("request.json");
        std::fs::write(
            &path,
            r#"{
                "page_id": "p1",
                "sender_id": "s1",
                "sender_name": "Rahim",
                "owner_name": "Shop",
                "user_message": "price?",
                "page_config": { "page_id": "p1", "owner_id": "u1", "cheap_engine": true }
            }"#,
        )
        .unwrap();

        let request = read_request(&path).unwrap();
        assert_eq!(request.user_message, "price?");
        assert!(request.page_config.cheap_engine);
    }

    #[test]
    fn lists_imported_keys_masked() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.database.path = dir.path().join("keys.db");

        let keys = dir.path().join("keys.txt");
        std::fs::write(&keys, "gsk_first_key_0001\n# comment\ngsk_second_key_0002\n").unwrap();
        import_keys(&config, &keys, "*", None).unwrap();

        let stored = open_store(&config).unwrap().load_all().unwrap();
        assert_eq!(stored.len(), 2);
        let line = describe_credential(&stored[0]);
        assert!(line.contains("****0001"));
        assert!(!line.contains("gsk_first"));
        assert!(line.contains("alive"));
    }
}
