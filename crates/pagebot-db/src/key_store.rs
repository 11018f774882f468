use std::path::Path;

use chrono::{DateTime, Utc};
use pagebot_common::{Error, ProviderKind, Result};
use pagebot_security::{Credential, CredentialId, CredentialStatus, infer_provider};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::{info, warn};

/// Outcome of a legacy key import.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    pub duplicates: usize,
    /// Keys whose provider could not be determined.
    pub unrecognized: usize,
}

/// Persistent storage for managed credentials and their health state.
pub struct KeyStore {
    conn: Connection,
}

impl KeyStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening key store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS api_keys (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    provider TEXT NOT NULL,
                    model TEXT NOT NULL,
                    secret TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'alive',
                    cooldown_until TEXT,
                    cumulative_tokens INTEGER NOT NULL DEFAULT 0,
                    last_used TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    UNIQUE(provider, model, secret)
                );

                CREATE INDEX IF NOT EXISTS idx_api_keys_provider_model
                    ON api_keys(provider, model);",
            )
            .map_err(|e| Error::Database(format!("migration failed: {e}")))?;

        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Insert a credential. Returns `None` when the same key is already stored.
    pub fn insert(
        &self,
        provider: ProviderKind,
        model: &str,
        secret: &str,
    ) -> Result<Option<CredentialId>> {
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO api_keys (provider, model, secret) VALUES (?1, ?2, ?3)",
                params![provider.as_str(), model, secret.trim()],
            )
            .map_err(|e| Error::Database(format!("failed to insert credential: {e}")))?;

        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(self.conn.last_insert_rowid()))
    }

    /// Import raw key strings from a pre-provider-field export.
    ///
    /// One key per line; blank lines and `#` comments are skipped. When
    /// `provider` is `None` the provider is inferred from the key prefix.
    pub fn import_legacy(
        &self,
        contents: &str,
        model: &str,
        provider: Option<ProviderKind>,
    ) -> Result<ImportReport> {
        let mut report = ImportReport::default();
        for line in contents.lines() {
            let secret = line.trim();
            if secret.is_empty() || secret.starts_with('#') {
                continue;
            }
            let Some(kind) = provider.or_else(|| infer_provider(secret)) else {
                report.unrecognized += 1;
                continue;
            };
            match self.insert(kind, model, secret)? {
                Some(_) => report.imported += 1,
                None => report.duplicates += 1,
            }
        }
        info!(
            imported = report.imported,
            duplicates = report.duplicates,
            unrecognized = report.unrecognized,
            "legacy key import finished"
        );
        Ok(report)
    }

    pub fn load_all(&self) -> Result<Vec<Credential>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, provider, model, secret, status, cooldown_until, cumulative_tokens, last_used
                 FROM api_keys ORDER BY id",
            )
            .map_err(|e| Error::Database(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], read_row)
            .map_err(|e| Error::Database(format!("failed to load credentials: {e}")))?;

        let mut credentials = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| Error::Database(format!("failed to read row: {e}")))?;
            match raw.into_credential() {
                Ok(credential) => credentials.push(credential),
                Err(e) => warn!("skipping unreadable credential row: {e}"),
            }
        }
        Ok(credentials)
    }

    pub fn get(&self, id: CredentialId) -> Result<Option<Credential>> {
        let raw = self
            .conn
            .query_row(
                "SELECT id, provider, model, secret, status, cooldown_until, cumulative_tokens, last_used
                 FROM api_keys WHERE id = ?1",
                params![id],
                read_row,
            )
            .optional()
            .map_err(|e| Error::Database(format!("failed to load credential {id}: {e}")))?;
        raw.map(RawCredential::into_credential).transpose()
    }

    /// Persist health state (status, cooldown, usage) for the given credentials.
    pub fn save_health(&self, credentials: &[Credential]) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;

        for credential in credentials {
            tx.execute(
                "UPDATE api_keys
                 SET status = ?1, cooldown_until = ?2, cumulative_tokens = ?3, last_used = ?4
                 WHERE id = ?5",
                params![
                    credential.status.as_str(),
                    credential.cooldown_until.map(|t| t.to_rfc3339()),
                    i64::try_from(credential.cumulative_tokens).unwrap_or(i64::MAX),
                    credential.last_used.map(|t| t.to_rfc3339()),
                    credential.id,
                ],
            )
            .map_err(|e| Error::Database(format!("failed to save credential health: {e}")))?;
        }

        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit health state: {e}")))?;
        Ok(())
    }

    pub fn remove(&self, id: CredentialId) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM api_keys WHERE id = ?1", params![id])
            .map_err(|e| Error::Database(format!("failed to delete credential: {e}")))?;
        Ok(changed > 0)
    }
}

struct RawCredential {
    id: CredentialId,
    provider: String,
    model: String,
    secret: String,
    status: String,
    cooldown_until: Option<String>,
    cumulative_tokens: i64,
    last_used: Option<String>,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawCredential> {
    Ok(RawCredential {
        id: row.get(0)?,
        provider: row.get(1)?,
        model: row.get(2)?,
        secret: row.get(3)?,
        status: row.get(4)?,
        cooldown_until: row.get(5)?,
        cumulative_tokens: row.get(6)?,
        last_used: row.get(7)?,
    })
}

impl RawCredential {
    fn into_credential(self) -> Result<Credential> {
        let provider: ProviderKind = self.provider.parse()?;
        let mut credential = Credential::new(self.id, provider, self.model, self.secret);
        credential.status = self.status.parse::<CredentialStatus>()?;
        credential.cooldown_until = parse_timestamp(self.cooldown_until.as_deref())?;
        credential.cumulative_tokens = u64::try_from(self.cumulative_tokens).unwrap_or(0);
        credential.last_used = parse_timestamp(self.last_used.as_deref())?;
        Ok(credential)
    }
}

fn parse_timestamp(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| Error::Database(format!("invalid timestamp '{raw}': {e}")))
        })
        .transpose()
}
