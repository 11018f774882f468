use std::path::Path;

use pagebot_common::{Error, ProviderKind, Result};
use tracing::{debug, info};

use crate::model::EngineConfig;

const ENV_PREFIX: &str = "PAGEBOT_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Result<Self> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Ok(Self::Yaml),
            Some("toml") => Ok(Self::Toml),
            other => Err(Error::Config(format!(
                "unsupported config extension {:?} for {}",
                other,
                path.display()
            ))),
        }
    }
}

/// Loads [`EngineConfig`] from a YAML/TOML file and `PAGEBOT_*` environment variables.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load `path` (when given), then apply `.env` and process environment overrides.
    pub fn load(path: Option<&Path>) -> Result<EngineConfig> {
        if let Ok(env_path) = dotenvy::dotenv() {
            debug!("loaded environment from {}", env_path.display());
        }

        let mut config = match path {
            Some(path) => Self::load_file(path)?,
            None => EngineConfig::default(),
        };
        Self::apply_env_overrides(&mut config, std::env::vars())?;
        Ok(config)
    }

    pub fn load_file(path: &Path) -> Result<EngineConfig> {
        let format = ConfigFormat::from_path(path)?;
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config {}: {e}", path.display()))
        })?;
        let config = Self::parse(&contents, format)?;
        info!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(contents: &str, format: ConfigFormat) -> Result<EngineConfig> {
        match format {
            ConfigFormat::Yaml => serde_yaml::from_str(contents)
                .map_err(|e| Error::Config(format!("invalid YAML config: {e}"))),
            ConfigFormat::Toml => toml::from_str(contents)
                .map_err(|e| Error::Config(format!("invalid TOML config: {e}"))),
        }
    }

    /// Apply `PAGEBOT_*` overrides from an explicit variable list.
    pub fn apply_env_overrides<I>(config: &mut EngineConfig, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "DATABASE_PATH" => config.database.path = value.into(),
                "CACHE_ENABLED" => config.cache.enabled = parse_env(&key, &value)?,
                "CACHE_TTL_SECS" => config.cache.ttl_secs = parse_env(&key, &value)?,
                "CACHE_MAX_ENTRIES" => config.cache.max_entries = parse_env(&key, &value)?,
                "SWARM_PROVIDER" => config.dispatch.swarm_provider = value.parse()?,
                "SWARM_MODEL" => config.dispatch.swarm_model = value,
                "SWARM_ATTEMPTS" => config.dispatch.swarm_attempts = parse_env(&key, &value)?,
                "MODELS_REFRESH_SECS" => {
                    config.models.refresh_interval_secs = parse_env(&key, &value)?
                }
                "LANGUAGE_HINT" => config.media.language_hint = value,
                other => {
                    if let Some(provider) = other.strip_suffix("_BASE_URL") {
                        let provider: ProviderKind = provider.parse()?;
                        let mut route = config.route(provider);
                        route.base_url = value;
                        config.providers.insert(provider, route);
                    } else {
                        debug!("ignoring unknown environment override {key}");
                    }
                }
            }
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid value '{value}' for {key}")))
}
