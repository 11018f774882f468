pub mod loader;
pub mod model;

pub use loader::{ConfigFormat, ConfigLoader};
pub use model::{
    CacheConfig, DatabaseConfig, DispatchConfig, EngineConfig, MediaAuthRule, MediaConfig,
    ModelTarget, ModelsConfig, ProviderRoute, QuarantineConfig, ToolsConfig,
};
