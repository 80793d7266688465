//! Configuration management for slidegate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::error::{Result, SlidegateError};
use crate::store::{HistoryStore, MemoryHistoryStore, RedisHistoryStore};
use crate::throttle::{
    AddressResolver, Consistency, IdentityResolver, PrincipalResolver, ScopeRegistry, Throttle,
    DEFAULT_MAX_RETRIES,
};

/// Prefix for environment overrides, e.g. `SLIDEGATE__STORE__REDIS_URL`.
const ENV_PREFIX: &str = "SLIDEGATE";

/// Main configuration for slidegate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlidegateConfig {
    /// History store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Caller identity configuration
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Throttle configuration
    #[serde(default)]
    pub throttle: ThrottleConfig,
}

/// Which history store backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local map; state is not shared between processes
    #[default]
    Memory,
    /// Shared Redis server
    Redis,
}

/// History store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, used by the redis backend
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/1".to_string()
}

/// Caller identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Trusted proxies in front of the service; `~` when unknown
    #[serde(default = "default_num_proxies")]
    pub num_proxies: Option<usize>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            num_proxies: default_num_proxies(),
        }
    }
}

fn default_num_proxies() -> Option<usize> {
    Some(1)
}

/// Throttle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Whether checks use plain get/set or compare-and-set
    #[serde(default)]
    pub consistency: Consistency,

    /// Compare-and-set attempts per check in atomic mode
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Scope name to rate string
    #[serde(default)]
    pub rates: ScopeRegistry,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            consistency: Consistency::default(),
            max_retries: default_max_retries(),
            rates: ScopeRegistry::default(),
        }
    }
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Just the `throttle.rates` section of a config file, keys untouched.
#[derive(Debug, Default, Deserialize)]
struct RatesOnly {
    #[serde(default)]
    throttle: RatesSection,
}

#[derive(Debug, Default, Deserialize)]
struct RatesSection {
    #[serde(default)]
    rates: ScopeRegistry,
}

fn rates_from_yaml(yaml: &str) -> Result<ScopeRegistry> {
    let raw: Option<RatesOnly> = serde_yaml::from_str(yaml)
        .map_err(|e| SlidegateError::Configuration(format!("Failed to parse configuration: {}", e)))?;
    Ok(raw.unwrap_or_default().throttle.rates)
}

impl SlidegateConfig {
    /// Load configuration from a YAML file, with `SLIDEGATE__SECTION__KEY`
    /// environment variables taking precedence.
    ///
    /// Scope names in `throttle.rates` are taken verbatim from the file. The
    /// `config` crate folds keys to lowercase, so rates cannot be overridden
    /// from the environment.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path).map_err(|e| {
            SlidegateError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let settings = config::Config::builder()
            .add_source(config::File::from_str(&contents, config::FileFormat::Yaml))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| SlidegateError::Configuration(e.to_string()))?;

        let mut config: SlidegateConfig = settings
            .try_deserialize()
            .map_err(|e| SlidegateError::Configuration(e.to_string()))?;
        config.throttle.rates = rates_from_yaml(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: SlidegateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| SlidegateError::Configuration(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every configured rate so bad deployments fail at startup.
    pub fn validate(&self) -> Result<()> {
        self.throttle.rates.validate()
    }

    /// The identity policy described by this configuration.
    pub fn resolver(&self) -> Arc<dyn IdentityResolver> {
        Arc::new(PrincipalResolver::new(AddressResolver::new(
            self.identity.num_proxies,
        )))
    }

    /// Open the configured history store.
    pub async fn open_store(&self) -> Result<Arc<dyn HistoryStore>> {
        match self.store.backend {
            StoreBackend::Memory => {
                info!("Using in-memory history store");
                Ok(Arc::new(MemoryHistoryStore::new()))
            }
            StoreBackend::Redis => {
                let store = RedisHistoryStore::connect(&self.store.redis_url).await?;
                store.ping().await?;
                Ok(Arc::new(store))
            }
        }
    }

    /// Build a throttle for `scope` that shares `store`.
    pub fn throttle(&self, scope: &str, store: Arc<dyn HistoryStore>) -> Result<Throttle> {
        Throttle::builder()
            .scope(scope)
            .registry(&self.throttle.rates)
            .store(store)
            .resolver(self.resolver())
            .consistency(self.throttle.consistency)
            .max_retries(self.throttle.max_retries)
            .build()
    }
}
