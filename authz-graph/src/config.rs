use crate::cache::{CacheTtls, DEFAULT_KEY_PREFIX};
use crate::error::{GraphError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Environment variables prefixed with this override file settings,
/// with `__` separating nested keys (`AUTHZ__CACHE__PROVIDER=redis`).
pub const ENV_PREFIX: &str = "AUTHZ";

/// Top-level configuration for one tenant's authorization graph
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthzConfig {
    /// PostgreSQL connection string; the in-memory store is used when absent
    #[serde(default)]
    pub database_url: Option<String>,

    /// Tenant whose graph this process serves
    #[serde(default = "Uuid::nil")]
    pub tenant_id: Uuid,

    /// Whether objects and edge types are partitioned by organization
    #[serde(default)]
    pub use_organizations: bool,

    /// The tenant's own organization; its members act across all organizations
    #[serde(default = "Uuid::nil")]
    pub company_id: Uuid,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub search: SearchConfig,
}

/// Which cache backend sits in front of the store
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheProviderKind {
    /// Process-local map
    #[default]
    Memory,
    /// Shared Redis instance
    Redis,
    /// No caching; every read goes to storage
    #[serde(rename = "none")]
    Disabled,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub provider: CacheProviderKind,

    /// Required when `provider` is `redis`
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prepended to every key, ahead of the tenant ID
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// TTL overrides in seconds; unset kinds keep their defaults
    #[serde(default)]
    pub ttl: TtlOverrides,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TtlOverrides {
    pub object_type: Option<u64>,
    pub edge_type: Option<u64>,
    pub organization: Option<u64>,
    pub object: Option<u64>,
    pub edge: Option<u64>,
    pub edge_listing: Option<u64>,
}

/// Bounds on a single graph search
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SearchConfig {
    /// Visited (object, side) states before the search gives up
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,

    /// Wall-clock budget per query in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_max_candidates() -> usize {
    60_000
}

fn default_timeout_ms() -> u64 {
    5_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            provider: CacheProviderKind::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
            ttl: TtlOverrides::default(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_candidates: default_max_candidates(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            tenant_id: Uuid::nil(),
            use_organizations: false,
            company_id: Uuid::nil(),
            cache: CacheConfig::default(),
            search: SearchConfig::default(),
        }
    }
}

impl SearchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl TtlOverrides {
    /// Apply the overrides on top of the built-in TTLs
    pub fn resolve(&self) -> CacheTtls {
        let defaults = CacheTtls::default();
        let pick = |value: Option<u64>, default: Duration| value.map(Duration::from_secs).unwrap_or(default);
        CacheTtls {
            object_type: pick(self.object_type, defaults.object_type),
            edge_type: pick(self.edge_type, defaults.edge_type),
            organization: pick(self.organization, defaults.organization),
            object: pick(self.object, defaults.object),
            edge: pick(self.edge, defaults.edge),
            edge_listing: pick(self.edge_listing, defaults.edge_listing),
        }
    }
}

impl AuthzConfig {
    /// Load from an optional file (YAML, TOML or JSON by extension) and then
    /// `AUTHZ__*` environment variables
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let config: AuthzConfig = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GraphError::ConfigError(format!("Failed to load configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.provider == CacheProviderKind::Redis && self.cache.redis_url.is_none() {
            return Err(GraphError::ConfigError(
                "cache.redis_url is required for the redis provider".to_string(),
            ));
        }
        if self.cache.key_prefix.is_empty() {
            return Err(GraphError::ConfigError("cache.key_prefix must not be empty".to_string()));
        }
        if self.search.max_candidates == 0 || self.search.timeout_ms == 0 {
            return Err(GraphError::ConfigError(
                "search.max_candidates and search.timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Cache administration from a separate process only reaches a shared
    /// provider; a process-local cache would start out empty.
    pub fn require_shared_cache(&self) -> Result<()> {
        match self.cache.provider {
            CacheProviderKind::Redis => Ok(()),
            other => Err(GraphError::ConfigError(format!(
                "cache administration needs the redis provider, configured provider is {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AuthzConfig::default();
        assert_eq!(config.search.max_candidates, 60_000);
        assert_eq!(config.search.timeout(), Duration::from_secs(5));
        assert_eq!(config.cache.key_prefix, "authz");
        assert_eq!(config.cache.ttl.resolve(), CacheTtls::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ttl_overrides_only_touch_set_kinds() {
        let overrides = TtlOverrides {
            edge: Some(30),
            ..Default::default()
        };
        let ttls = overrides.resolve();
        assert_eq!(ttls.edge, Duration::from_secs(30));
        assert_eq!(ttls.object_type, CacheTtls::default().object_type);
    }

    #[test]
    fn test_redis_provider_needs_url() {
        let mut config = AuthzConfig::default();
        config.cache.provider = CacheProviderKind::Redis;
        assert!(matches!(config.validate(), Err(GraphError::ConfigError(_))));
    }

    #[test]
    fn test_cache_administration_needs_a_shared_provider() {
        let mut config = AuthzConfig::default();
        assert!(matches!(config.require_shared_cache(), Err(GraphError::ConfigError(_))));

        config.cache.provider = CacheProviderKind::Disabled;
        assert!(matches!(config.require_shared_cache(), Err(GraphError::ConfigError(_))));

        config.cache.provider = CacheProviderKind::Redis;
        config.cache.redis_url = Some("redis://localhost:6379".to_string());
        assert!(config.require_shared_cache().is_ok());
    }

    #[test]
    fn test_yaml_document() {
        let yaml = r#"
tenant_id: 6a1f2c3e-4b5d-4e6f-8a9b-0c1d2e3f4a5b
use_organizations: true
cache:
  provider: redis
  redis_url: redis://localhost:6379
  ttl:
    edge_listing: 120
search:
  max_candidates: 1000
"#;
        let config: AuthzConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.use_organizations);
        assert_eq!(config.cache.provider, CacheProviderKind::Redis);
        assert_eq!(config.cache.ttl.resolve().edge_listing, Duration::from_secs(120));
        assert_eq!(config.search.max_candidates, 1000);
        assert_eq!(config.search.timeout_ms, 5_000);
    }
}
