//! Configuration management

use std::{collections::BTreeMap, net::IpAddr, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Cache configuration
    pub cache: CacheConfig,
    /// Rate limiting and abuse guard configuration
    pub security: SecurityConfig,
    /// Market feed cache lifetimes
    pub feed: FeedConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Reverse proxies whose `X-Forwarded-For` / `X-Real-IP` headers name
    /// the client. Empty: clients are keyed by their TCP peer address.
    pub trusted_proxies: Vec<IpAddr>,
    /// Mount `GET /api/security/blocks`, which lists blocked client addresses
    pub expose_blocks: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5000,
            shutdown_timeout: Duration::from_secs(30),
            trusted_proxies: Vec::new(),
            expose_blocks: false,
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries before the oldest insertion is evicted
    pub capacity: usize,
    /// TTL used when a caller does not supply one
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// Period of the background expiry sweep
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            default_ttl: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Quota for one protected endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPolicy {
    /// Length of the fixed window
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Requests admitted per window
    pub max_requests: u32,
    /// Message returned with a rejection
    pub message: String,
}

impl EndpointPolicy {
    /// Create a policy
    pub fn new(window: Duration, max_requests: u32, message: impl Into<String>) -> Self {
        Self {
            window,
            max_requests,
            message: message.into(),
        }
    }
}

/// Rate limiting and abuse guard configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Policies keyed by endpoint identifier (e.g. `/api/trade`)
    pub rate_limits: BTreeMap<String, EndpointPolicy>,
    /// Recent suspicious events that trigger a block
    pub suspicious_threshold: usize,
    /// How long a block lasts; also the retention of the activity log
    #[serde(with = "humantime_serde")]
    pub block_duration: Duration,
    /// Message returned to blocked clients
    pub block_message: String,
    /// Period of the background counter/log sweep
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            rate_limits: default_rate_limits(),
            suspicious_threshold: 5,
            block_duration: Duration::from_secs(15 * 60),
            block_message: "Your IP has been temporarily blocked due to suspicious activity."
                .to_string(),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

fn default_rate_limits() -> BTreeMap<String, EndpointPolicy> {
    let minute = Duration::from_secs(60);
    BTreeMap::from([
        (
            "/api/crypto-data".to_string(),
            EndpointPolicy::new(
                minute,
                100,
                "Too many requests to crypto data API, please slow down.",
            ),
        ),
        (
            "/api/gemini".to_string(),
            EndpointPolicy::new(
                minute,
                50,
                "Too many requests to AI service, please slow down.",
            ),
        ),
        (
            "/api/trade".to_string(),
            EndpointPolicy::new(minute, 10, "Too many trade requests, please slow down."),
        ),
        (
            "/api/auth".to_string(),
            EndpointPolicy::new(
                minute,
                5,
                "Too many authentication attempts, please try again later.",
            ),
        ),
    ])
}

/// Cache lifetimes for the market feed datasets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Top coins by market cap
    #[serde(with = "humantime_serde")]
    pub top_coins_ttl: Duration,
    /// News headlines
    #[serde(with = "humantime_serde")]
    pub news_ttl: Duration,
    /// Price history of a coin
    #[serde(with = "humantime_serde")]
    pub coin_history_ttl: Duration,
    /// Long-form coin description
    #[serde(with = "humantime_serde")]
    pub coin_description_ttl: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            top_coins_ttl: Duration::from_secs(5 * 60),
            news_ttl: Duration::from_secs(10 * 60),
            coin_history_ttl: Duration::from_secs(30 * 60),
            coin_description_ttl: Duration::from_secs(60 * 60),
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional YAML file and the
    /// environment (`TRADESIM_` prefix, `__` for nesting).
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or describes an unusable configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("TRADESIM_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.validate()?;

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("Failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Reject configurations the cache or the guard cannot honour
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.cache.capacity == 0 {
            return Err(Error::Config("cache.capacity must be > 0".to_string()));
        }
        if self.cache.sweep_interval.is_zero() {
            return Err(Error::Config("cache.sweep_interval must be > 0".to_string()));
        }
        if self.security.suspicious_threshold == 0 {
            return Err(Error::Config(
                "security.suspicious_threshold must be > 0".to_string(),
            ));
        }
        if self.security.block_duration.is_zero() {
            return Err(Error::Config(
                "security.block_duration must be > 0".to_string(),
            ));
        }
        if self.security.sweep_interval.is_zero() {
            return Err(Error::Config(
                "security.sweep_interval must be > 0".to_string(),
            ));
        }
        for (endpoint, policy) in &self.security.rate_limits {
            if policy.max_requests == 0 {
                return Err(Error::Config(format!(
                    "security.rate_limits.{endpoint}.max_requests must be > 0"
                )));
            }
            if policy.window.is_zero() {
                return Err(Error::Config(format!(
                    "security.rate_limits.{endpoint}.window must be > 0"
                )));
            }
        }
        Ok(())
    }

    /// Render the effective configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn defaults_match_observed_constants() {
        let config = Config::default();
        assert_eq!(config.cache.capacity, 1000);
        assert_eq!(config.cache.default_ttl, Duration::from_secs(300));
        assert_eq!(config.cache.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.security.suspicious_threshold, 5);
        assert_eq!(config.security.block_duration, Duration::from_secs(900));
        assert_eq!(config.security.rate_limits["/api/trade"].max_requests, 10);
        assert_eq!(config.security.rate_limits["/api/auth"].max_requests, 5);
        assert_eq!(config.feed.coin_description_ttl, Duration::from_secs(3600));
        config.validate().unwrap();
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let config = Config::load(None).unwrap();
        assert_eq!(config.security.rate_limits.len(), 4);
    }

    #[test]
    fn load_missing_file_is_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/tradesim.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn yaml_overrides_merge_with_default_policies() {
        let file = write_config(
            r#"
cache:
  capacity: 50
  default_ttl: 2m
security:
  block_duration: 5m
  rate_limits:
    /api/trade:
      window: 30s
      max_requests: 3
      message: "slow down"
    /api/orders:
      window: 1m
      max_requests: 20
      message: "too many orders"
"#,
        );

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.cache.capacity, 50);
        assert_eq!(config.cache.default_ttl, Duration::from_secs(120));
        assert_eq!(config.security.block_duration, Duration::from_secs(300));

        let trade = &config.security.rate_limits["/api/trade"];
        assert_eq!(trade.window, Duration::from_secs(30));
        assert_eq!(trade.max_requests, 3);
        assert_eq!(trade.message, "slow down");
        assert!(config.security.rate_limits.contains_key("/api/orders"));
        assert!(config.security.rate_limits.contains_key("/api/auth"));
    }

    #[test]
    fn forwarded_headers_untrusted_by_default() {
        let config = Config::default();
        assert!(config.server.trusted_proxies.is_empty());
        assert!(!config.server.expose_blocks);

        let file = write_config("server:\n  trusted_proxies: [\"10.0.0.1\", \"::1\"]\n");
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(
            config.server.trusted_proxies,
            vec![
                "10.0.0.1".parse::<IpAddr>().unwrap(),
                "::1".parse::<IpAddr>().unwrap()
            ]
        );
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let file = write_config("cache:\n  capacity: 0\n");
        let err = Config::load(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("cache.capacity"));
    }

    #[test]
    fn zero_max_requests_is_rejected() {
        let mut config = Config::default();
        config.security.rate_limits.insert(
            "/api/broken".to_string(),
            EndpointPolicy::new(Duration::from_secs(60), 0, "never"),
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("/api/broken"));
    }

    #[test]
    fn yaml_round_trips_through_loader() {
        let yaml = Config::default().to_yaml().unwrap();
        assert!(yaml.contains("block_duration: 15m"));
        let file = write_config(&yaml);
        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.security.block_duration, Duration::from_secs(900));
    }
}
