use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

/// Without a URL the API runs on the in-memory store.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct RedisConfig {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,
    #[serde(default)]
    pub refresh_baseline: bool,
    #[serde(default = "default_discriminating_keys")]
    pub discriminating_keys: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            debounce_ms: default_debounce_ms(),
            cache_ttl_seconds: default_cache_ttl(),
            refresh_baseline: false,
            discriminating_keys: default_discriminating_keys(),
        }
    }
}

fn default_batch_size() -> usize { 5 }

fn default_debounce_ms() -> u64 { 800 }

fn default_cache_ttl() -> u64 { 30 }

fn default_discriminating_keys() -> Vec<String> {
    vec!["type".to_string(), "density".to_string()]
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // optional per-environment overrides
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // never checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. `TIERMATRIX__ENGINE__BATCH_SIZE=10`
            .add_source(config::Environment::with_prefix("TIERMATRIX").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
