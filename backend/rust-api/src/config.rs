use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::services::interaction::ScoringPolicy;
use crate::utils::retry::RetryConfig;

/// Where sessions, commands and the change feed live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteBackend {
    Redis,
    Memory,
}

impl RemoteBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoteBackend::Redis => "redis",
            RemoteBackend::Memory => "memory",
        }
    }
}

impl FromStr for RemoteBackend {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "redis" => Ok(RemoteBackend::Redis),
            "memory" => Ok(RemoteBackend::Memory),
            other => Err(format!("Invalid remote backend: {}", other)),
        }
    }
}

/// Phase timer durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PlayTimings {
    pub countdown_steps: u8,
    pub countdown_step_ms: u64,
    pub countdown_go_ms: u64,
    pub soft_lock_grace_ms: u64,
    pub skip_display_ms: u64,
    pub auto_advance_default_ms: u64,
}

impl Default for PlayTimings {
    fn default() -> Self {
        Self {
            countdown_steps: 3,
            countdown_step_ms: 1000,
            countdown_go_ms: 800,
            soft_lock_grace_ms: 3000,
            skip_display_ms: 2000,
            auto_advance_default_ms: 5000,
        }
    }
}

/// Backoff used for resync fetches and change-feed reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FeedRetry {
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for FeedRetry {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_backoff_ms: 100,
            max_backoff_ms: 5000,
        }
    }
}

impl FeedRetry {
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            jitter_max: Some(Duration::from_millis(self.base_backoff_ms / 2)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub mongo_uri: String,
    pub redis_uri: String,
    pub mongo_database: String,
    pub remote_backend: RemoteBackend,
    pub timings: PlayTimings,
    pub scoring: ScoringPolicy,
    pub feed_retry: FeedRetry,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Load environment variables from root .env file (two levels up)
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        // Determine environment (defaults to dev)
        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // Build configuration from config/*.toml + ENV overrides
        let config_builder = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        let settings = config_builder.build()?;

        let listen_addr = settings
            .get_string("server.listen_addr")
            .or_else(|_| env::var("LISTEN_ADDR"))
            .unwrap_or_else(|_| "0.0.0.0:8081".to_string());

        let remote_backend = settings
            .get_string("remote.backend")
            .or_else(|_| env::var("REMOTE_BACKEND"))
            .unwrap_or_else(|_| "redis".to_string())
            .parse::<RemoteBackend>()
            .map_err(config::ConfigError::Message)?;

        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());

        let redis_uri = settings
            .get_string("redis.uri")
            .or_else(|_| env::var("REDIS_URI"))
            .unwrap_or_else(|_| {
                let host = env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
                let port = env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
                format!("redis://{}:{}/0", host, port)
            });

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or_else(|_| "lessonplay".to_string());

        let timings = settings
            .get::<PlayTimings>("timings")
            .unwrap_or_default();

        let scoring = ScoringPolicy {
            max_score: settings
                .get_int("scoring.max_score")
                .ok()
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(100),
            penalty_per_attempt: settings
                .get_int("scoring.penalty_per_attempt")
                .ok()
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(50),
        };

        let feed_retry = settings
            .get::<FeedRetry>("feed_retry")
            .unwrap_or_default();

        if env == "prod" && remote_backend == RemoteBackend::Memory {
            eprintln!("WARNING: In-memory remote backend selected in production");
        }

        Ok(Config {
            listen_addr,
            mongo_uri,
            redis_uri,
            mongo_database,
            remote_backend,
            timings,
            scoring,
            feed_retry,
        })
    }

    /// In-memory configuration with default timings.
    pub fn for_tests() -> Self {
        Config {
            listen_addr: "127.0.0.1:0".to_string(),
            mongo_uri: "mongodb://localhost:27017".to_string(),
            redis_uri: "redis://127.0.0.1:6379/0".to_string(),
            mongo_database: "lessonplay_test".to_string(),
            remote_backend: RemoteBackend::Memory,
            timings: PlayTimings::default(),
            scoring: ScoringPolicy::default(),
            feed_retry: FeedRetry {
                max_attempts: 3,
                base_backoff_ms: 10,
                max_backoff_ms: 50,
            },
        }
    }
}
