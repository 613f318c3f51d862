//! Environment-first server configuration.
//!
//! Config-file loading is deliberately out of scope; everything resolves
//! from `MAESTRO_*` environment variables with compiled defaults.

use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

use maestro_core::oracle::SpawnTriggers;
use maestro_core::queue::QueueConfig;
use maestro_db::config::DbConfig;

/// Optional LLM provider settings; both URL and model must be present.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: String,
}

/// Resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db: DbConfig,
    pub bind: String,
    pub port: u16,
    pub queue: QueueConfig,
    pub triggers: SpawnTriggers,
    pub llm: Option<LlmConfig>,
    /// Binary the worker runtime launches for each agent session.
    pub worker_binary: String,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        let queue = QueueConfig {
            max_queue_size: env_parse("MAESTRO_MAX_QUEUE_SIZE", 1_000usize)?,
            ..QueueConfig::default()
        };

        let triggers = SpawnTriggers {
            queue_growth_rate: env_parse("MAESTRO_SPAWN_GROWTH_RATE", 5.0f64)?,
            queue_depth_threshold: env_parse("MAESTRO_SPAWN_DEPTH_THRESHOLD", 5usize)?,
            idle_agent_minimum: env_parse("MAESTRO_SPAWN_IDLE_MINIMUM", 1usize)?,
            task_complexity_backlog: env_parse("MAESTRO_SPAWN_COMPLEXITY_BACKLOG", 3usize)?,
        };

        let llm = match (env::var("MAESTRO_LLM_URL"), env::var("MAESTRO_LLM_MODEL")) {
            (Ok(base_url), Ok(model)) => Some(LlmConfig {
                base_url,
                model,
                api_key: env::var("MAESTRO_LLM_API_KEY").unwrap_or_default(),
            }),
            _ => None,
        };

        Ok(Self {
            db: DbConfig::from_env(),
            bind: env::var("MAESTRO_BIND").unwrap_or_else(|_| "127.0.0.1".to_owned()),
            port: env_parse("MAESTRO_PORT", 7600u16)?,
            queue,
            triggers,
            llm,
            worker_binary: env::var("MAESTRO_WORKER_BIN").unwrap_or_else(|_| "claude".to_owned()),
        })
    }

    /// Timeout enforcer period, overridable for tests and slow fleets.
    pub fn timeout_check_interval() -> Result<Duration> {
        let ms = env_parse("MAESTRO_TIMEOUT_CHECK_INTERVAL_MS", 5_000u64)?;
        Ok(Duration::from_millis(ms))
    }
}
