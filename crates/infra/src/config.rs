//! Configuration loading.
//!
//! Sources, later ones overriding earlier ones:
//! 1. defaults in code
//! 2. optional file `config/stockledger.{toml,yaml,json,...}`
//! 3. environment variables with the `STOCKLEDGER__` prefix, `__` separating
//!    nested keys (e.g. `STOCKLEDGER__RETRY__MAX_ATTEMPTS=5`)
//!
//! [`LedgerConfig::ledger`] wires a [`Ledger`] from the loaded values.

use std::sync::Arc;
use std::time::Duration;

use config::{ConfigError, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use stockledger_observability::ObservabilityConfig;

use crate::Ledger;
use crate::ledger::{BackoffStrategy, NoopSink, RetryPolicy, StockEventSink};
use crate::store::{InMemoryLedgerStore, LedgerStore, PostgresLedgerStore, StoreError};

const CONFIG_FILE: &str = "config/stockledger";
const ENV_PREFIX: &str = "STOCKLEDGER";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LedgerConfig {
    /// Longest wait for a row lock before the unit of work fails.
    pub lock_timeout_ms: u64,
    pub retry: RetryConfig,
    pub database: DatabaseConfig,
    pub events: EventsConfig,
    #[serde(default)]
    pub log: ObservabilityConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub strategy: BackoffStrategy,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; the in-memory store is used when unset.
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EventsConfig {
    /// Redis URL for stock-changed publication; events are dropped when unset.
    pub redis_url: Option<String>,
    /// Channel prefix; each tenant publishes on `<channel>.<tenant_id>`.
    pub channel: String,
}

/// Failure to build a ledger component from configuration.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("event bus: {0}")]
    Events(String),
}

impl LedgerConfig {
    /// Load configuration from defaults, the optional file and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(CONFIG_FILE, ENV_PREFIX)
    }

    fn load_from(file: &str, env_prefix: &str) -> Result<Self, ConfigError> {
        let config = config::Config::builder()
            .set_default("lock_timeout_ms", 2000)?
            .set_default("retry.max_attempts", 3)?
            .set_default("retry.base_delay_ms", 25)?
            .set_default("retry.max_delay_ms", 500)?
            .set_default("retry.strategy", "exponential")?
            .set_default("database.max_connections", 10)?
            .set_default("events.channel", "stock.changed")?
            .set_default("log.json", true)?
            .set_default("log.filter", "info")?
            .add_source(File::with_name(file).required(false))
            .add_source(
                Environment::with_prefix(env_prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            strategy: self.retry.strategy,
        }
    }

    /// Postgres store when `database.url` is set (schema applied), in-memory
    /// store otherwise.
    pub async fn store(&self) -> Result<Arc<dyn LedgerStore>, SetupError> {
        let Some(url) = self.database.url.as_deref() else {
            warn!("database.url is not set; using the in-memory store");
            return Ok(Arc::new(InMemoryLedgerStore::with_lock_timeout(
                self.lock_timeout(),
            )));
        };
        let store =
            PostgresLedgerStore::connect(url, self.database.max_connections, self.lock_timeout())
                .await?;
        store.migrate().await?;
        info!(max_connections = self.database.max_connections, "postgres store ready");
        Ok(Arc::new(store))
    }

    /// Redis publisher when `events.redis_url` is set, [`NoopSink`] otherwise.
    pub fn sink(&self) -> Result<Arc<dyn StockEventSink>, SetupError> {
        match self.events.redis_url.as_deref() {
            Some(url) => redis_sink(url, &self.events.channel),
            None => Ok(Arc::new(NoopSink)),
        }
    }

    /// Store, sink and retry policy assembled into a ledger.
    pub async fn ledger(&self) -> Result<Ledger, SetupError> {
        let ledger = Ledger::new(self.store().await?, self.sink()?);
        Ok(ledger.with_retry(self.retry_policy()))
    }
}

#[cfg(feature = "redis")]
fn redis_sink(url: &str, channel: &str) -> Result<Arc<dyn StockEventSink>, SetupError> {
    use crate::event_bus::RedisStockBus;
    use crate::ledger::BusSink;

    let bus = RedisStockBus::new(url, channel).map_err(|e| SetupError::Events(e.to_string()))?;
    info!(channel, "publishing stock changes to redis");
    Ok(Arc::new(BusSink::new(bus)))
}

#[cfg(not(feature = "redis"))]
fn redis_sink(_url: &str, _channel: &str) -> Result<Arc<dyn StockEventSink>, SetupError> {
    Err(SetupError::Events(
        "events.redis_url is set but the `redis` feature is disabled".to_string(),
    ))
}
