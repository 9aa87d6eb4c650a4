use crate::service::SlotClock;
use anyhow::Context;
use quote_consensus::{ConsensusConfig, OracleKey, Queue, QueueId};
use std::str::FromStr;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string; the cache is disabled when unset
    pub redis_url: Option<String>,

    /// Server host
    pub server_host: String,

    /// Server port
    pub server_port: u16,

    /// The queue whose oracles this service trusts
    pub queue: Queue,

    /// Consensus policy applied to every update
    pub consensus: ConsensusConfig,

    /// Derives the current slot from wall-clock time; required by
    /// `MAX_SLOT_AGE`
    pub slot_clock: Option<SlotClock>,

    /// TTL of published feed states in Redis (seconds)
    pub cache_ttl_seconds: u64,

    /// How long accepted aggregates and rejections are kept (days)
    pub history_retention_days: i64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| lookup(key).with_context(|| format!("{key} must be set"));

        let queue_id = QueueId::from_str(&required("QUEUE_ID")?).context("invalid QUEUE_ID")?;
        let oracles = required("QUEUE_ORACLES")?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| OracleKey::from_str(s).with_context(|| format!("invalid oracle key {s}")))
            .collect::<anyhow::Result<Vec<_>>>()?;
        if oracles.is_empty() {
            anyhow::bail!("QUEUE_ORACLES must list at least one oracle");
        }

        let defaults = ConsensusConfig::default();
        let consensus = ConsensusConfig {
            min_oracle_samples: parse_or(&lookup, "MIN_ORACLE_SAMPLES", defaults.min_oracle_samples)?,
            max_variance_pct: parse_or(&lookup, "MAX_VARIANCE_PCT", defaults.max_variance_pct)?,
            max_age_ms: parse_or(&lookup, "MAX_AGE_MS", defaults.max_age_ms)?,
            max_deviation_bps: parse_or(&lookup, "MAX_DEVIATION_BPS", defaults.max_deviation_bps)?,
            max_clock_skew_ms: parse_or(&lookup, "MAX_CLOCK_SKEW_MS", defaults.max_clock_skew_ms)?,
            max_slot_age: lookup("MAX_SLOT_AGE")
                .map(|v| v.parse())
                .transpose()
                .context("invalid MAX_SLOT_AGE")?,
        };
        consensus.validate()?;

        let slot_duration_ms: u64 = parse_or(&lookup, "SLOT_DURATION_MS", DEFAULT_SLOT_DURATION_MS)?;
        if slot_duration_ms == 0 {
            anyhow::bail!("SLOT_DURATION_MS must be positive");
        }
        let slot_clock = lookup("SLOT_GENESIS_MS")
            .map(|v| v.trim().parse::<u64>())
            .transpose()
            .context("invalid SLOT_GENESIS_MS")?
            .map(|genesis_ms| SlotClock {
                genesis_ms,
                slot_duration_ms,
            });
        if consensus.max_slot_age.is_some() && slot_clock.is_none() {
            anyhow::bail!("MAX_SLOT_AGE needs SLOT_GENESIS_MS to know the current slot");
        }

        Ok(Config {
            database_url: required("DATABASE_URL")?,
            redis_url: lookup("REDIS_URL").filter(|url| !url.is_empty()),
            server_host: lookup("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            server_port: parse_or(&lookup, "SERVER_PORT", 8080)?,
            queue: Queue::new(
                queue_id,
                oracles,
                parse_or(&lookup, "QUEUE_MIN_QUORUM", 1)?,
            ),
            consensus,
            slot_clock,
            cache_ttl_seconds: parse_or(&lookup, "CACHE_TTL_SECONDS", 60)?,
            history_retention_days: parse_or(&lookup, "HISTORY_RETENTION_DAYS", 30)?,
        })
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

/// Slot length of the host chain, in milliseconds
const DEFAULT_SLOT_DURATION_MS: u64 = 400;

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid {key}: {value}")),
        None => Ok(default),
    }
}
