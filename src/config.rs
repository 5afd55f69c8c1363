use crate::evaluator::EvaluationMode;
use crate::resilience::{BreakerConfig, FailurePolicy, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// Serialize Duration as whole seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Serialize Duration as whole milliseconds, for backoff-scale values.
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Process-wide decision cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            capacity: 10_000,
        }
    }
}

/// Durable outbox settings for tuple synchronization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxConfig {
    pub enabled: bool,
    /// Attempts before an entry is parked as dead for manual repair.
    pub retry_ceiling: u32,
    #[serde(with = "duration_millis")]
    pub drain_interval: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            retry_ceiling: 8,
            drain_interval: Duration::from_millis(500),
        }
    }
}

/// Accessible-by planner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Page ceiling for reverse lookups; a query needing more pages is a
    /// modelling problem, not a paging problem.
    pub max_lookup_pages: u32,
    /// Direct pushdown is abandoned for lookup above this many
    /// predicate clauses.
    pub direct_clause_limit: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_lookup_pages: 50,
            direct_clause_limit: 8,
        }
    }
}

/// Top-level configuration for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RebacConfig {
    pub mode: EvaluationMode,
    pub failure_policy: FailurePolicy,
    pub read_retry: RetryPolicy,
    pub write_retry: RetryPolicy,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub outbox: OutboxConfig,
    pub planner: PlannerConfig,
}
