//! Row definitions for the Prism SurrealDB tables
//!
//! Tables:
//! - provider_health: circuit breaker state, one row per provider
//! - analysis_progress: append-only run progress updates
//! - analysis_cache: last-known-good analysis per image reference
//!
//! Rows convert to and from the `storage_traits` types at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{
    BreakerState, CachedAnalysis, ProgressUpdate, ProviderHealth, StorageResult,
};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

// ---------------------------------------------------------------------------
// provider_health
// ---------------------------------------------------------------------------

/// Breaker state row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRow {
    /// SurrealDB record ID (`provider_health:<provider>`)
    #[serde(default, skip_serializing)]
    pub id: Option<surrealdb::sql::Thing>,
    pub provider: String,
    /// "closed" | "open" | "half-open"
    pub state: String,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub window_started_at_ms: Option<i64>,
    #[serde(default)]
    pub opened_at_ms: Option<i64>,
    pub cooldown_ms: u64,
    #[serde(default)]
    pub trial_started_at_ms: Option<i64>,
    pub version: u64,
}

impl From<ProviderHealth> for HealthRow {
    fn from(h: ProviderHealth) -> Self {
        HealthRow {
            id: None,
            provider: h.provider,
            state: h.state.as_str().to_string(),
            consecutive_failures: h.consecutive_failures,
            window_started_at_ms: h.window_started_at_ms,
            opened_at_ms: h.opened_at_ms,
            cooldown_ms: h.cooldown_ms,
            trial_started_at_ms: h.trial_started_at_ms,
            version: h.version,
        }
    }
}

impl HealthRow {
    /// Convert back into the trait type, rejecting unknown states.
    pub fn into_health(self) -> StorageResult<ProviderHealth> {
        let state =
            BreakerState::parse(&self.state).ok_or_else(|| StorageError::InvalidRecord {
                key: self.provider.clone(),
                reason: format!("unknown breaker state '{}'", self.state),
            })?;
        Ok(ProviderHealth {
            provider: self.provider,
            state,
            consecutive_failures: self.consecutive_failures,
            window_started_at_ms: self.window_started_at_ms,
            opened_at_ms: self.opened_at_ms,
            cooldown_ms: self.cooldown_ms,
            trial_started_at_ms: self.trial_started_at_ms,
            version: self.version,
        })
    }
}

// ---------------------------------------------------------------------------
// analysis_progress
// ---------------------------------------------------------------------------

/// Progress update row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressRow {
    #[serde(default, skip_serializing)]
    pub id: Option<surrealdb::sql::Thing>,
    pub run_id: String,
    #[serde(default)]
    pub stage: Option<String>,
    pub status: String,
    pub progress: u8,
    pub message: String,
    pub metadata: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    pub emitted_at: DateTime<Utc>,
}

impl From<ProgressUpdate> for ProgressRow {
    fn from(u: ProgressUpdate) -> Self {
        ProgressRow {
            id: None,
            run_id: u.run_id,
            stage: u.stage,
            status: u.status,
            progress: u.progress,
            message: u.message,
            metadata: u.metadata,
            emitted_at: u.emitted_at,
        }
    }
}

impl From<ProgressRow> for ProgressUpdate {
    fn from(r: ProgressRow) -> Self {
        ProgressUpdate {
            run_id: r.run_id,
            stage: r.stage,
            status: r.status,
            progress: r.progress,
            message: r.message,
            metadata: r.metadata,
            emitted_at: r.emitted_at,
        }
    }
}

// ---------------------------------------------------------------------------
// analysis_cache
// ---------------------------------------------------------------------------

/// Cached analysis row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRow {
    #[serde(default, skip_serializing)]
    pub id: Option<surrealdb::sql::Thing>,
    pub image_ref: String,
    pub analysis: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    pub stored_at: DateTime<Utc>,
}

impl CacheRow {
    pub fn new(image_ref: String, analysis: serde_json::Value) -> Self {
        CacheRow {
            id: None,
            image_ref,
            analysis,
            stored_at: Utc::now(),
        }
    }
}

impl From<CacheRow> for CachedAnalysis {
    fn from(r: CacheRow) -> Self {
        CachedAnalysis {
            image_ref: r.image_ref,
            analysis: r.analysis,
            stored_at: r.stored_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_row_conversion() {
        let mut health = ProviderHealth::closed("vision", 30_000);
        health.state = BreakerState::HalfOpen;
        health.version = 7;

        let row = HealthRow::from(health.clone());
        assert_eq!(row.state, "half-open");
        assert_eq!(row.into_health().unwrap(), health);
    }

    #[test]
    fn test_health_row_rejects_unknown_state() {
        let mut row = HealthRow::from(ProviderHealth::closed("vision", 30_000));
        row.state = "ajar".to_string();

        let err = row.into_health().unwrap_err();
        assert!(matches!(err, StorageError::InvalidRecord { .. }));
    }

    #[test]
    fn test_health_row_skips_id_on_serialize() {
        let row = HealthRow::from(ProviderHealth::closed("vision", 30_000));
        let json = serde_json::to_value(&row).unwrap();
        assert!(json.get("id").is_none());
        assert_eq!(json["provider"], "vision");
    }
}
