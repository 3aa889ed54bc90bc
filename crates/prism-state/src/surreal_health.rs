//! SurrealDB-backed HealthStore implementation
//!
//! Each provider has one `provider_health` record whose id is the provider
//! name. Increment and reset are single `UPSERT` statements, and
//! compare-and-swap is an `UPDATE ... WHERE version = $expected`, so racing
//! processes never lose an update.

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::debug;

use crate::error::StorageError;
use crate::schema::HealthRow;
use crate::storage_traits::{HealthStore, ProviderHealth, StorageResult};

/// SurrealDB-backed implementation of [`HealthStore`].
#[derive(Clone)]
pub struct SurrealHealthStore {
    db: Surreal<Any>,
}

impl SurrealHealthStore {
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    fn single(rows: Vec<HealthRow>, provider: &str) -> StorageResult<ProviderHealth> {
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::NotFound {
                key: provider.to_string(),
            })?
            .into_health()
    }
}

#[async_trait]
impl HealthStore for SurrealHealthStore {
    async fn get(&self, provider: &str) -> StorageResult<Option<ProviderHealth>> {
        let mut res = self
            .db
            .query("SELECT * FROM type::thing('provider_health', $provider)")
            .bind(("provider", provider.to_string()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<HealthRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter().next().map(HealthRow::into_health).transpose()
    }

    async fn increment_failures(
        &self,
        provider: &str,
        now_ms: i64,
        window_ms: u64,
        base_cooldown_ms: u64,
    ) -> StorageResult<ProviderHealth> {
        let window_floor = now_ms.saturating_sub(window_ms as i64);
        debug!(provider, window_floor, "incrementing provider failures");

        // SET clauses run in order: the streak count reads the old window.
        let sql = r#"
            UPSERT type::thing('provider_health', $provider) SET
                provider = $provider,
                state = state OR 'closed',
                cooldown_ms = cooldown_ms OR $base_cooldown,
                consecutive_failures = IF !window_started_at_ms OR window_started_at_ms < $window_floor
                    THEN 1 ELSE consecutive_failures + 1 END,
                window_started_at_ms = IF !window_started_at_ms OR window_started_at_ms < $window_floor
                    THEN $now ELSE window_started_at_ms END,
                version = (version OR 0) + 1
            RETURN AFTER
        "#;

        let mut res = self
            .db
            .query(sql)
            .bind(("provider", provider.to_string()))
            .bind(("base_cooldown", base_cooldown_ms))
            .bind(("window_floor", window_floor))
            .bind(("now", now_ms))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<HealthRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Self::single(rows, provider)
    }

    async fn reset(&self, provider: &str, base_cooldown_ms: u64) -> StorageResult<ProviderHealth> {
        debug!(provider, "resetting provider health");

        let sql = r#"
            UPSERT type::thing('provider_health', $provider) SET
                provider = $provider,
                state = 'closed',
                consecutive_failures = 0,
                window_started_at_ms = NONE,
                opened_at_ms = NONE,
                cooldown_ms = $base_cooldown,
                trial_started_at_ms = NONE,
                version = (version OR 0) + 1
            RETURN AFTER
        "#;

        let mut res = self
            .db
            .query(sql)
            .bind(("provider", provider.to_string()))
            .bind(("base_cooldown", base_cooldown_ms))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<HealthRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Self::single(rows, provider)
    }

    async fn compare_and_swap(
        &self,
        expected_version: u64,
        next: ProviderHealth,
    ) -> StorageResult<bool> {
        let provider = next.provider.clone();
        let mut row = HealthRow::from(next);
        row.version = expected_version + 1;

        let mut res = self
            .db
            .query(
                "UPDATE type::thing('provider_health', $provider) MERGE $row \
                 WHERE version = $expected RETURN AFTER",
            )
            .bind(("provider", provider.clone()))
            .bind(("row", row))
            .bind(("expected", expected_version))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<HealthRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let swapped = !rows.is_empty();
        debug!(provider = %provider, expected_version, swapped, "health compare-and-swap");
        Ok(swapped)
    }

    async fn list(&self) -> StorageResult<Vec<ProviderHealth>> {
        let mut res = self
            .db
            .query("SELECT * FROM provider_health ORDER BY provider ASC")
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<HealthRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter().map(HealthRow::into_health).collect()
    }
}
