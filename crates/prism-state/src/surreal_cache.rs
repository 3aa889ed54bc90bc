//! SurrealDB-backed AnalysisCache implementation

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::debug;

use crate::error::StorageError;
use crate::schema::CacheRow;
use crate::storage_traits::{AnalysisCache, CachedAnalysis, StorageResult};

/// Keeps one `analysis_cache` record per image reference.
#[derive(Clone)]
pub struct SurrealAnalysisCache {
    db: Surreal<Any>,
}

impl SurrealAnalysisCache {
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AnalysisCache for SurrealAnalysisCache {
    async fn get_last_known_good(&self, image_ref: &str) -> StorageResult<Option<CachedAnalysis>> {
        let mut res = self
            .db
            .query("SELECT * FROM type::thing('analysis_cache', $image)")
            .bind(("image", image_ref.to_string()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<CacheRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(rows.into_iter().next().map(CachedAnalysis::from))
    }

    async fn put_last_known_good(
        &self,
        image_ref: &str,
        analysis: serde_json::Value,
    ) -> StorageResult<()> {
        debug!(image_ref, "storing last-known-good analysis");

        self.db
            .query("UPSERT type::thing('analysis_cache', $image) CONTENT $row")
            .bind(("image", image_ref.to_string()))
            .bind(("row", CacheRow::new(image_ref.to_string(), analysis)))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .check()
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(())
    }
}
