//! SurrealDB-backed ProgressSink implementation

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::debug;

use crate::error::StorageError;
use crate::schema::ProgressRow;
use crate::storage_traits::{ProgressSink, ProgressUpdate, StorageResult};

/// Appends every update to the `analysis_progress` table.
#[derive(Clone)]
pub struct SurrealProgressStore {
    db: Surreal<Any>,
}

impl SurrealProgressStore {
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    /// Updates recorded for a run, oldest first.
    pub async fn history(&self, run_id: &str) -> StorageResult<Vec<ProgressUpdate>> {
        let mut res = self
            .db
            .query("SELECT * FROM analysis_progress WHERE run_id = $rid ORDER BY emitted_at ASC")
            .bind(("rid", run_id.to_string()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<ProgressRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(rows.into_iter().map(ProgressUpdate::from).collect())
    }
}

#[async_trait]
impl ProgressSink for SurrealProgressStore {
    async fn publish(&self, update: ProgressUpdate) -> StorageResult<()> {
        debug!(run_id = %update.run_id, status = %update.status, "persisting progress update");

        let _created: Option<ProgressRow> = self
            .db
            .create("analysis_progress")
            .content(ProgressRow::from(update))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(())
    }
}
