//! SurrealDB schema initialization
//!
//! Sets up the Prism tables and indexes. Safe to call on every connection
//! (all definitions are idempotent).

use crate::error::StateError;
use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all Prism tables in SurrealDB.
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing Prism SurrealDB schema");

    init_provider_health_table(db).await?;
    init_progress_table(db).await?;
    init_cache_table(db).await?;

    info!("Prism schema initialization complete");
    Ok(())
}

/// `provider_health`: one row per provider, record id = provider name.
///
/// ```text
/// TABLE provider_health {
///   provider:              STRING (unique)
///   state:                 STRING (closed | open | half-open)
///   consecutive_failures:  INT
///   window_started_at_ms:  INT?
///   opened_at_ms:          INT?
///   cooldown_ms:           INT
///   trial_started_at_ms:   INT?
///   version:               INT (CAS token)
/// }
/// ```
async fn init_provider_health_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing provider_health table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS provider_health SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_provider ON TABLE provider_health COLUMNS provider UNIQUE;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StateError::SchemaSetup(format!("provider_health: {e}")))?;
    Ok(())
}

/// `analysis_progress`: append-only progress updates per run.
async fn init_progress_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing analysis_progress table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS analysis_progress SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_progress_run ON TABLE analysis_progress COLUMNS run_id;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StateError::SchemaSetup(format!("analysis_progress: {e}")))?;
    Ok(())
}

/// `analysis_cache`: last-known-good analysis, record id = image reference.
async fn init_cache_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing analysis_cache table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS analysis_cache SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_cache_image ON TABLE analysis_cache COLUMNS image_ref UNIQUE;
    "#;

    db.query(sql)
        .await
        .map_err(|e| StateError::SchemaSetup(format!("analysis_cache: {e}")))?;
    Ok(())
}
