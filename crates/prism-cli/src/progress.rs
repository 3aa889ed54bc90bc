//! Progress printer for interactive runs.

use std::sync::Arc;

use async_trait::async_trait;
use prism_state::{ProgressSink, ProgressUpdate, StorageResult};

/// Prints each update to stderr, then forwards it to `inner` if set.
pub struct ConsoleProgress {
    inner: Option<Arc<dyn ProgressSink>>,
}

impl ConsoleProgress {
    pub fn new(inner: Option<Arc<dyn ProgressSink>>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ProgressSink for ConsoleProgress {
    async fn publish(&self, update: ProgressUpdate) -> StorageResult<()> {
        eprintln!("{}", render_update(&update));
        match &self.inner {
            Some(inner) => inner.publish(update).await,
            None => Ok(()),
        }
    }
}

pub fn render_update(update: &ProgressUpdate) -> String {
    let scope = update.stage.as_deref().unwrap_or("run");
    format!(
        "[{:>3}%] {:<16} {:<9} {}",
        update.progress, scope, update.status, update.message
    )
}
