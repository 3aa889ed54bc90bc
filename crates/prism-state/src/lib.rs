//! Prism-State: shared stores for the Prism analysis pipeline
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: state that must be consistent across pipeline processes.
//!
//! ## Key Components
//!
//! - `HealthStore`: circuit breaker state with atomic increments and CAS
//! - `ProgressSink`: run progress updates
//! - `AnalysisCache`: last-known-good analysis per image
//! - `StoreHandle`: SurrealDB connection that hands out all three
//!
//! In-memory fakes live in [`fakes`].

mod error;
pub mod fakes;
mod handle;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_cache;
pub mod surreal_health;
pub mod surreal_progress;

pub use error::{StateError, StorageError};
pub use handle::{RemoteCredentials, StoreHandle, StoreTarget};
pub use storage_traits::{
    AnalysisCache, BreakerState, CachedAnalysis, HealthStore, ProgressSink, ProgressUpdate,
    ProviderHealth, StorageResult,
};
pub use surreal_cache::SurrealAnalysisCache;
pub use surreal_health::SurrealHealthStore;
pub use surreal_progress::SurrealProgressStore;

/// Result type for prism-state connection operations
pub type Result<T> = std::result::Result<T, StateError>;
