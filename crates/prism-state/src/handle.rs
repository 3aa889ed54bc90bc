//! SurrealDB connection shared by the Surreal-backed stores.
//!
//! Every Prism process that should see the same breaker state must resolve
//! to the same [`StoreTarget`]. One handle hands out all three stores over a
//! single connection.

use std::path::PathBuf;

use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::info;

use crate::error::StateError;
use crate::migrations;
use crate::surreal_cache::SurrealAnalysisCache;
use crate::surreal_health::SurrealHealthStore;
use crate::surreal_progress::SurrealProgressStore;
use crate::Result;

const DEFAULT_NAMESPACE: &str = "prism";
const DEFAULT_DATABASE: &str = "main";
const LOCAL_DB_PATH: &str = ".prism/db";

/// Signed-in connection to a hosted SurrealDB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCredentials {
    /// WebSocket endpoint, e.g. `wss://db.example.com`.
    pub endpoint: String,
    pub username: String,
    pub password: String,
    pub namespace: String,
    pub database: String,
    /// Sign in as root instead of a database user.
    pub is_root: bool,
}

/// Where the shared Prism state lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreTarget {
    Remote(RemoteCredentials),
    /// Any URL the `Any` engine accepts (`mem://`, `ws://`, `surrealkv://`).
    Url(String),
    /// On-disk surrealkv directory.
    Local(PathBuf),
}

impl StoreTarget {
    /// Pick a target from environment lookups.
    ///
    /// `SURREALDB_ENDPOINT`, `SURREALDB_USERNAME` and `SURREALDB_PASSWORD`
    /// together select a remote target (`SURREALDB_NAMESPACE`,
    /// `SURREALDB_DATABASE` and `SURREALDB_ROOT` are optional). Failing that,
    /// `SURREALDB_URL`; failing that, `.prism/db` on disk.
    pub fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let remote = (|| {
            Some(RemoteCredentials {
                endpoint: lookup("SURREALDB_ENDPOINT")?,
                username: lookup("SURREALDB_USERNAME")?,
                password: lookup("SURREALDB_PASSWORD")?,
                namespace: lookup("SURREALDB_NAMESPACE")
                    .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
                database: lookup("SURREALDB_DATABASE")
                    .unwrap_or_else(|| DEFAULT_DATABASE.to_string()),
                is_root: lookup("SURREALDB_ROOT")
                    .is_some_and(|v| v.eq_ignore_ascii_case("true")),
            })
        })();

        match (remote, lookup("SURREALDB_URL")) {
            (Some(credentials), _) => StoreTarget::Remote(credentials),
            (None, Some(url)) => StoreTarget::Url(url),
            (None, None) => StoreTarget::Local(PathBuf::from(LOCAL_DB_PATH)),
        }
    }

    /// [`StoreTarget::resolve`] over the process environment.
    pub fn from_env() -> Self {
        Self::resolve(|key| std::env::var(key).ok())
    }

    fn describe(&self) -> String {
        match self {
            StoreTarget::Remote(c) => format!("{} ({}/{})", c.endpoint, c.namespace, c.database),
            StoreTarget::Url(url) => url.clone(),
            StoreTarget::Local(path) => format!("surrealkv://{}", path.display()),
        }
    }
}

/// Connection to the shared Prism state.
#[derive(Clone)]
pub struct StoreHandle {
    db: Surreal<Any>,
}

impl StoreHandle {
    /// Fresh `mem://` database with the schema applied. For tests.
    pub async fn in_memory() -> Result<Self> {
        Self::connect(&StoreTarget::Url("mem://".to_string())).await
    }

    /// Connect to whatever the environment points at.
    pub async fn from_env() -> Result<Self> {
        Self::connect(&StoreTarget::from_env()).await
    }

    pub async fn connect(target: &StoreTarget) -> Result<Self> {
        let db = match target {
            StoreTarget::Remote(credentials) => open_remote(credentials).await?,
            StoreTarget::Url(url) => open_url(url).await?,
            StoreTarget::Local(path) => {
                std::fs::create_dir_all(path).map_err(|e| {
                    StateError::Connection(format!(
                        "cannot create state directory {}: {e}",
                        path.display()
                    ))
                })?;
                open_url(&format!("surrealkv://{}", path.display())).await?
            }
        };

        migrations::init_schema(&db).await?;
        info!(target = %target.describe(), "prism state store connected");
        Ok(Self { db })
    }

    pub fn health_store(&self) -> SurrealHealthStore {
        SurrealHealthStore::new(self.db.clone())
    }

    pub fn progress_store(&self) -> SurrealProgressStore {
        SurrealProgressStore::new(self.db.clone())
    }

    pub fn analysis_cache(&self) -> SurrealAnalysisCache {
        SurrealAnalysisCache::new(self.db.clone())
    }
}

async fn open_url(url: &str) -> Result<Surreal<Any>> {
    let db = surrealdb::engine::any::connect(url)
        .await
        .map_err(|e| StateError::Connection(format!("cannot reach {url}: {e}")))?;
    db.use_ns(DEFAULT_NAMESPACE)
        .use_db(DEFAULT_DATABASE)
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;
    Ok(db)
}

async fn open_remote(c: &RemoteCredentials) -> Result<Surreal<Any>> {
    let db = surrealdb::engine::any::connect(&c.endpoint)
        .await
        .map_err(|e| StateError::Connection(format!("cannot reach {}: {e}", c.endpoint)))?;

    let signed_in = if c.is_root {
        db.signin(Root {
            username: &c.username,
            password: &c.password,
        })
        .await
    } else {
        db.signin(Database {
            namespace: &c.namespace,
            database: &c.database,
            username: &c.username,
            password: &c.password,
        })
        .await
    };
    signed_in.map_err(|e| StateError::Connection(format!("sign-in as {} failed: {e}", c.username)))?;

    db.use_ns(&c.namespace)
        .use_db(&c.database)
        .await
        .map_err(|e| StateError::Connection(e.to_string()))?;
    Ok(db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn resolve(vars: &[(&str, &str)]) -> StoreTarget {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        StoreTarget::resolve(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_remote_needs_all_credentials() {
        let target = resolve(&[
            ("SURREALDB_ENDPOINT", "wss://db"),
            ("SURREALDB_USERNAME", "prism"),
            ("SURREALDB_PASSWORD", "secret"),
            ("SURREALDB_ROOT", "TRUE"),
        ]);
        let StoreTarget::Remote(credentials) = target else {
            panic!("expected remote target");
        };
        assert_eq!(credentials.namespace, "prism");
        assert_eq!(credentials.database, "main");
        assert!(credentials.is_root);

        let target = resolve(&[
            ("SURREALDB_ENDPOINT", "wss://db"),
            ("SURREALDB_URL", "ws://localhost:8000"),
        ]);
        assert_eq!(target, StoreTarget::Url("ws://localhost:8000".into()));
    }

    #[test]
    fn test_local_fallback() {
        assert_eq!(resolve(&[]), StoreTarget::Local(PathBuf::from(".prism/db")));
    }

    #[tokio::test]
    async fn test_in_memory_connects() {
        let handle = StoreHandle::in_memory().await.unwrap();
        let _ = handle.health_store();
    }
}
