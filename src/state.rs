//! Application state management

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::sync::{EventPublisher, SyncEngine, TracingPublisher};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    db: SqlitePool,
    engine: SyncEngine,
    publisher: Arc<dyn EventPublisher>,
}

impl AppState {
    /// Create state over a SQLite pool, logging domain events
    pub fn new(config: Config, db: SqlitePool) -> Self {
        let engine = SyncEngine::sqlite(db.clone())
            .with_limits(config.sync.limits(), config.sync.pull_limits());
        Self::with_engine(config, db, engine, Arc::new(TracingPublisher))
    }

    pub fn with_engine(
        config: Config,
        db: SqlitePool,
        engine: SyncEngine,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                db,
                engine,
                publisher,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }

    /// Get the sync engine
    pub fn engine(&self) -> &SyncEngine {
        &self.inner.engine
    }

    /// Get the domain event publisher
    pub fn publisher(&self) -> &Arc<dyn EventPublisher> {
        &self.inner.publisher
    }
}
