use crate::error::AppError;
use crate::jobs::JobRunner;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use treescan_core::{ContentStore, ScanDb, ScanDeps, ScanError};

pub type SharedState = Arc<AppState>;

pub struct AppState {
    pub deps: ScanDeps,
    pub jobs: JobRunner,
    pub store: ContentStore,
    /// Read connection for the query routes. Jobs open their own.
    db: Mutex<ScanDb>,
    pub started: Instant,
}

impl AppState {
    pub fn new(deps: ScanDeps) -> treescan_core::Result<Self> {
        let db = ScanDb::open(&deps.config.store.database)?;
        Ok(Self {
            jobs: JobRunner::new(deps.clone()),
            store: ContentStore::new(Arc::clone(&deps.cache)),
            deps,
            db: Mutex::new(db),
            started: Instant::now(),
        })
    }

    /// Run a database read on the blocking pool
    pub async fn with_db<T, F>(self: &Arc<Self>, f: F) -> Result<T, AppError>
    where
        F: FnOnce(&ScanDb) -> treescan_core::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let state = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let db = state
                .db
                .lock()
                .map_err(|_| ScanError::Io(std::io::Error::other("database lock poisoned")))?;
            f(&db)
        })
        .await
        .map_err(AppError::internal)?
        .map_err(AppError::from)
    }
}
