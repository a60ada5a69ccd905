use std::sync::Arc;

use keyhaven_core::{KeysConfig, KeysService};

use crate::db::DbHandle;
use crate::sqlite_stores::{SqliteAccountDirectory, SqlitePreKeyStore};
use crate::ServerError;

/// Central state for the key daemon.
pub struct ServerState {
    /// Prekey service over the SQLite stores.
    pub service: KeysService,
    /// The daemon's `SQLite` database, shared with the stores.
    pub db: DbHandle,
    /// Unix timestamp (seconds) when the server started.
    pub started_at: u64,
}

impl ServerState {
    pub fn new(db: DbHandle, config: KeysConfig) -> Self {
        let service = KeysService::new(
            Arc::new(SqliteAccountDirectory::new(Arc::clone(&db))),
            Arc::new(SqlitePreKeyStore::new(Arc::clone(&db))),
            config,
        );
        Self {
            service,
            db,
            started_at: timestamp_now_secs(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        timestamp_now_secs().saturating_sub(self.started_at)
    }

    pub fn account_count(&self) -> Result<u64, ServerError> {
        let count: i64 = self
            .db
            .lock()
            .query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

fn timestamp_now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
