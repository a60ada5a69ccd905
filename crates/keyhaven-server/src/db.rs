use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::ServerError;

/// Shared handle to the daemon's database.
pub type DbHandle = Arc<Mutex<Connection>>;

/// Schema version. Bump when the schema changes.
const SERVER_SCHEMA_VERSION: i64 = 1;

/// Open (or create) the key database and run migrations.
pub fn open_server_db(path: &Path) -> Result<DbHandle, ServerError> {
    let conn = Connection::open(path)?;

    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;

    let current: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0);

    if current != SERVER_SCHEMA_VERSION {
        if current != 0 {
            tracing::info!(
                old = current,
                new = SERVER_SCHEMA_VERSION,
                "schema version mismatch, recreating"
            );
            drop_all_tables(&conn)?;
        }
        conn.execute_batch(SERVER_SCHEMA)
            .map_err(|e| ServerError::Migration(e.to_string()))?;
        conn.pragma_update(None, "user_version", SERVER_SCHEMA_VERSION)?;
    }

    Ok(Arc::new(Mutex::new(conn)))
}

/// Drop every user table so the schema can be cleanly re-applied.
fn drop_all_tables(conn: &Connection) -> Result<(), ServerError> {
    let mut stmt =
        conn.prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")?;
    let tables: Vec<String> = stmt
        .query_map([], |row| row.get(0))?
        .filter_map(Result::ok)
        .collect();
    drop(stmt);

    for table in &tables {
        conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{table}\";"))
            .map_err(|e| ServerError::Migration(format!("failed to drop table {table}: {e}")))?;
    }
    Ok(())
}

const SERVER_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS accounts (
    uuid TEXT PRIMARY KEY,
    pni TEXT NOT NULL UNIQUE,
    version INTEGER NOT NULL,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ec_keys (
    identifier TEXT NOT NULL,
    device_id INTEGER NOT NULL,
    key_id INTEGER NOT NULL,
    public_key BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ec_keys ON ec_keys(identifier, device_id);

CREATE TABLE IF NOT EXISTS pq_keys (
    identifier TEXT NOT NULL,
    device_id INTEGER NOT NULL,
    key_id INTEGER NOT NULL,
    public_key BLOB NOT NULL,
    signature BLOB NOT NULL,
    last_resort INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_pq_keys ON pq_keys(identifier, device_id, last_resort);

CREATE TABLE IF NOT EXISTS ec_signed_keys (
    identifier TEXT NOT NULL,
    device_id INTEGER NOT NULL,
    key_id INTEGER NOT NULL,
    public_key BLOB NOT NULL,
    signature BLOB NOT NULL,
    PRIMARY KEY (identifier, device_id)
);
";
