//! SQLite-backed implementations of the core store traits.
//!
//! Both stores share one connection behind a mutex. Every operation runs to
//! completion while holding the lock, so a take can never interleave with a
//! batch replacement for the same device.

use std::collections::HashMap;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use keyhaven_core::account::{Account, AccountState};
use keyhaven_core::device::DeviceId;
use keyhaven_core::identity::AccountId;
use keyhaven_core::keys::{EcPreKey, EcSignedPreKey, KemSignedPreKey};
use keyhaven_core::store::{AccountDirectory, PreKeyStore, MAX_UPDATE_ATTEMPTS};
use keyhaven_core::KeysError;

use crate::db::DbHandle;
use crate::ServerError;

/// Account directory persisting each account as a JSON document with its
/// version alongside for compare-and-swap updates.
pub struct SqliteAccountDirectory {
    db: DbHandle,
}

impl SqliteAccountDirectory {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

fn decode_account(data: &str) -> Result<AccountState, ServerError> {
    Ok(serde_json::from_str(data)?)
}

fn load_by(conn: &Connection, column: &str, id: &AccountId) -> Result<Option<AccountState>, ServerError> {
    let data: Option<String> = conn
        .query_row(
            &format!("SELECT data FROM accounts WHERE {column} = ?1"),
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    data.as_deref().map(decode_account).transpose()
}

#[async_trait]
impl AccountDirectory for SqliteAccountDirectory {
    async fn create(&self, mut state: AccountState) -> Result<Account, KeysError> {
        state.set_version(0);
        let data = serde_json::to_string(&state).map_err(ServerError::from)?;

        let conn = self.db.lock();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO accounts (uuid, pni, version, data) VALUES (?1, ?2, ?3, ?4)",
                params![
                    state.uuid().to_string(),
                    state.phone_number_identifier().to_string(),
                    state.version(),
                    data
                ],
            )
            .map_err(ServerError::from)?;
        if inserted == 0 {
            return Err(KeysError::Storage(format!(
                "account {} already exists",
                state.uuid()
            )));
        }

        tracing::info!(account = %state.uuid(), "account created");
        Ok(Account::new(state))
    }

    async fn get_by_account_identifier(
        &self,
        uuid: &AccountId,
    ) -> Result<Option<Account>, KeysError> {
        let conn = self.db.lock();
        Ok(load_by(&conn, "uuid", uuid)?.map(Account::new))
    }

    async fn get_by_phone_number_identifier(
        &self,
        pni: &AccountId,
    ) -> Result<Option<Account>, KeysError> {
        let conn = self.db.lock();
        Ok(load_by(&conn, "pni", pni)?.map(Account::new))
    }

    async fn update(
        &self,
        account: &Account,
        mutation: &mut (dyn FnMut(AccountState) -> AccountState + Send),
    ) -> Result<Account, KeysError> {
        let mut base = account.state()?.clone();
        let conn = self.db.lock();

        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let mut updated = mutation(base.clone());
            updated.set_version(base.version() + 1);
            let data = serde_json::to_string(&updated).map_err(ServerError::from)?;

            let changed = conn
                .execute(
                    "UPDATE accounts SET pni = ?1, version = ?2, data = ?3 WHERE uuid = ?4 AND version = ?5",
                    params![
                        updated.phone_number_identifier().to_string(),
                        updated.version(),
                        data,
                        base.uuid().to_string(),
                        base.version()
                    ],
                )
                .map_err(ServerError::from)?;

            if changed == 1 {
                account.mark_stale();
                return Ok(Account::new(updated));
            }

            let latest = load_by(&conn, "uuid", &base.uuid())?
                .ok_or_else(|| KeysError::Storage(format!("account {} not found", base.uuid())))?;
            tracing::debug!(
                account = %base.uuid(),
                expected = base.version(),
                actual = latest.version(),
                "version conflict, reapplying mutation to latest"
            );
            base = latest;
        }

        Err(KeysError::Storage(format!(
            "account {} update did not converge",
            base.uuid()
        )))
    }
}

/// Prekey store over the `ec_keys`, `pq_keys` and `ec_signed_keys` tables.
/// One-time keys are taken in upload order.
pub struct SqlitePreKeyStore {
    db: DbHandle,
}

impl SqlitePreKeyStore {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }
}

fn upsert_ec_signed(
    conn: &Connection,
    identifier: &str,
    device_id: DeviceId,
    key: &EcSignedPreKey,
) -> Result<(), ServerError> {
    conn.execute(
        "INSERT INTO ec_signed_keys (identifier, device_id, key_id, public_key, signature)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (identifier, device_id) DO UPDATE SET
             key_id = excluded.key_id,
             public_key = excluded.public_key,
             signature = excluded.signature",
        params![identifier, device_id, key.key_id, key.public_key, key.signature],
    )?;
    Ok(())
}

fn store_batch(
    conn: &mut Connection,
    identifier: &str,
    device_id: DeviceId,
    ec_keys: &[EcPreKey],
    pq_keys: &[KemSignedPreKey],
    ec_signed_pre_key: Option<&EcSignedPreKey>,
    pq_last_resort_pre_key: Option<&KemSignedPreKey>,
) -> Result<(), ServerError> {
    let tx = conn.transaction()?;

    if !ec_keys.is_empty() {
        tx.execute(
            "DELETE FROM ec_keys WHERE identifier = ?1 AND device_id = ?2",
            params![identifier, device_id],
        )?;
        let mut insert = tx.prepare(
            "INSERT INTO ec_keys (identifier, device_id, key_id, public_key) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for key in ec_keys {
            insert.execute(params![identifier, device_id, key.key_id, key.public_key])?;
        }
    }

    if !pq_keys.is_empty() {
        tx.execute(
            "DELETE FROM pq_keys WHERE identifier = ?1 AND device_id = ?2 AND last_resort = 0",
            params![identifier, device_id],
        )?;
        let mut insert = tx.prepare(
            "INSERT INTO pq_keys (identifier, device_id, key_id, public_key, signature, last_resort)
             VALUES (?1, ?2, ?3, ?4, ?5, 0)",
        )?;
        for key in pq_keys {
            insert.execute(params![
                identifier,
                device_id,
                key.key_id,
                key.public_key,
                key.signature
            ])?;
        }
    }

    if let Some(key) = pq_last_resort_pre_key {
        tx.execute(
            "DELETE FROM pq_keys WHERE identifier = ?1 AND device_id = ?2 AND last_resort = 1",
            params![identifier, device_id],
        )?;
        tx.execute(
            "INSERT INTO pq_keys (identifier, device_id, key_id, public_key, signature, last_resort)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
            params![
                identifier,
                device_id,
                key.key_id,
                key.public_key,
                key.signature
            ],
        )?;
    }

    if let Some(key) = ec_signed_pre_key {
        upsert_ec_signed(&tx, identifier, device_id, key)?;
    }

    tx.commit()?;
    Ok(())
}

fn take_pq_key(
    conn: &mut Connection,
    identifier: &str,
    device_id: DeviceId,
) -> Result<Option<KemSignedPreKey>, ServerError> {
    let tx = conn.transaction()?;

    let taken = tx
        .query_row(
            "DELETE FROM pq_keys WHERE rowid = (
                 SELECT rowid FROM pq_keys
                 WHERE identifier = ?1 AND device_id = ?2 AND last_resort = 0
                 ORDER BY rowid LIMIT 1
             ) RETURNING key_id, public_key, signature",
            params![identifier, device_id],
            |row| {
                Ok(KemSignedPreKey {
                    key_id: row.get(0)?,
                    public_key: row.get(1)?,
                    signature: row.get(2)?,
                })
            },
        )
        .optional()?;

    let key = match taken {
        Some(key) => Some(key),
        None => tx
            .query_row(
                "SELECT key_id, public_key, signature FROM pq_keys
                 WHERE identifier = ?1 AND device_id = ?2 AND last_resort = 1",
                params![identifier, device_id],
                |row| {
                    Ok(KemSignedPreKey {
                        key_id: row.get(0)?,
                        public_key: row.get(1)?,
                        signature: row.get(2)?,
                    })
                },
            )
            .optional()?,
    };

    tx.commit()?;
    Ok(key)
}

fn count_rows(conn: &Connection, sql: &str, identifier: &str, device_id: DeviceId) -> Result<u32, ServerError> {
    let count: i64 = conn.query_row(sql, params![identifier, device_id], |row| row.get(0))?;
    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}

#[async_trait]
impl PreKeyStore for SqlitePreKeyStore {
    async fn store(
        &self,
        identifier: &AccountId,
        device_id: DeviceId,
        ec_keys: &[EcPreKey],
        pq_keys: &[KemSignedPreKey],
        ec_signed_pre_key: Option<&EcSignedPreKey>,
        pq_last_resort_pre_key: Option<&KemSignedPreKey>,
    ) -> Result<(), KeysError> {
        let mut conn = self.db.lock();
        store_batch(
            &mut conn,
            &identifier.to_string(),
            device_id,
            ec_keys,
            pq_keys,
            ec_signed_pre_key,
            pq_last_resort_pre_key,
        )?;
        Ok(())
    }

    async fn store_ec_signed_pre_keys(
        &self,
        identifier: &AccountId,
        keys: &HashMap<DeviceId, EcSignedPreKey>,
    ) -> Result<(), KeysError> {
        let identifier = identifier.to_string();
        let mut conn = self.db.lock();
        let tx = conn.transaction().map_err(ServerError::from)?;
        for (device_id, key) in keys {
            upsert_ec_signed(&tx, &identifier, *device_id, key)?;
        }
        tx.commit().map_err(ServerError::from)?;
        Ok(())
    }

    async fn take_ec(
        &self,
        identifier: &AccountId,
        device_id: DeviceId,
    ) -> Result<Option<EcPreKey>, KeysError> {
        let conn = self.db.lock();
        let key = conn
            .query_row(
                "DELETE FROM ec_keys WHERE rowid = (
                     SELECT rowid FROM ec_keys
                     WHERE identifier = ?1 AND device_id = ?2
                     ORDER BY rowid LIMIT 1
                 ) RETURNING key_id, public_key",
                params![identifier.to_string(), device_id],
                |row| {
                    Ok(EcPreKey {
                        key_id: row.get(0)?,
                        public_key: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(ServerError::from)?;
        Ok(key)
    }

    async fn take_pq(
        &self,
        identifier: &AccountId,
        device_id: DeviceId,
    ) -> Result<Option<KemSignedPreKey>, KeysError> {
        let mut conn = self.db.lock();
        Ok(take_pq_key(&mut conn, &identifier.to_string(), device_id)?)
    }

    async fn get_ec_count(
        &self,
        identifier: &AccountId,
        device_id: DeviceId,
    ) -> Result<u32, KeysError> {
        let conn = self.db.lock();
        Ok(count_rows(
            &conn,
            "SELECT COUNT(*) FROM ec_keys WHERE identifier = ?1 AND device_id = ?2",
            &identifier.to_string(),
            device_id,
        )?)
    }

    async fn get_pq_count(
        &self,
        identifier: &AccountId,
        device_id: DeviceId,
    ) -> Result<u32, KeysError> {
        let conn = self.db.lock();
        Ok(count_rows(
            &conn,
            "SELECT COUNT(*) FROM pq_keys WHERE identifier = ?1 AND device_id = ?2 AND last_resort = 0",
            &identifier.to_string(),
            device_id,
        )?)
    }

    async fn get_ec_signed_pre_key(
        &self,
        identifier: &AccountId,
        device_id: DeviceId,
    ) -> Result<Option<EcSignedPreKey>, KeysError> {
        let conn = self.db.lock();
        let key = conn
            .query_row(
                "SELECT key_id, public_key, signature FROM ec_signed_keys
                 WHERE identifier = ?1 AND device_id = ?2",
                params![identifier.to_string(), device_id],
                |row| {
                    Ok(EcSignedPreKey {
                        key_id: row.get(0)?,
                        public_key: row.get(1)?,
                        signature: row.get(2)?,
                    })
                },
            )
            .optional()
            .map_err(ServerError::from)?;
        Ok(key)
    }
}
