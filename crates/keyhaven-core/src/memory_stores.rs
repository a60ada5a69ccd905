//! In-memory implementations of the directory and prekey store traits.
//!
//! These are suitable for:
//! - Testing and development
//! - Embedding the service without a database
//!
//! **WARNING**: Data is lost on process exit. The daemon uses the SQLite
//! implementations in `keyhaven-server`.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::account::{Account, AccountState};
use crate::device::DeviceId;
use crate::identity::AccountId;
use crate::keys::{EcPreKey, EcSignedPreKey, KemSignedPreKey};
use crate::store::{AccountDirectory, PreKeyStore, MAX_UPDATE_ATTEMPTS};
use crate::KeysError;

#[derive(Default)]
struct Accounts {
    by_uuid: HashMap<AccountId, AccountState>,
    pni_index: HashMap<AccountId, AccountId>,
}

/// In-memory account directory.
///
/// Holds the latest persisted version of each account; reads hand out fresh
/// snapshots and `update` performs a version-checked write.
#[derive(Default)]
pub struct MemoryAccountDirectory {
    accounts: Mutex<Accounts>,
}

impl MemoryAccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountDirectory for MemoryAccountDirectory {
    async fn create(&self, mut state: AccountState) -> Result<Account, KeysError> {
        let mut accounts = self.accounts.lock();
        if accounts.by_uuid.contains_key(&state.uuid())
            || accounts
                .pni_index
                .contains_key(&state.phone_number_identifier())
        {
            return Err(KeysError::Storage(format!(
                "account {} already exists",
                state.uuid()
            )));
        }

        state.set_version(0);
        accounts
            .pni_index
            .insert(state.phone_number_identifier(), state.uuid());
        accounts.by_uuid.insert(state.uuid(), state.clone());
        Ok(Account::new(state))
    }

    async fn get_by_account_identifier(
        &self,
        uuid: &AccountId,
    ) -> Result<Option<Account>, KeysError> {
        Ok(self
            .accounts
            .lock()
            .by_uuid
            .get(uuid)
            .cloned()
            .map(Account::new))
    }

    async fn get_by_phone_number_identifier(
        &self,
        pni: &AccountId,
    ) -> Result<Option<Account>, KeysError> {
        let accounts = self.accounts.lock();
        Ok(accounts
            .pni_index
            .get(pni)
            .and_then(|uuid| accounts.by_uuid.get(uuid))
            .cloned()
            .map(Account::new))
    }

    async fn update(
        &self,
        account: &Account,
        mutation: &mut (dyn FnMut(AccountState) -> AccountState + Send),
    ) -> Result<Account, KeysError> {
        let mut base = account.state()?.clone();
        let mut accounts = self.accounts.lock();

        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let current = accounts
                .by_uuid
                .get(&base.uuid())
                .ok_or_else(|| KeysError::Storage(format!("account {} not found", base.uuid())))?;

            if current.version() != base.version() {
                tracing::debug!(
                    account = %base.uuid(),
                    expected = base.version(),
                    actual = current.version(),
                    "version conflict, reapplying mutation to latest"
                );
                base = current.clone();
                continue;
            }

            let mut updated = mutation(base.clone());
            updated.set_version(base.version() + 1);

            accounts.pni_index.remove(&base.phone_number_identifier());
            accounts
                .pni_index
                .insert(updated.phone_number_identifier(), updated.uuid());
            accounts.by_uuid.insert(updated.uuid(), updated.clone());

            account.mark_stale();
            return Ok(Account::new(updated));
        }

        Err(KeysError::Storage(format!(
            "account {} update did not converge",
            base.uuid()
        )))
    }
}

/// Prekeys held for one device.
#[derive(Default)]
struct DeviceKeys {
    ec: VecDeque<EcPreKey>,
    pq: VecDeque<KemSignedPreKey>,
    pq_last_resort: Option<KemSignedPreKey>,
    ec_signed: Option<EcSignedPreKey>,
}

/// In-memory prekey store.
///
/// A single lock serializes takes and batch replacements, so a key can never
/// be handed out twice or survive a replacement.
#[derive(Default)]
pub struct MemoryPreKeyStore {
    devices: Mutex<HashMap<(AccountId, DeviceId), DeviceKeys>>,
}

impl MemoryPreKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn count(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

#[async_trait]
impl PreKeyStore for MemoryPreKeyStore {
    async fn store(
        &self,
        identifier: &AccountId,
        device_id: DeviceId,
        ec_keys: &[EcPreKey],
        pq_keys: &[KemSignedPreKey],
        ec_signed_pre_key: Option<&EcSignedPreKey>,
        pq_last_resort_pre_key: Option<&KemSignedPreKey>,
    ) -> Result<(), KeysError> {
        let mut devices = self.devices.lock();
        let entry = devices.entry((*identifier, device_id)).or_default();

        if !ec_keys.is_empty() {
            entry.ec = ec_keys.iter().cloned().collect();
        }
        if !pq_keys.is_empty() {
            entry.pq = pq_keys.iter().cloned().collect();
        }
        if let Some(key) = ec_signed_pre_key {
            entry.ec_signed = Some(key.clone());
        }
        if let Some(key) = pq_last_resort_pre_key {
            entry.pq_last_resort = Some(key.clone());
        }
        Ok(())
    }

    async fn store_ec_signed_pre_keys(
        &self,
        identifier: &AccountId,
        keys: &HashMap<DeviceId, EcSignedPreKey>,
    ) -> Result<(), KeysError> {
        let mut devices = self.devices.lock();
        for (device_id, key) in keys {
            devices
                .entry((*identifier, *device_id))
                .or_default()
                .ec_signed = Some(key.clone());
        }
        Ok(())
    }

    async fn take_ec(
        &self,
        identifier: &AccountId,
        device_id: DeviceId,
    ) -> Result<Option<EcPreKey>, KeysError> {
        Ok(self
            .devices
            .lock()
            .get_mut(&(*identifier, device_id))
            .and_then(|keys| keys.ec.pop_front()))
    }

    async fn take_pq(
        &self,
        identifier: &AccountId,
        device_id: DeviceId,
    ) -> Result<Option<KemSignedPreKey>, KeysError> {
        Ok(self
            .devices
            .lock()
            .get_mut(&(*identifier, device_id))
            .and_then(|keys| keys.pq.pop_front().or_else(|| keys.pq_last_resort.clone())))
    }

    async fn get_ec_count(
        &self,
        identifier: &AccountId,
        device_id: DeviceId,
    ) -> Result<u32, KeysError> {
        Ok(self
            .devices
            .lock()
            .get(&(*identifier, device_id))
            .map_or(0, |keys| count(keys.ec.len())))
    }

    async fn get_pq_count(
        &self,
        identifier: &AccountId,
        device_id: DeviceId,
    ) -> Result<u32, KeysError> {
        Ok(self
            .devices
            .lock()
            .get(&(*identifier, device_id))
            .map_or(0, |keys| count(keys.pq.len())))
    }

    async fn get_ec_signed_pre_key(
        &self,
        identifier: &AccountId,
        device_id: DeviceId,
    ) -> Result<Option<EcSignedPreKey>, KeysError> {
        Ok(self
            .devices
            .lock()
            .get(&(*identifier, device_id))
            .and_then(|keys| keys.ec_signed.clone()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;
    use crate::identity::IdentityType;
    use crate::keys::IdentityKey;

    fn ec_batch(ids: std::ops::Range<u32>) -> Vec<EcPreKey> {
        ids.map(|key_id| EcPreKey {
            key_id,
            public_key: vec![1; 33],
        })
        .collect()
    }

    fn kem(key_id: u32) -> KemSignedPreKey {
        KemSignedPreKey {
            key_id,
            public_key: vec![3; 1568],
            signature: vec![4; 64],
        }
    }

    #[tokio::test]
    async fn concurrent_takes_never_repeat_a_key() {
        let store = Arc::new(MemoryPreKeyStore::new());
        let id = AccountId::random();
        store
            .store(&id, 1, &ec_batch(0..50), &[], None, None)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move { store.take_ec(&id, 1).await }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            let key = handle.await.unwrap().unwrap().expect("batch not yet exhausted");
            assert!(seen.insert(key.key_id), "key {} handed out twice", key.key_id);
        }
        assert_eq!(seen.len(), 50);
        assert!(store.take_ec(&id, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn new_batch_replaces_unconsumed_keys() {
        let store = MemoryPreKeyStore::new();
        let id = AccountId::random();
        store.store(&id, 1, &ec_batch(0..3), &[], None, None).await.unwrap();
        store.store(&id, 1, &ec_batch(100..102), &[], None, None).await.unwrap();

        assert_eq!(store.get_ec_count(&id, 1).await.unwrap(), 2);
        let first = store.take_ec(&id, 1).await.unwrap().unwrap();
        let second = store.take_ec(&id, 1).await.unwrap().unwrap();
        assert!(first.key_id >= 100 && second.key_id >= 100);
        assert!(store.take_ec(&id, 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn empty_batch_keeps_existing_keys() {
        let store = MemoryPreKeyStore::new();
        let id = AccountId::random();
        store.store(&id, 1, &ec_batch(0..3), &[kem(1)], None, None).await.unwrap();
        store.store(&id, 1, &[], &[], None, Some(&kem(99))).await.unwrap();

        assert_eq!(store.get_ec_count(&id, 1).await.unwrap(), 3);
        assert_eq!(store.get_pq_count(&id, 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn last_resort_is_fallback_and_never_consumed() {
        let store = MemoryPreKeyStore::new();
        let id = AccountId::random();
        store
            .store(&id, 1, &[], &[kem(1)], None, Some(&kem(99)))
            .await
            .unwrap();

        assert_eq!(store.get_pq_count(&id, 1).await.unwrap(), 1);
        assert_eq!(store.take_pq(&id, 1).await.unwrap().map(|k| k.key_id), Some(1));
        assert_eq!(store.get_pq_count(&id, 1).await.unwrap(), 0);
        assert_eq!(store.take_pq(&id, 1).await.unwrap().map(|k| k.key_id), Some(99));
        assert_eq!(store.take_pq(&id, 1).await.unwrap().map(|k| k.key_id), Some(99));
    }

    #[tokio::test]
    async fn keys_are_scoped_per_device() {
        let store = MemoryPreKeyStore::new();
        let id = AccountId::random();
        store.store(&id, 1, &ec_batch(0..2), &[], None, None).await.unwrap();

        assert_eq!(store.get_ec_count(&id, 2).await.unwrap(), 0);
        assert!(store.take_ec(&id, 2).await.unwrap().is_none());
        assert!(store.take_ec(&AccountId::random(), 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_bumps_version_and_marks_snapshot_stale() {
        let directory = MemoryAccountDirectory::new();
        let account = directory
            .create(AccountState::new(AccountId::random(), AccountId::random(), "+1555"))
            .await
            .unwrap();
        let key = IdentityKey(vec![5; 33]);

        let updated = directory
            .update(&account, &mut |mut state: AccountState| {
                state.set_identity_key(IdentityType::Aci, Some(key.clone()));
                state
            })
            .await
            .unwrap();

        assert!(account.is_stale());
        let state = updated.state().unwrap();
        assert_eq!(state.version(), 1);
        assert_eq!(state.identity_key(IdentityType::Aci), Some(&key));
    }

    #[tokio::test]
    async fn update_from_outdated_snapshot_reapplies_to_latest() {
        let directory = MemoryAccountDirectory::new();
        let created = directory
            .create(AccountState::new(AccountId::random(), AccountId::random(), "+1555"))
            .await
            .unwrap();
        let uuid = created.uuid();
        let outdated = directory.get_by_account_identifier(&uuid).await.unwrap().unwrap();

        directory
            .update(&created, &mut |mut state: AccountState| {
                state.set_discoverable_by_phone_number(false);
                state
            })
            .await
            .unwrap();

        let updated = directory
            .update(&outdated, &mut |mut state: AccountState| {
                state.set_current_profile_version(Some("v2".into()));
                state
            })
            .await
            .unwrap();

        let state = updated.state().unwrap();
        assert_eq!(state.version(), 2);
        assert!(!state.is_discoverable_by_phone_number());
        assert_eq!(state.current_profile_version(), Some("v2"));
    }

    #[tokio::test]
    async fn pni_lookup_resolves_same_account() {
        let directory = MemoryAccountDirectory::new();
        let pni = AccountId::random();
        let created = directory
            .create(AccountState::new(AccountId::random(), pni, "+1555"))
            .await
            .unwrap();

        let found = directory.get_by_phone_number_identifier(&pni).await.unwrap().unwrap();
        assert_eq!(found.uuid(), created.uuid());
        assert!(directory
            .get_by_phone_number_identifier(&created.uuid())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let directory = MemoryAccountDirectory::new();
        let state = AccountState::new(AccountId::random(), AccountId::random(), "+1555");
        directory.create(state.clone()).await.unwrap();
        assert!(directory.create(state).await.is_err());
    }
}
