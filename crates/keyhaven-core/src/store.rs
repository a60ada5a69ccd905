use std::collections::HashMap;

use async_trait::async_trait;

use crate::account::{Account, AccountState};
use crate::device::{Device, DeviceId};
use crate::identity::{AccountId, IdentityType, ServiceIdentifier};
use crate::keys::{EcPreKey, EcSignedPreKey, KemSignedPreKey};
use crate::KeysError;

/// Upper bound on compare-and-update attempts before a directory gives up.
pub const MAX_UPDATE_ATTEMPTS: usize = 10;

/// Durable store of accounts, keyed by ACI with a secondary PNI lookup.
///
/// The directory owns optimistic concurrency: `update` reads the current
/// version, applies the mutation, and writes only if the version is still
/// the one it read, retrying against the newer version otherwise.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Persist a brand-new account. Used by registration.
    async fn create(&self, state: AccountState) -> Result<Account, KeysError>;

    async fn get_by_account_identifier(&self, uuid: &AccountId)
        -> Result<Option<Account>, KeysError>;

    async fn get_by_phone_number_identifier(
        &self,
        pni: &AccountId,
    ) -> Result<Option<Account>, KeysError>;

    /// Apply `mutation` and persist the result as version + 1.
    ///
    /// `mutation` is a pure transform. It may run more than once, each time on
    /// a fresher version, so it must not have side effects. On success
    /// `account` is marked stale and the new snapshot returned.
    async fn update(
        &self,
        account: &Account,
        mutation: &mut (dyn FnMut(AccountState) -> AccountState + Send),
    ) -> Result<Account, KeysError>;

    async fn get_by_service_identifier(
        &self,
        service_id: &ServiceIdentifier,
    ) -> Result<Option<Account>, KeysError> {
        match service_id.identity_type {
            IdentityType::Aci => self.get_by_account_identifier(&service_id.id).await,
            IdentityType::Pni => self.get_by_phone_number_identifier(&service_id.id).await,
        }
    }

    /// Apply `mutation` to a single device. A missing device leaves the
    /// account untouched apart from the version bump.
    async fn update_device(
        &self,
        account: &Account,
        device_id: DeviceId,
        mutation: &mut (dyn for<'d> FnMut(&'d mut Device) + Send),
    ) -> Result<Account, KeysError> {
        self.update(account, &mut |mut state: AccountState| {
            if let Some(device) = state.device_mut(device_id) {
                mutation(device);
            }
            state
        })
        .await
    }
}

/// Durable store of per-device prekeys, addressed by the account identifier in
/// the relevant namespace and the device id.
#[async_trait]
pub trait PreKeyStore: Send + Sync {
    /// Store an upload. A non-empty one-time batch replaces every unconsumed key
    /// of the same kind for the device; an empty batch leaves it alone.
    async fn store(
        &self,
        identifier: &AccountId,
        device_id: DeviceId,
        ec_keys: &[EcPreKey],
        pq_keys: &[KemSignedPreKey],
        ec_signed_pre_key: Option<&EcSignedPreKey>,
        pq_last_resort_pre_key: Option<&KemSignedPreKey>,
    ) -> Result<(), KeysError>;

    async fn store_ec_signed_pre_keys(
        &self,
        identifier: &AccountId,
        keys: &HashMap<DeviceId, EcSignedPreKey>,
    ) -> Result<(), KeysError>;

    /// Atomically remove and return one unused EC one-time key.
    async fn take_ec(
        &self,
        identifier: &AccountId,
        device_id: DeviceId,
    ) -> Result<Option<EcPreKey>, KeysError>;

    /// Atomically remove and return one unused PQ one-time key, falling back to
    /// the (never removed) last-resort key.
    async fn take_pq(
        &self,
        identifier: &AccountId,
        device_id: DeviceId,
    ) -> Result<Option<KemSignedPreKey>, KeysError>;

    async fn get_ec_count(&self, identifier: &AccountId, device_id: DeviceId)
        -> Result<u32, KeysError>;

    /// Remaining one-time PQ keys, not counting the last-resort key.
    async fn get_pq_count(&self, identifier: &AccountId, device_id: DeviceId)
        -> Result<u32, KeysError>;

    async fn get_ec_signed_pre_key(
        &self,
        identifier: &AccountId,
        device_id: DeviceId,
    ) -> Result<Option<EcSignedPreKey>, KeysError>;
}
