//! The account aggregate.
//!
//! [`AccountState`] holds the persisted fields and enforces the structural
//! invariants (unique device ids, a single primary, identity keys owned by the
//! primary). [`Account`] pairs a state snapshot with a generation flag: once an
//! [`AccountDirectory`](crate::store::AccountDirectory) writes a newer version,
//! the old snapshot and every clone of it refuse to hand out data.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::device::{Device, DeviceId, MAXIMUM_DEVICE_ID, PRIMARY_ID};
use crate::identity::{AccountId, IdentityType, ServiceIdentifier};
use crate::keys::{base64_bytes, IdentityKey};
use crate::KeysError;

/// Outcome of asking whether a device may set a namespace's identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKeyChange {
    /// The supplied key equals the stored one.
    Unchanged,
    /// The acting device is primary; the change may proceed.
    Permitted { had_identity_key: bool },
    /// A linked device tried to change the key.
    Forbidden { had_identity_key: bool },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountState {
    uuid: AccountId,
    pni: AccountId,
    #[serde(default)]
    number: String,
    #[serde(default)]
    devices: Vec<Device>,
    #[serde(default)]
    identity_key: Option<IdentityKey>,
    #[serde(default)]
    pni_identity_key: Option<IdentityKey>,
    #[serde(default, with = "base64_bytes::option")]
    unidentified_access_key: Option<Vec<u8>>,
    #[serde(default)]
    unrestricted_unidentified_access: bool,
    #[serde(default = "default_true")]
    discoverable_by_phone_number: bool,
    #[serde(default)]
    current_profile_version: Option<String>,
    #[serde(default)]
    version: u32,
}

fn default_true() -> bool {
    true
}

impl AccountState {
    pub fn new(uuid: AccountId, pni: AccountId, number: impl Into<String>) -> Self {
        Self {
            uuid,
            pni,
            number: number.into(),
            devices: Vec::new(),
            identity_key: None,
            pni_identity_key: None,
            unidentified_access_key: None,
            unrestricted_unidentified_access: false,
            discoverable_by_phone_number: true,
            current_profile_version: None,
            version: 0,
        }
    }

    pub fn uuid(&self) -> AccountId {
        self.uuid
    }

    pub fn phone_number_identifier(&self) -> AccountId {
        self.pni
    }

    pub fn number(&self) -> &str {
        &self.number
    }

    pub fn identifier(&self, identity_type: IdentityType) -> AccountId {
        match identity_type {
            IdentityType::Aci => self.uuid,
            IdentityType::Pni => self.pni,
        }
    }

    pub fn is_identified_by(&self, service_id: &ServiceIdentifier) -> bool {
        self.identifier(service_id.identity_type) == service_id.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Only directory implementations should call this.
    pub fn set_version(&mut self, version: u32) {
        self.version = version;
    }

    // -- devices ------------------------------------------------------------

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn device_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.id == id)
    }

    pub fn primary_device(&self) -> Option<&Device> {
        self.device(PRIMARY_ID)
    }

    /// Add a device, replacing any existing device with the same id.
    pub fn add_device(&mut self, device: Device) -> Result<(), KeysError> {
        if device.id == 0 || device.id > MAXIMUM_DEVICE_ID {
            return Err(KeysError::Validation(format!(
                "device id {} out of range",
                device.id
            )));
        }
        self.remove_device(device.id);
        self.devices.push(device);
        Ok(())
    }

    pub fn remove_device(&mut self, id: DeviceId) {
        self.devices.retain(|d| d.id != id);
    }

    /// Smallest free id above the primary, or `None` if every id is taken.
    pub fn next_device_id(&self) -> Option<DeviceId> {
        (PRIMARY_ID + 1..=MAXIMUM_DEVICE_ID).find(|id| self.device(*id).is_none())
    }

    pub fn devices_matching<P>(&self, predicate: P) -> Vec<&Device>
    where
        P: Fn(&Device) -> bool,
    {
        self.devices.iter().filter(|d| predicate(d)).collect()
    }

    pub fn enabled_device_count(&self, now_ms: u64) -> usize {
        self.devices.iter().filter(|d| d.is_enabled(now_ms)).count()
    }

    /// An account is enabled when its primary device is.
    pub fn is_enabled(&self, now_ms: u64) -> bool {
        self.primary_device().is_some_and(|d| d.is_enabled(now_ms))
    }

    /// Most recent `last_seen` across all devices.
    pub fn last_seen(&self) -> u64 {
        self.devices.iter().map(|d| d.last_seen).max().unwrap_or(0)
    }

    pub fn is_storage_supported(&self) -> bool {
        self.devices
            .iter()
            .any(|d| d.capabilities.is_some_and(|c| c.storage))
    }

    pub fn is_transfer_supported(&self) -> bool {
        self.primary_device()
            .and_then(|d| d.capabilities)
            .is_some_and(|c| c.transfer)
    }

    pub fn is_pni_supported(&self, now_ms: u64) -> bool {
        self.all_enabled_devices_have(now_ms, |c| c.pni)
    }

    pub fn is_payment_activation_supported(&self, now_ms: u64) -> bool {
        self.all_enabled_devices_have(now_ms, |c| c.payment_activation)
    }

    fn all_enabled_devices_have<P>(&self, now_ms: u64, capability: P) -> bool
    where
        P: Fn(&crate::device::DeviceCapabilities) -> bool,
    {
        self.devices
            .iter()
            .filter(|d| d.is_enabled(now_ms))
            .all(|d| d.capabilities.as_ref().is_some_and(&capability))
    }

    // -- identity keys ------------------------------------------------------

    pub fn identity_key(&self, identity_type: IdentityType) -> Option<&IdentityKey> {
        match identity_type {
            IdentityType::Aci => self.identity_key.as_ref(),
            IdentityType::Pni => self.pni_identity_key.as_ref(),
        }
    }

    pub fn set_identity_key(&mut self, identity_type: IdentityType, key: Option<IdentityKey>) {
        match identity_type {
            IdentityType::Aci => self.identity_key = key,
            IdentityType::Pni => self.pni_identity_key = key,
        }
    }

    /// Decide whether `device_id` may set `identity_type`'s identity key to
    /// `new_key`.
    pub fn authorize_identity_key_change(
        &self,
        device_id: DeviceId,
        identity_type: IdentityType,
        new_key: &IdentityKey,
    ) -> IdentityKeyChange {
        let current = self.identity_key(identity_type);
        if current == Some(new_key) {
            return IdentityKeyChange::Unchanged;
        }

        let had_identity_key = current.is_some();
        if device_id == PRIMARY_ID {
            IdentityKeyChange::Permitted { had_identity_key }
        } else {
            IdentityKeyChange::Forbidden { had_identity_key }
        }
    }

    // -- access and directory attributes ------------------------------------

    pub fn unidentified_access_key(&self) -> Option<&[u8]> {
        self.unidentified_access_key.as_deref()
    }

    pub fn set_unidentified_access_key(&mut self, key: Option<Vec<u8>>) {
        self.unidentified_access_key = key;
    }

    pub fn is_unrestricted_unidentified_access(&self) -> bool {
        self.unrestricted_unidentified_access
    }

    pub fn set_unrestricted_unidentified_access(&mut self, unrestricted: bool) {
        self.unrestricted_unidentified_access = unrestricted;
    }

    pub fn is_discoverable_by_phone_number(&self) -> bool {
        self.discoverable_by_phone_number
    }

    pub fn set_discoverable_by_phone_number(&mut self, discoverable: bool) {
        self.discoverable_by_phone_number = discoverable;
    }

    pub fn should_be_visible_in_directory(&self, now_ms: u64) -> bool {
        self.is_enabled(now_ms) && self.discoverable_by_phone_number
    }

    pub fn current_profile_version(&self) -> Option<&str> {
        self.current_profile_version.as_deref()
    }

    pub fn set_current_profile_version(&mut self, version: Option<String>) {
        self.current_profile_version = version;
    }
}

/// Superseded flag shared by every clone of one snapshot.
#[derive(Debug, Clone, Default)]
struct Generation {
    superseded: Arc<AtomicBool>,
}

impl Generation {
    fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::Acquire)
    }

    fn supersede(&self) {
        self.superseded.store(true, Ordering::Release);
    }
}

/// A snapshot of one persisted account version.
#[derive(Debug, Clone)]
pub struct Account {
    state: AccountState,
    generation: Generation,
}

impl Account {
    /// Wrap a freshly loaded or freshly written state.
    pub fn new(state: AccountState) -> Self {
        Self {
            state,
            generation: Generation::default(),
        }
    }

    /// The account identifier. Unlike everything else it stays readable on a
    /// stale snapshot, so stale-access errors can name the account.
    pub fn uuid(&self) -> AccountId {
        self.state.uuid
    }

    /// Borrow the state, refusing if a newer version has been written.
    pub fn state(&self) -> Result<&AccountState, KeysError> {
        if self.generation.is_superseded() {
            tracing::error!(
                account = %self.state.uuid,
                version = self.state.version,
                "accessor called on stale account"
            );
            return Err(KeysError::StaleAccount);
        }
        Ok(&self.state)
    }

    /// Consume the snapshot, refusing if it is stale.
    pub fn into_state(self) -> Result<AccountState, KeysError> {
        self.state()?;
        Ok(self.state)
    }

    pub fn is_stale(&self) -> bool {
        self.generation.is_superseded()
    }

    /// Mark this snapshot (and all of its clones) as superseded.
    pub fn mark_stale(&self) {
        self.generation.supersede();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceCapabilities;
    use crate::keys::EcSignedPreKey;

    const NOW: u64 = 1_700_000_000_000;

    fn enabled_device(id: DeviceId) -> Device {
        let mut device = Device::new(id, 1000 + id);
        device.fetches_messages = true;
        device.last_seen = NOW;
        device.set_signed_pre_key(
            IdentityType::Aci,
            Some(EcSignedPreKey {
                key_id: id,
                public_key: vec![1; 33],
                signature: vec![2; 64],
            }),
        );
        device
    }

    fn account_with(ids: &[DeviceId]) -> AccountState {
        let mut state = AccountState::new(AccountId::random(), AccountId::random(), "+15550001");
        for id in ids {
            state.add_device(enabled_device(*id)).unwrap();
        }
        state
    }

    #[test]
    fn next_device_id_probes_from_two() {
        assert_eq!(account_with(&[1]).next_device_id(), Some(2));
        assert_eq!(account_with(&[1, 2, 3]).next_device_id(), Some(4));
        assert_eq!(account_with(&[1, 2, 4]).next_device_id(), Some(3));
        assert_eq!(account_with(&[]).next_device_id(), Some(2));
    }

    #[test]
    fn next_device_id_exhausted() {
        let ids: Vec<DeviceId> = (1..=MAXIMUM_DEVICE_ID).collect();
        assert_eq!(account_with(&ids).next_device_id(), None);
    }

    #[test]
    fn add_device_replaces_same_id() {
        let mut state = account_with(&[1, 2]);
        let mut replacement = enabled_device(2);
        replacement.registration_id = 9;
        state.add_device(replacement).unwrap();

        assert_eq!(state.devices().len(), 2);
        assert_eq!(state.device(2).map(|d| d.registration_id), Some(9));
    }

    #[test]
    fn add_device_rejects_out_of_range_ids() {
        let mut state = account_with(&[1]);
        assert!(state.add_device(Device::new(0, 1)).is_err());
        assert!(state.add_device(Device::new(MAXIMUM_DEVICE_ID + 1, 1)).is_err());
    }

    #[test]
    fn enabled_counts_skip_disabled_devices() {
        let mut state = account_with(&[1, 2, 3]);
        state.device_mut(3).unwrap().fetches_messages = false;

        assert_eq!(state.enabled_device_count(NOW), 2);
        assert_eq!(
            state.devices_matching(|d| !d.is_enabled(NOW)).len(),
            1
        );
        assert!(state.is_enabled(NOW));
    }

    #[test]
    fn capability_aggregation_ignores_disabled_devices() {
        let mut state = account_with(&[1, 2]);
        let caps = DeviceCapabilities {
            storage: true,
            transfer: true,
            pni: true,
            payment_activation: false,
        };
        state.device_mut(1).unwrap().capabilities = Some(caps);
        assert!(!state.is_pni_supported(NOW));

        // device 2 lacks capabilities; once disabled it no longer counts
        state.device_mut(2).unwrap().fetches_messages = false;
        assert!(state.is_pni_supported(NOW));
        assert!(!state.is_payment_activation_supported(NOW));
        assert!(state.is_storage_supported());
        assert!(state.is_transfer_supported());
    }

    #[test]
    fn identity_key_change_requires_primary() {
        let mut state = account_with(&[1, 2]);
        let key = IdentityKey(vec![9; 33]);

        assert_eq!(
            state.authorize_identity_key_change(2, IdentityType::Aci, &key),
            IdentityKeyChange::Forbidden {
                had_identity_key: false
            }
        );
        assert_eq!(
            state.authorize_identity_key_change(1, IdentityType::Aci, &key),
            IdentityKeyChange::Permitted {
                had_identity_key: false
            }
        );

        state.set_identity_key(IdentityType::Aci, Some(key.clone()));
        assert_eq!(
            state.authorize_identity_key_change(2, IdentityType::Aci, &key),
            IdentityKeyChange::Unchanged
        );
        assert_eq!(
            state.authorize_identity_key_change(2, IdentityType::Aci, &IdentityKey(vec![8; 33])),
            IdentityKeyChange::Forbidden {
                had_identity_key: true
            }
        );
        // the PNI namespace is independent
        assert_eq!(
            state.authorize_identity_key_change(1, IdentityType::Pni, &key),
            IdentityKeyChange::Permitted {
                had_identity_key: false
            }
        );
    }

    #[test]
    fn stale_snapshot_refuses_access() {
        let account = Account::new(account_with(&[1]));
        let clone = account.clone();
        assert!(account.state().is_ok());

        account.mark_stale();

        assert!(matches!(account.state(), Err(KeysError::StaleAccount)));
        assert!(matches!(clone.state(), Err(KeysError::StaleAccount)));
        assert!(matches!(clone.into_state(), Err(KeysError::StaleAccount)));
        // the identifier remains readable for diagnostics
        let _ = account.uuid();
    }

    #[test]
    fn identified_by_matches_namespace() {
        let state = account_with(&[1]);
        assert!(state.is_identified_by(&ServiceIdentifier::aci(state.uuid())));
        assert!(state.is_identified_by(&ServiceIdentifier::pni(state.phone_number_identifier())));
        assert!(!state.is_identified_by(&ServiceIdentifier::pni(state.uuid())));
    }
}
