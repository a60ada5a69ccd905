//! Authorization for reading another account's keys.
//!
//! A caller is either an authenticated device or anonymous with the target's
//! unidentified access key. Failures are shaped so that a missing target and
//! a wrong access key look the same to an anonymous caller.

use subtle::ConstantTimeEq;

use crate::account::Account;
use crate::device::{Device, DeviceId, DeviceSelector};
use crate::KeysError;

/// Length of an unidentified access key.
pub const UNIDENTIFIED_ACCESS_KEY_LENGTH: usize = 16;

/// A device that has proven possession of its account credentials.
#[derive(Debug, Clone)]
pub struct AuthenticatedAccount {
    pub account: Account,
    pub device_id: DeviceId,
}

impl AuthenticatedAccount {
    pub fn new(account: Account, device_id: DeviceId) -> Self {
        Self { account, device_id }
    }

    pub fn device(&self) -> Result<&Device, KeysError> {
        self.account
            .state()?
            .device(self.device_id)
            .ok_or(KeysError::Unauthenticated)
    }
}

/// Access key presented by an anonymous caller.
#[derive(Clone)]
pub struct AnonymousAccessKey(Vec<u8>);

impl AnonymousAccessKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for AnonymousAccessKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AnonymousAccessKey(..)")
    }
}

pub trait AccessControl: Send + Sync {
    /// Decide whether the caller may read `target`'s keys for `device_selector`.
    ///
    /// `target` is `None` when the identifier did not resolve; implementations
    /// must still reject without revealing that.
    fn verify(
        &self,
        requester: Option<&Account>,
        access_key: Option<&AnonymousAccessKey>,
        target: Option<&Account>,
        device_selector: &str,
        now_ms: u64,
    ) -> Result<(), KeysError>;
}

/// Default policy.
///
/// Authenticated callers see `NotFound` for missing or disabled targets.
/// Anonymous callers need the target's unidentified access key (or any key if
/// the target allows unrestricted access) and see `Unauthenticated` for every
/// failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct OptionalAccess;

impl AccessControl for OptionalAccess {
    fn verify(
        &self,
        requester: Option<&Account>,
        access_key: Option<&AnonymousAccessKey>,
        target: Option<&Account>,
        device_selector: &str,
        now_ms: u64,
    ) -> Result<(), KeysError> {
        if requester.is_some() {
            let Some(target) = target else {
                return Err(KeysError::NotFound);
            };
            let target = target.state()?;
            if !target.is_enabled(now_ms) {
                return Err(KeysError::NotFound);
            }
            let selector: DeviceSelector = device_selector.parse()?;
            if selector.select(target, now_ms).is_empty() {
                return Err(KeysError::NotFound);
            }
            return Ok(());
        }

        let (Some(access_key), Some(target)) = (access_key, target) else {
            return Err(KeysError::Unauthenticated);
        };
        let target = target.state()?;

        if !target.is_enabled(now_ms) {
            return Err(KeysError::Unauthenticated);
        }
        if target.is_unrestricted_unidentified_access() {
            return Ok(());
        }

        let selector: DeviceSelector = device_selector.parse()?;
        if selector != DeviceSelector::All && selector.select(target, now_ms).is_empty() {
            return Err(KeysError::Unauthenticated);
        }

        let Some(expected) = target.unidentified_access_key() else {
            return Err(KeysError::Unauthenticated);
        };
        if expected.len() != access_key.as_bytes().len()
            || !bool::from(expected.ct_eq(access_key.as_bytes()))
        {
            return Err(KeysError::Unauthenticated);
        }
        Ok(())
    }
}
