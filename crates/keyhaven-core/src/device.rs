use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::account::AccountState;
use crate::identity::IdentityType;
use crate::keys::EcSignedPreKey;
use crate::KeysError;

pub type DeviceId = u32;

/// The primary device. Only it may change the account's identity keys.
pub const PRIMARY_ID: DeviceId = 1;

/// Highest device id an account may hold.
pub const MAXIMUM_DEVICE_ID: DeviceId = 256;

/// Linked devices unseen for longer than this are disabled.
pub const ENABLED_WINDOW_MS: u64 = 30 * 24 * 60 * 60 * 1000;

/// Optional features a device advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceCapabilities {
    pub storage: bool,
    pub transfer: bool,
    pub pni: bool,
    pub payment_activation: bool,
}

/// One device linked to an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceId,
    #[serde(default)]
    pub name: Option<String>,
    /// Device polls for messages over a persistent connection.
    #[serde(default)]
    pub fetches_messages: bool,
    #[serde(default)]
    pub gcm_id: Option<String>,
    #[serde(default)]
    pub apn_id: Option<String>,
    pub registration_id: u32,
    #[serde(default)]
    pub pni_registration_id: Option<u32>,
    #[serde(default)]
    signed_pre_key: Option<EcSignedPreKey>,
    #[serde(default)]
    pni_signed_pre_key: Option<EcSignedPreKey>,
    /// Milliseconds since the UNIX epoch.
    #[serde(default)]
    pub last_seen: u64,
    /// Milliseconds since the UNIX epoch.
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub capabilities: Option<DeviceCapabilities>,
}

impl Device {
    pub fn new(id: DeviceId, registration_id: u32) -> Self {
        Self {
            id,
            name: None,
            fetches_messages: false,
            gcm_id: None,
            apn_id: None,
            registration_id,
            pni_registration_id: None,
            signed_pre_key: None,
            pni_signed_pre_key: None,
            last_seen: 0,
            created: 0,
            capabilities: None,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.id == PRIMARY_ID
    }

    /// Whether the device can be reached at all: it either fetches messages
    /// itself or holds a push token.
    pub fn has_push_channel(&self) -> bool {
        let non_empty = |token: &Option<String>| token.as_deref().is_some_and(|t| !t.is_empty());
        self.fetches_messages || non_empty(&self.gcm_id) || non_empty(&self.apn_id)
    }

    /// Reachable, holds an ACI signed prekey, and (unless primary) was seen
    /// within [`ENABLED_WINDOW_MS`] of `now_ms`.
    pub fn is_enabled(&self, now_ms: u64) -> bool {
        if !self.has_push_channel() || self.signed_pre_key.is_none() {
            return false;
        }
        self.is_primary() || now_ms.saturating_sub(self.last_seen) <= ENABLED_WINDOW_MS
    }

    pub fn signed_pre_key(&self, identity_type: IdentityType) -> Option<&EcSignedPreKey> {
        match identity_type {
            IdentityType::Aci => self.signed_pre_key.as_ref(),
            IdentityType::Pni => self.pni_signed_pre_key.as_ref(),
        }
    }

    pub fn set_signed_pre_key(&mut self, identity_type: IdentityType, key: Option<EcSignedPreKey>) {
        match identity_type {
            IdentityType::Aci => self.signed_pre_key = key,
            IdentityType::Pni => self.pni_signed_pre_key = key,
        }
    }

    /// Registration id for the namespace; PNI falls back to the ACI value.
    pub fn registration_id(&self, identity_type: IdentityType) -> u32 {
        match identity_type {
            IdentityType::Aci => self.registration_id,
            IdentityType::Pni => self.pni_registration_id.unwrap_or(self.registration_id),
        }
    }
}

/// Which of a target's devices a bundle fetch asks for: `*` or one numeric id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSelector {
    All,
    Single(DeviceId),
    /// A well-formed number that can never name a device (negative, too big).
    OutOfRange,
}

impl DeviceSelector {
    /// The enabled devices of `account` this selector names.
    pub fn select<'a>(&self, account: &'a AccountState, now_ms: u64) -> Vec<&'a Device> {
        match *self {
            Self::All => account.devices_matching(|d| d.is_enabled(now_ms)),
            Self::Single(id) => account
                .device(id)
                .filter(|d| d.is_enabled(now_ms))
                .into_iter()
                .collect(),
            Self::OutOfRange => Vec::new(),
        }
    }
}

impl FromStr for DeviceSelector {
    type Err = KeysError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "*" {
            return Ok(Self::All);
        }
        let id: i64 = s
            .parse()
            .map_err(|_| KeysError::Validation(format!("malformed device id: {s}")))?;
        Ok(DeviceId::try_from(id).map_or(Self::OutOfRange, Self::Single))
    }
}
