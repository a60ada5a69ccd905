pub mod access;
pub mod account;
pub mod audit;
pub mod config;
pub mod device;
pub mod error;
pub mod identity;
pub mod keys;
pub mod memory_stores;
pub mod rate_limit;
pub mod service;
pub mod store;

pub use access::{AccessControl, AnonymousAccessKey, AuthenticatedAccount, OptionalAccess};
pub use account::{Account, AccountState};
pub use config::KeysConfig;
pub use device::{Device, DeviceId, DeviceSelector};
pub use error::KeysError;
pub use identity::{AccountId, IdentityType, ServiceIdentifier};
pub use service::KeysService;
pub use store::{AccountDirectory, PreKeyStore};

/// Milliseconds since the UNIX epoch.
pub fn timestamp_now_millis() -> u64 {
    let elapsed = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
