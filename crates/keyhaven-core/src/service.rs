//! The prekey service.
//!
//! Devices upload key material with [`KeysService::set_keys`] and peers fetch
//! bundles with [`KeysService::get_device_keys`]. Authorization, validation and
//! rate limiting all happen before anything is written or consumed.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;

use crate::access::{AccessControl, AnonymousAccessKey, AuthenticatedAccount, OptionalAccess};
use crate::account::{Account, AccountState, IdentityKeyChange};
use crate::audit::{AuditSink, IdentityKeyAudit, TracingAuditSink};
use crate::config::KeysConfig;
use crate::device::{Device, DeviceId, DeviceSelector, PRIMARY_ID};
use crate::identity::{AccountId, IdentityType, ServiceIdentifier};
use crate::keys::{EcSignedPreKey, PreKeyCount, PreKeyResponse, PreKeyResponseItem, PreKeyState};
use crate::rate_limit::{RateLimiter, TokenBucketLimiter};
use crate::store::{AccountDirectory, PreKeyStore};
use crate::{timestamp_now_millis, KeysError};

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

pub struct KeysService {
    accounts: Arc<dyn AccountDirectory>,
    keys: Arc<dyn PreKeyStore>,
    access: Arc<dyn AccessControl>,
    rate_limiter: Arc<dyn RateLimiter>,
    audit: Arc<dyn AuditSink>,
    config: KeysConfig,
}

impl KeysService {
    /// Build a service with the default access policy, a token-bucket limiter
    /// sized from `config`, and audit events logged through `tracing`.
    pub fn new(
        accounts: Arc<dyn AccountDirectory>,
        keys: Arc<dyn PreKeyStore>,
        config: KeysConfig,
    ) -> Self {
        Self {
            accounts,
            keys,
            access: Arc::new(OptionalAccess),
            rate_limiter: Arc::new(TokenBucketLimiter::new(config.pre_keys_rate_limit)),
            audit: Arc::new(TracingAuditSink),
            config,
        }
    }

    pub fn with_access_control(mut self, access: Arc<dyn AccessControl>) -> Self {
        self.access = access;
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn accounts(&self) -> &Arc<dyn AccountDirectory> {
        &self.accounts
    }

    pub fn config(&self) -> &KeysConfig {
        &self.config
    }

    /// Remaining one-time EC and PQ prekeys for the caller's own device.
    pub async fn get_status(
        &self,
        auth: &AuthenticatedAccount,
        identity_type: IdentityType,
    ) -> Result<PreKeyCount, KeysError> {
        let identifier = auth.account.state()?.identifier(identity_type);
        let device_id = auth.device()?.id;

        let (count, pq_count) = futures::try_join!(
            self.keys.get_ec_count(&identifier, device_id),
            self.keys.get_pq_count(&identifier, device_id),
        )?;
        Ok(PreKeyCount { count, pq_count })
    }

    /// Store an upload from the caller's device.
    ///
    /// A changed signed prekey or identity key is written to the account first
    /// (identity keys only from the primary device); the one-time batches and
    /// keys then go to the prekey store. Returns the account as it stands after
    /// the upload; `auth.account` is stale if the account was rewritten.
    pub async fn set_keys(
        &self,
        auth: &AuthenticatedAccount,
        pre_keys: &PreKeyState,
        identity_type: IdentityType,
    ) -> Result<Account, KeysError> {
        pre_keys.validate()?;

        let state = auth.account.state()?;
        let device = auth.device()?;
        let device_id = device.id;
        let identifier = state.identifier(identity_type);

        let signed_pre_key_changed = pre_keys
            .signed_pre_key
            .as_ref()
            .is_some_and(|key| device.signed_pre_key(identity_type) != Some(key));
        let identity_key_change =
            self.authorize_identity_key(state, device_id, pre_keys, identity_type)?;

        let account = if signed_pre_key_changed || identity_key_change.is_some() {
            let account = self
                .accounts
                .update(&auth.account, &mut |mut account: AccountState| {
                    if let Some(ref key) = pre_keys.signed_pre_key {
                        if let Some(device) = account.device_mut(device_id) {
                            device.set_signed_pre_key(identity_type, Some(key.clone()));
                        }
                    }
                    // The mutation may be reapplied to a newer version than the
                    // one authorized above, so only the primary writes the key.
                    if let Some(ref key) = pre_keys.identity_key {
                        if device_id == PRIMARY_ID {
                            account.set_identity_key(identity_type, Some(key.clone()));
                        }
                    }
                    account
                })
                .await?;
            if let Some(event) = identity_key_change {
                self.record_identity_key_change(event, device.created);
            }
            account
        } else {
            auth.account.clone()
        };

        self.keys
            .store(
                &identifier,
                device_id,
                &pre_keys.pre_keys,
                &pre_keys.pq_pre_keys,
                pre_keys.signed_pre_key.as_ref(),
                pre_keys.pq_last_resort_pre_key.as_ref(),
            )
            .await?;

        tracing::debug!(
            account = %auth.account.uuid(),
            device = device_id,
            %identity_type,
            ec = pre_keys.pre_keys.len(),
            pq = pre_keys.pq_pre_keys.len(),
            "stored prekeys"
        );
        Ok(account)
    }

    /// The pending `Changed` event when the upload replaces the namespace
    /// identity key. Fails with `Forbidden` when a linked device attempts it.
    fn authorize_identity_key(
        &self,
        state: &AccountState,
        device_id: DeviceId,
        pre_keys: &PreKeyState,
        identity_type: IdentityType,
    ) -> Result<Option<IdentityKeyAudit>, KeysError> {
        let Some(ref new_key) = pre_keys.identity_key else {
            return Ok(None);
        };
        let account = state.uuid();

        match state.authorize_identity_key_change(device_id, identity_type, new_key) {
            IdentityKeyChange::Unchanged => Ok(None),
            IdentityKeyChange::Forbidden { had_identity_key } => {
                self.audit.identity_key_change(IdentityKeyAudit::Forbidden {
                    account,
                    identity_type,
                    had_identity_key,
                });
                Err(KeysError::Forbidden)
            }
            IdentityKeyChange::Permitted { had_identity_key } => {
                Ok(Some(IdentityKeyAudit::Changed {
                    account,
                    identity_type,
                    had_identity_key,
                }))
            }
        }
    }

    fn record_identity_key_change(&self, event: IdentityKeyAudit, device_created: u64) {
        if let IdentityKeyAudit::Changed {
            account,
            identity_type,
            had_identity_key: true,
        } = event
        {
            let age_days = timestamp_now_millis().saturating_sub(device_created) / DAY_MS;
            tracing::warn!(
                %account,
                %identity_type,
                age_days,
                "existing identity key changed"
            );
        }
        self.audit.identity_key_change(event);
    }

    /// Fetch a bundle for `target`'s devices named by `device_selector`
    /// (`*` or a device id), consuming one one-time key of each requested kind
    /// per device.
    pub async fn get_device_keys(
        &self,
        auth: Option<&AuthenticatedAccount>,
        access_key: Option<&AnonymousAccessKey>,
        target_identifier: &ServiceIdentifier,
        device_selector: &str,
        return_pq_key: bool,
    ) -> Result<PreKeyResponse, KeysError> {
        if auth.is_none() && access_key.is_none() {
            return Err(KeysError::Unauthenticated);
        }
        let now = timestamp_now_millis();

        let target = self
            .accounts
            .get_by_service_identifier(target_identifier)
            .await?;
        self.access.verify(
            auth.map(|a| &a.account),
            access_key,
            target.as_ref(),
            device_selector,
            now,
        )?;
        let target = target.ok_or(KeysError::NotFound)?;

        if let Some(auth) = auth {
            let key = format!(
                "{}.{}__{}.{}",
                auth.account.uuid(),
                auth.device_id,
                target_identifier.id,
                device_selector
            );
            self.rate_limiter.validate(&key).await?;
        }

        let selector: DeviceSelector = device_selector.parse()?;
        let state = target.state()?;
        let identity_type = target_identifier.identity_type;

        let items: Vec<PreKeyResponseItem> = join_all(
            selector
                .select(state, now)
                .into_iter()
                .map(|device| self.device_item(target_identifier, device, return_pq_key)),
        )
        .await
        .into_iter()
        .flatten()
        .collect();

        if items.is_empty() {
            return Err(KeysError::NotFound);
        }
        Ok(PreKeyResponse {
            identity_key: state.identity_key(identity_type).cloned(),
            devices: items,
        })
    }

    async fn device_item(
        &self,
        target_identifier: &ServiceIdentifier,
        device: &Device,
        return_pq_key: bool,
    ) -> Option<PreKeyResponseItem> {
        let identity_type = target_identifier.identity_type;
        let identifier = &target_identifier.id;
        let signed_pre_key = device.signed_pre_key(identity_type).cloned();

        let (pre_key, pq_pre_key) = futures::join!(
            self.keys.take_ec(identifier, device.id),
            async {
                if return_pq_key {
                    self.keys.take_pq(identifier, device.id).await
                } else {
                    Ok(None)
                }
            }
        );
        let pre_key = pre_key.unwrap_or_else(|err| {
            tracing::warn!(%target_identifier, device = device.id, error = %err, "EC prekey take failed");
            None
        });
        let pq_pre_key = pq_pre_key.unwrap_or_else(|err| {
            tracing::warn!(%target_identifier, device = device.id, error = %err, "PQ prekey take failed");
            None
        });

        if self.config.compare_signed_pre_keys {
            self.compare_signed_pre_key(identifier, device, signed_pre_key.as_ref())
                .await;
        }

        if signed_pre_key.is_none() && pre_key.is_none() && pq_pre_key.is_none() {
            return None;
        }
        Some(PreKeyResponseItem {
            device_id: device.id,
            registration_id: device.registration_id(identity_type),
            signed_pre_key,
            pre_key,
            pq_pre_key,
        })
    }

    /// Log whether the prekey store agrees with the account on a device's
    /// signed prekey.
    async fn compare_signed_pre_key(
        &self,
        identifier: &AccountId,
        device: &Device,
        served: Option<&EcSignedPreKey>,
    ) {
        match self.keys.get_ec_signed_pre_key(identifier, device.id).await {
            Ok(stored) if stored.as_ref() == served => {
                tracing::debug!(%identifier, device = device.id, "signed prekeys match");
            }
            Ok(stored) => tracing::warn!(
                %identifier,
                device = device.id,
                served = served.map(|k| k.key_id),
                stored = stored.map(|k| k.key_id),
                "signed prekey mismatch"
            ),
            Err(err) => {
                tracing::warn!(%identifier, device = device.id, error = %err, "signed prekey comparison failed");
            }
        }
    }

    /// Replace the caller device's signed EC prekey for one namespace.
    pub async fn set_signed_key(
        &self,
        auth: &AuthenticatedAccount,
        signed_pre_key: &EcSignedPreKey,
        identity_type: IdentityType,
    ) -> Result<Account, KeysError> {
        signed_pre_key.validate()?;
        let identifier = auth.account.state()?.identifier(identity_type);
        let device_id = auth.device()?.id;

        let account = self
            .accounts
            .update_device(&auth.account, device_id, &mut |device: &mut Device| {
                device.set_signed_pre_key(identity_type, Some(signed_pre_key.clone()));
            })
            .await?;

        self.keys
            .store_ec_signed_pre_keys(
                &identifier,
                &HashMap::from([(device_id, signed_pre_key.clone())]),
            )
            .await?;
        Ok(account)
    }
}
