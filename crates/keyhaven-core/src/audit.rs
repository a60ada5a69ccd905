//! Reporting of identity-key change attempts.

use parking_lot::Mutex;

use crate::identity::{AccountId, IdentityType};

/// An identity-key change that was either accepted or refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKeyAudit {
    Changed {
        account: AccountId,
        identity_type: IdentityType,
        had_identity_key: bool,
    },
    Forbidden {
        account: AccountId,
        identity_type: IdentityType,
        had_identity_key: bool,
    },
}

pub trait AuditSink: Send + Sync {
    fn identity_key_change(&self, event: IdentityKeyAudit);
}

/// Emits audit events as `tracing` records under the `keyhaven::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn identity_key_change(&self, event: IdentityKeyAudit) {
        match event {
            IdentityKeyAudit::Changed {
                account,
                identity_type,
                had_identity_key,
            } => tracing::info!(
                target: "keyhaven::audit",
                %account,
                %identity_type,
                had_identity_key,
                "identity key changed"
            ),
            IdentityKeyAudit::Forbidden {
                account,
                identity_type,
                had_identity_key,
            } => tracing::warn!(
                target: "keyhaven::audit",
                %account,
                %identity_type,
                had_identity_key,
                "identity key change from linked device refused"
            ),
        }
    }
}

/// Keeps every event in memory. Useful in tests and for embedding callers
/// that forward events elsewhere.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: Mutex<Vec<IdentityKeyAudit>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<IdentityKeyAudit> {
        self.events.lock().clone()
    }
}

impl AuditSink for RecordingAuditSink {
    fn identity_key_change(&self, event: IdentityKeyAudit) {
        self.events.lock().push(event);
    }
}
