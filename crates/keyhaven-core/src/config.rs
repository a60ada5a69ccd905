use serde::{Deserialize, Serialize};

use crate::rate_limit::RateLimiterConfig;

/// Tunables for [`KeysService`](crate::service::KeysService).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeysConfig {
    /// Bucket for `get_device_keys`, per caller device and target.
    pub pre_keys_rate_limit: RateLimiterConfig,
    /// Compare each served signed prekey against the prekey store's copy and
    /// log mismatches. Never changes the response.
    pub compare_signed_pre_keys: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: KeysConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, KeysConfig::default());
        assert!(!config.compare_signed_pre_keys);
        assert_eq!(config.pre_keys_rate_limit.bucket_size, 6000);
    }

    #[test]
    fn partial_rate_limit_override() {
        let config: KeysConfig = serde_json::from_str(
            r#"{"preKeysRateLimit": {"bucketSize": 10}, "compareSignedPreKeys": true}"#,
        )
        .unwrap();
        assert_eq!(config.pre_keys_rate_limit.bucket_size, 10);
        assert!((config.pre_keys_rate_limit.leak_rate_per_minute - 100.0).abs() < f64::EPSILON);
        assert!(config.compare_signed_pre_keys);
    }
}
