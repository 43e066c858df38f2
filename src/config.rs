//! Controller configuration
//!
//! Timing knobs and registry settings, injected into the controller at
//! construction. Loaded from JSON and overridden by command line flags.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::plan::Policy;
use crate::registry::RegistryConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Identifies this cluster in owner ids and remote status slots
    pub cluster_id: String,

    /// Validity window once a record has converged
    #[serde(rename = "validForSeconds", with = "duration_secs")]
    pub valid_for: Duration,

    /// Validity window while changes are still settling
    #[serde(rename = "validationRequeueSeconds", with = "duration_secs")]
    pub validation_requeue: Duration,

    /// Retry interval after provider or lookup failures
    #[serde(rename = "errorRequeueSeconds", with = "duration_secs")]
    pub error_requeue: Duration,

    /// Deadline for a single reconcile
    #[serde(rename = "reconcileTimeoutSeconds", with = "duration_secs")]
    pub reconcile_timeout: Duration,

    /// Interval at which every record is queued again
    #[serde(rename = "resyncSeconds", with = "duration_secs")]
    pub resync: Duration,

    pub workers: usize,

    /// Immediate retries of a conflicting status write
    pub status_retries: usize,

    pub default_policy: Policy,

    /// Namespace holding authoritative records
    pub authoritative_namespace: String,

    /// Nameservers asked for the active-groups signal
    pub active_groups_nameservers: Vec<String>,

    pub registry: RegistryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cluster_id: "local".to_string(),
            valid_for: Duration::from_secs(15 * 60),
            validation_requeue: Duration::from_secs(5),
            error_requeue: Duration::from_secs(30),
            reconcile_timeout: Duration::from_secs(60),
            resync: Duration::from_secs(5 * 60),
            workers: 4,
            status_retries: 5,
            default_policy: Policy::Sync,
            authoritative_namespace: "lornu-dns".to_string(),
            active_groups_nameservers: Vec::new(),
            registry: RegistryConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Serialize a `Duration` as whole seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::RecordType;

    #[test]
    fn test_defaults() {
        let config = ControllerConfig::default();

        assert_eq!(config.valid_for, Duration::from_secs(900));
        assert_eq!(config.validation_requeue, Duration::from_secs(5));
        assert_eq!(config.error_requeue, Duration::from_secs(30));
        assert_eq!(config.registry.txt_prefix, "kuadrant-");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ControllerConfig = serde_json::from_str(
            r#"{
                "clusterId": "eu-west",
                "validForSeconds": 60,
                "defaultPolicy": "upsert-only",
                "registry": { "managedTypes": ["A", "CNAME", "MX"] }
            }"#,
        )
        .unwrap();

        assert_eq!(config.cluster_id, "eu-west");
        assert_eq!(config.valid_for, Duration::from_secs(60));
        assert_eq!(config.error_requeue, Duration::from_secs(30));
        assert_eq!(config.default_policy, Policy::UpsertOnly);
        assert!(config.registry.is_managed(RecordType::MX));
        assert_eq!(config.registry.wildcard_replacement, "wildcard");
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("dns-controller-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"{"workers": 8}"#).unwrap();

        let config = ControllerConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.workers, 8);
        assert!(ControllerConfig::from_file(&path).is_err());
    }
}
