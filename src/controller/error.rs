use std::time::Duration;
use thiserror::Error;

use crate::config::ControllerConfig;
use crate::delegation::groups::LookupError;
use crate::plan::PlanError;
use crate::provider::ProviderError;
use crate::record::ConditionReason;
use crate::registry::RegistryError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("active groups lookup failed: {0}")]
    Lookup(#[from] LookupError),

    #[error("reconcile did not finish within {0:?}")]
    Timeout(Duration),
}

/// How soon a failed reconcile is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Needs a spec or configuration change
    Config,
    /// Another owner holds the name; may resolve as writers converge
    Conflict,
    Transient,
}

impl ReconcileError {
    fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            ReconcileError::Provider(e) | ReconcileError::Registry(RegistryError::Provider(e)) => Some(e),
            _ => None,
        }
    }

    pub fn reason(&self) -> ConditionReason {
        match self {
            ReconcileError::Plan(e) => match e {
                PlanError::ApexDomain { .. } => ConditionReason::ApexDomain,
                PlanError::ZoneMismatch { .. } => ConditionReason::ZoneMismatch,
                PlanError::RecordTypeConflict { .. } => ConditionReason::RecordTypeConflict,
                PlanError::TargetConflict { .. } => ConditionReason::TargetConflict,
                PlanError::DanglingTarget { .. } => ConditionReason::DanglingTarget,
                PlanError::UnknownPolicy(_) => ConditionReason::ProviderError,
            },
            ReconcileError::Lookup(_) => ConditionReason::ActiveGroupsLookupFailed,
            _ => match self.provider_error() {
                Some(ProviderError::ZoneNotFound(_)) => ConditionReason::ZoneNotFound,
                Some(ProviderError::MissingProvider(_)) => ConditionReason::MissingProvider,
                _ => ConditionReason::ProviderError,
            },
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self.reason() {
            ConditionReason::ApexDomain
            | ConditionReason::ZoneMismatch
            | ConditionReason::ZoneNotFound
            | ConditionReason::MissingProvider => ErrorCategory::Config,
            ConditionReason::RecordTypeConflict
            | ConditionReason::TargetConflict
            | ConditionReason::DanglingTarget => ErrorCategory::Conflict,
            _ if matches!(self, ReconcileError::Plan(PlanError::UnknownPolicy(_))) => ErrorCategory::Config,
            _ => ErrorCategory::Transient,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Absence the provider reports while tearing a record down
    pub fn is_benign_absence(&self) -> bool {
        self.provider_error().is_some_and(ProviderError::is_benign_absence)
    }

    pub fn requeue_after(&self, config: &ControllerConfig) -> Duration {
        match self.category() {
            ErrorCategory::Config => config.valid_for,
            ErrorCategory::Conflict => config.validation_requeue,
            ErrorCategory::Transient => config.error_requeue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reasons_and_requeue() {
        let config = ControllerConfig::default();

        let apex = ReconcileError::from(PlanError::ApexDomain {
            root_host: "example.com".to_string(),
            zone: "example.com".to_string(),
        });
        assert_eq!(apex.reason(), ConditionReason::ApexDomain);
        assert_eq!(apex.requeue_after(&config), config.valid_for);

        let conflict = ReconcileError::from(PlanError::TargetConflict {
            name: "foo.example.com".to_string(),
            ours: "a".to_string(),
            theirs: "b".to_string(),
        });
        assert_eq!(conflict.requeue_after(&config), config.validation_requeue);

        let wrapped = ReconcileError::from(RegistryError::Provider(ProviderError::ZoneNotFound(
            "foo.example.com".to_string(),
        )));
        assert_eq!(wrapped.reason(), ConditionReason::ZoneNotFound);

        let transient = ReconcileError::from(ProviderError::Transport("reset".to_string()));
        assert!(transient.is_transient());
        assert_eq!(transient.requeue_after(&config), config.error_requeue);
    }

    #[test]
    fn test_benign_absence() {
        let gone = ReconcileError::from(ProviderError::Api("record foo not found".to_string()));
        assert!(gone.is_benign_absence());
        assert!(!ReconcileError::from(ProviderError::Api("rate limited".to_string())).is_benign_absence());
    }
}
