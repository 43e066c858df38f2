//! DNS Provider Adapters
//!
//! Trait-based abstraction over a DNS vendor's zone API. The controller only
//! ever lists a zone, applies a change set to it, and asks which zone is
//! responsible for a host.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::endpoint::{is_subdomain, Changes, Endpoint, Zone};
use crate::record::ProviderRef;

pub mod cloudflare;
pub mod inmemory;

pub use cloudflare::CloudflareProvider;
pub use inmemory::InMemoryProvider;

/// Errors surfaced by a provider
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("zone not found for host {0}")]
    ZoneNotFound(String),

    #[error("no DNS provider configured for reference {0}")]
    MissingProvider(String),

    #[error("{0}")]
    Api(String),

    #[error("provider request failed: {0}")]
    Transport(String),
}

impl ProviderError {
    /// Absence reported by the provider, which deletion treats as success
    pub fn is_benign_absence(&self) -> bool {
        let message = self.to_string().to_lowercase();
        message.contains("not found") || message.contains("no endpoints")
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Transport(err.to_string())
    }
}

/// A DNS vendor API
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// List every endpoint in the zone
    async fn records(&self, zone: &Zone) -> Result<Vec<Endpoint>, ProviderError>;

    /// Apply a change set. Not atomic: a failure may leave part of the batch applied.
    async fn apply_changes(&self, zone: &Zone, changes: &Changes) -> Result<(), ProviderError>;

    /// Find the zone responsible for `host`
    async fn zone_for_host(&self, host: &str) -> Result<Zone, ProviderError>;
}

/// Pick the zone whose domain is the longest suffix of `host`
pub fn best_zone_for_host<'a, I>(zones: I, host: &str) -> Option<Zone>
where
    I: IntoIterator<Item = &'a Zone>,
{
    zones
        .into_iter()
        .filter(|zone| is_subdomain(host, &zone.dns_name))
        .max_by_key(|zone| zone.dns_name.len())
        .cloned()
}

/// Resolves the provider a record publishes through
pub trait ProviderFactory: Send + Sync {
    fn provider_for(&self, reference: Option<&ProviderRef>) -> Result<Arc<dyn Provider>, ProviderError>;
}

/// Factory over a fixed set of named providers with an optional default
#[derive(Default, Clone)]
pub struct StaticProviderFactory {
    providers: HashMap<String, Arc<dyn Provider>>,
    default: Option<String>,
}

impl StaticProviderFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, name: &str, provider: Arc<dyn Provider>) -> Self {
        self.providers.insert(name.to_string(), provider);
        self
    }

    /// Provider used by records without an explicit reference
    pub fn with_default(mut self, name: &str) -> Self {
        self.default = Some(name.to_string());
        self
    }
}

impl ProviderFactory for StaticProviderFactory {
    fn provider_for(&self, reference: Option<&ProviderRef>) -> Result<Arc<dyn Provider>, ProviderError> {
        let name = reference
            .map(|r| r.name.clone())
            .or_else(|| self.default.clone())
            .ok_or_else(|| ProviderError::MissingProvider("<none>".to_string()))?;

        self.providers
            .get(&name)
            .cloned()
            .ok_or(ProviderError::MissingProvider(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_zone_prefers_longest_suffix() {
        let zones = vec![
            Zone::new("z1", "example.com"),
            Zone::new("z2", "sub.example.com"),
            Zone::new("z3", "other.com"),
        ];

        let best = best_zone_for_host(&zones, "foo.sub.example.com").unwrap();
        assert_eq!(best.id, "z2");

        let best = best_zone_for_host(&zones, "foo.example.com").unwrap();
        assert_eq!(best.id, "z1");

        assert!(best_zone_for_host(&zones, "foo.example.org").is_none());
    }

    #[test]
    fn test_benign_absence_detection() {
        assert!(ProviderError::Api("record not found".to_string()).is_benign_absence());
        assert!(ProviderError::Api("No endpoints to delete".to_string()).is_benign_absence());
        assert!(!ProviderError::Transport("connection reset".to_string()).is_benign_absence());
        assert!(!ProviderError::MissingProvider("cf".to_string()).is_benign_absence());
    }

    #[test]
    fn test_static_factory_resolves_default_and_reports_missing() {
        let factory = StaticProviderFactory::new()
            .with_provider("memory", Arc::new(InMemoryProvider::new()))
            .with_default("memory");

        assert!(factory.provider_for(None).is_ok());

        let missing = ProviderRef {
            name: "route53".to_string(),
        };
        let err = factory.provider_for(Some(&missing)).err().unwrap();
        assert!(matches!(err, ProviderError::MissingProvider(name) if name == "route53"));
    }
}
