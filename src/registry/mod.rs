//! Ownership Registry
//!
//! Wraps a [`Provider`] so that every managed endpoint travels with a
//! provenance TXT record naming the owner that contributed it. Reading
//! decodes (and decrypts) the markers, writing encodes them.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::endpoint::{merge_by_key, Changes, Endpoint, RecordType, Zone};
use crate::provider::{Provider, ProviderError};

pub mod encryption;
pub mod mapper;
pub mod ownership;
pub mod provenance;

pub use encryption::ProvenanceCipher;
pub use mapper::TxtNameMapper;
pub use ownership::{OwnershipEntry, OwnershipIndex};
pub use provenance::{Provenance, ProvenanceError};

use provenance::{quote, split_segments};

pub const DEFAULT_TXT_PREFIX: &str = "kuadrant-";
pub const DEFAULT_WILDCARD_REPLACEMENT: &str = "wildcard";

/// Label stamped on endpoints produced by this registry
pub const OWNER_LABEL: &str = "owner";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("failed to encode provenance for {name}: {source}")]
    Encode {
        name: String,
        #[source]
        source: ProvenanceError,
    },
}

/// Registry settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistryConfig {
    pub txt_prefix: String,
    pub wildcard_replacement: String,
    /// Passphrase for provenance encryption; plaintext markers when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    pub managed_types: Vec<RecordType>,
    pub excluded_types: Vec<RecordType>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            txt_prefix: DEFAULT_TXT_PREFIX.to_string(),
            wildcard_replacement: DEFAULT_WILDCARD_REPLACEMENT.to_string(),
            encryption_key: None,
            managed_types: vec![RecordType::A, RecordType::AAAA, RecordType::CNAME],
            excluded_types: Vec::new(),
        }
    }
}

impl RegistryConfig {
    pub fn mapper(&self) -> TxtNameMapper {
        TxtNameMapper::new(&self.txt_prefix, &self.wildcard_replacement)
    }

    pub fn is_managed(&self, record_type: RecordType) -> bool {
        self.managed_types.contains(&record_type) && !self.excluded_types.contains(&record_type)
    }
}

/// TXT-backed ownership registry for one zone and one owner
pub struct TxtRegistry {
    provider: Arc<dyn Provider>,
    zone: Zone,
    owner_id: String,
    group: Option<String>,
    mapper: TxtNameMapper,
    cipher: Option<ProvenanceCipher>,
    config: RegistryConfig,
}

impl TxtRegistry {
    pub fn new(provider: Arc<dyn Provider>, zone: Zone, owner_id: &str, config: &RegistryConfig) -> Self {
        Self {
            provider,
            zone,
            owner_id: owner_id.to_string(),
            group: None,
            mapper: config.mapper(),
            cipher: config.encryption_key.as_deref().map(ProvenanceCipher::new),
            config: config.clone(),
        }
    }

    /// Group recorded in every marker this registry writes
    pub fn with_group(mut self, group: Option<&str>) -> Self {
        self.group = group.filter(|g| !g.is_empty()).map(str::to_string);
        self
    }

    pub fn zone(&self) -> &Zone {
        &self.zone
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn mapper(&self) -> &TxtNameMapper {
        &self.mapper
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn is_provenance(&self, endpoint: &Endpoint) -> bool {
        endpoint.record_type == RecordType::TXT && self.mapper.is_provenance_name(&endpoint.dns_name)
    }

    /// List the zone. Provenance endpoints come back with one plaintext
    /// marker per target; unreadable markers are dropped with a warning.
    pub async fn records(&self) -> Result<Vec<Endpoint>, RegistryError> {
        let raw = self.provider.records(&self.zone).await?;
        let mut endpoints = Vec::with_capacity(raw.len());

        for mut endpoint in raw {
            if self.is_provenance(&endpoint) {
                endpoint.targets = self.decode_targets(&endpoint);
            }
            endpoints.push(endpoint);
        }

        debug!(zone = %self.zone.id, count = endpoints.len(), "Decoded zone records");
        Ok(endpoints)
    }

    fn decode_targets(&self, endpoint: &Endpoint) -> Vec<String> {
        let mut decoded: Vec<String> = Vec::new();

        for value in &endpoint.targets {
            for segment in split_segments(value) {
                let marker = segment
                    .and_then(|text| self.decrypt(&text))
                    .and_then(|text| Provenance::parse(&text).map(|_| text));
                match marker {
                    Ok(text) => decoded.push(text),
                    Err(e) => {
                        warn!(
                            name = %endpoint.dns_name,
                            zone = %self.zone.id,
                            error = %e,
                            "Skipping unreadable provenance marker"
                        );
                    }
                }
            }
        }

        decoded.sort();
        decoded.dedup();
        decoded
    }

    fn decrypt(&self, text: &str) -> Result<String, ProvenanceError> {
        if !ProvenanceCipher::is_encrypted(text) {
            return Ok(text.to_string());
        }
        match &self.cipher {
            Some(cipher) => cipher.decrypt(text),
            None => Err(ProvenanceError::Decrypt(
                "marker is encrypted but no key is configured".to_string(),
            )),
        }
    }

    /// Pair every managed endpoint with this owner's provenance marker
    pub fn adjust_endpoints(&self, desired: Vec<Endpoint>) -> Result<Vec<Endpoint>, RegistryError> {
        let mut adjusted = Vec::new();

        for mut endpoint in merge_by_key(desired) {
            if self.is_provenance(&endpoint) {
                debug!(name = %endpoint.dns_name, "Ignoring desired endpoint that collides with a provenance name");
                continue;
            }

            endpoint
                .labels
                .insert(OWNER_LABEL.to_string(), self.owner_id.clone());

            if self.config.is_managed(endpoint.record_type) {
                adjusted.push(self.provenance_for(&endpoint));
            }
            adjusted.push(endpoint);
        }

        Ok(adjusted)
    }

    fn provenance_for(&self, endpoint: &Endpoint) -> Endpoint {
        let marker = Provenance::new(&self.owner_id)
            .with_group(self.group.as_deref())
            .with_targets(endpoint.targets.iter().cloned());

        let mut txt = Endpoint::new(
            &self.mapper.to_txt_name(endpoint.record_type, &endpoint.dns_name),
            RecordType::TXT,
            [marker.encode()],
        )
        .with_ttl(endpoint.record_ttl)
        .with_set_identifier(endpoint.set_identifier.clone());
        txt.labels
            .insert(OWNER_LABEL.to_string(), self.owner_id.clone());
        txt
    }

    /// Encode provenance targets and hand the batch to the provider.
    /// Not atomic: the next reconcile resumes from whatever was applied.
    pub async fn apply_changes(&self, changes: &Changes) -> Result<(), RegistryError> {
        let encoded = Changes {
            create: self.encode_all(&changes.create)?,
            update_old: self.encode_all(&changes.update_old)?,
            update_new: self.encode_all(&changes.update_new)?,
            delete: self.encode_all(&changes.delete)?,
        };

        self.provider
            .apply_changes(&self.zone, &encoded)
            .await
            .map_err(RegistryError::from)
    }

    fn encode_all(&self, endpoints: &[Endpoint]) -> Result<Vec<Endpoint>, RegistryError> {
        endpoints.iter().map(|e| self.encode(e)).collect()
    }

    fn encode(&self, endpoint: &Endpoint) -> Result<Endpoint, RegistryError> {
        let mut endpoint = endpoint.clone();
        if !self.is_provenance(&endpoint) {
            return Ok(endpoint);
        }

        endpoint.targets = endpoint
            .targets
            .iter()
            .map(|text| {
                let sealed = match &self.cipher {
                    Some(cipher) => cipher.encrypt(text).map_err(|source| RegistryError::Encode {
                        name: endpoint.dns_name.clone(),
                        source,
                    })?,
                    None => text.clone(),
                };
                Ok(quote(&sealed))
            })
            .collect::<Result<Vec<_>, RegistryError>>()?;

        Ok(endpoint)
    }
}
