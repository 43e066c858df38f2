//! DNS Endpoint Types
//!
//! Core types for representing desired and observed DNS endpoints and the
//! change sets applied to a provider zone.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// DNS record type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    A,
    #[allow(clippy::upper_case_acronyms)]
    AAAA,
    #[allow(clippy::upper_case_acronyms)]
    CNAME,
    #[allow(clippy::upper_case_acronyms)]
    TXT,
    MX,
    NS,
    #[allow(clippy::upper_case_acronyms)]
    SRV,
}

impl RecordType {
    /// A and AAAA records describe the same host in different address
    /// families and may be owned by different writers side by side.
    pub fn is_address(self) -> bool {
        matches!(self, RecordType::A | RecordType::AAAA)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::AAAA => "AAAA",
            RecordType::CNAME => "CNAME",
            RecordType::TXT => "TXT",
            RecordType::MX => "MX",
            RecordType::NS => "NS",
            RecordType::SRV => "SRV",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "AAAA" => Ok(RecordType::AAAA),
            "CNAME" => Ok(RecordType::CNAME),
            "TXT" => Ok(RecordType::TXT),
            "MX" => Ok(RecordType::MX),
            "NS" => Ok(RecordType::NS),
            "SRV" => Ok(RecordType::SRV),
            other => Err(format!("unsupported record type: {}", other)),
        }
    }
}

/// Provider specific property attached to an endpoint (e.g. routing weight)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderSpecificProperty {
    pub name: String,
    pub value: String,
}

/// A DNS endpoint: one (name, type, set identifier) with its targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub dns_name: String,
    pub record_type: RecordType,
    #[serde(default)]
    pub targets: Vec<String>,
    /// TTL in seconds, 0 means provider default
    #[serde(default, rename = "recordTTL")]
    pub record_ttl: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub set_identifier: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provider_specific: Vec<ProviderSpecificProperty>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Endpoint {
    pub fn new<I, S>(dns_name: &str, record_type: RecordType, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dns_name: normalize_name(dns_name),
            record_type,
            targets: targets.into_iter().map(Into::into).collect(),
            record_ttl: 0,
            set_identifier: String::new(),
            provider_specific: Vec::new(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.record_ttl = ttl;
        self
    }

    pub fn with_set_identifier(mut self, set_identifier: impl Into<String>) -> Self {
        self.set_identifier = set_identifier.into();
        self
    }

    pub fn with_provider_specific(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.provider_specific.push(ProviderSpecificProperty {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn key(&self) -> EndpointKey {
        EndpointKey {
            dns_name: normalize_name(&self.dns_name),
            record_type: self.record_type,
            set_identifier: self.set_identifier.clone(),
        }
    }

    /// Targets as an ordered, deduplicated set
    pub fn target_set(&self) -> BTreeSet<String> {
        self.targets.iter().cloned().collect()
    }

    /// Compare everything the provider stores: targets (order-insensitive),
    /// TTL and provider specific properties. Labels are bookkeeping only.
    pub fn same_values(&self, other: &Endpoint) -> bool {
        let mut ours = self.provider_specific.clone();
        let mut theirs = other.provider_specific.clone();
        ours.sort();
        theirs.sort();

        self.target_set() == other.target_set() && self.record_ttl == other.record_ttl && ours == theirs
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{}]",
            self.dns_name,
            self.record_type,
            self.targets.join(", ")
        )?;
        if !self.set_identifier.is_empty() {
            write!(f, " ({})", self.set_identifier)?;
        }
        Ok(())
    }
}

/// Unique key of an endpoint within one zone snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointKey {
    pub dns_name: String,
    pub record_type: RecordType,
    pub set_identifier: String,
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.dns_name, self.record_type)?;
        if !self.set_identifier.is_empty() {
            write!(f, "/{}", self.set_identifier)?;
        }
        Ok(())
    }
}

/// A hosted zone as reported by a provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub id: String,
    pub dns_name: String,
}

impl Zone {
    pub fn new(id: impl Into<String>, dns_name: &str) -> Self {
        Self {
            id: id.into(),
            dns_name: normalize_name(dns_name),
        }
    }
}

/// Set of changes to apply to a zone
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Changes {
    pub create: Vec<Endpoint>,
    pub update_old: Vec<Endpoint>,
    pub update_new: Vec<Endpoint>,
    pub delete: Vec<Endpoint>,
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update_new.is_empty() && self.delete.is_empty()
    }

    pub fn len(&self) -> usize {
        self.create.len() + self.update_new.len() + self.delete.len()
    }
}

/// Lowercase a DNS name and drop the trailing root dot
pub fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// `*.foo.example.com` -> `foo.example.com`
pub fn strip_wildcard(host: &str) -> &str {
    host.strip_prefix("*.").unwrap_or(host)
}

/// True when `name` equals `domain` or lives below it
pub fn is_subdomain(name: &str, domain: &str) -> bool {
    let name = name.trim_end_matches('.');
    let domain = domain.trim_end_matches('.');
    if domain.is_empty() {
        return true;
    }
    name.eq_ignore_ascii_case(domain)
        || (name.len() > domain.len()
            && name.to_ascii_lowercase().ends_with(&format!(".{}", domain.to_ascii_lowercase())))
}

/// Collapse endpoints sharing a key into one, unioning their targets.
/// The first occurrence wins for TTL and provider specific properties.
pub fn merge_by_key(endpoints: Vec<Endpoint>) -> Vec<Endpoint> {
    let mut merged: BTreeMap<EndpointKey, Endpoint> = BTreeMap::new();

    for mut endpoint in endpoints {
        endpoint.dns_name = normalize_name(&endpoint.dns_name);
        match merged.get_mut(&endpoint.key()) {
            Some(existing) => {
                let mut targets = existing.target_set();
                targets.extend(endpoint.targets);
                existing.targets = targets.into_iter().collect();
            }
            None => {
                endpoint.targets = endpoint.target_set().into_iter().collect();
                merged.insert(endpoint.key(), endpoint);
            }
        }
    }

    merged.into_values().collect()
}
