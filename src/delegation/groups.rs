//! Active groups
//!
//! Redundant record groups fail over through a TXT signal published at
//! `<prefix>active-groups.<zone>` holding `groups=<g1>&&<g2>;version=1`.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::endpoint::normalize_name;
use crate::registry::provenance::split_segments;
use crate::registry::TxtNameMapper;

pub const DEFAULT_DOH_ENDPOINT: &str = "https://cloudflare-dns.com/dns-query";

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("TXT lookup for {host} failed: {message}")]
    Failed { host: String, message: String },
}

/// The set of currently live groups
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveGroups {
    groups: BTreeSet<String>,
}

impl ActiveGroups {
    pub fn new<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            groups: groups
                .into_iter()
                .map(Into::<String>::into)
                .filter(|g| !g.is_empty())
                .collect(),
        }
    }

    /// Parse raw TXT values. Values without a `groups` attribute are ignored.
    pub fn parse(values: &[String]) -> Self {
        let mut groups = BTreeSet::new();

        for segment in values.iter().flat_map(|v| split_segments(v)).flatten() {
            for attribute in segment.split(';') {
                if let Some(list) = attribute.trim().strip_prefix("groups=") {
                    groups.extend(
                        list.split("&&")
                            .map(str::trim)
                            .filter(|g| !g.is_empty())
                            .map(str::to_string),
                    );
                }
            }
        }

        Self { groups }
    }

    /// Ungrouped records are always active, and with no signal every group is
    pub fn is_active(&self, group: Option<&str>) -> bool {
        match group {
            None | Some("") => true,
            Some(group) => self.groups.is_empty() || self.groups.contains(group),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(String::as_str)
    }
}

#[async_trait]
pub trait TxtLookup: Send + Sync {
    /// TXT values of `host`. An empty list means the name does not exist.
    async fn lookup_txt(&self, host: &str, nameservers: &[String]) -> Result<Vec<String>, LookupError>;
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

const TXT_TYPE: u16 = 16;
const NXDOMAIN: u32 = 3;

/// DNS-over-HTTPS JSON lookup. Nameservers are DoH endpoint URLs tried in order.
pub struct DohTxtLookup {
    client: Client,
    default_endpoint: String,
}

impl DohTxtLookup {
    pub fn new() -> Result<Self, LookupError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LookupError::Failed {
                host: DEFAULT_DOH_ENDPOINT.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            default_endpoint: DEFAULT_DOH_ENDPOINT.to_string(),
        })
    }

    async fn query(&self, endpoint: &str, host: &str) -> Result<Vec<String>, LookupError> {
        let failed = |message: String| LookupError::Failed {
            host: host.to_string(),
            message,
        };

        let response = self
            .client
            .get(endpoint)
            .query(&[("name", host), ("type", "TXT")])
            .header("accept", "application/dns-json")
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(failed(format!("{} returned {}", endpoint, response.status())));
        }

        let body: DohResponse = response.json().await.map_err(|e| failed(e.to_string()))?;
        match body.status {
            0 => Ok(body
                .answer
                .into_iter()
                .filter(|a| a.record_type == TXT_TYPE)
                .map(|a| a.data)
                .collect()),
            NXDOMAIN => Ok(Vec::new()),
            rcode => Err(failed(format!("rcode {}", rcode))),
        }
    }
}

#[async_trait]
impl TxtLookup for DohTxtLookup {
    async fn lookup_txt(&self, host: &str, nameservers: &[String]) -> Result<Vec<String>, LookupError> {
        let endpoints: Vec<&str> = if nameservers.is_empty() {
            vec![self.default_endpoint.as_str()]
        } else {
            nameservers.iter().map(String::as_str).collect()
        };

        let mut last_error = None;
        for endpoint in endpoints {
            match self.query(endpoint, host).await {
                Ok(values) => return Ok(values),
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "DoH lookup failed, trying next endpoint");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LookupError::Failed {
            host: host.to_string(),
            message: "no endpoints".to_string(),
        }))
    }
}

/// Fixed answers, for tests and dry runs
#[derive(Default)]
pub struct StaticTxtLookup {
    records: RwLock<BTreeMap<String, Vec<String>>>,
    failing: AtomicBool,
}

impl StaticTxtLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, host: &str, values: Vec<String>) {
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(normalize_name(host), values);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl TxtLookup for StaticTxtLookup {
    async fn lookup_txt(&self, host: &str, _nameservers: &[String]) -> Result<Vec<String>, LookupError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(LookupError::Failed {
                host: host.to_string(),
                message: "lookup disabled".to_string(),
            });
        }

        Ok(self
            .records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&normalize_name(host))
            .cloned()
            .unwrap_or_default())
    }
}

/// Resolves the active groups of a zone
#[derive(Clone)]
pub struct ActiveGroupsResolver {
    lookup: Arc<dyn TxtLookup>,
    mapper: TxtNameMapper,
    nameservers: Vec<String>,
}

impl ActiveGroupsResolver {
    pub fn new(lookup: Arc<dyn TxtLookup>, mapper: TxtNameMapper, nameservers: Vec<String>) -> Self {
        Self {
            lookup,
            mapper,
            nameservers,
        }
    }

    pub async fn resolve(&self, zone_domain: &str) -> Result<ActiveGroups, LookupError> {
        let host = self.mapper.active_groups_name(zone_domain);
        let values = self.lookup.lookup_txt(&host, &self.nameservers).await?;
        let groups = ActiveGroups::parse(&values);

        debug!(host = %host, groups = ?groups.groups().collect::<Vec<_>>(), "Resolved active groups");
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal() {
        let groups = ActiveGroups::parse(&["\"groups=group1&&group2;version=1\"".to_string()]);

        assert!(groups.is_active(Some("group1")));
        assert!(groups.is_active(Some("group2")));
        assert!(!groups.is_active(Some("group3")));
        assert!(groups.is_active(None));
    }

    #[test]
    fn test_empty_signal_activates_everyone() {
        let groups = ActiveGroups::parse(&["version=1".to_string()]);

        assert!(groups.is_empty());
        assert!(groups.is_active(Some("anything")));
    }

    #[test]
    fn test_doh_response_parsing() {
        let body = r#"{"Status":0,"Answer":[{"name":"kuadrant-active-groups.example.com","type":16,"TTL":60,"data":"\"groups=a;version=1\""}]}"#;
        let parsed: DohResponse = serde_json::from_str(body).unwrap();

        assert_eq!(parsed.status, 0);
        assert_eq!(parsed.answer[0].record_type, TXT_TYPE);

        let nx: DohResponse = serde_json::from_str(r#"{"Status":3}"#).unwrap();
        assert!(nx.answer.is_empty());
    }

    #[tokio::test]
    async fn test_resolver_uses_prefixed_name() {
        let lookup = Arc::new(StaticTxtLookup::new());
        lookup.set(
            "kuadrant-active-groups.example.com",
            vec!["groups=blue;version=1".to_string()],
        );
        let resolver = ActiveGroupsResolver::new(lookup.clone(), TxtNameMapper::default(), Vec::new());

        let groups = resolver.resolve("example.com").await.unwrap();
        assert!(groups.is_active(Some("blue")));
        assert!(!groups.is_active(Some("green")));

        lookup.set_failing(true);
        assert!(resolver.resolve("example.com").await.is_err());
    }
}
