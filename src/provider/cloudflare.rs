//! Cloudflare DNS Provider
//!
//! Provider implementation over the Cloudflare v4 DNS API. Cloudflare stores
//! one record per target, so endpoints are grouped by (name, type) on read
//! and fanned out per target on write.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info};

use super::{best_zone_for_host, Provider, ProviderError};
use crate::endpoint::{normalize_name, Changes, Endpoint, RecordType, Zone};

const CLOUDFLARE_API_BASE: &str = "https://api.cloudflare.com/client/v4";

/// Cloudflare's "automatic" TTL
const AUTO_TTL: u32 = 1;

/// A DNS record from Cloudflare
#[derive(Debug, Clone, Deserialize)]
struct DnsRecord {
    id: String,
    name: String,
    #[serde(rename = "type")]
    record_type: String,
    content: String,
    ttl: u32,
}

/// Request to create/update a DNS record
#[derive(Debug, Clone, Serialize)]
struct DnsRecordRequest {
    #[serde(rename = "type")]
    record_type: RecordType,
    name: String,
    content: String,
    ttl: u32,
    proxied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<String>,
}

/// Cloudflare API response wrapper
#[derive(Debug, Deserialize)]
struct CloudflareResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<CloudflareError>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct CloudflareError {
    #[serde(default)]
    code: i32,
    message: String,
}

#[derive(Debug, Deserialize)]
struct CloudflareZone {
    id: String,
    name: String,
}

/// Cloudflare DNS provider
pub struct CloudflareProvider {
    http_client: Client,
    api_token: String,
    proxied: bool,
}

impl CloudflareProvider {
    /// Create a new Cloudflare provider
    pub fn new(api_token: String) -> Result<Self, ProviderError> {
        let http_client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            http_client,
            api_token,
            proxied: false,
        })
    }

    /// Proxy published records through Cloudflare
    pub fn proxied(mut self, proxied: bool) -> Self {
        self.proxied = proxied;
        self
    }

    async fn send<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T, ProviderError> {
        let response = request.bearer_auth(&self.api_token).send().await?;
        let status = response.status();
        let body: CloudflareResponse<T> = response.json().await?;

        if !body.success {
            let errors: Vec<String> = body
                .errors
                .iter()
                .map(|e| format!("{} ({})", e.message, e.code))
                .collect();
            return Err(ProviderError::Api(format!(
                "Cloudflare API error {}: {}",
                status,
                errors.join(", ")
            )));
        }

        body.result
            .ok_or_else(|| ProviderError::Api(format!("Cloudflare API {} returned no result", status)))
    }

    async fn list_zones(&self) -> Result<Vec<Zone>, ProviderError> {
        let url = format!("{}/zones?per_page=50", CLOUDFLARE_API_BASE);
        let zones: Vec<CloudflareZone> = self.send(self.http_client.get(&url)).await?;

        Ok(zones.into_iter().map(|z| Zone::new(z.id, &z.name)).collect())
    }

    async fn list_records(&self, zone: &Zone, filter: Option<(&str, RecordType)>) -> Result<Vec<DnsRecord>, ProviderError> {
        let mut url = format!(
            "{}/zones/{}/dns_records?per_page=1000",
            CLOUDFLARE_API_BASE, zone.id
        );
        if let Some((name, record_type)) = filter {
            url.push_str(&format!("&name={}&type={}", name, record_type));
        }

        self.send(self.http_client.get(&url)).await
    }

    async fn create_record(&self, zone: &Zone, endpoint: &Endpoint, content: &str) -> Result<(), ProviderError> {
        let url = format!("{}/zones/{}/dns_records", CLOUDFLARE_API_BASE, zone.id);
        let request = self.request_for(endpoint, content);

        info!(name = %endpoint.dns_name, record_type = %endpoint.record_type, content = %content, "Creating Cloudflare record");
        let _: serde_json::Value = self.send(self.http_client.post(&url).json(&request)).await?;
        Ok(())
    }

    async fn update_record(&self, zone: &Zone, record_id: &str, endpoint: &Endpoint, content: &str) -> Result<(), ProviderError> {
        let url = format!(
            "{}/zones/{}/dns_records/{}",
            CLOUDFLARE_API_BASE, zone.id, record_id
        );
        let request = self.request_for(endpoint, content);

        info!(name = %endpoint.dns_name, record_type = %endpoint.record_type, "Updating Cloudflare record");
        let _: serde_json::Value = self.send(self.http_client.patch(&url).json(&request)).await?;
        Ok(())
    }

    async fn delete_record(&self, zone: &Zone, record: &DnsRecord) -> Result<(), ProviderError> {
        let url = format!(
            "{}/zones/{}/dns_records/{}",
            CLOUDFLARE_API_BASE, zone.id, record.id
        );

        info!(name = %record.name, record_type = %record.record_type, content = %record.content, "Deleting Cloudflare record");
        let _: serde_json::Value = self.send(self.http_client.delete(&url)).await?;
        Ok(())
    }

    fn request_for(&self, endpoint: &Endpoint, content: &str) -> DnsRecordRequest {
        DnsRecordRequest {
            record_type: endpoint.record_type,
            name: endpoint.dns_name.clone(),
            content: content.to_string(),
            ttl: if endpoint.record_ttl == 0 { AUTO_TTL } else { endpoint.record_ttl },
            // TXT and provenance records can never be proxied
            proxied: self.proxied && endpoint.record_type.is_address(),
            comment: Some("Managed by Lornu DNS Controller".to_string()),
        }
    }

    async fn existing_for(&self, zone: &Zone, endpoint: &Endpoint) -> Result<Vec<DnsRecord>, ProviderError> {
        self.list_records(zone, Some((&endpoint.dns_name, endpoint.record_type)))
            .await
    }
}

/// Group Cloudflare's one-record-per-target layout into endpoints
fn group_records(records: Vec<DnsRecord>) -> Vec<Endpoint> {
    let mut grouped: BTreeMap<(String, RecordType), Endpoint> = BTreeMap::new();

    for record in records {
        let Ok(record_type) = record.record_type.parse::<RecordType>() else {
            debug!(name = %record.name, record_type = %record.record_type, "Skipping unsupported record type");
            continue;
        };
        let name = normalize_name(&record.name);
        let ttl = if record.ttl == AUTO_TTL { 0 } else { record.ttl };

        grouped
            .entry((name.clone(), record_type))
            .or_insert_with(|| Endpoint::new(&name, record_type, Vec::<String>::new()).with_ttl(ttl))
            .targets
            .push(record.content);
    }

    grouped.into_values().collect()
}

#[async_trait]
impl Provider for CloudflareProvider {
    fn name(&self) -> &str {
        "cloudflare"
    }

    async fn records(&self, zone: &Zone) -> Result<Vec<Endpoint>, ProviderError> {
        let records = self.list_records(zone, None).await?;
        debug!(zone = %zone.id, count = records.len(), "Listed Cloudflare records");
        Ok(group_records(records))
    }

    async fn apply_changes(&self, zone: &Zone, changes: &Changes) -> Result<(), ProviderError> {
        for endpoint in &changes.delete {
            let existing = self.existing_for(zone, endpoint).await?;
            if existing.is_empty() {
                return Err(ProviderError::Api(format!("record {} not found", endpoint.key())));
            }
            for record in &existing {
                self.delete_record(zone, record).await?;
            }
        }

        for endpoint in &changes.update_new {
            let existing = self.existing_for(zone, endpoint).await?;
            let wanted: BTreeSet<&str> = endpoint.targets.iter().map(String::as_str).collect();
            let ttl = if endpoint.record_ttl == 0 { AUTO_TTL } else { endpoint.record_ttl };

            for record in &existing {
                if !wanted.contains(record.content.as_str()) {
                    self.delete_record(zone, record).await?;
                } else if record.ttl != ttl {
                    self.update_record(zone, &record.id, endpoint, &record.content)
                        .await?;
                }
            }

            let present: BTreeSet<&str> = existing.iter().map(|r| r.content.as_str()).collect();
            for target in wanted.difference(&present) {
                self.create_record(zone, endpoint, target).await?;
            }
        }

        for endpoint in &changes.create {
            for target in &endpoint.targets {
                self.create_record(zone, endpoint, target).await?;
            }
        }

        Ok(())
    }

    async fn zone_for_host(&self, host: &str) -> Result<Zone, ProviderError> {
        let zones = self.list_zones().await?;
        best_zone_for_host(&zones, host).ok_or_else(|| ProviderError::ZoneNotFound(host.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, name: &str, record_type: &str, content: &str, ttl: u32) -> DnsRecord {
        DnsRecord {
            id: id.to_string(),
            name: name.to_string(),
            record_type: record_type.to_string(),
            content: content.to_string(),
            ttl,
        }
    }

    #[test]
    fn test_dns_record_request_serialization() {
        let provider = CloudflareProvider::new("token".to_string()).unwrap();
        let endpoint = Endpoint::new("test.lornu.ai", RecordType::A, ["1.2.3.4"]).with_ttl(300);

        let json = serde_json::to_string(&provider.request_for(&endpoint, "1.2.3.4")).unwrap();
        assert!(json.contains("\"type\":\"A\""));
        assert!(json.contains("\"name\":\"test.lornu.ai\""));
        assert!(json.contains("\"ttl\":300"));
    }

    #[test]
    fn test_zero_ttl_maps_to_auto_and_txt_is_never_proxied() {
        let provider = CloudflareProvider::new("token".to_string()).unwrap().proxied(true);
        let txt = Endpoint::new("kuadrant-a-test.lornu.ai", RecordType::TXT, ["\"x\""]);

        let request = provider.request_for(&txt, "\"x\"");
        assert_eq!(request.ttl, AUTO_TTL);
        assert!(!request.proxied);
    }

    #[test]
    fn test_group_records_by_name_and_type() {
        let endpoints = group_records(vec![
            record("1", "foo.lornu.ai", "A", "1.1.1.1", 1),
            record("2", "foo.lornu.ai", "A", "2.2.2.2", 1),
            record("3", "foo.lornu.ai", "TXT", "\"heritage=external-dns\"", 300),
            record("4", "foo.lornu.ai", "CAA", "0 issue \"letsencrypt.org\"", 300),
        ]);

        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].record_type, RecordType::A);
        assert_eq!(endpoints[0].targets, vec!["1.1.1.1", "2.2.2.2"]);
        assert_eq!(endpoints[0].record_ttl, 0);
        assert_eq!(endpoints[1].record_ttl, 300);
    }

    #[test]
    fn test_error_response_parsing() {
        let body = r#"{"success":false,"errors":[{"code":81057,"message":"Record already exists."}],"result":null}"#;
        let parsed: CloudflareResponse<serde_json::Value> = serde_json::from_str(body).unwrap();

        assert!(!parsed.success);
        assert_eq!(parsed.errors[0].code, 81057);
    }
}
