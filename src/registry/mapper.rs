//! Provenance record naming
//!
//! `kuadrant-a-foo.example.com` describes `A foo.example.com`. Wildcard
//! labels are replaced because several providers reject `*` inside TXT
//! record names.

use crate::endpoint::{normalize_name, RecordType};

/// Maps endpoint names to provenance TXT names and back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxtNameMapper {
    prefix: String,
    wildcard_replacement: String,
}

impl TxtNameMapper {
    pub fn new(prefix: &str, wildcard_replacement: &str) -> Self {
        Self {
            prefix: prefix.to_ascii_lowercase(),
            wildcard_replacement: wildcard_replacement.to_ascii_lowercase(),
        }
    }

    /// TXT name holding the provenance of `record_type dns_name`
    pub fn to_txt_name(&self, record_type: RecordType, dns_name: &str) -> String {
        let name = normalize_name(dns_name);
        let name = match name.strip_prefix("*.") {
            Some(rest) => format!("{}.{}", self.wildcard_replacement, rest),
            None if name == "*" => self.wildcard_replacement.clone(),
            None => name,
        };

        format!(
            "{}{}-{}",
            self.prefix,
            record_type.as_str().to_ascii_lowercase(),
            name
        )
    }

    /// Reverse of [`to_txt_name`](Self::to_txt_name). `None` when the name is
    /// not a provenance name.
    pub fn to_endpoint_name(&self, txt_name: &str) -> Option<(RecordType, String)> {
        let name = normalize_name(txt_name);
        let rest = name.strip_prefix(&self.prefix)?;
        let (record_type, dns_name) = rest.split_once('-')?;
        let record_type: RecordType = record_type.parse().ok()?;

        if dns_name.is_empty() {
            return None;
        }

        let wildcard_label = format!("{}.", self.wildcard_replacement);
        let dns_name = match dns_name.strip_prefix(&wildcard_label) {
            Some(rest) => format!("*.{}", rest),
            None => dns_name.to_string(),
        };

        Some((record_type, dns_name))
    }

    pub fn is_provenance_name(&self, name: &str) -> bool {
        self.to_endpoint_name(name).is_some()
    }

    /// Name of the active-groups signal record for a zone
    pub fn active_groups_name(&self, zone_domain: &str) -> String {
        format!("{}active-groups.{}", self.prefix, normalize_name(zone_domain))
    }
}

impl Default for TxtNameMapper {
    fn default() -> Self {
        Self::new(super::DEFAULT_TXT_PREFIX, super::DEFAULT_WILDCARD_REPLACEMENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_txt_name_round_trip() {
        let mapper = TxtNameMapper::default();

        let txt = mapper.to_txt_name(RecordType::CNAME, "Api.Example.com.");
        assert_eq!(txt, "kuadrant-cname-api.example.com");
        assert_eq!(
            mapper.to_endpoint_name(&txt),
            Some((RecordType::CNAME, "api.example.com".to_string()))
        );
    }

    #[test]
    fn test_wildcard_is_replaced() {
        let mapper = TxtNameMapper::default();

        let txt = mapper.to_txt_name(RecordType::A, "*.apps.example.com");
        assert_eq!(txt, "kuadrant-a-wildcard.apps.example.com");
        assert_eq!(
            mapper.to_endpoint_name(&txt),
            Some((RecordType::A, "*.apps.example.com".to_string()))
        );
    }

    #[test]
    fn test_foreign_names_are_not_provenance() {
        let mapper = TxtNameMapper::default();

        assert!(!mapper.is_provenance_name("foo.example.com"));
        assert!(!mapper.is_provenance_name("kuadrant-bogus-foo.example.com"));
        assert!(!mapper.is_provenance_name("kuadrant-a-"));
        assert_eq!(
            mapper.active_groups_name("Example.com"),
            "kuadrant-active-groups.example.com"
        );
    }
}
