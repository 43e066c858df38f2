//! Provenance markers
//!
//! One marker per owner: `heritage=external-dns,owner=<id>,version=1`
//! optionally followed by `group=<g>` and `targets=<t1>;<t2>`. Several
//! markers may share one TXT value as concatenated quoted segments.

use std::fmt;
use thiserror::Error;

pub const HERITAGE: &str = "external-dns";
pub const PROVENANCE_VERSION: &str = "1";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvenanceError {
    #[error("unterminated quoted segment: {0}")]
    UnterminatedQuote(String),

    #[error("unexpected text between quoted segments: {0}")]
    StrayText(String),

    #[error("not an external-dns provenance marker: {0}")]
    MissingHeritage(String),

    #[error("provenance marker without owner: {0}")]
    MissingOwner(String),

    #[error("failed to decrypt provenance marker: {0}")]
    Decrypt(String),
}

/// A decoded provenance marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub owner: String,
    pub version: String,
    pub group: Option<String>,
    /// Targets this owner contributed, when the marker records them
    pub targets: Option<Vec<String>>,
}

impl Provenance {
    pub fn new(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            version: PROVENANCE_VERSION.to_string(),
            group: None,
            targets: None,
        }
    }

    pub fn with_group(mut self, group: Option<&str>) -> Self {
        self.group = group.filter(|g| !g.is_empty()).map(str::to_string);
        self
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut targets: Vec<String> = targets.into_iter().map(Into::into).collect();
        targets.sort();
        targets.dedup();
        self.targets = Some(targets);
        self
    }

    /// Plaintext marker
    pub fn encode(&self) -> String {
        let mut text = format!(
            "heritage={},owner={},version={}",
            HERITAGE, self.owner, self.version
        );
        if let Some(group) = &self.group {
            text.push_str(&format!(",group={}", group));
        }
        if let Some(targets) = &self.targets {
            text.push_str(&format!(",targets={}", targets.join(";")));
        }
        text
    }

    /// Parse one plaintext marker. Unknown attributes are ignored.
    pub fn parse(text: &str) -> Result<Self, ProvenanceError> {
        let mut heritage = None;
        let mut owner = None;
        let mut version = None;
        let mut group = None;
        let mut targets = None;

        for attribute in text.trim().split(',') {
            let Some((key, value)) = attribute.split_once('=') else {
                continue;
            };
            match key.trim() {
                "heritage" => heritage = Some(value.trim()),
                "owner" => owner = Some(value.trim()),
                "version" => version = Some(value.trim()),
                "group" => group = Some(value.trim()),
                "targets" => {
                    targets = Some(
                        value
                            .split(';')
                            .map(str::trim)
                            .filter(|t| !t.is_empty())
                            .map(str::to_string)
                            .collect::<Vec<_>>(),
                    )
                }
                _ => {}
            }
        }

        if heritage != Some(HERITAGE) {
            return Err(ProvenanceError::MissingHeritage(text.to_string()));
        }
        let owner = owner
            .filter(|o| !o.is_empty())
            .ok_or_else(|| ProvenanceError::MissingOwner(text.to_string()))?;

        Ok(Self {
            owner: owner.to_string(),
            version: version.unwrap_or(PROVENANCE_VERSION).to_string(),
            group: group.filter(|g| !g.is_empty()).map(str::to_string),
            targets,
        })
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Split a raw TXT value into its quoted segments.
///
/// An unquoted value is a single segment. Inside quotes `\"` and `\\` are
/// escapes. Each malformed segment becomes its own `Err` so callers can skip
/// it and keep the rest.
pub fn split_segments(value: &str) -> Vec<Result<String, ProvenanceError>> {
    let value = value.trim();
    if value.is_empty() {
        return Vec::new();
    }
    if !value.starts_with('"') {
        return vec![Ok(value.to_string())];
    }

    let mut segments = Vec::new();
    let mut chars = value.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        match chars.next() {
            None => break,
            Some('"') => {
                let mut segment = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                segment.push(escaped);
                            }
                        }
                        '"' => {
                            closed = true;
                            break;
                        }
                        c => segment.push(c),
                    }
                }
                if closed {
                    segments.push(Ok(segment));
                } else {
                    segments.push(Err(ProvenanceError::UnterminatedQuote(segment)));
                }
            }
            Some(c) => {
                let mut stray = String::from(c);
                while let Some(c) = chars.next_if(|c| *c != '"') {
                    stray.push(c);
                }
                segments.push(Err(ProvenanceError::StrayText(stray.trim().to_string())));
            }
        }
    }

    segments
}

/// Wrap a marker in quotes for storage in a TXT value
pub fn quote(text: &str) -> String {
    format!("\"{}\"", text.replace('\\', "\\\\").replace('"', "\\\""))
}
