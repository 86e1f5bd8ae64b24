//! Shared data model for canonical host records.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

const KEY_SEPARATOR: char = '_';

/// An external inventory feed. Built once from configuration and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub name: String,
    pub endpoint: String,
    pub index_id: String,
}

impl SourceDescriptor {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        index_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            index_id: index_id.into(),
        }
    }

    /// Reads the source-local id out of a raw record. Strings and integers are accepted.
    pub fn local_id(&self, raw: &Value) -> Option<String> {
        match raw.get(&self.index_id)? {
            Value::String(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
            Value::Number(value) => Some(value.to_string()),
            _ => None,
        }
    }

    /// Key under which the raw payload is referenced in logs and reports.
    pub fn archive_key(&self, local_id: &str) -> String {
        format!("{}_{}", self.name, local_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeField {
    Ip,
    Mac,
    Hostname,
}

impl AttributeField {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ip => "ip",
            Self::Mac => "mac",
            Self::Hostname => "hostname",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("attribute `{}` must not be empty", .field.as_str())]
pub struct AttributeError {
    pub field: AttributeField,
}

/// Normalized identity attributes of one sighting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalAttributes {
    pub ip: String,
    pub mac: String,
    pub hostname: String,
}

impl CanonicalAttributes {
    /// Builds attributes in canonical form: trimmed, lowercase, colon-separated MAC.
    pub fn new(ip: &str, mac: &str, hostname: &str) -> Self {
        Self {
            ip: ip.trim().to_lowercase(),
            mac: canonical_mac(mac),
            hostname: hostname.trim().to_lowercase(),
        }
    }

    pub fn canonical(&self) -> Self {
        Self::new(&self.ip, &self.mac, &self.hostname)
    }

    pub fn validate(&self) -> Result<(), AttributeError> {
        for (field, value) in [
            (AttributeField::Ip, &self.ip),
            (AttributeField::Mac, &self.mac),
            (AttributeField::Hostname, &self.hostname),
        ] {
            if value.trim().is_empty() {
                return Err(AttributeError { field });
            }
        }
        Ok(())
    }

    pub fn identity_key(&self) -> Result<IdentityKey, AttributeError> {
        IdentityKey::from_attributes(self)
    }
}

fn canonical_mac(raw: &str) -> String {
    raw.trim().replace('-', ":").to_lowercase()
}

/// Deterministic `ip_mac_hostname` key. Components escape `%` and `_` so the
/// separator only ever appears between them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn from_attributes(attrs: &CanonicalAttributes) -> Result<Self, AttributeError> {
        let attrs = attrs.canonical();
        attrs.validate()?;
        let key = [&attrs.ip, &attrs.mac, &attrs.hostname]
            .iter()
            .map(|part| escape_component(part))
            .collect::<Vec<_>>()
            .join(&KEY_SEPARATOR.to_string());
        Ok(Self(key))
    }

    /// Wraps a key read back from storage.
    pub fn from_stored(raw: String) -> Self {
        Self(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn escape_component(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for ch in part.chars() {
        match ch {
            '%' => out.push_str("%25"),
            KEY_SEPARATOR => out.push_str("%5F"),
            other => out.push(other),
        }
    }
    out
}

/// Source name to the set of source-local ids seen for one canonical record.
/// Only ever grows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceIds(BTreeMap<String, BTreeSet<String>>);

impl SourceIds {
    pub fn single(source: &str, local_id: &str) -> Self {
        let mut ids = Self::default();
        ids.insert(source, local_id);
        ids
    }

    /// Returns `true` when the id was not already recorded for `source`.
    pub fn insert(&mut self, source: &str, local_id: &str) -> bool {
        self.0
            .entry(source.to_string())
            .or_default()
            .insert(local_id.to_string())
    }

    pub fn contains(&self, source: &str, local_id: &str) -> bool {
        self.0
            .get(source)
            .is_some_and(|ids| ids.contains(local_id))
    }

    pub fn get(&self, source: &str) -> Option<&BTreeSet<String>> {
        self.0.get(source)
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BTreeSet<String>)> {
        self.0.iter().map(|(source, ids)| (source.as_str(), ids))
    }

    pub fn id_count(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }
}

/// The deduplicated entity for one identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalRecord {
    pub canonical_id: i64,
    pub identity_key: IdentityKey,
    pub ip: String,
    pub mac: String,
    pub hostname: String,
    pub source_ids: SourceIds,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub source: String,
    pub skip_offset: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_attributes_lowercase_and_colonize_mac() {
        let attrs = CanonicalAttributes::new(" 10.0.0.1 ", "AA-BB-CC-DD-EE-FF", "HOST1");
        assert_eq!(attrs.ip, "10.0.0.1");
        assert_eq!(attrs.mac, "aa:bb:cc:dd:ee:ff");
        assert_eq!(attrs.hostname, "host1");
    }

    #[test]
    fn identity_key_matches_documented_shape() {
        let attrs = CanonicalAttributes::new("10.0.0.1", "AA-BB-CC-DD-EE-FF", "HOST1");
        let key = attrs.identity_key().expect("valid key");
        assert_eq!(key.as_str(), "10.0.0.1_aa:bb:cc:dd:ee:ff_host1");
    }

    #[test]
    fn identity_key_canonicalizes_raw_values() {
        let raw = CanonicalAttributes {
            ip: "10.0.0.1".to_string(),
            mac: "AA:BB:CC:DD:EE:FF".to_string(),
            hostname: "Host1".to_string(),
        };
        let canonical = CanonicalAttributes::new("10.0.0.1", "aa:bb:cc:dd:ee:ff", "host1");
        assert_eq!(
            raw.identity_key().expect("raw key"),
            canonical.identity_key().expect("canonical key")
        );
    }

    #[test]
    fn identity_key_escapes_separator_inside_components() {
        let a = CanonicalAttributes::new("10.0.0.1", "aa:bb", "x_y");
        let b = CanonicalAttributes::new("10.0.0.1_aa:bb", "x", "y");
        let key_a = a.identity_key().expect("key a");
        assert_eq!(key_a.as_str(), "10.0.0.1_aa:bb_x%5Fy");
        assert_ne!(key_a, b.identity_key().expect("key b"));

        let percent = CanonicalAttributes::new("10.0.0.1", "aa:bb", "x%5Fy");
        assert_ne!(percent.identity_key().expect("percent key"), key_a);
    }

    #[test]
    fn empty_attribute_is_rejected() {
        let attrs = CanonicalAttributes::new("10.0.0.1", "  ", "host");
        let err = attrs.identity_key().expect_err("empty mac rejected");
        assert_eq!(err.field, AttributeField::Mac);
    }

    #[test]
    fn source_ids_insert_reports_new_entries_only() {
        let mut ids = SourceIds::single("alpha", "7");
        assert!(!ids.insert("alpha", "7"));
        assert!(ids.insert("alpha", "8"));
        assert!(ids.insert("beta", "42"));
        assert_eq!(ids.id_count(), 3);
        assert_eq!(ids.sources().collect::<Vec<_>>(), vec!["alpha", "beta"]);
        assert_eq!(
            serde_json::to_value(&ids).expect("serialize"),
            json!({"alpha": ["7", "8"], "beta": ["42"]})
        );
    }

    #[test]
    fn local_id_accepts_strings_and_numbers() {
        let source = SourceDescriptor::new("alpha", "/alpha", "device_id");
        assert_eq!(
            source.local_id(&json!({"device_id": "abc"})).as_deref(),
            Some("abc")
        );
        assert_eq!(
            source.local_id(&json!({"device_id": 42})).as_deref(),
            Some("42")
        );
        assert_eq!(source.local_id(&json!({"device_id": ""})), None);
        assert_eq!(source.local_id(&json!({"other": "x"})), None);
        assert_eq!(source.archive_key("42"), "alpha_42");
    }
}
