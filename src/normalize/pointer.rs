use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Normalizer, Rejection};
use crate::model::CanonicalAttributes;

/// JSON pointers (RFC 6901) locating each attribute in a raw record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointerFields {
    pub ip: String,
    pub mac: String,
    pub hostname: String,
}

/// Config-driven normalizer for feeds that need no custom logic.
#[derive(Debug, Clone)]
pub struct PointerNormalizer {
    fields: PointerFields,
}

impl PointerNormalizer {
    pub fn new(fields: PointerFields) -> Self {
        Self { fields }
    }

    fn lookup<'a>(raw: &'a Value, pointer: &str) -> Result<&'a str, Rejection> {
        raw.pointer(pointer)
            .and_then(Value::as_str)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| Rejection::MissingField(pointer.to_string()))
    }
}

impl Normalizer for PointerNormalizer {
    fn normalize(&self, raw: &Value) -> Result<CanonicalAttributes, Rejection> {
        let ip = Self::lookup(raw, &self.fields.ip)?;
        let mac = Self::lookup(raw, &self.fields.mac)?;
        let hostname = Self::lookup(raw, &self.fields.hostname)?;
        Ok(CanonicalAttributes::new(ip, mac, hostname))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalizer() -> PointerNormalizer {
        PointerNormalizer::new(PointerFields {
            ip: "/net/ip".to_string(),
            mac: "/net/mac".to_string(),
            hostname: "/name".to_string(),
        })
    }

    #[test]
    fn follows_nested_pointers() {
        let attrs = normalizer()
            .normalize(&json!({"name": "HOST1", "net": {"ip": "10.0.0.1", "mac": "AA-BB-CC-DD-EE-FF"}}))
            .expect("normalizes");
        assert_eq!(attrs.identity_key().expect("key").as_str(), "10.0.0.1_aa:bb:cc:dd:ee:ff_host1");
    }

    #[test]
    fn non_string_target_is_rejected() {
        let err = normalizer()
            .normalize(&json!({"name": "HOST1", "net": {"ip": 10, "mac": "aa"}}))
            .expect_err("rejected");
        assert_eq!(err, Rejection::MissingField("/net/ip".to_string()));
    }
}
