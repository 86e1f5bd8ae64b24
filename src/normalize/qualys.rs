use serde_json::Value;

use super::{Normalizer, Rejection, required_str};
use crate::model::CanonicalAttributes;

/// Vulnerability-scanner host assets. The MAC comes from the interface carrying
/// the asset's primary address; when several do, the last one listed wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct QualysNormalizer;

impl Normalizer for QualysNormalizer {
    fn normalize(&self, raw: &Value) -> Result<CanonicalAttributes, Rejection> {
        let ip = required_str(raw, "address")?.trim().to_lowercase();
        let hostname = required_str(raw, "fqdn")?;
        let interfaces = raw
            .pointer("/networkInterface/list")
            .and_then(Value::as_array)
            .ok_or_else(|| Rejection::MissingField("networkInterface.list".to_string()))?;

        let mac = interfaces
            .iter()
            .filter_map(|entry| entry.get("HostAssetInterface"))
            .rev()
            .find(|iface| {
                iface
                    .get("address")
                    .and_then(Value::as_str)
                    .is_some_and(|address| address.trim().eq_ignore_ascii_case(&ip))
            })
            .and_then(|iface| iface.get("macAddress").and_then(Value::as_str))
            .filter(|mac| !mac.trim().is_empty())
            .ok_or_else(|| {
                Rejection::Unusable(format!("no interface with a MAC address matches {ip}"))
            })?;

        Ok(CanonicalAttributes::new(&ip, mac, hostname))
    }
}
