use serde_json::Value;

use super::{Normalizer, Rejection, required_str};
use crate::model::CanonicalAttributes;

/// Endpoint-agent host records: `local_ip`, `mac_address` (dash separated), `hostname`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrowdstrikeNormalizer;

impl Normalizer for CrowdstrikeNormalizer {
    fn normalize(&self, raw: &Value) -> Result<CanonicalAttributes, Rejection> {
        let ip = required_str(raw, "local_ip")?;
        let mac = required_str(raw, "mac_address")?;
        let hostname = required_str(raw, "hostname")?;
        Ok(CanonicalAttributes::new(ip, mac, hostname))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn maps_agent_fields() {
        let attrs = CrowdstrikeNormalizer
            .normalize(&json!({
                "device_id": "7",
                "local_ip": "10.0.0.1",
                "mac_address": "AA-BB-CC-DD-EE-FF",
                "hostname": "HOST1",
                "platform_name": "Windows"
            }))
            .expect("normalizes");
        assert_eq!(
            attrs,
            CanonicalAttributes {
                ip: "10.0.0.1".to_string(),
                mac: "aa:bb:cc:dd:ee:ff".to_string(),
                hostname: "host1".to_string(),
            }
        );
    }

    #[test]
    fn missing_mac_is_rejected() {
        let err = CrowdstrikeNormalizer
            .normalize(&json!({"local_ip": "10.0.0.1", "hostname": "HOST1"}))
            .expect_err("rejected");
        assert_eq!(err, Rejection::MissingField("mac_address".to_string()));
    }
}
