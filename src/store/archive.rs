use rusqlite::{OptionalExtension, params};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::{Store, StoreError, now_iso8601};

const ZSTD_LEVEL: i32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Inserted,
    Replaced,
    Unchanged,
}

/// Replaces `$` with `_` in every object key and string value, recursively.
pub fn sanitize_payload(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.replace('$', "_"), sanitize_payload(value)))
                .collect::<Map<_, _>>(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_payload).collect()),
        Value::String(text) => Value::String(text.replace('$', "_")),
        other => other.clone(),
    }
}

impl Store {
    /// Upserts the sanitized payload for `(source, local_id)`. A payload whose
    /// digest matches the stored one is left untouched.
    pub fn archive_raw(
        &self,
        source: &str,
        local_id: &str,
        payload: &Value,
    ) -> Result<ArchiveOutcome, StoreError> {
        let sanitized = serde_json::to_string(&sanitize_payload(payload))?;
        let digest = sha256_hex(&sanitized);

        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT payload_sha256 FROM raw_records WHERE source = ?1 AND local_id = ?2",
                params![source, local_id],
                |row| row.get(0),
            )
            .optional()?;
        if existing.as_deref() == Some(digest.as_str()) {
            return Ok(ArchiveOutcome::Unchanged);
        }

        let compressed = zstd::stream::encode_all(sanitized.as_bytes(), ZSTD_LEVEL)?;
        self.conn.execute(
            "INSERT INTO raw_records (source, local_id, payload, payload_sha256, archived_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(source, local_id) DO UPDATE SET
                payload = excluded.payload,
                payload_sha256 = excluded.payload_sha256,
                archived_at = excluded.archived_at",
            params![source, local_id, compressed, digest, now_iso8601()],
        )?;
        Ok(if existing.is_some() {
            ArchiveOutcome::Replaced
        } else {
            ArchiveOutcome::Inserted
        })
    }

    pub fn archived_payload(
        &self,
        source: &str,
        local_id: &str,
    ) -> Result<Option<Value>, StoreError> {
        let blob: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT payload FROM raw_records WHERE source = ?1 AND local_id = ?2",
                params![source, local_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(blob) = blob else {
            return Ok(None);
        };
        let decoded = zstd::stream::decode_all(blob.as_slice())?;
        Ok(Some(serde_json::from_slice(&decoded)?))
    }

    pub fn archived_count(&self, source: &str) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM raw_records WHERE source = ?1",
            params![source],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write as _;
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sanitize_rewrites_dollar_signs_recursively() {
        let raw = json!({
            "$id": "a$b",
            "nested": {"list": [{"$k": "$v"}, "x$", 3]},
            "count": 2
        });
        assert_eq!(
            sanitize_payload(&raw),
            json!({
                "_id": "a_b",
                "nested": {"list": [{"_k": "_v"}, "x_", 3]},
                "count": 2
            })
        );
    }

    #[test]
    fn archive_upserts_by_source_and_local_id() {
        let store = Store::open_in_memory().expect("in-memory store");
        let first = json!({"device_id": "7", "hostname": "HOST1"});
        let second = json!({"device_id": "7", "hostname": "HOST1-renamed"});

        assert_eq!(
            store.archive_raw("alpha", "7", &first).expect("insert"),
            ArchiveOutcome::Inserted
        );
        assert_eq!(
            store.archive_raw("alpha", "7", &first).expect("same payload"),
            ArchiveOutcome::Unchanged
        );
        assert_eq!(
            store.archive_raw("alpha", "7", &second).expect("replace"),
            ArchiveOutcome::Replaced
        );
        assert_eq!(
            store.archive_raw("beta", "7", &first).expect("other source"),
            ArchiveOutcome::Inserted
        );

        assert_eq!(
            store.archived_payload("alpha", "7").expect("read back"),
            Some(second)
        );
        assert_eq!(store.archived_count("alpha").expect("count"), 1);
        assert_eq!(store.archived_payload("alpha", "8").expect("missing"), None);
    }

    #[test]
    fn archived_payload_is_stored_sanitized() {
        let store = Store::open_in_memory().expect("in-memory store");
        store
            .archive_raw("alpha", "1", &json!({"$where": "x"}))
            .expect("archive");
        assert_eq!(
            store.archived_payload("alpha", "1").expect("read"),
            Some(json!({"_where": "x"}))
        );
    }
}
