use rusqlite::{OptionalExtension, Row, params};

use super::{Store, StoreError, now_iso8601};
use crate::model::{CanonicalAttributes, CanonicalRecord, IdentityKey, SourceIds};

const RECORD_COLUMNS: &str = "canonical_id, identity_key, ip, mac, hostname, source_ids, version, created_at, updated_at";

/// A record about to be created; version always starts at 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub canonical_id: i64,
    pub identity_key: IdentityKey,
    pub attributes: CanonicalAttributes,
    pub source_ids: SourceIds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Created,
    /// Another writer already holds this identity key.
    AlreadyExists,
}

impl Store {
    pub fn find_record(&self, key: &IdentityKey) -> Result<Option<CanonicalRecord>, StoreError> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM canonical_records WHERE identity_key = ?1"),
                params![key.as_str()],
                raw_record,
            )
            .optional()?;
        raw.map(RawRecord::decode).transpose()
    }

    pub fn get_record(&self, canonical_id: i64) -> Result<Option<CanonicalRecord>, StoreError> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM canonical_records WHERE canonical_id = ?1"),
                params![canonical_id],
                raw_record,
            )
            .optional()?;
        raw.map(RawRecord::decode).transpose()
    }

    /// Inserts a record, relying on the unique identity_key constraint to detect
    /// a concurrent creator.
    pub fn insert_record(&self, record: &NewRecord) -> Result<InsertOutcome, StoreError> {
        let now = now_iso8601();
        let source_ids = serde_json::to_string(&record.source_ids)?;
        let result = self.conn.execute(
            "INSERT INTO canonical_records (
                canonical_id, identity_key, ip, mac, hostname, source_ids, version,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?7)",
            params![
                record.canonical_id,
                record.identity_key.as_str(),
                record.attributes.ip,
                record.attributes.mac,
                record.attributes.hostname,
                source_ids,
                now
            ],
        );
        match result {
            Ok(_) => Ok(InsertOutcome::Created),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
            {
                Ok(InsertOutcome::AlreadyExists)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Replaces `source_ids` and bumps the version only if the stored version is
    /// still `observed_version`. Returns `false` when another writer got there first.
    pub fn update_record_if_version(
        &self,
        key: &IdentityKey,
        observed_version: i64,
        source_ids: &SourceIds,
    ) -> Result<bool, StoreError> {
        let source_ids = serde_json::to_string(source_ids)?;
        let changed = self.conn.execute(
            "UPDATE canonical_records
             SET source_ids = ?1, version = version + 1, updated_at = ?2
             WHERE identity_key = ?3 AND version = ?4",
            params![source_ids, now_iso8601(), key.as_str(), observed_version],
        )?;
        Ok(changed == 1)
    }

    /// Records ordered by canonical id, optionally only those attributed to `source`.
    pub fn list_records(&self, source: Option<&str>) -> Result<Vec<CanonicalRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RECORD_COLUMNS}
             FROM canonical_records
             WHERE ?1 IS NULL
                OR EXISTS (SELECT 1 FROM json_each(canonical_records.source_ids) WHERE key = ?1)
             ORDER BY canonical_id ASC"
        ))?;
        let mut rows = stmt.query(params![source])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(raw_record(row)?.decode()?);
        }
        Ok(out)
    }

    pub fn count_records(&self) -> Result<usize, StoreError> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM canonical_records", [], |row| {
                    row.get(0)
                })?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

struct RawRecord {
    canonical_id: i64,
    identity_key: String,
    ip: String,
    mac: String,
    hostname: String,
    source_ids: String,
    version: i64,
    created_at: String,
    updated_at: String,
}

fn raw_record(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok(RawRecord {
        canonical_id: row.get(0)?,
        identity_key: row.get(1)?,
        ip: row.get(2)?,
        mac: row.get(3)?,
        hostname: row.get(4)?,
        source_ids: row.get(5)?,
        version: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

impl RawRecord {
    fn decode(self) -> Result<CanonicalRecord, StoreError> {
        Ok(CanonicalRecord {
            canonical_id: self.canonical_id,
            identity_key: IdentityKey::from_stored(self.identity_key),
            ip: self.ip,
            mac: self.mac,
            hostname: self.hostname,
            source_ids: serde_json::from_str(&self.source_ids)?,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_record(store: &Store, ip: &str, source: &str, local_id: &str) -> NewRecord {
        let attributes = CanonicalAttributes::new(ip, "aa:bb:cc:dd:ee:ff", "host1");
        NewRecord {
            canonical_id: store.next_canonical_id().expect("id"),
            identity_key: attributes.identity_key().expect("key"),
            attributes,
            source_ids: SourceIds::single(source, local_id),
        }
    }

    #[test]
    fn insert_then_find_by_key_and_id() {
        let store = Store::open_in_memory().expect("in-memory store");
        let record = new_record(&store, "10.0.0.1", "alpha", "7");
        assert_eq!(
            store.insert_record(&record).expect("insert"),
            InsertOutcome::Created
        );

        let found = store
            .find_record(&record.identity_key)
            .expect("find")
            .expect("record exists");
        assert_eq!(found.canonical_id, record.canonical_id);
        assert_eq!(found.version, 1);
        assert_eq!(found.source_ids, SourceIds::single("alpha", "7"));
        assert_eq!(
            store.get_record(record.canonical_id).expect("get"),
            Some(found)
        );
        assert_eq!(store.get_record(999).expect("get missing"), None);
    }

    #[test]
    fn duplicate_identity_key_reports_already_exists() {
        let store = Store::open_in_memory().expect("in-memory store");
        let first = new_record(&store, "10.0.0.1", "alpha", "7");
        let second = new_record(&store, "10.0.0.1", "beta", "42");
        assert_eq!(
            store.insert_record(&first).expect("first insert"),
            InsertOutcome::Created
        );
        assert_eq!(
            store.insert_record(&second).expect("second insert"),
            InsertOutcome::AlreadyExists
        );
        assert_eq!(store.count_records().expect("count"), 1);
    }

    #[test]
    fn stale_version_update_matches_nothing() {
        let store = Store::open_in_memory().expect("in-memory store");
        let record = new_record(&store, "10.0.0.1", "alpha", "7");
        store.insert_record(&record).expect("insert");

        let mut ids = record.source_ids.clone();
        ids.insert("beta", "42");
        assert!(
            store
                .update_record_if_version(&record.identity_key, 1, &ids)
                .expect("first update")
        );

        ids.insert("gamma", "1");
        assert!(
            !store
                .update_record_if_version(&record.identity_key, 1, &ids)
                .expect("stale update")
        );

        let stored = store
            .find_record(&record.identity_key)
            .expect("find")
            .expect("exists");
        assert_eq!(stored.version, 2);
        assert!(stored.source_ids.get("gamma").is_none());
        assert!(stored.source_ids.contains("beta", "42"));
    }

    #[test]
    fn list_filters_by_contributing_source() {
        let store = Store::open_in_memory().expect("in-memory store");
        let a = new_record(&store, "10.0.0.1", "alpha", "1");
        let b = new_record(&store, "10.0.0.2", "beta", "2");
        store.insert_record(&a).expect("insert a");
        store.insert_record(&b).expect("insert b");

        let all = store.list_records(None).expect("all");
        assert_eq!(
            all.iter().map(|r| r.canonical_id).collect::<Vec<_>>(),
            vec![a.canonical_id, b.canonical_id]
        );
        let beta = store.list_records(Some("beta")).expect("beta only");
        assert_eq!(beta.len(), 1);
        assert_eq!(beta[0].ip, "10.0.0.2");
        assert!(store.list_records(Some("gamma")).expect("none").is_empty());
    }
}
