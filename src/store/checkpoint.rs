use rusqlite::{OptionalExtension, params};

use super::{Store, StoreError, now_iso8601};
use crate::model::Checkpoint;

impl Store {
    /// Last persisted offset for `source`, or `default` when none was stored.
    pub fn get_offset(&self, source: &str, default: u64) -> Result<u64, StoreError> {
        let stored: Option<i64> = self
            .conn
            .query_row(
                "SELECT skip_offset FROM checkpoints WHERE source = ?1",
                params![source],
                |row| row.get(0),
            )
            .optional()?;
        match stored {
            Some(value) => u64::try_from(value).map_err(|_| StoreError::NegativeOffset(value)),
            None => Ok(default),
        }
    }

    /// Advances the checkpoint for `source`. A lower offset than the stored one
    /// is ignored; only [`Store::reset_offsets`] and the administrative reset
    /// move a checkpoint backward. Returns the offset now stored.
    pub fn set_offset(&self, source: &str, offset: u64) -> Result<u64, StoreError> {
        let stored = i64::try_from(offset).map_err(|_| StoreError::OffsetOverflow(offset))?;
        let current: i64 = self.conn.query_row(
            "INSERT INTO checkpoints (source, skip_offset, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(source) DO UPDATE SET
                skip_offset = MAX(skip_offset, excluded.skip_offset),
                updated_at = excluded.updated_at
             RETURNING skip_offset",
            params![source, stored, now_iso8601()],
            |row| row.get(0),
        )?;
        u64::try_from(current).map_err(|_| StoreError::NegativeOffset(current))
    }

    /// Zeroes the checkpoint of every given source. Administrative use only.
    pub fn reset_offsets(&self, sources: &[String]) -> Result<(), StoreError> {
        let tx = self.conn.unchecked_transaction()?;
        let now = now_iso8601();
        for source in sources {
            tx.execute(
                "INSERT INTO checkpoints (source, skip_offset, updated_at) VALUES (?1, 0, ?2)
                 ON CONFLICT(source) DO UPDATE SET skip_offset = 0, updated_at = excluded.updated_at",
                params![source, now],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn checkpoints(&self, sources: &[String]) -> Result<Vec<Checkpoint>, StoreError> {
        sources
            .iter()
            .map(|source| {
                Ok(Checkpoint {
                    source: source.clone(),
                    skip_offset: self.get_offset(source, 0)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::model::Checkpoint;
    use crate::store::Store;

    #[test]
    fn missing_checkpoint_returns_default() {
        let store = Store::open_in_memory().expect("in-memory store");
        assert_eq!(store.get_offset("alpha", 0).expect("offset"), 0);
        assert_eq!(store.get_offset("alpha", 17).expect("offset"), 17);
    }

    #[test]
    fn set_offset_upserts_and_is_idempotent() {
        let store = Store::open_in_memory().expect("in-memory store");
        store.set_offset("alpha", 100).expect("first set");
        store.set_offset("alpha", 100).expect("same value again");
        assert_eq!(store.get_offset("alpha", 0).expect("offset"), 100);

        store.set_offset("alpha", 200).expect("advance");
        assert_eq!(store.get_offset("alpha", 0).expect("offset"), 200);
    }

    #[test]
    fn lower_offset_never_moves_checkpoint_backward() {
        let store = Store::open_in_memory().expect("in-memory store");
        assert_eq!(store.set_offset("alpha", 40).expect("advance"), 40);
        assert_eq!(store.set_offset("alpha", 20).expect("stale writer"), 40);
        assert_eq!(store.get_offset("alpha", 0).expect("offset"), 40);

        store
            .reset_offsets(&["alpha".to_string()])
            .expect("administrative reset");
        assert_eq!(store.get_offset("alpha", 99).expect("offset"), 0);
        assert_eq!(store.set_offset("alpha", 10).expect("after reset"), 10);
    }

    #[test]
    fn checkpoints_are_scoped_per_source() {
        let store = Store::open_in_memory().expect("in-memory store");
        store.set_offset("alpha", 5).expect("alpha");
        store.set_offset("beta", 9).expect("beta");

        store
            .reset_offsets(&["alpha".to_string()])
            .expect("reset alpha");
        let listed = store
            .checkpoints(&["alpha".to_string(), "beta".to_string(), "gamma".to_string()])
            .expect("list");
        assert_eq!(
            listed,
            vec![
                Checkpoint {
                    source: "alpha".to_string(),
                    skip_offset: 0
                },
                Checkpoint {
                    source: "beta".to_string(),
                    skip_offset: 9
                },
                Checkpoint {
                    source: "gamma".to_string(),
                    skip_offset: 0
                },
            ]
        );
    }

    #[test]
    fn offsets_beyond_storage_range_are_rejected() {
        let store = Store::open_in_memory().expect("in-memory store");
        assert!(store.set_offset("alpha", u64::MAX).is_err());
    }
}
