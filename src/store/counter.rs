use rusqlite::params;

use super::{Store, StoreError};

const CANONICAL_ID_COUNTER: &str = "canonical_id";

impl Store {
    /// Atomically increments the shared canonical-id counter and returns the new
    /// value. The first id handed out is 1; ids are never reused, even when the
    /// insert they were allocated for loses a race.
    pub fn next_canonical_id(&self) -> Result<i64, StoreError> {
        let id = self.conn.query_row(
            "INSERT INTO counters (name, value) VALUES (?1, 1)
             ON CONFLICT(name) DO UPDATE SET value = value + 1
             RETURNING value",
            params![CANONICAL_ID_COUNTER],
            |row| row.get(0),
        )?;
        Ok(id)
    }
}
