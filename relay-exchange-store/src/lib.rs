//! A private SQL side table recording the context of inbound messages that
//! expect a result, so a stale result (secure ID changed since receipt) can
//! be detected and dropped rather than sent (§4.D).

mod error;

pub use error::ExchangeStoreError;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

/// One recorded inbound message awaiting a result.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageContext {
    pub operation_id: i64,
    pub secure_id: String,
    pub message_type: String,
    pub timestamp: f64,
}

pub struct ExchangeStore {
    conn: Connection,
}

impl ExchangeStore {
    /// Opens (creating if absent) the single-file database at `path` and
    /// ensures the `message_context` table and its `operation_id` unique
    /// index exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ExchangeStoreError> {
        let conn = Connection::open(path)?;
        Self::ensure_schema(&conn)?;
        Ok(Self { conn })
    }

    fn ensure_schema(conn: &Connection) -> Result<(), ExchangeStoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS message_context (
                id INTEGER PRIMARY KEY,
                timestamp REAL,
                secure_id TEXT NOT NULL,
                operation_id INTEGER NOT NULL,
                message_type TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS msgctx_operationid_idx
                ON message_context(operation_id);",
        )?;
        Ok(())
    }

    /// Inserts a new context row. A duplicate `operation_id` surfaces as
    /// [`ExchangeStoreError::is_duplicate`] returning `true`; callers treat
    /// that as "already recorded" and proceed rather than treating it as a
    /// hard failure (§4.D).
    pub fn add(
        &mut self,
        operation_id: i64,
        secure_id: &str,
        message_type: &str,
        timestamp: f64,
    ) -> Result<MessageContext, ExchangeStoreError> {
        let tx = self.conn.transaction()?;
        let result = tx.execute(
            "INSERT INTO message_context (operation_id, secure_id, message_type, timestamp)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![operation_id, secure_id, message_type, timestamp],
        );
        match result {
            Ok(_) => {
                tx.commit()?;
                Ok(MessageContext {
                    operation_id,
                    secure_id: secure_id.to_string(),
                    message_type: message_type.to_string(),
                    timestamp,
                })
            }
            Err(err) => {
                // tx drops here, rolling back implicitly.
                Err(err.into())
            }
        }
    }

    pub fn get(&mut self, operation_id: i64) -> Result<Option<MessageContext>, ExchangeStoreError> {
        let tx = self.conn.transaction()?;
        let row = tx
            .query_row(
                "SELECT operation_id, secure_id, message_type, timestamp
                 FROM message_context WHERE operation_id = ?1",
                [operation_id],
                |row| {
                    Ok(MessageContext {
                        operation_id: row.get(0)?,
                        secure_id: row.get(1)?,
                        message_type: row.get(2)?,
                        timestamp: row.get(3)?,
                    })
                },
            )
            .optional()?;
        tx.commit()?;
        Ok(row)
    }

    pub fn remove(&mut self, operation_id: i64) -> Result<(), ExchangeStoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM message_context WHERE operation_id = ?1",
            [operation_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn list_operation_ids(&mut self) -> Result<Vec<i64>, ExchangeStoreError> {
        let tx = self.conn.transaction()?;
        let ids = {
            let mut stmt = tx.prepare("SELECT operation_id FROM message_context")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<Vec<i64>, _>>()?
        };
        tx.commit()?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> ExchangeStore {
        ExchangeStore::open(":memory:").unwrap()
    }

    #[test]
    fn add_then_get_round_trips() {
        let mut store = store();
        store.add(42, "secure-1", "accepted-types", 123.5).unwrap();
        let ctx = store.get(42).unwrap().unwrap();
        assert_eq!(ctx.operation_id, 42);
        assert_eq!(ctx.secure_id, "secure-1");
        assert_eq!(ctx.message_type, "accepted-types");
    }

    #[test]
    fn get_missing_returns_none() {
        let mut store = store();
        assert_eq!(store.get(1).unwrap(), None);
    }

    #[test]
    fn duplicate_operation_id_is_reported_as_duplicate() {
        let mut store = store();
        store.add(1, "a", "t", 1.0).unwrap();
        let err = store.add(1, "b", "t", 2.0).unwrap_err();
        assert!(err.is_duplicate());
    }

    #[test]
    fn remove_drops_row() {
        let mut store = store();
        store.add(7, "a", "t", 1.0).unwrap();
        store.remove(7).unwrap();
        assert_eq!(store.get(7).unwrap(), None);
    }

    #[test]
    fn list_operation_ids_returns_all() {
        let mut store = store();
        store.add(1, "a", "t", 1.0).unwrap();
        store.add(2, "a", "t", 1.0).unwrap();
        let mut ids = store.list_operation_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }
}
