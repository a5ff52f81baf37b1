#[derive(Debug, thiserror::Error)]
pub enum ExchangeStoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("operation_id {0} is already recorded")]
    Duplicate(i64),
}

impl ExchangeStoreError {
    /// True when this failure is the UNIQUE-constraint violation on
    /// `operation_id`, which `add` callers treat as "already recorded"
    /// rather than a hard error (§4.D).
    pub fn is_duplicate(&self) -> bool {
        matches!(self, ExchangeStoreError::Duplicate(_))
            || matches!(
                self,
                ExchangeStoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation
            )
    }
}
