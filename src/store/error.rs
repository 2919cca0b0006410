use thiserror::Error;

/// Typed storage failure. The flusher branches on the kind: busy errors
/// are retried with backoff, constraint errors discard the offending row,
/// anything else bubbles up.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLITE_BUSY / SQLITE_LOCKED; the write can be retried.
    #[error("database busy: {0}")]
    Busy(sqlx::Error),

    /// Integrity violation (unique, foreign key, check, not-null).
    #[error("constraint violation: {0}")]
    Constraint(sqlx::Error),

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, StoreError::Constraint(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &e {
            use sqlx::error::ErrorKind;
            match db.kind() {
                ErrorKind::UniqueViolation
                | ErrorKind::ForeignKeyViolation
                | ErrorKind::NotNullViolation
                | ErrorKind::CheckViolation => return StoreError::Constraint(e),
                _ => {}
            }

            // SQLITE_BUSY (5) and SQLITE_LOCKED (6) plus their extended
            // codes signal transient contention.
            if let Some(code) = db.code() {
                if matches!(code.as_ref(), "5" | "6" | "261" | "262" | "517") {
                    return StoreError::Busy(e);
                }
            }
            if db.message().contains("database is locked")
                || db.message().contains("database table is locked")
            {
                return StoreError::Busy(e);
            }
        }

        StoreError::Database(e)
    }
}
