/// PostgreSQL persistence implementations for the admission queue and the
/// lifecycle store.
///
/// Both backends share one pool, so every server process and every cluster
/// job that points at the same database sees the same queue and records.
pub mod postgres;

pub use postgres::{connect, run_migrations, PostgresAdmissionQueue, PostgresLifecycleStore};

use crate::error::PkaqError;

/// SQLSTATE for a unique constraint violation.
pub(crate) const UNIQUE_VIOLATION: &str = "23505";

impl From<sqlx::Error> for PkaqError {
    fn from(err: sqlx::Error) -> Self {
        PkaqError::Store(err.to_string())
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.code().map(|c| c.to_string()).as_deref() == Some(UNIQUE_VIOLATION)
        }
        _ => false,
    }
}
