//! Error types for release tracking.

use diesel::result::{DatabaseErrorKind, Error as DieselError};

/// Reason reported when a release is some issue's first release.
pub const ERR_RELEASE_REFERENCED: &str =
    "This release is referenced by active issues and cannot be removed.";

/// Reason reported when analytical health data exists for the release.
pub const ERR_RELEASE_HEALTH_DATA: &str = "This release has health data and cannot be removed.";

/// Reason reported when the health data check itself failed.
pub const ERR_RELEASE_HEALTH_UNKNOWN: &str =
    "Health data for this release could not be checked; it cannot be removed right now.";

pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub type ReleaseResult<T> = std::result::Result<T, ReleaseError>;

/// Storage-layer failures. `Conflict` is the uniqueness violation the
/// services recover from locally; everything else is a persistence fault.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("uniqueness conflict: {0}")]
    Conflict(String),
    #[error("record not found")]
    NotFound,
    #[error("database error: {0}")]
    Database(DieselError),
    #[error("storage backend unavailable: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("in-memory store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<DieselError> for StoreError {
    fn from(err: DieselError) -> Self {
        match err {
            DieselError::NotFound => Self::NotFound,
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                Self::Conflict(info.message().to_string())
            }
            other => Self::Database(other),
        }
    }
}

/// Errors surfaced to callers of the release services.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    /// Commits are already being bound to this release.
    #[error("commits are already being set for this release (lock {key} busy after {attempts} attempt(s))")]
    LockBusy { key: String, attempts: u32 },

    #[error("{reason}")]
    UnsafeDeletion { reason: String },

    #[error("Invalid repository names: {}", names.join(","))]
    InvalidRepository { names: Vec<String> },

    #[error("persistence fault: {0}")]
    Persistence(#[from] StoreError),
}

impl ReleaseError {
    /// Maps a store miss to `NotFound` for the given entity, keeping any
    /// other failure as a persistence fault.
    pub fn from_store(err: StoreError, entity: &'static str, id: i64) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound { entity, id },
            other => Self::Persistence(other),
        }
    }
}
