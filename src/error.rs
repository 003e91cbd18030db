//! Error types for rental_summary.
//!
//! All errors that can occur while maintaining the rental summary are
//! represented by [`SummaryError`]. Errors are propagated via
//! `Result<T, SummaryError>` throughout the crate and surface unchanged at
//! the [`RentalLedger`](crate::ledger::RentalLedger) boundary.
//!
//! # Error Classification
//!
//! Errors are classified into four categories:
//! - **User** — bad arguments, unknown records, invalid configuration.
//! - **Storage** — the persistence layer is unreachable. The enclosing
//!   mutation is aborted and may be retried.
//! - **Consistency** — the summary disagrees with the detail store. Logged,
//!   never used to abort a deletion.
//! - **Internal** — bugs, e.g. a duplicate summary key.
//!
//! PostgreSQL errors are classified by SQLSTATE in [`classify_sqlstate`].

use std::fmt;

/// Primary error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum SummaryError {
    // ── User errors ──────────────────────────────────────────────────────
    /// A referenced detail record or entry does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An invalid argument was provided to a ledger operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),

    // ── Storage errors — abort the mutation ──────────────────────────────
    /// The detail or summary storage could not be reached.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    // ── Consistency errors — log and skip ────────────────────────────────
    /// A deleted detail record had no summary entry for its genre.
    #[error("invariant violation: no summary entry for genre '{genre}'")]
    InvariantViolation { genre: String },

    // ── Internal errors — should not happen ──────────────────────────────
    /// A summary entry was created for a genre that already had one.
    #[error("duplicate summary key for genre '{0}'")]
    DuplicateGenreKey(String),

    /// An unexpected internal error. Indicates a bug.
    #[error("internal error: {0}")]
    InternalError(String),
}

/// Classification of error kind for logging and exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryErrorKind {
    User,
    Storage,
    Consistency,
    Internal,
}

impl fmt::Display for SummaryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SummaryErrorKind::User => write!(f, "USER"),
            SummaryErrorKind::Storage => write!(f, "STORAGE"),
            SummaryErrorKind::Consistency => write!(f, "CONSISTENCY"),
            SummaryErrorKind::Internal => write!(f, "INTERNAL"),
        }
    }
}

impl SummaryError {
    /// Classify the error.
    pub fn kind(&self) -> SummaryErrorKind {
        match self {
            SummaryError::NotFound(_)
            | SummaryError::InvalidArgument(_)
            | SummaryError::Config(_) => SummaryErrorKind::User,

            SummaryError::StorageUnavailable(_) => SummaryErrorKind::Storage,

            SummaryError::InvariantViolation { .. } => SummaryErrorKind::Consistency,

            SummaryError::DuplicateGenreKey(_) | SummaryError::InternalError(_) => {
                SummaryErrorKind::Internal
            }
        }
    }

    /// Whether retrying the same mutation later could succeed.
    ///
    /// Only storage outages are retryable; everything else fails the same
    /// way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SummaryError::StorageUnavailable(_))
    }

    /// Process exit code used by the CLI for this error.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            SummaryErrorKind::User => 2,
            SummaryErrorKind::Storage => 3,
            SummaryErrorKind::Consistency => 4,
            SummaryErrorKind::Internal => 70,
        }
    }
}

impl From<postgres::Error> for SummaryError {
    fn from(e: postgres::Error) -> Self {
        match (e.code(), e.as_db_error()) {
            (Some(state), Some(db)) => classify_sqlstate(state.code(), db.message()),
            (Some(state), None) => classify_sqlstate(state.code(), &e.to_string()),
            // No SQLSTATE: the connection itself failed.
            (None, _) => SummaryError::StorageUnavailable(e.to_string()),
        }
    }
}

/// Map a server-reported SQLSTATE to an error variant, keeping the server's
/// message text.
///
/// Transient, so [`SummaryError::StorageUnavailable`]:
/// - class 40, deadlock and serialization failure
/// - class 08, connection exceptions
/// - 57P, server shutdown
///
/// Anything else the server rejects is a bug in the statements this crate
/// issues.
pub fn classify_sqlstate(code: &str, message: &str) -> SummaryError {
    let text = format!("{message} (SQLSTATE {code})");
    if code == "23505" {
        SummaryError::DuplicateGenreKey(text)
    } else if code.starts_with("40") || code.starts_with("08") || code.starts_with("57P") {
        SummaryError::StorageUnavailable(text)
    } else {
        SummaryError::InternalError(text)
    }
}

impl From<toml::de::Error> for SummaryError {
    fn from(e: toml::de::Error) -> Self {
        SummaryError::Config(e.to_string())
    }
}
