//! # Error Handling
//!
//! Error types for the chat store.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Lifecycle Errors                                                  │
//! │  │   ├── InvalidConfig         - Configuration rejected at open        │
//! │  │   └── SchemaTooNew          - File written by a newer build         │
//! │  │                                                                      │
//! │  ├── Storage Errors                                                    │
//! │  │   ├── Database              - SQLite reported a failure             │
//! │  │   ├── Busy                  - Writer slot or file lock unavailable  │
//! │  │   ├── Io                    - Disk full / I/O failure               │
//! │  │   └── Corrupted             - Database file is not usable           │
//! │  │                                                                      │
//! │  ├── Message Errors                                                    │
//! │  │   ├── InvalidMessage        - Message rejected before any write     │
//! │  │   └── InvalidCategory       - Unrecognised category tag             │
//! │  │                                                                      │
//! │  └── Internal Errors                                                   │
//! │      ├── Serialization         - JSON encode/decode failed             │
//! │      └── Internal              - Should never happen                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## What is NOT an error
//!
//! Lookups that find nothing return `Ok(None)` or an empty collection.
//! Status updates on a FAILED message and attempts to overwrite a set
//! expiry are integrity anomalies: the write is skipped, a warning is
//! logged and the anomaly is published on the notifier's violation
//! channel. The caller still gets `Ok`.
//!
//! ## Error Codes
//!
//! | Range   | Category   |
//! |---------|------------|
//! | 100-199 | Lifecycle  |
//! | 400-499 | Storage    |
//! | 700-799 | Message    |
//! | 900-999 | Internal   |

use thiserror::Error;

/// Result type alias using the store's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the chat store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // ========================================================================
    // LIFECYCLE ERRORS (100-199)
    // ========================================================================
    /// The supplied configuration cannot be used
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The database was written by a newer schema than this build knows
    #[error("Schema version {found} is newer than supported version {supported}")]
    SchemaTooNew {
        /// Version found in the file
        found: i32,
        /// Highest version this build can open
        supported: i32,
    },

    // ========================================================================
    // STORAGE ERRORS (400-499)
    // ========================================================================
    /// SQLite failure that is not one of the more specific kinds below
    #[error("Database error: {0}")]
    Database(String),

    /// The writer slot (or the file lock) could not be acquired in time
    #[error("Store busy: {0}")]
    Busy(String),

    /// The engine could not read or write the file
    #[error("Storage I/O error: {0}")]
    Io(String),

    /// The database file is damaged or not a database
    #[error("Data corrupted: {0}")]
    Corrupted(String),

    // ========================================================================
    // MESSAGE ERRORS (700-799)
    // ========================================================================
    /// A message was rejected before anything was written
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// A category tag did not parse
    #[error("Invalid category: {0}")]
    InvalidCategory(String),

    // ========================================================================
    // INTERNAL ERRORS (900-999)
    // ========================================================================
    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the numeric error code
    pub fn code(&self) -> i32 {
        match self {
            // Lifecycle (100-199)
            Error::InvalidConfig(_) => 100,
            Error::SchemaTooNew { .. } => 101,

            // Storage (400-499)
            Error::Database(_) => 400,
            Error::Busy(_) => 401,
            Error::Io(_) => 402,
            Error::Corrupted(_) => 403,

            // Message (700-799)
            Error::InvalidMessage(_) => 700,
            Error::InvalidCategory(_) => 701,

            // Internal (900-999)
            Error::Serialization(_) => 900,
            Error::Internal(_) => 999,
        }
    }

    /// Whether retrying the same call later may succeed.
    ///
    /// A failed write has already rolled back, so retrying is always safe.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Busy(_) | Error::Io(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &err {
            rusqlite::Error::SqliteFailure(failure, _) => match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                    Error::Busy(err.to_string())
                }
                ErrorCode::DiskFull | ErrorCode::SystemIoFailure | ErrorCode::CannotOpen => {
                    Error::Io(err.to_string())
                }
                ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => {
                    Error::Corrupted(err.to_string())
                }
                _ => Error::Database(err.to_string()),
            },
            _ => Error::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
