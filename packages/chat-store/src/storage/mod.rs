//! # Storage Module
//!
//! SQLite-backed storage: configuration, the transactional database handle
//! and the typed records every other module reads and writes.
//!
//! ## Storage Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         STORAGE SYSTEM                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  Writer slot (one connection, parking_lot Mutex)                │   │
//! │  │  ─────────────────────────────────────────────                   │   │
//! │  │  Database::write(|txn| ...)                                     │   │
//! │  │    • BEGIN IMMEDIATE                                            │   │
//! │  │    • closure touches any number of tables                       │   │
//! │  │    • COMMIT, or ROLLBACK if the closure returns Err             │   │
//! │  │    • then hand recorded changes to the notifier                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  Reader pool (file databases, WAL mode)                         │   │
//! │  │  ──────────────────────────────────────                          │   │
//! │  │  Database::read(|conn| ...)                                     │   │
//! │  │    • read-only connections, one snapshot per closure            │   │
//! │  │    • never blocked by the writer                                │   │
//! │  │    • in-memory stores read through the writer connection        │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod database;
mod records;
pub mod schema;

pub use database::{Database, WriteTxn};
pub(crate) use database::get_property;
pub use records::{
    Category, Conversation, ConversationCategory, ConversationStatus, ExpiryScheme,
    ExpirySchedule, MediaAttachment, MediaStatus, Message, MessageBody, MessageMention,
    MessageSource, MessageStatus, NewConversation, NewMessage, PinnedMessage, QuoteSnapshot,
    SearchHit, StatusTransition, TranscriptChild,
};
pub(crate) use records::{
    conversation_from_row, message_from_row, RecallScope, CONVERSATION_COLUMNS, MESSAGE_COLUMNS,
};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Ids bound per `IN (...)` list; longer lists are processed in chunks
pub(crate) const MAX_BOUND_IDS: usize = 500;

/// `?, ?, ?` for an `IN (...)` list of `count` values
pub(crate) fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// Store configuration
///
/// Every field has a default, so a JSON config only needs the fields it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file; `None` keeps everything in memory
    pub path: Option<PathBuf>,
    /// The local user's id (decides inbound vs outbound)
    pub local_user_id: String,
    /// Read-only connections for file databases
    pub reader_connections: usize,
    /// How long a write waits for the writer slot before failing as busy
    pub write_lock_timeout_ms: u64,
    /// SQLite busy timeout for file locks held by other processes
    pub busy_timeout_ms: u64,
    /// Upper bound on messages removed by one expiry sweep
    pub sweep_batch_size: usize,
    /// Upper bound on a single page read
    pub max_page_size: usize,
    /// Batches a slow subscriber may fall behind before it lags
    pub event_capacity: usize,
    /// Build the full-text index on open if it has not been built yet
    pub search_index: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            local_user_id: String::new(),
            reader_connections: 4,
            write_lock_timeout_ms: 5_000,
            busy_timeout_ms: 5_000,
            sweep_batch_size: 100,
            max_page_size: 500,
            event_capacity: 256,
            search_index: true,
        }
    }
}

impl StoreConfig {
    /// In-memory store for `local_user_id`
    pub fn in_memory(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            ..Default::default()
        }
    }

    /// File-backed store for `local_user_id`
    pub fn at_path(path: impl Into<PathBuf>, local_user_id: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            local_user_id: local_user_id.into(),
            ..Default::default()
        }
    }

    /// Parse a JSON config
    pub fn from_json(json: &str) -> Result<Self> {
        let config: StoreConfig = serde_json::from_str(json)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the store cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.local_user_id.is_empty() {
            return Err(Error::InvalidConfig("local_user_id is required".into()));
        }
        if self.sweep_batch_size == 0 {
            return Err(Error::InvalidConfig(
                "sweep_batch_size must be at least 1".into(),
            ));
        }
        if self.max_page_size == 0 {
            return Err(Error::InvalidConfig(
                "max_page_size must be at least 1".into(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(Error::InvalidConfig(
                "event_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(1), "?");
        assert_eq!(placeholders(3), "?, ?, ?");
    }

    #[test]
    fn test_config_from_partial_json() {
        let config =
            StoreConfig::from_json(r#"{"local_user_id": "me", "sweep_batch_size": 10}"#).unwrap();
        assert_eq!(config.local_user_id, "me");
        assert_eq!(config.sweep_batch_size, 10);
        assert_eq!(config.max_page_size, 500);
        assert!(config.path.is_none());
        assert!(config.search_index);
    }

    #[test]
    fn test_config_requires_local_user() {
        assert!(matches!(
            StoreConfig::from_json("{}"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            StoreConfig::from_json("not json"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_rejects_zero_limits() {
        let mut config = StoreConfig::in_memory("me");
        assert!(config.validate().is_ok());

        config.sweep_batch_size = 0;
        assert!(config.validate().is_err());

        config.sweep_batch_size = 1;
        config.max_page_size = 0;
        assert!(config.validate().is_err());
    }
}
