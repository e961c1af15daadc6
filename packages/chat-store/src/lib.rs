//! # Chat Store
//!
//! On-device persistence for a chat client: conversations, messages and
//! the summary views derived from them, kept consistent under one writer
//! and many readers.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          CHAT STORE MODULES                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────┐  ┌─────────────┐   │
//! │  │   Messages   │  │Conversations │  │    Pins    │  │ Transcripts │   │
//! │  │              │  │              │  │            │  │             │   │
//! │  │ - Insert     │  │ - Metadata   │  │ - Pin      │  │ - Children  │   │
//! │  │ - Status     │  │ - Mark read  │  │ - Unpin    │  │ - Media     │   │
//! │  │ - Recall     │  │ - Clear      │  │ - List     │  │             │   │
//! │  │ - Page       │  │ - Aggregates │  │            │  │             │   │
//! │  │ - Search     │  │              │  │            │  │             │   │
//! │  └──────┬───────┘  └──────┬───────┘  └─────┬──────┘  └──────┬──────┘   │
//! │         │                 │                │                │          │
//! │         └─────────────────┴───────┬────────┴────────────────┘          │
//! │                                   │                                     │
//! │  ┌──────────────┐   ┌─────────────▼──────────┐   ┌───────────────────┐ │
//! │  │    Expiry    │──►│        Storage         │──►│     Notifier      │ │
//! │  │              │   │                        │   │                   │ │
//! │  │ - Schedules  │   │ - SQLite (WAL)         │   │ - ChangeBatch     │ │
//! │  │ - Sweep      │   │ - One writer, N readers│   │ - Violations      │ │
//! │  │ - Runner     │   │ - Schema / migrations  │   │ - Post-commit     │ │
//! │  └──────────────┘   └────────────────────────┘   └───────────────────┘ │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`storage`] - Database, schema and record types
//! - [`messages`] - Message store (insert, status, recall, paging, search)
//! - [`conversations`] - Conversation store and derived aggregates
//! - [`pins`] - Pinned messages
//! - [`transcripts`] - Messages embedded in transcripts
//! - [`expiry`] - Disappearing messages
//! - [`notifier`] - Post-commit change notifications
//! - [`time`] - Clocks
//!
//! ## Usage
//!
//! ```ignore
//! use chat_store::{ChatStore, MessageBody, MessageSource, NewMessage, StoreConfig};
//!
//! let store = ChatStore::open(StoreConfig::at_path("chat.db", "me"))?;
//! store.messages().insert(
//!     NewMessage::new("m1", "c1", "bob", MessageBody::Text("hi".into()), created_at),
//!     MessageSource::Remote,
//! )?;
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod conversations;
pub mod error;
pub mod expiry;
pub mod messages;
pub mod notifier;
pub mod pins;
pub mod storage;
/// Clocks used to stamp writes and drive expiry.
pub mod time;
pub mod transcripts;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use conversations::ConversationStore;
pub use error::{Error, Result};
pub use expiry::{ExpiryScheduler, SweepReport, SweepRunner};
pub use messages::{
    Direction, InsertOutcome, MediaUpdate, MessageStore, MessageWindow, ReadReceipt,
    RecallOutcome, StatusUpdate,
};
pub use notifier::{ChangeBatch, ChangeNotifier, ConversationChange, IntegrityViolation, StoreEvent};
pub use pins::PinStore;
pub use storage::{
    Category, Conversation, ConversationCategory, ConversationStatus, Database, ExpirySchedule,
    ExpiryScheme, MediaAttachment, MediaStatus, Message, MessageBody, MessageMention,
    MessageSource, MessageStatus, NewConversation, NewMessage, PinnedMessage, QuoteSnapshot,
    SearchHit, StoreConfig, TranscriptChild,
};
pub use time::{Clock, ManualClock, SystemClock};
pub use transcripts::TranscriptStore;

// ============================================================================
// STORE HANDLE
// ============================================================================

use futures::Stream;
use std::sync::Arc;
use tokio::sync::broadcast;

/// One opened store with all of its services
///
/// ## Lifecycle
///
/// ```text
/// ┌─────────────────────────────────────────────────────────────────────────┐
/// │                        CHAT STORE LIFECYCLE                             │
/// ├─────────────────────────────────────────────────────────────────────────┤
/// │                                                                         │
/// │  1. Open                                                                │
/// │     ChatStore::open() ──► validate config                               │
/// │                       ──► open / migrate database                       │
/// │                       ──► start notifier thread                         │
/// │                       ──► build search index (if enabled)               │
/// │            │                                                            │
/// │            ▼                                                            │
/// │  2. Subscribe                                                           │
/// │     subscribe() / events() ──► ChangeBatch per commit                   │
/// │            │                                                            │
/// │            ▼                                                            │
/// │  3. Operate                                                             │
/// │     messages() / conversations() / pins() / transcripts() / expiry()    │
/// │            │                                                            │
/// │            ▼                                                            │
/// │  4. Drop                                                                │
/// │     last handle dropped ──► connections closed, notifier stops          │
/// │                                                                         │
/// └─────────────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone)]
pub struct ChatStore {
    db: Arc<Database>,
    messages: MessageStore,
    conversations: ConversationStore,
    pins: PinStore,
    transcripts: TranscriptStore,
    expiry: ExpiryScheduler,
}

impl ChatStore {
    /// Open a store using the system clock
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Open a store with an explicit clock (tests, simulations)
    pub fn open_with_clock(config: StoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let build_index = config.search_index;

        tracing::info!("Opening chat store v{}", version());
        // Validates the config before touching disk
        let db = Database::open(config, clock)?;
        let store = Self {
            messages: MessageStore::new(db.clone()),
            conversations: ConversationStore::new(db.clone()),
            pins: PinStore::new(db.clone()),
            transcripts: TranscriptStore::new(db.clone()),
            expiry: ExpiryScheduler::new(db.clone()),
            db,
        };

        if build_index {
            let indexed = store.messages.initialize_search_index()?;
            if indexed > 0 {
                tracing::info!("Indexed {} existing message(s) for search", indexed);
            }
        }

        Ok(store)
    }

    /// In-memory store for `local_user_id`
    pub fn in_memory(local_user_id: impl Into<String>) -> Result<Self> {
        Self::open(StoreConfig::in_memory(local_user_id))
    }

    /// Message store
    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    /// Conversation store
    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    /// Pinned messages
    pub fn pins(&self) -> &PinStore {
        &self.pins
    }

    /// Transcript children
    pub fn transcripts(&self) -> &TranscriptStore {
        &self.transcripts
    }

    /// Disappearing-message scheduler
    pub fn expiry(&self) -> &ExpiryScheduler {
        &self.expiry
    }

    /// Start a background sweep on the current tokio runtime
    pub fn spawn_sweeper(&self) -> SweepRunner {
        SweepRunner::spawn(self.expiry.clone())
    }

    /// Committed change batches
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeBatch> {
        self.db.notifier().subscribe()
    }

    /// Refused writes
    pub fn subscribe_violations(&self) -> broadcast::Receiver<IntegrityViolation> {
        self.db.notifier().subscribe_violations()
    }

    /// Committed events as a stream
    pub fn events(&self) -> impl Stream<Item = StoreEvent> + Send + 'static {
        self.db.notifier().stream()
    }

    /// Resolves once everything committed so far has been dispatched
    pub async fn flushed(&self) {
        self.db.notifier().flushed().await
    }

    /// The underlying database
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }
}

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of the chat store
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }

    #[test]
    fn test_open_builds_search_index() {
        let store = ChatStore::in_memory("me").unwrap();
        assert!(store.messages().search_index_initialized().unwrap());
    }

    #[test]
    fn test_open_without_search_index() {
        let mut config = StoreConfig::in_memory("me");
        config.search_index = false;
        let store = ChatStore::open(config).unwrap();
        assert!(!store.messages().search_index_initialized().unwrap());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = StoreConfig::in_memory("");
        assert!(matches!(ChatStore::open(config), Err(Error::InvalidConfig(_))));
    }
}
