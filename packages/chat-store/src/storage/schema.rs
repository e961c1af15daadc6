//! # Database Schema
//!
//! SQL schema definitions for the chat store.
//!
//! ## Schema Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         DATABASE SCHEMA                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────────────┐         ┌─────────────────────┐               │
//! │  │    conversations     │         │      messages       │               │
//! │  ├──────────────────────┤         ├─────────────────────┤               │
//! │  │ id                   │◄────────│ conversation_id     │               │
//! │  │ category / name      │         │ id                  │◄──┐           │
//! │  │ last_message_id ─────┼────────►│ category / status   │   │           │
//! │  │ last_read_message_id │         │ content / media_*   │   │           │
//! │  │ unseen_message_count │         │ quote_message_id    │   │           │
//! │  │ unseen_mention_count │         │ quote_content (json)│   │           │
//! │  │ pin_time / mute_until│         │ created_at (ms)     │   │           │
//! │  │ expire_in / status   │         └─────────────────────┘   │           │
//! │  └──────────────────────┘                                   │           │
//! │                                                             │           │
//! │  message_mentions ──────┐  pinned_messages ──────┐          │           │
//! │  transcript_messages ───┼─ expired_messages ─────┼──────────┘           │
//! │  messages_fts (FTS5) ───┘                        │  (keyed by message)  │
//! │                                                                         │
//! │  properties: key/value flags (search index state)                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! There are no foreign keys: the message store removes dependents in the
//! same transaction as the message, and the shadow tables are allowed to be
//! briefly ahead of a crashed import (they are rebuilt on demand).

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// SQL to create all tables
pub const CREATE_TABLES: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

-- Small key/value table for store-level flags
CREATE TABLE IF NOT EXISTS properties (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Conversations with their derived aggregates
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    -- 'DIRECT' | 'GROUP' | NULL while unclassified
    category TEXT,
    name TEXT,
    owner_id TEXT,
    -- Derived: newest message by (created_at, seq)
    last_message_id TEXT,
    last_message_created_at INTEGER,
    last_read_message_id TEXT,
    -- Derived: inbound messages still DELIVERED
    unseen_message_count INTEGER NOT NULL DEFAULT 0,
    -- Derived: mention rows with has_read = 0
    unseen_mention_count INTEGER NOT NULL DEFAULT 0,
    pin_time INTEGER,
    mute_until INTEGER,
    -- Disappearing-message duration in seconds, 0 = off
    expire_in INTEGER NOT NULL DEFAULT 0,
    -- 0 = start, 1 = success, 2 = quit
    status INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_order
    ON conversations(pin_time DESC, last_message_created_at DESC);

-- Messages. `seq` is the insertion order used to break created_at ties;
-- as an INTEGER PRIMARY KEY it survives VACUUM.
CREATE TABLE IF NOT EXISTS messages (
    seq INTEGER PRIMARY KEY,
    id TEXT NOT NULL UNIQUE,
    conversation_id TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    category TEXT NOT NULL,
    -- Text body, or the attachment id for media
    content TEXT,
    media_url TEXT,
    media_mime_type TEXT,
    media_size INTEGER,
    media_duration INTEGER,
    media_width INTEGER,
    media_height INTEGER,
    media_status TEXT,
    thumb_image TEXT,
    -- File name for DATA
    name TEXT,
    sticker_id TEXT,
    shared_user_id TEXT,
    status TEXT NOT NULL,
    quote_message_id TEXT,
    -- Frozen JSON snapshot of the quoted message
    quote_content TEXT,
    -- Unix milliseconds
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_unseen
    ON messages(conversation_id, status, sender_id);
CREATE INDEX IF NOT EXISTS idx_messages_quote
    ON messages(conversation_id, quote_message_id);
CREATE INDEX IF NOT EXISTS idx_messages_category
    ON messages(conversation_id, category, created_at);

-- At most one mention row per message
CREATE TABLE IF NOT EXISTS message_mentions (
    message_id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    -- JSON array of mentioned user ids
    mentions TEXT NOT NULL,
    has_read INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_message_mentions_unread
    ON message_mentions(conversation_id, has_read);

-- Pins
CREATE TABLE IF NOT EXISTS pinned_messages (
    message_id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    pinned_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pinned_messages_conversation
    ON pinned_messages(conversation_id, pinned_at);

-- Messages embedded in a TRANSCRIPT message
CREATE TABLE IF NOT EXISTS transcript_messages (
    transcript_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    position INTEGER NOT NULL,
    sender_id TEXT NOT NULL,
    sender_name TEXT,
    category TEXT NOT NULL,
    content TEXT,
    media_url TEXT,
    media_mime_type TEXT,
    media_size INTEGER,
    media_status TEXT,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (transcript_id, message_id)
);

-- Disappearing-message schedule, one row per expiring message
CREATE TABLE IF NOT EXISTS expired_messages (
    message_id TEXT PRIMARY KEY,
    -- 'READ' (countdown starts when read) | 'SEND' (fixed at insert)
    scheme TEXT NOT NULL,
    -- Seconds
    expire_in INTEGER NOT NULL,
    -- Unix seconds, NULL until the countdown starts
    expire_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_expired_messages_expire_at
    ON expired_messages(expire_at);

-- Full-text shadow of searchable messages, rowid = messages.seq
CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    content,
    name,
    tokenize = 'unicode61'
);
"#;

/// Migration from v1 to v2: full-text search index.
///
/// v1 stores never indexed anything, so the index starts uninitialized and
/// is backfilled by `initialize_search_index`.
pub const MIGRATE_V1_TO_V2: &str = r#"
CREATE TABLE IF NOT EXISTS properties (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    message_id UNINDEXED,
    conversation_id UNINDEXED,
    content,
    name,
    tokenize = 'unicode61'
);

DELETE FROM properties WHERE key = 'search_index_initialized';
UPDATE schema_version SET version = 2;
"#;

/// Migration from v2 to v3: explicit message sequence.
///
/// `messages` gains an INTEGER primary key seeded from the old rowids, so
/// tie-break order no longer depends on VACUUM. The search index is keyed
/// by that sequence and is rebuilt on the next open.
pub const MIGRATE_V2_TO_V3: &str = r#"
CREATE TABLE messages_v3 (
    seq INTEGER PRIMARY KEY,
    id TEXT NOT NULL UNIQUE,
    conversation_id TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    category TEXT NOT NULL,
    content TEXT,
    media_url TEXT,
    media_mime_type TEXT,
    media_size INTEGER,
    media_duration INTEGER,
    media_width INTEGER,
    media_height INTEGER,
    media_status TEXT,
    thumb_image TEXT,
    name TEXT,
    sticker_id TEXT,
    shared_user_id TEXT,
    status TEXT NOT NULL,
    quote_message_id TEXT,
    quote_content TEXT,
    created_at INTEGER NOT NULL
);

INSERT INTO messages_v3 (
    seq, id, conversation_id, sender_id, category, content,
    media_url, media_mime_type, media_size, media_duration, media_width,
    media_height, media_status, thumb_image, name, sticker_id,
    shared_user_id, status, quote_message_id, quote_content, created_at
)
SELECT
    rowid, id, conversation_id, sender_id, category, content,
    media_url, media_mime_type, media_size, media_duration, media_width,
    media_height, media_status, thumb_image, name, sticker_id,
    shared_user_id, status, quote_message_id, quote_content, created_at
FROM messages ORDER BY rowid;

DROP TABLE messages;
ALTER TABLE messages_v3 RENAME TO messages;

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages(conversation_id, created_at);
CREATE INDEX IF NOT EXISTS idx_messages_unseen
    ON messages(conversation_id, status, sender_id);
CREATE INDEX IF NOT EXISTS idx_messages_quote
    ON messages(conversation_id, quote_message_id);
CREATE INDEX IF NOT EXISTS idx_messages_category
    ON messages(conversation_id, category, created_at);

DROP TABLE IF EXISTS messages_fts;
CREATE VIRTUAL TABLE messages_fts USING fts5(
    content,
    name,
    tokenize = 'unicode61'
);

DELETE FROM properties WHERE key = 'search_index_initialized';
UPDATE schema_version SET version = 3;
"#;

/// Property key recording that `messages_fts` has been backfilled
pub const PROPERTY_SEARCH_INDEX_INITIALIZED: &str = "search_index_initialized";
