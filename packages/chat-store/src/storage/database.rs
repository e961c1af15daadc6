//! # Database
//!
//! SQLite handle with a single writer slot and a pool of readers.
//!
//! ## Database Operations
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      DATABASE OPERATIONS                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐                                                   │
//! │  │  Stores         │  MessageStore, ConversationStore, ...             │
//! │  └────────┬────────┘                                                   │
//! │           │  read(|conn|) / write(|txn|)                                │
//! │           ▼                                                             │
//! │  ┌─────────────────┐                                                   │
//! │  │    Database     │  - writer slot with bounded wait                  │
//! │  │   (this file)   │  - one clock sample per transaction               │
//! │  │                 │  - changes published after COMMIT                 │
//! │  └────────┬────────┘                                                   │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  ┌─────────────────┐                                                   │
//! │  │    rusqlite     │  bundled SQLite + FTS5                            │
//! │  │   (file or      │  - WAL for files                                  │
//! │  │    memory)      │  - in-memory for tests                            │
//! │  └─────────────────┘                                                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A write closure must not call back into [`Database::write`] or
//! [`Database::read`]; it would wait on the slot it already holds and fail
//! as busy. Use [`WriteTxn::conn`] for reads inside a write.

use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::schema;
use super::StoreConfig;
use crate::error::{Error, Result};
use crate::notifier::{
    ChangeNotifier, ChangeSet, ConversationChange, IntegrityViolation, StoreEvent,
};
use crate::time::Clock;

/// The main database handle
pub struct Database {
    /// The only connection allowed to write
    writer: Mutex<Connection>,
    /// Read-only connections (empty for in-memory stores)
    readers: Vec<Mutex<Connection>>,
    /// Round-robin cursor into `readers`
    next_reader: AtomicUsize,
    notifier: ChangeNotifier,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.config.path)
            .field("readers", &self.readers.len())
            .finish()
    }
}

impl Database {
    /// Open or create a database
    ///
    /// With `config.path == None` the database lives in memory (useful for
    /// testing).
    pub fn open(config: StoreConfig, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        config.validate()?;

        let writer = match &config.path {
            Some(path) => {
                tracing::info!("Opening database at {}", path.display());
                Connection::open(path)
                    .map_err(|e| Error::Io(format!("Failed to open database: {}", e)))?
            }
            None => Connection::open_in_memory().map_err(|e| {
                Error::Database(format!("Failed to create in-memory database: {}", e))
            })?,
        };

        Self::configure_writer(&writer, &config)?;
        Self::init_schema(&writer)?;

        let readers = match &config.path {
            Some(path) => (0..config.reader_connections)
                .map(|_| Self::open_reader(path, &config).map(Mutex::new))
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        let notifier = ChangeNotifier::start(config.event_capacity)?;

        tracing::debug!(
            "Database ready ({} reader connection(s))",
            readers.len()
        );

        Ok(Arc::new(Self {
            writer: Mutex::new(writer),
            readers,
            next_reader: AtomicUsize::new(0),
            notifier,
            clock,
            config,
        }))
    }

    fn configure_writer(conn: &Connection, config: &StoreConfig) -> Result<()> {
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;

        if config.path.is_some() {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            if !mode.eq_ignore_ascii_case("wal") {
                tracing::warn!("WAL unavailable, journal mode is {}", mode);
            }
            conn.pragma_update(None, "synchronous", "NORMAL")?;
        }

        Ok(())
    }

    fn open_reader(path: &Path, config: &StoreConfig) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
                | OpenFlags::SQLITE_OPEN_URI,
        )
        .map_err(|e| Error::Io(format!("Failed to open reader connection: {}", e)))?;
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
        Ok(conn)
    }

    /// Initialize the database schema
    fn init_schema(conn: &Connection) -> Result<()> {
        // Check current schema version
        let version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .ok();

        let tx = conn.unchecked_transaction()?;
        match version {
            None => {
                // Fresh database, create all tables
                tx.execute_batch(schema::CREATE_TABLES)
                    .map_err(|e| Error::Database(format!("Failed to create tables: {}", e)))?;

                tx.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    params![schema::SCHEMA_VERSION],
                )
                .map_err(|e| Error::Database(format!("Failed to set schema version: {}", e)))?;

                tracing::info!("Database schema created (version {})", schema::SCHEMA_VERSION);
            }
            Some(v) if v < schema::SCHEMA_VERSION => {
                tracing::info!(
                    "Database schema version {} is older than current {}, running migrations",
                    v,
                    schema::SCHEMA_VERSION
                );

                if v < 2 {
                    tracing::info!("Running migration v1 → v2 (search index)");
                    tx.execute_batch(schema::MIGRATE_V1_TO_V2)
                        .map_err(|e| Error::Database(format!("Migration v1→v2 failed: {}", e)))?;
                }

                if v < 3 {
                    tracing::info!("Running migration v2 → v3 (message sequence)");
                    tx.execute_batch(schema::MIGRATE_V2_TO_V3)
                        .map_err(|e| Error::Database(format!("Migration v2→v3 failed: {}", e)))?;
                }
            }
            Some(v) if v > schema::SCHEMA_VERSION => {
                return Err(Error::SchemaTooNew {
                    found: v,
                    supported: schema::SCHEMA_VERSION,
                });
            }
            Some(_) => {}
        }
        tx.commit()?;

        Ok(())
    }

    // ========================================================================
    // TRANSACTIONS
    // ========================================================================

    fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.config.write_lock_timeout_ms)
    }

    /// Run `f` inside one immediate write transaction.
    ///
    /// Everything `f` writes commits together or not at all. Changes it
    /// records reach subscribers only after the commit, and after the writer
    /// slot has been released.
    pub fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut WriteTxn<'_>) -> Result<T>,
    {
        let mut conn = self
            .writer
            .try_lock_for(self.write_timeout())
            .ok_or_else(|| Error::Busy("timed out waiting for the writer slot".into()))?;

        // The transaction borrows the guard; it must be gone before the
        // guard is released.
        let (value, changes) = {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut txn = WriteTxn {
                tx,
                now_millis: self.clock.now_millis(),
                local_user_id: &self.config.local_user_id,
                changes: ChangeSet::default(),
            };

            match f(&mut txn) {
                Ok(value) => {
                    let WriteTxn { tx, changes, .. } = txn;
                    tx.commit()?;
                    (value, changes)
                }
                Err(e) => {
                    tracing::debug!("Write transaction rolled back: {}", e);
                    return Err(e);
                }
            }
        };
        drop(conn);

        self.notifier.publish(changes);
        Ok(value)
    }

    /// Run `f` against a consistent snapshot.
    ///
    /// File databases use the reader pool and never wait for the writer.
    /// In-memory databases have a single connection, so reads wait for the
    /// writer slot like writes do.
    pub fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        if self.readers.is_empty() {
            let conn = self
                .writer
                .try_lock_for(self.write_timeout())
                .ok_or_else(|| Error::Busy("timed out waiting for the connection".into()))?;
            return Self::snapshot(&conn, f);
        }

        let count = self.readers.len();
        let start = self.next_reader.fetch_add(1, Ordering::Relaxed);
        for offset in 0..count {
            if let Some(conn) = self.readers[(start + offset) % count].try_lock() {
                return Self::snapshot(&conn, f);
            }
        }

        let conn = self.readers[start % count]
            .try_lock_for(self.write_timeout())
            .ok_or_else(|| Error::Busy("all reader connections are in use".into()))?;
        Self::snapshot(&conn, f)
    }

    fn snapshot<T, F>(conn: &Connection, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let tx = conn.unchecked_transaction()?;
        let value = f(&tx)?;
        tx.finish()?;
        Ok(value)
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    /// The store's configuration
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// The store's clock
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The local user's id
    pub fn local_user_id(&self) -> &str {
        &self.config.local_user_id
    }

    /// Change notifier
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// Clamp a requested page size to the configured maximum
    pub(crate) fn page_size(&self, requested: usize) -> usize {
        requested.min(self.config.max_page_size)
    }

    // ── Properties ──────────────────────────────────────────────────────

    /// Read a store property
    pub fn property(&self, key: &str) -> Result<Option<String>> {
        self.read(|conn| get_property(conn, key))
    }
}

/// Read a property through any connection
pub(crate) fn get_property(conn: &Connection, key: &str) -> Result<Option<String>> {
    let result = conn.query_row(
        "SELECT value FROM properties WHERE key = ?",
        params![key],
        |row| row.get(0),
    );

    match result {
        Ok(value) => Ok(Some(value)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// ============================================================================
// WRITE TRANSACTION
// ============================================================================

/// An open write transaction.
///
/// Handed to [`Database::write`] closures. All operations on it share one
/// "now" and their recorded changes are published together after commit.
pub struct WriteTxn<'a> {
    tx: Transaction<'a>,
    now_millis: i64,
    local_user_id: &'a str,
    changes: ChangeSet,
}

impl<'a> WriteTxn<'a> {
    /// Connection bound to this transaction
    pub fn conn(&self) -> &Connection {
        &self.tx
    }

    /// Transaction time (Unix ms)
    pub fn now_millis(&self) -> i64 {
        self.now_millis
    }

    /// Transaction time (Unix seconds)
    pub fn now_secs(&self) -> i64 {
        self.now_millis.div_euclid(1000)
    }

    /// The local user's id
    pub fn local_user_id(&self) -> &'a str {
        self.local_user_id
    }

    /// Record a change to one conversation
    pub fn record(&mut self, conversation_id: &str, change: ConversationChange) {
        self.changes.push(StoreEvent::Conversation {
            conversation_id: conversation_id.to_string(),
            change,
        });
    }

    /// Record a store-wide event
    pub fn record_event(&mut self, event: StoreEvent) {
        self.changes.push(event);
    }

    /// Record a deleted message; all deletions of a transaction are
    /// reported together in one [`StoreEvent::MessagesRemoved`]
    pub fn record_removed(&mut self, message_id: impl Into<String>) {
        self.changes.push_removed(message_id.into());
    }

    /// Report a refused write. Logged now, published after commit.
    pub fn record_violation(&mut self, violation: IntegrityViolation) {
        tracing::warn!("Integrity violation refused: {:?}", violation);
        self.changes.push_violation(violation);
    }

    /// Run `hook` on the notifier thread once this transaction has committed.
    /// Dropped if it rolls back.
    pub fn after_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.changes.push_hook(Box::new(hook));
    }

    /// Write a store property
    pub fn set_property(&self, key: &str, value: &str) -> Result<()> {
        self.tx
            .execute(
                "INSERT OR REPLACE INTO properties (key, value, updated_at) VALUES (?, ?, ?)",
                params![key, value, self.now_millis],
            )
            .map_err(|e| Error::Database(format!("Failed to set property: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;

    fn memory_db() -> Arc<Database> {
        Database::open(
            StoreConfig::in_memory("me"),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        )
        .unwrap()
    }

    #[test]
    fn test_database_creation() {
        let db = memory_db();
        let version: i32 = db
            .read(|conn| {
                Ok(conn.query_row("SELECT version FROM schema_version", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(version, schema::SCHEMA_VERSION);
    }

    #[test]
    fn test_failed_closure_rolls_back() {
        let db = memory_db();

        let result: Result<()> = db.write(|txn| {
            txn.set_property("k", "v")?;
            Err(Error::InvalidMessage("abort".into()))
        });
        assert!(result.is_err());
        assert_eq!(db.property("k").unwrap(), None);

        db.write(|txn| txn.set_property("k", "v")).unwrap();
        assert_eq!(db.property("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_writer_slot_is_released_after_rollback() {
        let mut config = StoreConfig::in_memory("me");
        config.write_lock_timeout_ms = 20;
        let db = Database::open(config, Arc::new(ManualClock::new(0))).unwrap();

        for _ in 0..3 {
            let failed: Result<()> = db.write(|txn| {
                txn.set_property("k", "v")?;
                Err(Error::InvalidMessage("abort".into()))
            });
            assert!(matches!(failed, Err(Error::InvalidMessage(_))));
        }

        db.write(|txn| txn.set_property("k", "kept")).unwrap();
        assert_eq!(db.property("k").unwrap().as_deref(), Some("kept"));
    }

    #[test]
    fn test_nested_write_fails_as_busy() {
        let mut config = StoreConfig::in_memory("me");
        config.write_lock_timeout_ms = 20;
        let db = Database::open(config, Arc::new(ManualClock::new(0))).unwrap();

        let inner = db
            .write(|_| Ok(db.write(|_| Ok(()))))
            .unwrap();
        assert!(matches!(inner, Err(Error::Busy(_))));
    }

    #[test]
    fn test_transaction_time_is_sampled_once() {
        let clock = Arc::new(ManualClock::new(5_000));
        let db = Database::open(StoreConfig::in_memory("me"), clock.clone()).unwrap();

        let (before, after) = db
            .write(|txn| {
                let before = txn.now_millis();
                clock.set_millis(9_000);
                Ok((before, txn.now_millis()))
            })
            .unwrap();
        assert_eq!(before, 5_000);
        assert_eq!(after, 5_000);
        assert_eq!(txn_secs(&db), 9);
    }

    fn txn_secs(db: &Database) -> i64 {
        db.write(|txn| Ok(txn.now_secs())).unwrap()
    }

    #[tokio::test]
    async fn test_changes_published_only_on_commit() {
        let db = memory_db();
        let mut rx = db.notifier().subscribe();

        let _ = db.write(|txn| -> Result<()> {
            txn.record_event(StoreEvent::ExpireAtUpdated);
            Err(Error::InvalidMessage("abort".into()))
        });
        db.write(|txn| {
            txn.record("c1", ConversationChange::MetadataChanged);
            Ok(())
        })
        .unwrap();
        db.notifier().flushed().await;

        let batch = rx.try_recv().unwrap();
        assert_eq!(
            batch.events,
            vec![StoreEvent::Conversation {
                conversation_id: "c1".into(),
                change: ConversationChange::MetadataChanged,
            }]
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_file_database_reads_from_pool() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let db = Database::open(
            StoreConfig::at_path(&path, "me"),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();

        db.write(|txn| txn.set_property("k", "v")).unwrap();

        // Reads still work while the writer slot is held elsewhere
        let seen = db
            .write(|_| db.property("k"))
            .unwrap();
        assert_eq!(seen.as_deref(), Some("v"));
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let db = Database::open(
                StoreConfig::at_path(&path, "me"),
                Arc::new(ManualClock::new(0)),
            )
            .unwrap();
            db.write(|txn| txn.set_property("k", "v")).unwrap();
        }

        let db = Database::open(
            StoreConfig::at_path(&path, "me"),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();
        assert_eq!(db.property("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_migrates_v1_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v1.db");

        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(schema::CREATE_TABLES).unwrap();
            conn.execute_batch(
                "DROP TABLE messages_fts; DROP TABLE properties;
                 INSERT INTO schema_version (version) VALUES (1);",
            )
            .unwrap();
        }

        let db = Database::open(
            StoreConfig::at_path(&path, "me"),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();
        let (version, fts): (i32, i64) = db
            .read(|conn| {
                let version = conn.query_row("SELECT version FROM schema_version", [], |row| {
                    row.get(0)
                })?;
                let fts = conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE name = 'messages_fts'",
                    [],
                    |row| row.get(0),
                )?;
                Ok((version, fts))
            })
            .unwrap();
        assert_eq!(version, schema::SCHEMA_VERSION);
        assert_eq!(fts, 1);
    }

    #[test]
    fn test_migrates_v2_messages_to_explicit_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v2.db");

        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(schema::CREATE_TABLES).unwrap();
            conn.execute_batch(
                "DROP TABLE messages;
                 CREATE TABLE messages (
                    id TEXT PRIMARY KEY,
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
                 INSERT INTO messages (id, conversation_id, sender_id, category, content, status, created_at)
                 VALUES ('z', 'c1', 'bob', 'TEXT', 'first', 'READ', 10),
                        ('a', 'c1', 'bob', 'TEXT', 'second', 'READ', 10);
                 INSERT INTO properties (key, value, updated_at)
                 VALUES ('search_index_initialized', '1', 0);
                 INSERT INTO schema_version (version) VALUES (2);",
            )
            .unwrap();
        }

        let db = Database::open(
            StoreConfig::at_path(&path, "me"),
            Arc::new(ManualClock::new(0)),
        )
        .unwrap();
        let order: Vec<String> = db
            .read(|conn| {
                let mut stmt = conn.prepare("SELECT id FROM messages ORDER BY seq")?;
                let ids = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(ids)
            })
            .unwrap();
        assert_eq!(order, vec!["z", "a"]);
        assert_eq!(
            db.property(schema::PROPERTY_SEARCH_INDEX_INITIALIZED).unwrap(),
            None
        );

        let duplicate = db.write(|txn| {
            txn.conn().execute(
                "INSERT INTO messages (id, conversation_id, sender_id, category, status, created_at)
                 VALUES ('a', 'c1', 'bob', 'TEXT', 'READ', 11)",
                [],
            )?;
            Ok(())
        });
        assert!(duplicate.is_err());
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("future.db");

        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE schema_version (version INTEGER PRIMARY KEY);
                 INSERT INTO schema_version (version) VALUES (99);",
            )
            .unwrap();
        }

        let result = Database::open(
            StoreConfig::at_path(&path, "me"),
            Arc::new(ManualClock::new(0)),
        );
        assert!(matches!(
            result,
            Err(Error::SchemaTooNew { found: 99, .. })
        ));
    }
}
