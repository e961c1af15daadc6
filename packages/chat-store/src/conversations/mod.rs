//! # Conversations
//!
//! Conversation rows, their metadata, and the chat-level bulk operations.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      CONVERSATION LIFECYCLE                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  first message ──► placeholder row (category NULL)                      │
//! │  create()      ──► category / name / owner / expire_in filled in        │
//! │                                                                         │
//! │  mark_read()   ──► inbound DELIVERED → READ, mentions read,             │
//! │                    last_read_message_id = last_message_id               │
//! │  exit_group()  ──► mark_read + status QUIT                              │
//! │  clear_chat()  ──► every message and dependent row gone, row kept       │
//! │  delete_chat() ──► clear_chat + row removed                             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The derived columns (`last_message_id`, `unseen_message_count`,
//! `unseen_mention_count`) are only ever written by [`aggregate`].

pub(crate) mod aggregate;

use rusqlite::{params, Connection, OptionalExtension, ToSql};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::messages::{mark_read_in, search, ReadReceipt};
use crate::notifier::{ConversationChange, StoreEvent};
use crate::storage::{
    conversation_from_row, Conversation, ConversationStatus, Database, NewConversation, WriteTxn,
    CONVERSATION_COLUMNS,
};

/// Conversation storage service
#[derive(Debug, Clone)]
pub struct ConversationStore {
    db: Arc<Database>,
}

/// Make sure a conversation row exists before a message lands in it.
/// Returns the conversation's disappearing-message duration.
pub(crate) fn ensure_exists(conn: &Connection, conversation_id: &str, now_millis: i64) -> Result<i64> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO conversations (id, status, created_at) VALUES (?, ?, ?)",
        params![conversation_id, ConversationStatus::Start, now_millis],
    )?;
    if inserted > 0 {
        tracing::debug!("Created placeholder conversation {}", conversation_id);
    }
    Ok(conn.query_row(
        "SELECT expire_in FROM conversations WHERE id = ?",
        params![conversation_id],
        |row| row.get(0),
    )?)
}

fn load(conn: &Connection, conversation_id: &str) -> Result<Option<Conversation>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM conversations WHERE id = ?", CONVERSATION_COLUMNS),
            params![conversation_id],
            conversation_from_row,
        )
        .optional()?)
}

/// What a chat clear removed
struct ClearedChat {
    messages: usize,
    media_urls: Vec<String>,
    transcript_ids: Vec<String>,
}

/// Delete every message of a conversation and all rows hanging off them
fn clear_in(conn: &Connection, conversation_id: &str) -> Result<ClearedChat> {
    let media_urls = crate::messages::media_urls(conn, conversation_id)?;
    let transcript_ids: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM messages WHERE conversation_id = ? AND category = 'TRANSCRIPT'",
        )?;
        let ids = stmt
            .query_map(params![conversation_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        ids
    };

    search::remove_conversation(conn, conversation_id)?;
    conn.execute(
        "DELETE FROM message_mentions WHERE conversation_id = ?",
        params![conversation_id],
    )?;
    conn.execute(
        "DELETE FROM transcript_messages WHERE transcript_id IN (
            SELECT id FROM messages WHERE conversation_id = ? AND category = 'TRANSCRIPT'
         )",
        params![conversation_id],
    )?;
    conn.execute(
        "DELETE FROM pinned_messages WHERE conversation_id = ?",
        params![conversation_id],
    )?;
    conn.execute(
        "DELETE FROM expired_messages WHERE message_id IN (
            SELECT id FROM messages WHERE conversation_id = ?
         )",
        params![conversation_id],
    )?;
    let messages = conn.execute(
        "DELETE FROM messages WHERE conversation_id = ?",
        params![conversation_id],
    )?;

    Ok(ClearedChat {
        messages,
        media_urls,
        transcript_ids,
    })
}

fn release_attachments(txn: &mut WriteTxn<'_>, conversation_id: &str, cleared: ClearedChat) {
    if cleared.media_urls.is_empty() && cleared.transcript_ids.is_empty() {
        return;
    }
    txn.record_event(StoreEvent::AttachmentsReleased {
        conversation_id: conversation_id.to_string(),
        media_urls: cleared.media_urls,
        transcript_ids: cleared.transcript_ids,
    });
}

impl ConversationStore {
    /// Create a conversation store over `db`
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Create a conversation, or fill in a placeholder created by an
    /// earlier message. Derived fields are kept, and so is an existing
    /// disappearing-message duration unless a new non-zero one is given.
    pub fn create(&self, conversation: NewConversation) -> Result<Conversation> {
        self.db.write(|txn| {
            let now = txn.now_millis();
            let local_user_id = txn.local_user_id();
            let conn = txn.conn();

            conn.execute(
                "INSERT INTO conversations (id, category, name, owner_id, expire_in, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(id) DO UPDATE SET
                    category = excluded.category,
                    name = COALESCE(excluded.name, name),
                    owner_id = COALESCE(excluded.owner_id, owner_id),
                    expire_in = COALESCE(NULLIF(excluded.expire_in, 0), expire_in)",
                params![
                    conversation.id,
                    conversation.category,
                    conversation.name,
                    conversation.owner_id,
                    conversation.expire_in.max(0),
                    ConversationStatus::Start,
                    now,
                ],
            )?;
            aggregate::refresh_all(conn, &conversation.id, local_user_id)?;

            let stored = load(conn, &conversation.id)?.ok_or_else(|| {
                Error::Internal(format!("conversation {} vanished", conversation.id))
            })?;
            txn.record(&conversation.id, ConversationChange::MetadataChanged);
            Ok(stored)
        })
    }

    /// Get a conversation
    pub fn get(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        self.db.read(|conn| load(conn, conversation_id))
    }

    /// Classified conversations, pinned first (latest pin first), then by
    /// most recent activity
    pub fn list(&self, limit: usize) -> Result<Vec<Conversation>> {
        let limit = self.db.page_size(limit) as i64;
        self.db.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM conversations
                 WHERE category IS NOT NULL
                 ORDER BY pin_time IS NULL, pin_time DESC,
                          COALESCE(last_message_created_at, created_at) DESC, id
                 LIMIT ?",
                CONVERSATION_COLUMNS
            ))?;
            let conversations = stmt
                .query_map(params![limit], conversation_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(conversations)
        })
    }

    // ── Metadata ────────────────────────────────────────────────────────

    fn set_column(&self, conversation_id: &str, column: &str, value: &dyn ToSql) -> Result<bool> {
        self.db.write(|txn| {
            let sql = format!("UPDATE conversations SET {} = ? WHERE id = ?", column);
            let updated = txn.conn().execute(&sql, params![value, conversation_id])?;
            if updated == 0 {
                return Ok(false);
            }
            txn.record(conversation_id, ConversationChange::MetadataChanged);
            Ok(true)
        })
    }

    /// Disappearing-message duration for new messages, in seconds (0 = off).
    /// Existing messages keep their schedule.
    pub fn set_expire_in(&self, conversation_id: &str, seconds: i64) -> Result<bool> {
        self.set_column(conversation_id, "expire_in", &seconds.max(0))
    }

    /// Mute until a Unix time in seconds, or unmute with `None`
    pub fn set_mute_until(&self, conversation_id: &str, until: Option<i64>) -> Result<bool> {
        self.set_column(conversation_id, "mute_until", &until)
    }

    /// Pin the conversation in the list at `pin_time` (ms), or unpin
    pub fn set_pin_time(&self, conversation_id: &str, pin_time: Option<i64>) -> Result<bool> {
        self.set_column(conversation_id, "pin_time", &pin_time)
    }

    /// Display name
    pub fn set_name(&self, conversation_id: &str, name: Option<&str>) -> Result<bool> {
        self.set_column(conversation_id, "name", &name)
    }

    /// Membership state
    pub fn set_status(&self, conversation_id: &str, status: ConversationStatus) -> Result<bool> {
        self.set_column(conversation_id, "status", &status)
    }

    // ── Reading ─────────────────────────────────────────────────────────

    /// Mark every unread inbound message and mention in the conversation
    /// read, then move `last_read_message_id` to the newest message.
    pub fn mark_read(&self, conversation_id: &str) -> Result<ReadReceipt> {
        self.db.write(|txn| mark_conversation_read(txn, conversation_id))
    }

    /// Leave a group: everything is marked read and the status becomes QUIT
    pub fn exit_group(&self, conversation_id: &str) -> Result<bool> {
        self.db.write(|txn| {
            if load(txn.conn(), conversation_id)?.is_none() {
                return Ok(false);
            }
            mark_conversation_read(txn, conversation_id)?;
            txn.conn().execute(
                "UPDATE conversations SET status = ? WHERE id = ?",
                params![ConversationStatus::Quit, conversation_id],
            )?;
            txn.record(conversation_id, ConversationChange::MetadataChanged);
            tracing::info!("Exited conversation {}", conversation_id);
            Ok(true)
        })
    }

    /// Sum of unseen messages over classified conversations
    pub fn total_unseen(&self) -> Result<i64> {
        self.db.read(|conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(SUM(unseen_message_count), 0) FROM conversations
                 WHERE category IS NOT NULL",
                [],
                |row| row.get(0),
            )?)
        })
    }

    // ── Bulk removal ────────────────────────────────────────────────────

    /// Remove every message of the conversation, keeping the conversation.
    /// Returns the number of deleted messages.
    pub fn clear_chat(&self, conversation_id: &str) -> Result<usize> {
        self.db.write(|txn| {
            let local_user_id = txn.local_user_id();
            let conn = txn.conn();
            if load(conn, conversation_id)?.is_none() {
                return Ok(0);
            }

            let cleared = clear_in(conn, conversation_id)?;
            conn.execute(
                "UPDATE conversations SET last_read_message_id = NULL WHERE id = ?",
                params![conversation_id],
            )?;
            aggregate::refresh_all(conn, conversation_id, local_user_id)?;

            let count = cleared.messages;
            tracing::info!("Cleared {} message(s) from {}", count, conversation_id);
            txn.record(conversation_id, ConversationChange::Cleared);
            release_attachments(txn, conversation_id, cleared);
            Ok(count)
        })
    }

    /// Remove the conversation and everything in it
    pub fn delete_chat(&self, conversation_id: &str) -> Result<bool> {
        self.db.write(|txn| {
            let conn = txn.conn();
            let cleared = clear_in(conn, conversation_id)?;
            let deleted = conn.execute(
                "DELETE FROM conversations WHERE id = ?",
                params![conversation_id],
            )?;
            if deleted == 0 {
                return Ok(false);
            }

            tracing::info!(
                "Deleted conversation {} ({} message(s))",
                conversation_id,
                cleared.messages
            );
            release_attachments(txn, conversation_id, cleared);
            txn.record_event(StoreEvent::ConversationDeleted {
                conversation_id: conversation_id.to_string(),
            });
            Ok(true)
        })
    }

    /// Recompute the derived fields from the message rows
    pub fn refresh(&self, conversation_id: &str) -> Result<bool> {
        self.db.write(|txn| {
            let local_user_id = txn.local_user_id();
            if load(txn.conn(), conversation_id)?.is_none() {
                return Ok(false);
            }
            aggregate::refresh_all(txn.conn(), conversation_id, local_user_id)?;
            txn.record(conversation_id, ConversationChange::MetadataChanged);
            Ok(true)
        })
    }
}

fn mark_conversation_read(txn: &mut WriteTxn<'_>, conversation_id: &str) -> Result<ReadReceipt> {
    let local_user_id = txn.local_user_id();
    let conn = txn.conn();

    let message_ids: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM messages
             WHERE conversation_id = ? AND status = 'DELIVERED' AND sender_id != ?",
        )?;
        let ids = stmt
            .query_map(params![conversation_id, local_user_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        ids
    };
    let mention_ids: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT message_id FROM message_mentions WHERE conversation_id = ? AND has_read = 0",
        )?;
        let ids = stmt
            .query_map(params![conversation_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        ids
    };

    let receipt = mark_read_in(txn, &message_ids, &mention_ids)?;
    txn.conn().execute(
        "UPDATE conversations SET last_read_message_id = last_message_id WHERE id = ?",
        params![conversation_id],
    )?;
    Ok(receipt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageStore;
    use crate::notifier::ChangeBatch;
    use crate::storage::{
        ConversationCategory, MediaAttachment, MessageBody, MessageSource, MessageStatus,
        NewMessage, StoreConfig, TranscriptChild,
    };
    use crate::time::ManualClock;
    use crate::{ExpiryScheduler, PinStore, TranscriptStore};

    fn setup() -> (Arc<Database>, ConversationStore, MessageStore) {
        let db = Database::open(
            StoreConfig::in_memory("me"),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        )
        .unwrap();
        (
            db.clone(),
            ConversationStore::new(db.clone()),
            MessageStore::new(db),
        )
    }

    fn inbound(id: &str, conversation: &str, created_at: i64) -> NewMessage {
        NewMessage::new(id, conversation, "bob", MessageBody::Text(id.into()), created_at)
            .with_status(MessageStatus::Delivered)
    }

    async fn events(db: &Database, rx: &mut tokio::sync::broadcast::Receiver<ChangeBatch>) -> Vec<StoreEvent> {
        db.notifier().flushed().await;
        let mut events = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            events.extend(batch.events);
        }
        events
    }

    #[test]
    fn test_create_fills_placeholder() {
        let (_db, conversations, messages) = setup();
        messages.insert(inbound("m1", "c1", 10), MessageSource::Remote).unwrap();

        let placeholder = conversations.get("c1").unwrap().unwrap();
        assert_eq!(placeholder.category, ConversationCategory::Unclassified);
        assert_eq!(placeholder.unseen_message_count, 1);
        assert_eq!(conversations.total_unseen().unwrap(), 0);
        assert!(conversations.list(10).unwrap().is_empty());

        let mut group = NewConversation::new("c1", ConversationCategory::Group);
        group.name = Some("Team".into());
        let created = conversations.create(group).unwrap();
        assert_eq!(created.category, ConversationCategory::Group);
        assert_eq!(created.name.as_deref(), Some("Team"));
        assert_eq!(created.last_message_id.as_deref(), Some("m1"));
        assert_eq!(created.unseen_message_count, 1);
        assert_eq!(conversations.total_unseen().unwrap(), 1);
    }

    #[test]
    fn test_create_again_keeps_expiry() {
        let (db, conversations, messages) = setup();
        conversations
            .create(NewConversation::new("c1", ConversationCategory::Direct))
            .unwrap();
        conversations.set_expire_in("c1", 30).unwrap();

        let again = conversations
            .create(NewConversation::new("c1", ConversationCategory::Direct))
            .unwrap();
        assert_eq!(again.expire_in, 30);

        // Later messages are still scheduled from the kept duration
        messages.insert(inbound("m1", "c1", 1_700_000_000_000), MessageSource::Remote).unwrap();
        let schedule = ExpiryScheduler::new(db)
            .schedule_for("m1")
            .unwrap()
            .unwrap();
        assert_eq!(schedule.expire_at, Some(1_700_000_000 + 30));

        let mut shorter = NewConversation::new("c1", ConversationCategory::Direct);
        shorter.expire_in = 5;
        assert_eq!(conversations.create(shorter).unwrap().expire_in, 5);
    }

    #[test]
    fn test_list_orders_pinned_then_recent() {
        let (_db, conversations, messages) = setup();
        for id in ["a", "b", "c"] {
            conversations
                .create(NewConversation::new(id, ConversationCategory::Direct))
                .unwrap();
        }
        messages.insert(inbound("m1", "a", 10), MessageSource::Remote).unwrap();
        messages.insert(inbound("m2", "b", 20), MessageSource::Remote).unwrap();
        messages.insert(inbound("m3", "c", 30), MessageSource::Remote).unwrap();
        conversations.set_pin_time("a", Some(5)).unwrap();

        let order: Vec<_> = conversations
            .list(10)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(order, vec!["a", "c", "b"]);
        assert!(!conversations.set_pin_time("missing", Some(1)).unwrap());
    }

    #[test]
    fn test_mark_read_clears_counts_and_sets_last_read() {
        let (_db, conversations, messages) = setup();
        messages.insert(inbound("m1", "c1", 10), MessageSource::Remote).unwrap();
        messages
            .insert(inbound("m2", "c1", 20).mentioning(["me"]), MessageSource::Remote)
            .unwrap();
        messages
            .insert(
                NewMessage::new("m3", "c1", "me", MessageBody::Text("mine".into()), 30)
                    .with_status(MessageStatus::Delivered),
                MessageSource::LocalSend,
            )
            .unwrap();

        let receipt = conversations.mark_read("c1").unwrap();
        assert_eq!(receipt, ReadReceipt { messages: 2, mentions: 1 });

        let conversation = conversations.get("c1").unwrap().unwrap();
        assert_eq!(conversation.unseen_message_count, 0);
        assert_eq!(conversation.unseen_mention_count, 0);
        assert_eq!(conversation.last_read_message_id.as_deref(), Some("m3"));
        assert_eq!(
            messages.get("m3").unwrap().unwrap().status,
            MessageStatus::Delivered
        );
    }

    #[test]
    fn test_exit_group() {
        let (_db, conversations, messages) = setup();
        conversations
            .create(NewConversation::new("g1", ConversationCategory::Group))
            .unwrap();
        messages.insert(inbound("m1", "g1", 10), MessageSource::Remote).unwrap();

        assert!(conversations.exit_group("g1").unwrap());
        let group = conversations.get("g1").unwrap().unwrap();
        assert_eq!(group.status, ConversationStatus::Quit);
        assert_eq!(group.unseen_message_count, 0);
        assert!(!conversations.exit_group("missing").unwrap());
    }

    #[test]
    fn test_send_triggered_schedule_uses_conversation_duration() {
        let (db, conversations, messages) = setup();
        conversations
            .create(NewConversation::new("c1", ConversationCategory::Direct))
            .unwrap();
        conversations.set_expire_in("c1", 10).unwrap();

        messages.insert(inbound("m1", "c1", 1_700_000_000_000), MessageSource::Remote).unwrap();

        let schedule = ExpiryScheduler::new(db).schedule_for("m1").unwrap().unwrap();
        assert_eq!(schedule.expire_in, 10);
        assert_eq!(schedule.expire_at, Some(1_700_000_010));
    }

    #[tokio::test]
    async fn test_clear_chat_removes_dependents() {
        let (db, conversations, messages) = setup();
        conversations
            .create(NewConversation::new("c1", ConversationCategory::Group))
            .unwrap();
        messages.initialize_search_index().unwrap();
        messages
            .insert(inbound("m1", "c1", 10).mentioning(["me"]), MessageSource::Remote)
            .unwrap();
        messages
            .insert(
                NewMessage::new(
                    "i1",
                    "c1",
                    "bob",
                    MessageBody::Image(MediaAttachment {
                        url: Some("file:///i1.jpg".into()),
                        ..Default::default()
                    }),
                    20,
                ),
                MessageSource::Remote,
            )
            .unwrap();
        messages
            .insert(
                NewMessage::new("t1", "c1", "bob", MessageBody::Transcript("fwd".into()), 30)
                    .with_transcript_children(vec![TranscriptChild::text("x1", "carol", "hi", 1)]),
                MessageSource::Remote,
            )
            .unwrap();
        messages
            .insert(inbound("m2", "c1", 40).expiring_in(60), MessageSource::Remote)
            .unwrap();
        PinStore::new(db.clone()).pin("m1").unwrap();
        db.notifier().flushed().await;
        let mut rx = db.notifier().subscribe();

        assert_eq!(conversations.clear_chat("c1").unwrap(), 4);

        let conversation = conversations.get("c1").unwrap().unwrap();
        assert!(conversation.last_message_id.is_none());
        assert_eq!(conversation.unseen_message_count, 0);
        assert_eq!(conversation.unseen_mention_count, 0);
        assert!(messages.search("m1", None, 10).unwrap().is_empty());
        assert!(PinStore::new(db.clone()).list("c1").unwrap().is_empty());
        assert!(TranscriptStore::new(db.clone()).children("t1").unwrap().is_empty());
        assert!(ExpiryScheduler::new(db.clone()).schedule_for("m2").unwrap().is_none());

        let events = events(&db, &mut rx).await;
        assert!(events.contains(&StoreEvent::Conversation {
            conversation_id: "c1".into(),
            change: ConversationChange::Cleared,
        }));
        assert!(events.contains(&StoreEvent::AttachmentsReleased {
            conversation_id: "c1".into(),
            media_urls: vec!["file:///i1.jpg".into()],
            transcript_ids: vec!["t1".into()],
        }));
    }

    #[tokio::test]
    async fn test_delete_chat() {
        let (db, conversations, messages) = setup();
        messages.insert(inbound("m1", "c1", 10), MessageSource::Remote).unwrap();
        db.notifier().flushed().await;
        let mut rx = db.notifier().subscribe();

        assert!(conversations.delete_chat("c1").unwrap());
        assert!(conversations.get("c1").unwrap().is_none());
        assert!(messages.get("m1").unwrap().is_none());
        assert!(!conversations.delete_chat("c1").unwrap());

        let events = events(&db, &mut rx).await;
        assert_eq!(
            events,
            vec![StoreEvent::ConversationDeleted {
                conversation_id: "c1".into()
            }]
        );
    }

    #[test]
    fn test_refresh_repairs_counters() {
        let (db, conversations, messages) = setup();
        messages.insert(inbound("m1", "c1", 10), MessageSource::Remote).unwrap();
        db.write(|txn| {
            txn.conn().execute(
                "UPDATE conversations SET unseen_message_count = 99, last_message_id = 'gone'
                 WHERE id = 'c1'",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        assert!(conversations.refresh("c1").unwrap());
        let conversation = conversations.get("c1").unwrap().unwrap();
        assert_eq!(conversation.unseen_message_count, 1);
        assert_eq!(conversation.last_message_id.as_deref(), Some("m1"));
    }
}
