//! # Messages
//!
//! The message store: insert, read, page, update, recall and delete.
//!
//! ## Insert Pipeline
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    INSERT (one write transaction)                       │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  NewMessage                                                             │
//! │      │                                                                  │
//! │      ├─ id already stored?            ──► Duplicate (nothing written)   │
//! │      ├─ conversation row              ──► placeholder if missing        │
//! │      ├─ expiry plan                   ──► own + already past ──► skip   │
//! │      ├─ quote snapshot                ──► frozen JSON copy              │
//! │      ├─ messages row                                                    │
//! │      ├─ mention row                   ──► inbound, mentions/quotes me   │
//! │      ├─ transcript children                                             │
//! │      ├─ search index                  ──► if built, not FAILED          │
//! │      ├─ expired_messages row                                            │
//! │      └─ last message / unseen / mentions recomputed                     │
//! │                                                                         │
//! │  COMMIT ──► MessageInserted (+ ExpireAtUpdated)                         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Deletion mirrors it: the message, its mention row, search entry,
//! transcript children, pin and expiry row are removed together and the
//! conversation's aggregates are recomputed before commit.

mod paging;
mod recall;
pub(crate) mod search;
mod status;

pub use paging::{Direction, MessageWindow};
pub use recall::RecallOutcome;
pub use status::{ReadReceipt, StatusUpdate};

pub(crate) use status::mark_read_in;

use rusqlite::{params, Connection, OptionalExtension, ToSql};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::conversations::{self, aggregate};
use crate::error::Result;
use crate::expiry::{self, ExpiryPlan};
use crate::notifier::{ConversationChange, StoreEvent};
use crate::pins;
use crate::storage::{
    message_from_row, Category, Database, ExpiryScheme, MediaStatus, Message, MessageBody,
    MessageMention, MessageSource, MessageStatus, NewMessage, WriteTxn, MESSAGE_COLUMNS,
};
use crate::transcripts;

/// Result of an insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Stored
    Inserted,
    /// A message with this id already exists; nothing changed
    Duplicate,
    /// Own disappearing message whose deadline already passed; not stored
    AlreadyExpired,
}

/// Attachment fields to overwrite; `None` leaves a field as it is
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaUpdate {
    /// Upstream attachment id
    pub attachment_id: Option<String>,
    /// Local file URL
    pub url: Option<String>,
    /// MIME type
    pub mime_type: Option<String>,
    /// Size in bytes
    pub size: Option<i64>,
    /// Duration in milliseconds
    pub duration: Option<i64>,
    /// Pixel width
    pub width: Option<i64>,
    /// Pixel height
    pub height: Option<i64>,
    /// Inline thumbnail
    pub thumbnail: Option<String>,
}

/// Message storage service
#[derive(Debug, Clone)]
pub struct MessageStore {
    db: Arc<Database>,
}

// ============================================================================
// SHARED ROW HELPERS
// ============================================================================

/// Load one message through any connection
pub(crate) fn load(conn: &Connection, message_id: &str) -> Result<Option<Message>> {
    Ok(conn
        .query_row(
            &format!("SELECT {} FROM messages m WHERE m.id = ?", MESSAGE_COLUMNS),
            params![message_id],
            message_from_row,
        )
        .optional()?)
}

pub(crate) fn exists(conn: &Connection, message_id: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM messages WHERE id = ?",
            params![message_id],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

/// Rebuild a text-like body from a category and new content
fn text_body(category: Category, content: String) -> Option<MessageBody> {
    match category {
        Category::Text => Some(MessageBody::Text(content)),
        Category::Post => Some(MessageBody::Post(content)),
        Category::Location => Some(MessageBody::Location(content)),
        Category::System => Some(MessageBody::System(content)),
        Category::Transcript => Some(MessageBody::Transcript(content)),
        _ => None,
    }
}

// ============================================================================
// INSERT
// ============================================================================

pub(crate) fn insert_in(
    txn: &mut WriteTxn<'_>,
    message: NewMessage,
    source: MessageSource,
) -> Result<InsertOutcome> {
    message.validate()?;

    let local_user_id = txn.local_user_id();
    let now_secs = txn.now_secs();
    let now_millis = txn.now_millis();
    let conn = txn.conn();

    if exists(conn, &message.id)? {
        tracing::debug!("Message {} already stored", message.id);
        return Ok(InsertOutcome::Duplicate);
    }

    let conversation_expire_in =
        conversations::ensure_exists(conn, &message.conversation_id, now_millis)?;
    let is_own = message.sender_id == local_user_id;
    let plan = expiry::plan(&message, conversation_expire_in, is_own, now_secs);

    if let Some(ExpiryPlan {
        scheme: ExpiryScheme::SendTriggered,
        expire_at: Some(expire_at),
        ..
    }) = plan
    {
        if is_own && expire_at <= now_secs {
            tracing::debug!("Own message {} expired before it was stored", message.id);
            return Ok(InsertOutcome::AlreadyExpired);
        }
    }

    let quoted = match &message.quote_message_id {
        Some(quote_id) => load(conn, quote_id)?.filter(|q| q.status != MessageStatus::Failed),
        None => None,
    };
    let quote_content = quoted
        .as_ref()
        .map(|q| serde_json::to_string(&q.to_quote_snapshot()))
        .transpose()?;

    let columns = message.body.columns();
    let media = columns.media;
    conn.execute(
        "INSERT INTO messages (
            id, conversation_id, sender_id, category, content,
            media_url, media_mime_type, media_size, media_duration, media_width,
            media_height, media_status, thumb_image, name, sticker_id,
            shared_user_id, status, quote_message_id, quote_content, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                   ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
        params![
            message.id,
            message.conversation_id,
            message.sender_id,
            message.body.category(),
            columns.content,
            media.and_then(|m| m.url.as_deref()),
            media.and_then(|m| m.mime_type.as_deref()),
            media.and_then(|m| m.size),
            media.and_then(|m| m.duration),
            media.and_then(|m| m.width),
            media.and_then(|m| m.height),
            media.and_then(|m| m.status),
            media.and_then(|m| m.thumbnail.as_deref()),
            media.and_then(|m| m.name.as_deref()),
            columns.sticker_id,
            columns.shared_user_id,
            message.status,
            message.quote_message_id,
            quote_content,
            message.created_at,
        ],
    )?;

    let mentions_me = message.mentions.iter().any(|user| user == local_user_id);
    let quotes_me = quoted
        .as_ref()
        .map_or(false, |q| q.sender_id == local_user_id);
    if !is_own && (mentions_me || quotes_me) {
        let mut mentioned = message.mentions.clone();
        if !mentions_me {
            mentioned.push(local_user_id.to_string());
        }
        conn.execute(
            "INSERT OR REPLACE INTO message_mentions (message_id, conversation_id, mentions, has_read)
             VALUES (?, ?, ?, ?)",
            params![
                message.id,
                message.conversation_id,
                serde_json::to_string(&mentioned)?,
                message.status == MessageStatus::Read,
            ],
        )?;
    }

    if !message.transcript_children.is_empty() {
        transcripts::insert_children(conn, &message.id, &message.transcript_children)?;
    }

    if message.status != MessageStatus::Failed && search::is_initialized(conn)? {
        search::index_message(conn, &message.id, &message.body)?;
    }

    if let Some(plan) = &plan {
        expiry::insert_schedule(conn, &message.id, plan)?;
    }

    aggregate::refresh_all(conn, &message.conversation_id, local_user_id)?;

    #[cfg(feature = "verbose-logging")]
    tracing::trace!(
        "Stored message {} in {} ({:?})",
        message.id,
        message.conversation_id,
        source
    );

    txn.record(
        &message.conversation_id,
        ConversationChange::MessageInserted {
            message_id: message.id,
            source,
        },
    );
    if plan.map_or(false, |p| p.expire_at.is_some()) {
        txn.record_event(StoreEvent::ExpireAtUpdated);
    }

    Ok(InsertOutcome::Inserted)
}

// ============================================================================
// DELETE
// ============================================================================

/// What a deletion left behind for the caller to report
#[derive(Debug, Clone)]
pub(crate) struct RemovedMessage {
    pub id: String,
    pub conversation_id: String,
    pub media_url: Option<String>,
    pub is_transcript: bool,
    pub was_pinned: bool,
}

/// Delete a message and every row that depends on it. The caller refreshes
/// aggregates (once per conversation) and records the removal.
pub(crate) fn delete_in(conn: &Connection, message_id: &str) -> Result<Option<RemovedMessage>> {
    let target: Option<(String, Category, Option<String>)> = conn
        .query_row(
            "SELECT conversation_id, category, media_url FROM messages WHERE id = ?",
            params![message_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((conversation_id, category, media_url)) = target else {
        return Ok(None);
    };

    search::remove(conn, message_id)?;
    conn.execute(
        "DELETE FROM message_mentions WHERE message_id = ?",
        params![message_id],
    )?;
    let is_transcript = category == Category::Transcript;
    if is_transcript {
        transcripts::delete_children(conn, message_id)?;
    }
    let was_pinned = pins::remove_for_message(conn, message_id)? > 0;
    expiry::remove(conn, message_id)?;
    conn.execute("DELETE FROM messages WHERE id = ?", params![message_id])?;

    Ok(Some(RemovedMessage {
        id: message_id.to_string(),
        conversation_id,
        media_url,
        is_transcript,
        was_pinned,
    }))
}

/// Record deletions: one `MessagesRemoved` for the transaction, pin
/// changes, and attachments that are now unreferenced.
pub(crate) fn record_removals(txn: &mut WriteTxn<'_>, removed: Vec<RemovedMessage>) {
    let mut released: BTreeMap<String, (Vec<String>, Vec<String>)> = BTreeMap::new();

    for message in removed {
        if message.was_pinned {
            txn.record(&message.conversation_id, ConversationChange::PinsChanged);
        }
        if message.media_url.is_some() || message.is_transcript {
            let (urls, transcripts) = released
                .entry(message.conversation_id.clone())
                .or_default();
            urls.extend(message.media_url);
            if message.is_transcript {
                transcripts.push(message.id.clone());
            }
        }
        txn.record_removed(message.id);
    }

    for (conversation_id, (media_urls, transcript_ids)) in released {
        txn.record_event(StoreEvent::AttachmentsReleased {
            conversation_id,
            media_urls,
            transcript_ids,
        });
    }
}

// ============================================================================
// MESSAGE STORE
// ============================================================================

impl MessageStore {
    /// Create a message store over `db`
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a message with all its side effects in one transaction.
    /// Re-inserting an existing id is a no-op.
    pub fn insert(&self, message: NewMessage, source: MessageSource) -> Result<InsertOutcome> {
        self.db.write(|txn| insert_in(txn, message, source))
    }

    /// Insert many messages in one transaction (history sync, backups).
    /// Any invalid message rolls back the whole batch.
    pub fn insert_batch(
        &self,
        messages: Vec<NewMessage>,
        source: MessageSource,
    ) -> Result<Vec<InsertOutcome>> {
        self.db.write(|txn| {
            messages
                .into_iter()
                .map(|message| insert_in(txn, message, source))
                .collect()
        })
    }

    /// Get a message by id
    pub fn get(&self, message_id: &str) -> Result<Option<Message>> {
        self.db.read(|conn| load(conn, message_id))
    }

    /// Whether a message exists
    pub fn exists(&self, message_id: &str) -> Result<bool> {
        self.db.read(|conn| exists(conn, message_id))
    }

    /// Delete a message and everything attached to it
    pub fn delete(&self, message_id: &str) -> Result<bool> {
        self.db.write(|txn| {
            let Some(removed) = delete_in(txn.conn(), message_id)? else {
                return Ok(false);
            };
            aggregate::refresh_all(txn.conn(), &removed.conversation_id, txn.local_user_id())?;
            record_removals(txn, vec![removed]);
            Ok(true)
        })
    }

    // ── Updates ─────────────────────────────────────────────────────────

    /// Overwrite attachment fields of a media message. Recalled and
    /// non-media messages are left alone.
    pub fn update_media(&self, message_id: &str, update: &MediaUpdate) -> Result<bool> {
        self.db.write(|txn| {
            let mut updates = Vec::new();
            let mut values: Vec<Box<dyn ToSql>> = Vec::new();

            if let Some(attachment_id) = &update.attachment_id {
                updates.push("content = ?");
                values.push(Box::new(attachment_id.clone()));
            }
            if let Some(url) = &update.url {
                updates.push("media_url = ?");
                values.push(Box::new(url.clone()));
            }
            if let Some(mime_type) = &update.mime_type {
                updates.push("media_mime_type = ?");
                values.push(Box::new(mime_type.clone()));
            }
            if let Some(size) = update.size {
                updates.push("media_size = ?");
                values.push(Box::new(size));
            }
            if let Some(duration) = update.duration {
                updates.push("media_duration = ?");
                values.push(Box::new(duration));
            }
            if let Some(width) = update.width {
                updates.push("media_width = ?");
                values.push(Box::new(width));
            }
            if let Some(height) = update.height {
                updates.push("media_height = ?");
                values.push(Box::new(height));
            }
            if let Some(thumbnail) = &update.thumbnail {
                updates.push("thumb_image = ?");
                values.push(Box::new(thumbnail.clone()));
            }

            if updates.is_empty() {
                return Ok(false);
            }

            let sql = format!(
                "UPDATE messages SET {} WHERE id = ?
                 AND category IN ('IMAGE', 'VIDEO', 'LIVE', 'AUDIO', 'DATA')",
                updates.join(", ")
            );
            values.push(Box::new(message_id.to_string()));
            let params: Vec<&dyn ToSql> = values.iter().map(|v| v.as_ref()).collect();

            let conn = txn.conn();
            if conn.execute(&sql, params.as_slice())? == 0 {
                return Ok(false);
            }
            let conversation_id: String = conn.query_row(
                "SELECT conversation_id FROM messages WHERE id = ?",
                params![message_id],
                |row| row.get(0),
            )?;
            txn.record(
                &conversation_id,
                ConversationChange::MessageUpdated {
                    message_id: message_id.to_string(),
                },
            );
            Ok(true)
        })
    }

    /// Set an attachment's transfer state. A finished transfer never goes
    /// back to PENDING or CANCELED.
    pub fn update_media_status(&self, message_id: &str, status: MediaStatus) -> Result<bool> {
        self.db.write(|txn| {
            let conn = txn.conn();
            let current: Option<(String, Category, Option<MediaStatus>)> = conn
                .query_row(
                    "SELECT conversation_id, category, media_status FROM messages WHERE id = ?",
                    params![message_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let Some((conversation_id, category, current)) = current else {
                return Ok(false);
            };
            if !category.is_media() {
                return Ok(false);
            }
            if let Some(current) = current {
                if current == status || !status.can_replace(current) {
                    return Ok(false);
                }
            }

            conn.execute(
                "UPDATE messages SET media_status = ? WHERE id = ?",
                params![status, message_id],
            )?;
            txn.record(
                &conversation_id,
                ConversationChange::MediaStatusChanged {
                    message_id: message_id.to_string(),
                    status,
                },
            );
            Ok(true)
        })
    }

    /// Replace the text of a text-like message (late decryption, edits).
    /// Existing quote snapshots of it are not touched.
    pub fn update_content(&self, message_id: &str, content: &str) -> Result<bool> {
        self.db.write(|txn| {
            let conn = txn.conn();
            let current: Option<(String, Category, MessageStatus)> = conn
                .query_row(
                    "SELECT conversation_id, category, status FROM messages WHERE id = ?",
                    params![message_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let Some((conversation_id, category, status)) = current else {
                return Ok(false);
            };
            let Some(body) = text_body(category, content.to_string()) else {
                return Ok(false);
            };

            conn.execute(
                "UPDATE messages SET content = ? WHERE id = ?",
                params![content, message_id],
            )?;
            if status != MessageStatus::Failed && search::is_initialized(conn)? {
                search::remove(conn, message_id)?;
                search::index_message(conn, message_id, &body)?;
            }

            txn.record(
                &conversation_id,
                ConversationChange::MessageUpdated {
                    message_id: message_id.to_string(),
                },
            );
            Ok(true)
        })
    }

    // ── Queries ─────────────────────────────────────────────────────────

    /// Messages in the conversation that quote `message_id`
    pub fn quoting_message_ids(&self, conversation_id: &str, message_id: &str) -> Result<Vec<String>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM messages WHERE conversation_id = ? AND quote_message_id = ?
                 ORDER BY created_at, seq",
            )?;
            let ids = stmt
                .query_map(params![conversation_id, message_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
    }

    /// FAILED messages of a conversation, oldest first
    pub fn failed_message_ids(&self, conversation_id: &str) -> Result<Vec<String>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM messages WHERE conversation_id = ? AND status = 'FAILED'
                 ORDER BY created_at, seq",
            )?;
            let ids = stmt
                .query_map(params![conversation_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
    }

    /// Inbound messages not yet read, oldest first
    pub fn unread_message_ids(&self, conversation_id: &str) -> Result<Vec<String>> {
        let local_user_id = self.db.local_user_id();
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM messages
                 WHERE conversation_id = ? AND status = 'DELIVERED' AND sender_id != ?
                 ORDER BY created_at, seq",
            )?;
            let ids = stmt
                .query_map(params![conversation_id, local_user_id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(ids)
        })
    }

    /// Oldest unread inbound message, where the chat view should open
    pub fn first_unread(&self, conversation_id: &str) -> Result<Option<Message>> {
        let local_user_id = self.db.local_user_id();
        self.db.read(|conn| {
            Ok(conn
                .query_row(
                    &format!(
                        "SELECT {} FROM messages m
                         WHERE m.conversation_id = ? AND m.status = 'DELIVERED' AND m.sender_id != ?
                         ORDER BY m.created_at, m.seq LIMIT 1",
                        MESSAGE_COLUMNS
                    ),
                    params![conversation_id, local_user_id],
                    message_from_row,
                )
                .optional()?)
        })
    }

    /// Local attachment files referenced by a conversation
    pub fn media_urls(&self, conversation_id: &str) -> Result<Vec<String>> {
        self.db.read(|conn| media_urls(conn, conversation_id))
    }

    /// Mention row of a message
    pub fn mention(&self, message_id: &str) -> Result<Option<MessageMention>> {
        self.db.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT message_id, conversation_id, mentions, has_read
                     FROM message_mentions WHERE message_id = ?",
                    params![message_id],
                    mention_from_row,
                )
                .optional()?)
        })
    }

    /// Unread mentions in a conversation, oldest message first
    pub fn unread_mentions(&self, conversation_id: &str) -> Result<Vec<MessageMention>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT mm.message_id, mm.conversation_id, mm.mentions, mm.has_read
                 FROM message_mentions mm JOIN messages m ON m.id = mm.message_id
                 WHERE mm.conversation_id = ? AND mm.has_read = 0
                 ORDER BY m.created_at, m.seq",
            )?;
            let mentions = stmt
                .query_map(params![conversation_id], mention_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(mentions)
        })
    }
}

fn mention_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageMention> {
    let mentions: String = row.get(2)?;
    Ok(MessageMention {
        message_id: row.get(0)?,
        conversation_id: row.get(1)?,
        mentions: serde_json::from_str(&mentions).unwrap_or_default(),
        has_read: row.get(3)?,
    })
}

pub(crate) fn media_urls(conn: &Connection, conversation_id: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT media_url FROM messages WHERE conversation_id = ? AND media_url IS NOT NULL",
    )?;
    let urls = stmt
        .query_map(params![conversation_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(urls)
}
