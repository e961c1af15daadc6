//! # Pins
//!
//! Pinned messages per conversation. A pin only exists while its message
//! exists and is not recalled; deletion and recall remove it in the same
//! transaction.

use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;

use crate::error::Result;
use crate::notifier::ConversationChange;
use crate::storage::{message_from_row, Category, Database, Message, PinnedMessage, MESSAGE_COLUMNS};

/// Pin / unpin and list pinned messages
#[derive(Debug, Clone)]
pub struct PinStore {
    db: Arc<Database>,
}

impl PinStore {
    /// Create a pin store over `db`
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Pin a message. Returns `false` if the message does not exist or is
    /// a recall tombstone. Re-pinning refreshes the pin time.
    pub fn pin(&self, message_id: &str) -> Result<bool> {
        self.db.write(|txn| {
            let pinned_at = txn.now_millis();
            let conn = txn.conn();
            let target: Option<(String, Category)> = conn
                .query_row(
                    "SELECT conversation_id, category FROM messages WHERE id = ?",
                    params![message_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let conversation_id = match target {
                Some((conversation_id, category)) if category != Category::Recalled => {
                    conversation_id
                }
                _ => return Ok(false),
            };

            conn.execute(
                "INSERT OR REPLACE INTO pinned_messages (message_id, conversation_id, pinned_at)
                 VALUES (?, ?, ?)",
                params![message_id, conversation_id, pinned_at],
            )?;

            txn.record(&conversation_id, ConversationChange::PinsChanged);
            Ok(true)
        })
    }

    /// Unpin a message
    pub fn unpin(&self, message_id: &str) -> Result<bool> {
        self.db.write(|txn| {
            let conversation_id: Option<String> = txn
                .conn()
                .query_row(
                    "SELECT conversation_id FROM pinned_messages WHERE message_id = ?",
                    params![message_id],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(conversation_id) = conversation_id else {
                return Ok(false);
            };
            remove_for_message(txn.conn(), message_id)?;
            txn.record(&conversation_id, ConversationChange::PinsChanged);
            Ok(true)
        })
    }

    /// Whether a message is pinned
    pub fn is_pinned(&self, message_id: &str) -> Result<bool> {
        self.db.read(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM pinned_messages WHERE message_id = ?",
                    params![message_id],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    /// Pins of a conversation, oldest pin first
    pub fn list(&self, conversation_id: &str) -> Result<Vec<PinnedMessage>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id, conversation_id, pinned_at FROM pinned_messages
                 WHERE conversation_id = ? ORDER BY pinned_at, rowid",
            )?;
            let pins = stmt
                .query_map(params![conversation_id], |row| {
                    Ok(PinnedMessage {
                        message_id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        pinned_at: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(pins)
        })
    }

    /// Pinned messages themselves, in pin order
    pub fn messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM pinned_messages p JOIN messages m ON m.id = p.message_id
                 WHERE p.conversation_id = ? ORDER BY p.pinned_at, p.rowid",
                MESSAGE_COLUMNS
            ))?;
            let messages = stmt
                .query_map(params![conversation_id], message_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(messages)
        })
    }
}

/// Drop the pin of one message; returns the number of rows removed
pub(crate) fn remove_for_message(conn: &Connection, message_id: &str) -> Result<usize> {
    Ok(conn.execute(
        "DELETE FROM pinned_messages WHERE message_id = ?",
        params![message_id],
    )?)
}
