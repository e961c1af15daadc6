//! Recall: turn a message into a tombstone in place.
//!
//! The row keeps its id, sender, timestamp and position; the category
//! becomes RECALLED and the columns its original category used are
//! cleared. Everything hanging off the message (mention row, pin, search
//! entry, transcript children) goes in the same transaction, and messages
//! quoting it get their snapshot replaced by the tombstone.

use rusqlite::{params, OptionalExtension};

use super::{load, search, MessageStore};
use crate::conversations::aggregate;
use crate::error::Result;
use crate::notifier::{ConversationChange, StoreEvent};
use crate::pins;
use crate::storage::{Category, MessageStatus, RecallScope, WriteTxn};
use crate::transcripts;

/// Result of a recall
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecallOutcome {
    /// The message is now a tombstone
    Recalled,
    /// It already was
    AlreadyRecalled,
    /// No such message
    NotFound,
}

pub(crate) fn recall_in(txn: &mut WriteTxn<'_>, message_id: &str) -> Result<RecallOutcome> {
    let local_user_id = txn.local_user_id();
    let conn = txn.conn();

    let target: Option<(String, Category, MessageStatus, Option<String>)> = conn
        .query_row(
            "SELECT conversation_id, category, status, media_url FROM messages WHERE id = ?",
            params![message_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;
    let Some((conversation_id, category, status, media_url)) = target else {
        return Ok(RecallOutcome::NotFound);
    };
    if category == Category::Recalled {
        return Ok(RecallOutcome::AlreadyRecalled);
    }

    // A message whose status is unknown may still hold undecoded text
    let scope = if status == MessageStatus::Unknown {
        RecallScope::ContentAndQuote
    } else {
        category.recall_scope()
    };
    let status_reset = if status == MessageStatus::Failed {
        ", status = 'DELIVERED'"
    } else {
        ""
    };
    conn.execute(
        &format!(
            "UPDATE messages SET category = 'RECALLED'{}{} WHERE id = ?",
            scope.clear_columns(),
            status_reset
        ),
        params![message_id],
    )?;

    conn.execute(
        "DELETE FROM message_mentions WHERE message_id = ?",
        params![message_id],
    )?;
    let unpinned = pins::remove_for_message(conn, message_id)?;
    search::remove(conn, message_id)?;
    let children = if category == Category::Transcript {
        transcripts::delete_children(conn, message_id)?
    } else {
        Vec::new()
    };

    aggregate::refresh_all(conn, &conversation_id, local_user_id)?;

    let quoting: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT id FROM messages WHERE conversation_id = ? AND quote_message_id = ?",
        )?;
        let ids = stmt
            .query_map(params![conversation_id, message_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        ids
    };
    if !quoting.is_empty() {
        if let Some(tombstone) = load(conn, message_id)? {
            let snapshot = serde_json::to_string(&tombstone.to_quote_snapshot())?;
            conn.execute(
                "UPDATE messages SET quote_content = ? WHERE conversation_id = ? AND quote_message_id = ?",
                params![snapshot, conversation_id, message_id],
            )?;
        }
    }

    tracing::debug!(
        "Recalled message {} ({} quoting message(s) refreshed)",
        message_id,
        quoting.len()
    );

    txn.record(
        &conversation_id,
        ConversationChange::Recalled {
            message_id: message_id.to_string(),
        },
    );
    for id in quoting {
        txn.record(&conversation_id, ConversationChange::Recalled { message_id: id });
    }
    if unpinned > 0 {
        txn.record(&conversation_id, ConversationChange::PinsChanged);
    }
    let media_urls: Vec<String> = media_url
        .filter(|_| scope == RecallScope::Media)
        .into_iter()
        .collect();
    if !media_urls.is_empty() || !children.is_empty() {
        txn.record_event(StoreEvent::AttachmentsReleased {
            conversation_id,
            media_urls,
            transcript_ids: if children.is_empty() {
                Vec::new()
            } else {
                vec![message_id.to_string()]
            },
        });
    }

    Ok(RecallOutcome::Recalled)
}

impl MessageStore {
    /// Recall a message (sender deleted it for everyone)
    pub fn recall(&self, message_id: &str) -> Result<RecallOutcome> {
        self.db.write(|txn| recall_in(txn, message_id))
    }
}
