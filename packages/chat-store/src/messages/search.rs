//! Full-text search over message text.
//!
//! `messages_fts` shadows searchable messages (TEXT, POST, DATA file
//! names, TRANSCRIPT summaries). It is only written once the index has
//! been initialized; until then search returns nothing and the backfill
//! builds it in one transaction. FAILED messages are never indexed.
//!
//! An index row's rowid is the message's `seq`, so removing one entry is a
//! rowid lookup rather than a scan of the virtual table. The message row
//! must still exist when its entry is added or removed.

use rusqlite::{params, Connection};

use super::MessageStore;
use crate::error::Result;
use crate::storage::schema::PROPERTY_SEARCH_INDEX_INITIALIZED;
use crate::storage::{message_from_row, MessageBody, SearchHit, MESSAGE_COLUMNS};

pub(crate) fn is_initialized(conn: &Connection) -> Result<bool> {
    Ok(crate::storage::get_property(conn, PROPERTY_SEARCH_INDEX_INITIALIZED)?.is_some())
}

/// Add a message to the index if its body is searchable
pub(crate) fn index_message(
    conn: &Connection,
    message_id: &str,
    body: &MessageBody,
) -> Result<()> {
    let Some((content, name)) = body.search_fields() else {
        return Ok(());
    };
    conn.execute(
        "INSERT INTO messages_fts (rowid, content, name)
         SELECT seq, ?1, ?2 FROM messages WHERE id = ?3",
        params![content, name, message_id],
    )?;
    Ok(())
}

pub(crate) fn remove(conn: &Connection, message_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM messages_fts WHERE rowid = (SELECT seq FROM messages WHERE id = ?)",
        params![message_id],
    )?;
    Ok(())
}

pub(crate) fn remove_conversation(conn: &Connection, conversation_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM messages_fts WHERE rowid IN (
            SELECT seq FROM messages WHERE conversation_id = ?
         )",
        params![conversation_id],
    )?;
    Ok(())
}

/// Turn free text into an FTS5 query: every word must match as a prefix.
/// Quoting each word keeps operators typed by the user literal.
fn match_expression(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|word| format!("\"{}\"*", word.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

impl MessageStore {
    /// Whether the search index has been built
    pub fn search_index_initialized(&self) -> Result<bool> {
        self.db.read(is_initialized)
    }

    /// Build the search index from existing messages. Returns the number of
    /// indexed messages, or 0 if the index was already built.
    pub fn initialize_search_index(&self) -> Result<usize> {
        self.db.write(|txn| {
            let conn = txn.conn();
            if is_initialized(conn)? {
                return Ok(0);
            }

            conn.execute("DELETE FROM messages_fts", [])?;

            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM messages m
                 WHERE m.status != 'FAILED'
                   AND m.category IN ('TEXT', 'POST', 'DATA', 'TRANSCRIPT')",
                MESSAGE_COLUMNS
            ))?;
            let messages = stmt
                .query_map([], message_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            for message in &messages {
                index_message(conn, &message.id, &message.body)?;
            }

            txn.set_property(PROPERTY_SEARCH_INDEX_INITIALIZED, "1")?;
            tracing::info!("Search index built ({} messages)", messages.len());
            Ok(messages.len())
        })
    }

    /// Search message text, newest first. `conversation_id` narrows the
    /// search to one conversation.
    pub fn search(
        &self,
        query: &str,
        conversation_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        let Some(expression) = match_expression(query) else {
            return Ok(Vec::new());
        };
        let limit = self.db.page_size(limit) as i64;

        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT m.id, m.conversation_id, m.created_at
                 FROM messages_fts JOIN messages m ON m.seq = messages_fts.rowid
                 WHERE messages_fts MATCH ?1
                   AND (?2 IS NULL OR m.conversation_id = ?2)
                 ORDER BY m.created_at DESC, m.seq DESC
                 LIMIT ?3",
            )?;
            let hits = stmt
                .query_map(params![expression, conversation_id, limit], |row| {
                    Ok(SearchHit {
                        message_id: row.get(0)?,
                        conversation_id: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(hits)
        })
    }
}
