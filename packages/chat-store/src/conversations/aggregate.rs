//! Derived conversation fields.
//!
//! `last_message_id`, `unseen_message_count` and `unseen_mention_count` are
//! always recomputed from the underlying rows inside the same transaction
//! as the write that affected them. Nothing here adjusts a counter by a
//! delta, so a stale or corrupted value is repaired by the next write that
//! touches the conversation.

use rusqlite::{params, Connection};

use crate::error::Result;

/// Point `last_message_id` at the newest remaining message, by
/// `(created_at, seq)`. Recall tombstones count as messages.
pub(crate) fn refresh_last_message(conn: &Connection, conversation_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET
            last_message_id = (
                SELECT id FROM messages WHERE conversation_id = ?1
                ORDER BY created_at DESC, seq DESC LIMIT 1
            ),
            last_message_created_at = (
                SELECT MAX(created_at) FROM messages WHERE conversation_id = ?1
            )
         WHERE id = ?1",
        params![conversation_id],
    )?;
    Ok(())
}

/// Count inbound messages still at DELIVERED
pub(crate) fn refresh_unseen(
    conn: &Connection,
    conversation_id: &str,
    local_user_id: &str,
) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET unseen_message_count = (
            SELECT COUNT(*) FROM messages
            WHERE conversation_id = ?1 AND status = 'DELIVERED' AND sender_id != ?2
         )
         WHERE id = ?1",
        params![conversation_id, local_user_id],
    )?;
    Ok(())
}

/// Count mention rows not yet read
pub(crate) fn refresh_mentions(conn: &Connection, conversation_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE conversations SET unseen_mention_count = (
            SELECT COUNT(*) FROM message_mentions
            WHERE conversation_id = ?1 AND has_read = 0
         )
         WHERE id = ?1",
        params![conversation_id],
    )?;
    Ok(())
}

/// Recompute every derived field
pub(crate) fn refresh_all(
    conn: &Connection,
    conversation_id: &str,
    local_user_id: &str,
) -> Result<()> {
    refresh_last_message(conn, conversation_id)?;
    refresh_unseen(conn, conversation_id, local_user_id)?;
    refresh_mentions(conn, conversation_id)
}
