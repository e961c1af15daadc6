//! Status transitions and read receipts.

use rusqlite::{params, params_from_iter, OptionalExtension};
use std::collections::BTreeMap;

use super::{search, MessageStore};
use crate::conversations::aggregate;
use crate::error::Result;
use crate::expiry;
use crate::notifier::{ConversationChange, IntegrityViolation, StoreEvent};
use crate::storage::{
    placeholders, MessageStatus, StatusTransition, WriteTxn, MAX_BOUND_IDS,
};

/// Result of a single status update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    /// Written
    Applied,
    /// Not a forward move; nothing written
    Ignored,
    /// Message is FAILED; refused and reported
    Rejected,
    /// No such message
    NotFound,
}

/// Counts from a batched read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadReceipt {
    /// Messages moved to READ
    pub messages: usize,
    /// Mention rows marked read
    pub mentions: usize,
}

pub(crate) fn update_status_in(
    txn: &mut WriteTxn<'_>,
    message_id: &str,
    status: MessageStatus,
) -> Result<StatusUpdate> {
    let local_user_id = txn.local_user_id();
    let now_secs = txn.now_secs();
    let conn = txn.conn();

    let current: Option<(String, String, MessageStatus)> = conn
        .query_row(
            "SELECT conversation_id, sender_id, status FROM messages WHERE id = ?",
            params![message_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((conversation_id, sender_id, current)) = current else {
        return Ok(StatusUpdate::NotFound);
    };

    match current.transition_to(status) {
        StatusTransition::Reject => {
            txn.record_violation(IntegrityViolation::StatusOnFailedMessage {
                message_id: message_id.to_string(),
                attempted: status,
            });
            Ok(StatusUpdate::Rejected)
        }
        StatusTransition::Ignore => Ok(StatusUpdate::Ignored),
        StatusTransition::Apply => {
            conn.execute(
                "UPDATE messages SET status = ? WHERE id = ?",
                params![status, message_id],
            )?;
            if status == MessageStatus::Failed {
                search::remove(conn, message_id)?;
            }

            let started = if expiry::countdown_started(status, sender_id == local_user_id) {
                expiry::start_countdown(conn, &[message_id.to_string()], now_secs)?
            } else {
                0
            };
            aggregate::refresh_unseen(conn, &conversation_id, local_user_id)?;

            txn.record(
                &conversation_id,
                ConversationChange::StatusChanged {
                    message_ids: vec![message_id.to_string()],
                    status,
                },
            );
            if started > 0 {
                txn.record_event(StoreEvent::ExpireAtUpdated);
            }
            Ok(StatusUpdate::Applied)
        }
    }
}

/// Move messages to READ and mark mention rows read, recomputing each
/// affected conversation once. One change per conversation per kind.
pub(crate) fn mark_read_in(
    txn: &mut WriteTxn<'_>,
    message_ids: &[String],
    mention_ids: &[String],
) -> Result<ReadReceipt> {
    let local_user_id = txn.local_user_id();
    let now_secs = txn.now_secs();
    let conn = txn.conn();

    let mut read_by_conversation: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut refused = Vec::new();

    for chunk in message_ids.chunks(MAX_BOUND_IDS) {
        let mut stmt = conn.prepare(&format!(
            "SELECT id, conversation_id, status FROM messages WHERE id IN ({}) AND status != 'READ'",
            placeholders(chunk.len())
        ))?;
        let rows = stmt
            .query_map(params_from_iter(chunk.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, MessageStatus>(2)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        for (id, conversation_id, status) in rows {
            match status.transition_to(MessageStatus::Read) {
                StatusTransition::Apply => {
                    read_by_conversation.entry(conversation_id).or_default().push(id)
                }
                StatusTransition::Reject => refused.push(id),
                StatusTransition::Ignore => {}
            }
        }
    }

    let mut read_total = 0;
    let mut started = 0;
    for ids in read_by_conversation.values() {
        for chunk in ids.chunks(MAX_BOUND_IDS) {
            read_total += conn.execute(
                &format!(
                    "UPDATE messages SET status = 'READ' WHERE id IN ({})",
                    placeholders(chunk.len())
                ),
                params_from_iter(chunk.iter()),
            )?;
        }
        // READ starts the countdown for inbound and outbound messages alike
        started += expiry::start_countdown(conn, ids, now_secs)?;
    }
    for conversation_id in read_by_conversation.keys() {
        aggregate::refresh_unseen(conn, conversation_id, local_user_id)?;
    }

    let mut mentions_by_conversation: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for chunk in mention_ids.chunks(MAX_BOUND_IDS) {
        let mut stmt = conn.prepare(&format!(
            "SELECT message_id, conversation_id FROM message_mentions
             WHERE message_id IN ({}) AND has_read = 0",
            placeholders(chunk.len())
        ))?;
        let rows = stmt
            .query_map(params_from_iter(chunk.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (id, conversation_id) in rows {
            mentions_by_conversation.entry(conversation_id).or_default().push(id);
        }
    }

    let mut mentions_total = 0;
    for (conversation_id, ids) in &mentions_by_conversation {
        for chunk in ids.chunks(MAX_BOUND_IDS) {
            mentions_total += conn.execute(
                &format!(
                    "UPDATE message_mentions SET has_read = 1 WHERE message_id IN ({})",
                    placeholders(chunk.len())
                ),
                params_from_iter(chunk.iter()),
            )?;
        }
        aggregate::refresh_mentions(conn, conversation_id)?;
    }

    for id in refused {
        txn.record_violation(IntegrityViolation::StatusOnFailedMessage {
            message_id: id,
            attempted: MessageStatus::Read,
        });
    }
    for (conversation_id, message_ids) in read_by_conversation {
        txn.record(
            &conversation_id,
            ConversationChange::StatusChanged {
                message_ids,
                status: MessageStatus::Read,
            },
        );
    }
    for (conversation_id, message_ids) in mentions_by_conversation {
        txn.record(&conversation_id, ConversationChange::MentionsRead { message_ids });
    }
    if started > 0 {
        txn.record_event(StoreEvent::ExpireAtUpdated);
    }

    Ok(ReadReceipt {
        messages: read_total,
        mentions: mentions_total,
    })
}

impl MessageStore {
    /// Move one message forward to `status`.
    ///
    /// Backward and same-status moves are ignored. A FAILED message refuses
    /// every update; the refusal is reported on the violation channel.
    pub fn update_status(&self, message_id: &str, status: MessageStatus) -> Result<StatusUpdate> {
        self.db.write(|txn| update_status_in(txn, message_id, status))
    }

    /// Mark messages READ and mention rows read in one transaction.
    pub fn mark_read(&self, message_ids: &[String], mention_ids: &[String]) -> Result<ReadReceipt> {
        self.db.write(|txn| mark_read_in(txn, message_ids, mention_ids))
    }
}
