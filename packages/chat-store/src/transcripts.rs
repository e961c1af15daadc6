//! # Transcripts
//!
//! Messages embedded in a TRANSCRIPT message. Children are written with
//! their parent, keep their forwarding order, and are removed whenever the
//! parent is deleted or recalled.

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;

use crate::error::Result;
use crate::notifier::ConversationChange;
use crate::storage::{Database, MediaStatus, TranscriptChild};

const CHILD_COLUMNS: &str = "transcript_id, message_id, sender_id, sender_name, category, \
     content, media_url, media_mime_type, media_size, media_status, created_at";

fn child_from_row(row: &Row<'_>) -> rusqlite::Result<TranscriptChild> {
    Ok(TranscriptChild {
        transcript_id: row.get(0)?,
        message_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_name: row.get(3)?,
        category: row.get(4)?,
        content: row.get(5)?,
        media_url: row.get(6)?,
        media_mime_type: row.get(7)?,
        media_size: row.get(8)?,
        media_status: row.get(9)?,
        created_at: row.get(10)?,
    })
}

/// Read access to transcript children
#[derive(Debug, Clone)]
pub struct TranscriptStore {
    db: Arc<Database>,
}

impl TranscriptStore {
    /// Create a transcript store over `db`
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Children of a transcript, in forwarding order
    pub fn children(&self, transcript_id: &str) -> Result<Vec<TranscriptChild>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM transcript_messages WHERE transcript_id = ? ORDER BY position",
                CHILD_COLUMNS
            ))?;
            let children = stmt
                .query_map(params![transcript_id], child_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(children)
        })
    }

    /// Record a child attachment's transfer state (and local file once
    /// downloaded). Same no-regression rule as top-level media.
    pub fn update_child_media(
        &self,
        transcript_id: &str,
        message_id: &str,
        status: MediaStatus,
        media_url: Option<&str>,
    ) -> Result<bool> {
        self.db.write(|txn| {
            let conn = txn.conn();
            let current: Option<Option<MediaStatus>> = conn
                .query_row(
                    "SELECT media_status FROM transcript_messages
                     WHERE transcript_id = ? AND message_id = ?",
                    params![transcript_id, message_id],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(current) = current else {
                return Ok(false);
            };
            if let Some(current) = current {
                if current == status || !status.can_replace(current) {
                    return Ok(false);
                }
            }

            conn.execute(
                "UPDATE transcript_messages
                 SET media_status = ?1, media_url = COALESCE(?2, media_url)
                 WHERE transcript_id = ?3 AND message_id = ?4",
                params![status, media_url, transcript_id, message_id],
            )?;

            let conversation_id: Option<String> = conn
                .query_row(
                    "SELECT conversation_id FROM messages WHERE id = ?",
                    params![transcript_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(conversation_id) = conversation_id {
                txn.record(
                    &conversation_id,
                    ConversationChange::MessageUpdated {
                        message_id: transcript_id.to_string(),
                    },
                );
            }
            Ok(true)
        })
    }
}

/// Store children under `transcript_id`, numbered in slice order
pub(crate) fn insert_children(
    conn: &Connection,
    transcript_id: &str,
    children: &[TranscriptChild],
) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT OR REPLACE INTO transcript_messages (
            transcript_id, message_id, position, sender_id, sender_name, category,
            content, media_url, media_mime_type, media_size, media_status, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
    )?;

    for (position, child) in children.iter().enumerate() {
        stmt.execute(params![
            transcript_id,
            child.message_id,
            position as i64,
            child.sender_id,
            child.sender_name,
            child.category,
            child.content,
            child.media_url,
            child.media_mime_type,
            child.media_size,
            child.media_status,
            child.created_at,
        ])?;
    }
    Ok(())
}

/// Remove all children of `transcript_id`, returning their message ids
pub(crate) fn delete_children(conn: &Connection, transcript_id: &str) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT message_id FROM transcript_messages WHERE transcript_id = ?")?;
    let ids = stmt
        .query_map(params![transcript_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    conn.execute(
        "DELETE FROM transcript_messages WHERE transcript_id = ?",
        params![transcript_id],
    )?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Category, StoreConfig};
    use crate::time::ManualClock;

    fn setup() -> TranscriptStore {
        let db = Database::open(StoreConfig::in_memory("me"), Arc::new(ManualClock::new(0)))
            .unwrap();
        TranscriptStore::new(db)
    }

    fn media_child(id: &str) -> TranscriptChild {
        TranscriptChild {
            category: Category::Image,
            content: Some("att".into()),
            media_status: Some(MediaStatus::Pending),
            ..TranscriptChild::text(id, "bob", "", 5)
        }
    }

    #[test]
    fn test_children_keep_order() {
        let store = setup();
        store
            .db
            .write(|txn| {
                insert_children(
                    txn.conn(),
                    "t1",
                    &[
                        TranscriptChild::text("z", "bob", "first", 30),
                        TranscriptChild::text("a", "carol", "second", 10),
                    ],
                )
            })
            .unwrap();

        let children = store.children("t1").unwrap();
        let ids: Vec<_> = children.iter().map(|c| c.message_id.as_str()).collect();
        assert_eq!(ids, vec!["z", "a"]);
        assert!(children.iter().all(|c| c.transcript_id == "t1"));
    }

    #[test]
    fn test_delete_returns_child_ids() {
        let store = setup();
        let deleted = store
            .db
            .write(|txn| {
                insert_children(txn.conn(), "t1", &[TranscriptChild::text("c1", "bob", "x", 0)])?;
                delete_children(txn.conn(), "t1")
            })
            .unwrap();
        assert_eq!(deleted, vec!["c1".to_string()]);
        assert!(store.children("t1").unwrap().is_empty());
    }

    #[test]
    fn test_child_media_does_not_regress_from_done() {
        let store = setup();
        store
            .db
            .write(|txn| insert_children(txn.conn(), "t1", &[media_child("c1")]))
            .unwrap();

        assert!(store
            .update_child_media("t1", "c1", MediaStatus::Done, Some("file:///c1.jpg"))
            .unwrap());
        assert!(!store
            .update_child_media("t1", "c1", MediaStatus::Pending, None)
            .unwrap());
        assert!(!store
            .update_child_media("t1", "missing", MediaStatus::Done, None)
            .unwrap());

        let child = &store.children("t1").unwrap()[0];
        assert_eq!(child.media_status, Some(MediaStatus::Done));
        assert_eq!(child.media_url.as_deref(), Some("file:///c1.jpg"));
    }
}
