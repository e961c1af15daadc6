//! Paged message reads.
//!
//! Pages are keyed on `(created_at, seq)`, so messages sharing a
//! timestamp still page deterministically in insertion order. Every page
//! comes back oldest first, whichever direction it was read in, and never
//! includes its anchor.

use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use super::MessageStore;
use crate::error::Result;
use crate::storage::{message_from_row, placeholders, Category, Message, MESSAGE_COLUMNS};

/// Which side of the anchor to read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Messages before the anchor (or the newest, without one)
    Older,
    /// Messages after the anchor (or the oldest, without one)
    Newer,
}

/// Messages surrounding a target message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageWindow {
    /// Oldest first, target included
    pub messages: Vec<Message>,
    /// Index of the target in `messages`
    pub anchor_index: usize,
    /// Nothing older exists
    pub reached_begin: bool,
    /// Nothing newer exists
    pub reached_end: bool,
}

/// `(created_at, seq)` of a message inside a conversation
fn position(conn: &Connection, conversation_id: &str, message_id: &str) -> Result<Option<(i64, i64)>> {
    Ok(conn
        .query_row(
            "SELECT created_at, seq FROM messages WHERE id = ? AND conversation_id = ?",
            params![message_id, conversation_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?)
}

fn page_in(
    conn: &Connection,
    conversation_id: &str,
    anchor: Option<(i64, i64)>,
    count: usize,
    direction: Direction,
    categories: &[Category],
) -> Result<Vec<Message>> {
    if count == 0 {
        return Ok(Vec::new());
    }

    let mut sql = format!(
        "SELECT {} FROM messages m WHERE m.conversation_id = ?",
        MESSAGE_COLUMNS
    );
    let mut values: Vec<Value> = vec![Value::from(conversation_id.to_string())];

    if !categories.is_empty() {
        sql.push_str(&format!(" AND m.category IN ({})", placeholders(categories.len())));
        values.extend(categories.iter().map(|c| Value::from(c.as_str().to_string())));
    }

    let (comparison, order) = match direction {
        Direction::Older => ("<", "DESC"),
        Direction::Newer => (">", "ASC"),
    };
    if let Some((created_at, seq)) = anchor {
        sql.push_str(&format!(" AND (m.created_at, m.seq) {} (?, ?)", comparison));
        values.push(Value::from(created_at));
        values.push(Value::from(seq));
    }
    sql.push_str(&format!(
        " ORDER BY m.created_at {0}, m.seq {0} LIMIT ?",
        order
    ));
    values.push(Value::from(count as i64));

    let mut stmt = conn.prepare(&sql)?;
    let mut messages = stmt
        .query_map(params_from_iter(values), message_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    if direction == Direction::Older {
        messages.reverse();
    }
    Ok(messages)
}

impl MessageStore {
    /// Read up to `count` messages on one side of `anchor`.
    ///
    /// Without an anchor, `Older` gives the newest page and `Newer` the
    /// oldest. An anchor that is not in the conversation yields an empty
    /// page.
    pub fn page(
        &self,
        conversation_id: &str,
        anchor: Option<&str>,
        count: usize,
        direction: Direction,
    ) -> Result<Vec<Message>> {
        self.page_filtered(conversation_id, anchor, count, direction, &[])
    }

    /// Like [`MessageStore::page`], restricted to `categories`
    /// (media galleries, file lists)
    pub fn page_by_category(
        &self,
        conversation_id: &str,
        categories: &[Category],
        anchor: Option<&str>,
        count: usize,
        direction: Direction,
    ) -> Result<Vec<Message>> {
        self.page_filtered(conversation_id, anchor, count, direction, categories)
    }

    /// Newest `count` messages
    pub fn latest(&self, conversation_id: &str, count: usize) -> Result<Vec<Message>> {
        self.page(conversation_id, None, count, Direction::Older)
    }

    /// Oldest `count` messages
    pub fn earliest(&self, conversation_id: &str, count: usize) -> Result<Vec<Message>> {
        self.page(conversation_id, None, count, Direction::Newer)
    }

    fn page_filtered(
        &self,
        conversation_id: &str,
        anchor: Option<&str>,
        count: usize,
        direction: Direction,
        categories: &[Category],
    ) -> Result<Vec<Message>> {
        let count = self.db.page_size(count);
        self.db.read(|conn| {
            let anchor = match anchor {
                Some(id) => match position(conn, conversation_id, id)? {
                    Some(pos) => Some(pos),
                    None => return Ok(Vec::new()),
                },
                None => None,
            };
            page_in(conn, conversation_id, anchor, count, direction, categories)
        })
    }

    /// Up to `count` messages around `message_id`, split evenly on both
    /// sides, for jumping to a search hit or a quoted message.
    pub fn around(
        &self,
        conversation_id: &str,
        message_id: &str,
        count: usize,
    ) -> Result<Option<MessageWindow>> {
        let count = self.db.page_size(count);
        let above = count / 2;
        let below = count - above;

        self.db.read(|conn| {
            let Some(anchor) = position(conn, conversation_id, message_id)? else {
                return Ok(None);
            };
            let Some(target) = super::load(conn, message_id)? else {
                return Ok(None);
            };

            // One extra row on each side tells whether anything lies beyond
            let mut older =
                page_in(conn, conversation_id, Some(anchor), above + 1, Direction::Older, &[])?;
            let mut newer =
                page_in(conn, conversation_id, Some(anchor), below + 1, Direction::Newer, &[])?;

            let reached_begin = older.len() <= above;
            if !reached_begin {
                older.remove(0);
            }
            let reached_end = newer.len() <= below;
            if !reached_end {
                newer.pop();
            }
            let anchor_index = older.len();

            let mut messages = older;
            messages.push(target);
            messages.extend(newer);

            Ok(Some(MessageWindow {
                messages,
                anchor_index,
                reached_begin,
                reached_end,
            }))
        })
    }
}
