//! # Records
//!
//! Typed rows for every table, plus the tag enums they are built from.
//!
//! Tag enums are stored as TEXT so a database file stays readable with the
//! sqlite3 shell. Each one implements `ToSql`/`FromSql`, which keeps the
//! string tags out of the query code.
//!
//! ## Message bodies
//!
//! A message's category decides which columns carry data:
//!
//! ```text
//! ┌──────────────────────────────┬──────────────────────────────────────────┐
//! │ Category                     │ Columns                                  │
//! ├──────────────────────────────┼──────────────────────────────────────────┤
//! │ TEXT POST LOCATION SYSTEM    │ content                                  │
//! │ TRANSCRIPT                   │ content (summary) + transcript_messages  │
//! │ IMAGE VIDEO LIVE AUDIO DATA  │ content (attachment id) + media_* + name │
//! │ STICKER                      │ sticker_id                               │
//! │ CONTACT                      │ shared_user_id                           │
//! │ RECALLED                     │ nothing (tombstone)                      │
//! └──────────────────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! [`MessageBody`] mirrors that table, so a recalled message can never be
//! read back with content attached.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Generates the TEXT tag mapping shared by the enums in this module.
///
/// With `fallback`, an unrecognised tag read from disk decodes to that
/// variant instead of failing the row.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $tag:literal),+ $(,)? } $(, fallback = $fallback:ident)?) => {
        impl $name {
            /// Storage tag for this value
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $tag,)+
                }
            }

            /// Parse a storage tag
            pub fn from_tag(tag: &str) -> Option<Self> {
                match tag {
                    $($tag => Some($name::$variant),)+
                    _ => None,
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $name {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $name {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let tag = value.as_str()?;
                $name::from_tag(tag)
                    $(.or(Some($name::$fallback)))?
                    .ok_or_else(|| {
                        FromSqlError::Other(
                            format!("unknown {} tag {:?}", stringify!($name), tag).into(),
                        )
                    })
            }
        }
    };
}

// ============================================================================
// MESSAGE TAGS
// ============================================================================

/// Message category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    /// Plain text
    Text,
    /// Image attachment
    Image,
    /// Video attachment
    Video,
    /// Live stream card
    Live,
    /// Voice / audio attachment
    Audio,
    /// Arbitrary file
    Data,
    /// Sticker reference
    Sticker,
    /// Shared contact card
    Contact,
    /// Location (JSON payload in content)
    Location,
    /// Long-form markdown post
    Post,
    /// Forwarded bundle of other messages
    Transcript,
    /// System notice generated by the app
    System,
    /// Tombstone left by a recall
    Recalled,
}

text_enum!(Category {
    Text => "TEXT",
    Image => "IMAGE",
    Video => "VIDEO",
    Live => "LIVE",
    Audio => "AUDIO",
    Data => "DATA",
    Sticker => "STICKER",
    Contact => "CONTACT",
    Location => "LOCATION",
    Post => "POST",
    Transcript => "TRANSCRIPT",
    System => "SYSTEM",
    Recalled => "RECALLED",
});

impl std::str::FromStr for Category {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Category::from_tag(s).ok_or_else(|| Error::InvalidCategory(s.to_string()))
    }
}

/// Which columns a recall clears for a category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecallScope {
    /// Text-like: content and the quote
    ContentAndQuote,
    /// Attachment columns and the attachment id
    Media,
    /// Sticker id
    Sticker,
    /// Shared user id
    Contact,
    /// Nothing to clear
    Nothing,
}

impl RecallScope {
    /// SET fragment applied alongside `category = 'RECALLED'`
    pub(crate) fn clear_columns(&self) -> &'static str {
        match self {
            RecallScope::ContentAndQuote => {
                ", content = NULL, quote_message_id = NULL, quote_content = NULL"
            }
            RecallScope::Media => {
                ", content = NULL, media_url = NULL, media_mime_type = NULL, media_size = NULL, \
                 media_duration = NULL, media_width = NULL, media_height = NULL, \
                 media_status = NULL, thumb_image = NULL, name = NULL"
            }
            RecallScope::Sticker => ", sticker_id = NULL",
            RecallScope::Contact => ", shared_user_id = NULL",
            RecallScope::Nothing => "",
        }
    }
}

impl Category {
    /// Categories that carry an attachment
    pub fn is_media(&self) -> bool {
        matches!(
            self,
            Category::Image | Category::Video | Category::Live | Category::Audio | Category::Data
        )
    }

    /// Categories whose text goes into the full-text index
    pub fn is_searchable(&self) -> bool {
        matches!(
            self,
            Category::Text | Category::Post | Category::Data | Category::Transcript
        )
    }

    pub(crate) fn recall_scope(&self) -> RecallScope {
        match self {
            Category::Text | Category::Post | Category::Location | Category::Transcript => {
                RecallScope::ContentAndQuote
            }
            Category::Image | Category::Video | Category::Live | Category::Audio | Category::Data => {
                RecallScope::Media
            }
            Category::Sticker => RecallScope::Sticker,
            Category::Contact => RecallScope::Contact,
            Category::System | Category::Recalled => RecallScope::Nothing,
        }
    }
}

/// Delivery status of a message.
///
/// Ordered: UNKNOWN < PENDING < SENT < DELIVERED < READ < FAILED. Status
/// only moves forward, and FAILED accepts no further updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    /// Not known (also used for unrecognised stored tags)
    Unknown,
    /// Queued locally, not yet acknowledged
    Pending,
    /// Acknowledged by the server
    Sent,
    /// Delivered to this device (inbound) or the peer (outbound)
    Delivered,
    /// Read
    Read,
    /// Could not be sent or decrypted
    Failed,
}

text_enum!(MessageStatus {
    Unknown => "UNKNOWN",
    Pending => "PENDING",
    Sent => "SENT",
    Delivered => "DELIVERED",
    Read => "READ",
    Failed => "FAILED",
}, fallback = Unknown);

/// Verdict of a single status transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTransition {
    /// Strictly forward move, will be written
    Apply,
    /// Same or backward move, silently skipped
    Ignore,
    /// Current status is FAILED, reported as an integrity anomaly
    Reject,
}

impl MessageStatus {
    /// Position in the forward-only order
    pub fn ordinal(&self) -> u8 {
        match self {
            MessageStatus::Unknown => 0,
            MessageStatus::Pending => 1,
            MessageStatus::Sent => 2,
            MessageStatus::Delivered => 3,
            MessageStatus::Read => 4,
            MessageStatus::Failed => 5,
        }
    }

    /// Decide whether `self -> next` may be written
    pub fn transition_to(&self, next: MessageStatus) -> StatusTransition {
        if *self == MessageStatus::Failed {
            StatusTransition::Reject
        } else if next.ordinal() > self.ordinal() {
            StatusTransition::Apply
        } else {
            StatusTransition::Ignore
        }
    }
}

/// Transfer state of an attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaStatus {
    /// Waiting for transfer
    Pending,
    /// Transferred
    Done,
    /// Transfer cancelled by the user
    Canceled,
    /// Attachment no longer available upstream
    Expired,
    /// Voice message listened to
    Read,
}

text_enum!(MediaStatus {
    Pending => "PENDING",
    Done => "DONE",
    Canceled => "CANCELED",
    Expired => "EXPIRED",
    Read => "READ",
});

impl MediaStatus {
    /// A finished transfer never goes back to PENDING or CANCELED
    pub fn can_replace(&self, current: MediaStatus) -> bool {
        !(current == MediaStatus::Done
            && matches!(self, MediaStatus::Pending | MediaStatus::Canceled))
    }
}

/// Where an inserted message came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageSource {
    /// Composed on this device
    LocalSend,
    /// Received from the network
    Remote,
    /// Restored from history or a backup
    Backfill,
}

// ============================================================================
// MESSAGE BODY
// ============================================================================

/// Attachment metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaAttachment {
    /// Upstream attachment id
    pub attachment_id: Option<String>,
    /// Local file URL once downloaded
    pub url: Option<String>,
    /// MIME type
    pub mime_type: Option<String>,
    /// Size in bytes
    pub size: Option<i64>,
    /// Duration in milliseconds (audio / video)
    pub duration: Option<i64>,
    /// Pixel width
    pub width: Option<i64>,
    /// Pixel height
    pub height: Option<i64>,
    /// Transfer state
    pub status: Option<MediaStatus>,
    /// Inline thumbnail (base64 / blurhash)
    pub thumbnail: Option<String>,
    /// File name (DATA)
    pub name: Option<String>,
}

/// Category-specific message payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageBody {
    /// Plain text
    Text(String),
    /// Markdown post
    Post(String),
    /// Location payload
    Location(String),
    /// System notice
    System(String),
    /// Transcript summary; the embedded messages live in their own table
    Transcript(String),
    /// Image
    Image(MediaAttachment),
    /// Video
    Video(MediaAttachment),
    /// Live stream card
    Live(MediaAttachment),
    /// Audio
    Audio(MediaAttachment),
    /// File
    Data(MediaAttachment),
    /// Sticker id
    Sticker(String),
    /// Shared user id
    Contact(String),
    /// Recalled tombstone
    Recalled,
}

/// Column values a body writes into the `messages` row
#[derive(Debug, Default)]
pub(crate) struct BodyColumns<'a> {
    pub content: Option<&'a str>,
    pub media: Option<&'a MediaAttachment>,
    pub sticker_id: Option<&'a str>,
    pub shared_user_id: Option<&'a str>,
}

impl MessageBody {
    /// The category this body is stored under
    pub fn category(&self) -> Category {
        match self {
            MessageBody::Text(_) => Category::Text,
            MessageBody::Post(_) => Category::Post,
            MessageBody::Location(_) => Category::Location,
            MessageBody::System(_) => Category::System,
            MessageBody::Transcript(_) => Category::Transcript,
            MessageBody::Image(_) => Category::Image,
            MessageBody::Video(_) => Category::Video,
            MessageBody::Live(_) => Category::Live,
            MessageBody::Audio(_) => Category::Audio,
            MessageBody::Data(_) => Category::Data,
            MessageBody::Sticker(_) => Category::Sticker,
            MessageBody::Contact(_) => Category::Contact,
            MessageBody::Recalled => Category::Recalled,
        }
    }

    /// Attachment, for media categories
    pub fn media(&self) -> Option<&MediaAttachment> {
        match self {
            MessageBody::Image(media)
            | MessageBody::Video(media)
            | MessageBody::Live(media)
            | MessageBody::Audio(media)
            | MessageBody::Data(media) => Some(media),
            _ => None,
        }
    }

    /// Text body, for text-like categories
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageBody::Text(text)
            | MessageBody::Post(text)
            | MessageBody::Location(text)
            | MessageBody::System(text)
            | MessageBody::Transcript(text) => Some(text),
            _ => None,
        }
    }

    /// `(content, name)` for the full-text index, if this body is indexed
    pub(crate) fn search_fields(&self) -> Option<(&str, Option<&str>)> {
        if !self.category().is_searchable() {
            return None;
        }
        match self {
            MessageBody::Data(media) => Some(("", media.name.as_deref())),
            other => other.text().map(|text| (text, None)),
        }
    }

    pub(crate) fn columns(&self) -> BodyColumns<'_> {
        match self {
            MessageBody::Text(text)
            | MessageBody::Post(text)
            | MessageBody::Location(text)
            | MessageBody::System(text)
            | MessageBody::Transcript(text) => BodyColumns {
                content: Some(text),
                ..Default::default()
            },
            MessageBody::Image(media)
            | MessageBody::Video(media)
            | MessageBody::Live(media)
            | MessageBody::Audio(media)
            | MessageBody::Data(media) => BodyColumns {
                content: media.attachment_id.as_deref(),
                media: Some(media),
                ..Default::default()
            },
            MessageBody::Sticker(sticker_id) => BodyColumns {
                sticker_id: Some(sticker_id),
                ..Default::default()
            },
            MessageBody::Contact(user_id) => BodyColumns {
                shared_user_id: Some(user_id),
                ..Default::default()
            },
            MessageBody::Recalled => BodyColumns::default(),
        }
    }
}

// ============================================================================
// MESSAGES
// ============================================================================

/// Frozen copy of a quoted message, taken when the quoting message is
/// stored. It never carries its own quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    /// Quoted message id
    pub message_id: String,
    /// Quoted message sender
    pub sender_id: String,
    /// Quoted body as it was (or the tombstone after a recall)
    pub body: MessageBody,
    /// Quoted message status when the snapshot was taken
    pub status: MessageStatus,
    /// Quoted message creation time (ms)
    pub created_at: i64,
}

/// A stored message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message id
    pub id: String,
    /// Owning conversation
    pub conversation_id: String,
    /// Sender user id
    pub sender_id: String,
    /// Delivery status
    pub status: MessageStatus,
    /// Category-specific payload
    pub body: MessageBody,
    /// Id of the quoted message, if any
    pub quote_message_id: Option<String>,
    /// Snapshot of the quoted message
    pub quote: Option<QuoteSnapshot>,
    /// Creation time (Unix ms)
    pub created_at: i64,
}

impl Message {
    /// Category derived from the body
    pub fn category(&self) -> Category {
        self.body.category()
    }

    /// Whether this row is a recall tombstone
    pub fn is_recalled(&self) -> bool {
        matches!(self.body, MessageBody::Recalled)
    }

    /// Snapshot for embedding into a quoting message
    pub fn to_quote_snapshot(&self) -> QuoteSnapshot {
        QuoteSnapshot {
            message_id: self.id.clone(),
            sender_id: self.sender_id.clone(),
            body: self.body.clone(),
            status: self.status,
            created_at: self.created_at,
        }
    }
}

/// Input for [`crate::MessageStore::insert`]
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Message id (globally unique)
    pub id: String,
    /// Owning conversation
    pub conversation_id: String,
    /// Sender user id
    pub sender_id: String,
    /// Payload
    pub body: MessageBody,
    /// Initial status
    pub status: MessageStatus,
    /// Creation time (Unix ms)
    pub created_at: i64,
    /// Message being replied to
    pub quote_message_id: Option<String>,
    /// Mentioned user ids
    pub mentions: Vec<String>,
    /// Per-message disappearing duration in seconds (read-triggered)
    pub expire_in: Option<i64>,
    /// Embedded messages, for transcripts
    pub transcript_children: Vec<TranscriptChild>,
}

impl NewMessage {
    /// A PENDING message with no quote, mentions or expiry
    pub fn new(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        body: MessageBody,
        created_at: i64,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            body,
            status: MessageStatus::Pending,
            created_at,
            quote_message_id: None,
            mentions: Vec::new(),
            expire_in: None,
            transcript_children: Vec::new(),
        }
    }

    /// Set the initial status
    pub fn with_status(mut self, status: MessageStatus) -> Self {
        self.status = status;
        self
    }

    /// Reply to another message
    pub fn quoting(mut self, message_id: impl Into<String>) -> Self {
        self.quote_message_id = Some(message_id.into());
        self
    }

    /// Mention users
    pub fn mentioning<I, S>(mut self, user_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mentions = user_ids.into_iter().map(Into::into).collect();
        self
    }

    /// Disappear `seconds` after being read
    pub fn expiring_in(mut self, seconds: i64) -> Self {
        self.expire_in = Some(seconds);
        self
    }

    /// Attach transcript children
    pub fn with_transcript_children(mut self, children: Vec<TranscriptChild>) -> Self {
        self.transcript_children = children;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidMessage("message id is empty".into()));
        }
        if self.conversation_id.is_empty() {
            return Err(Error::InvalidMessage(format!(
                "message {} has no conversation",
                self.id
            )));
        }
        if matches!(self.body, MessageBody::Recalled) {
            return Err(Error::InvalidMessage(format!(
                "message {} cannot be inserted as recalled",
                self.id
            )));
        }
        if !self.transcript_children.is_empty() && self.body.category() != Category::Transcript {
            return Err(Error::InvalidMessage(format!(
                "message {} carries transcript children but is {}",
                self.id,
                self.body.category()
            )));
        }
        if matches!(self.expire_in, Some(secs) if secs < 0) {
            return Err(Error::InvalidMessage(format!(
                "message {} has a negative expiry",
                self.id
            )));
        }
        Ok(())
    }
}

/// Column list for `SELECT ... FROM messages m`
pub(crate) const MESSAGE_COLUMNS: &str = "m.id, m.conversation_id, m.sender_id, m.category, \
     m.content, m.media_url, m.media_mime_type, m.media_size, m.media_duration, m.media_width, \
     m.media_height, m.media_status, m.thumb_image, m.name, m.sticker_id, m.shared_user_id, \
     m.status, m.quote_message_id, m.quote_content, m.created_at";

/// Decode a row selected with [`MESSAGE_COLUMNS`]
pub(crate) fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let category: Category = row.get(3)?;
    let content: Option<String> = row.get(4)?;

    let body = if category.is_media() {
        let media = MediaAttachment {
            attachment_id: content,
            url: row.get(5)?,
            mime_type: row.get(6)?,
            size: row.get(7)?,
            duration: row.get(8)?,
            width: row.get(9)?,
            height: row.get(10)?,
            status: row.get(11)?,
            thumbnail: row.get(12)?,
            name: row.get(13)?,
        };
        match category {
            Category::Image => MessageBody::Image(media),
            Category::Video => MessageBody::Video(media),
            Category::Live => MessageBody::Live(media),
            Category::Audio => MessageBody::Audio(media),
            _ => MessageBody::Data(media),
        }
    } else {
        let text = content.unwrap_or_default();
        match category {
            Category::Text => MessageBody::Text(text),
            Category::Post => MessageBody::Post(text),
            Category::Location => MessageBody::Location(text),
            Category::System => MessageBody::System(text),
            Category::Transcript => MessageBody::Transcript(text),
            Category::Sticker => MessageBody::Sticker(row.get::<_, Option<String>>(14)?.unwrap_or_default()),
            Category::Contact => MessageBody::Contact(row.get::<_, Option<String>>(15)?.unwrap_or_default()),
            _ => MessageBody::Recalled,
        }
    };

    let quote = row
        .get::<_, Option<String>>(18)?
        .and_then(|json| match serde_json::from_str::<QuoteSnapshot>(&json) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::debug!("Dropping unreadable quote snapshot: {}", e);
                None
            }
        });

    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        body,
        status: row.get(16)?,
        quote_message_id: row.get(17)?,
        quote,
        created_at: row.get(19)?,
    })
}

/// A message's mention row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMention {
    /// Mentioning message
    pub message_id: String,
    /// Owning conversation
    pub conversation_id: String,
    /// Mentioned user ids
    pub mentions: Vec<String>,
    /// Whether the local user has seen it
    pub has_read: bool,
}

/// A pinned message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedMessage {
    /// Pinned message id
    pub message_id: String,
    /// Owning conversation
    pub conversation_id: String,
    /// Pin time (Unix ms)
    pub pinned_at: i64,
}

/// A message embedded in a transcript
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptChild {
    /// Owning transcript message id (filled in on insert)
    #[serde(default)]
    pub transcript_id: String,
    /// Original message id
    pub message_id: String,
    /// Original sender
    pub sender_id: String,
    /// Sender display name at forwarding time
    pub sender_name: Option<String>,
    /// Original category
    pub category: Category,
    /// Text, or attachment id for media
    pub content: Option<String>,
    /// Local file URL
    pub media_url: Option<String>,
    /// MIME type
    pub media_mime_type: Option<String>,
    /// Size in bytes
    pub media_size: Option<i64>,
    /// Transfer state
    pub media_status: Option<MediaStatus>,
    /// Original creation time (ms)
    pub created_at: i64,
}

impl TranscriptChild {
    /// A text child
    pub fn text(
        message_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
        created_at: i64,
    ) -> Self {
        Self {
            transcript_id: String::new(),
            message_id: message_id.into(),
            sender_id: sender_id.into(),
            sender_name: None,
            category: Category::Text,
            content: Some(content.into()),
            media_url: None,
            media_mime_type: None,
            media_size: None,
            media_status: None,
            created_at,
        }
    }
}

// ============================================================================
// EXPIRY
// ============================================================================

/// When a disappearing message's countdown starts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryScheme {
    /// Starts when the message is read (or, for own messages, sent)
    ReadTriggered,
    /// Fixed at insert from the creation time
    SendTriggered,
}

text_enum!(ExpiryScheme {
    ReadTriggered => "READ",
    SendTriggered => "SEND",
});

/// Expiry row for one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpirySchedule {
    /// Expiring message
    pub message_id: String,
    /// Countdown trigger
    pub scheme: ExpiryScheme,
    /// Duration in seconds
    pub expire_in: i64,
    /// Absolute deadline (Unix seconds) once the countdown has started
    pub expire_at: Option<i64>,
}

// ============================================================================
// CONVERSATIONS
// ============================================================================

/// Kind of conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationCategory {
    /// One-to-one
    Direct,
    /// Group
    Group,
    /// Placeholder created before metadata arrived
    Unclassified,
}

impl ToSql for ConversationCategory {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            ConversationCategory::Direct => ToSqlOutput::from("DIRECT"),
            ConversationCategory::Group => ToSqlOutput::from("GROUP"),
            ConversationCategory::Unclassified => ToSqlOutput::from(rusqlite::types::Null),
        })
    }
}

impl FromSql for ConversationCategory {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Null => Ok(ConversationCategory::Unclassified),
            other => match other.as_str()? {
                "DIRECT" => Ok(ConversationCategory::Direct),
                "GROUP" => Ok(ConversationCategory::Group),
                _ => Ok(ConversationCategory::Unclassified),
            },
        }
    }
}

/// Membership state of the local user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    /// Created locally, not yet confirmed
    Start,
    /// Active
    Success,
    /// Local user left
    Quit,
}

impl ToSql for ConversationStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value: i64 = match self {
            ConversationStatus::Start => 0,
            ConversationStatus::Success => 1,
            ConversationStatus::Quit => 2,
        };
        Ok(ToSqlOutput::from(value))
    }
}

impl FromSql for ConversationStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value.as_i64()? {
            0 => Ok(ConversationStatus::Start),
            1 => Ok(ConversationStatus::Success),
            2 => Ok(ConversationStatus::Quit),
            other => Err(FromSqlError::OutOfRange(other)),
        }
    }
}

/// A conversation with its derived aggregates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    /// Conversation id
    pub id: String,
    /// Kind
    pub category: ConversationCategory,
    /// Display name (groups)
    pub name: Option<String>,
    /// Owner / peer user id
    pub owner_id: Option<String>,
    /// Newest message
    pub last_message_id: Option<String>,
    /// Creation time of the newest message (ms)
    pub last_message_created_at: Option<i64>,
    /// Newest message at the last mark-read
    pub last_read_message_id: Option<String>,
    /// Inbound messages not yet read
    pub unseen_message_count: i64,
    /// Unread mentions of the local user
    pub unseen_mention_count: i64,
    /// Pin time (ms)
    pub pin_time: Option<i64>,
    /// Muted until (Unix seconds)
    pub mute_until: Option<i64>,
    /// Disappearing-message duration in seconds, 0 = off
    pub expire_in: i64,
    /// Membership state
    pub status: ConversationStatus,
    /// Creation time (ms)
    pub created_at: i64,
}

/// Input for [`crate::ConversationStore::create`]
#[derive(Debug, Clone)]
pub struct NewConversation {
    /// Conversation id
    pub id: String,
    /// Kind
    pub category: ConversationCategory,
    /// Display name
    pub name: Option<String>,
    /// Owner / peer user id
    pub owner_id: Option<String>,
    /// Disappearing-message duration in seconds
    pub expire_in: i64,
}

impl NewConversation {
    /// A conversation with no name and no expiry
    pub fn new(id: impl Into<String>, category: ConversationCategory) -> Self {
        Self {
            id: id.into(),
            category,
            name: None,
            owner_id: None,
            expire_in: 0,
        }
    }
}

pub(crate) const CONVERSATION_COLUMNS: &str = "id, category, name, owner_id, last_message_id, \
     last_message_created_at, last_read_message_id, unseen_message_count, unseen_mention_count, \
     pin_time, mute_until, expire_in, status, created_at";

pub(crate) fn conversation_from_row(row: &Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: row.get(0)?,
        category: row.get(1)?,
        name: row.get(2)?,
        owner_id: row.get(3)?,
        last_message_id: row.get(4)?,
        last_message_created_at: row.get(5)?,
        last_read_message_id: row.get(6)?,
        unseen_message_count: row.get(7)?,
        unseen_mention_count: row.get(8)?,
        pin_time: row.get(9)?,
        mute_until: row.get(10)?,
        expire_in: row.get(11)?,
        status: row.get(12)?,
        created_at: row.get(13)?,
    })
}

/// A full-text search match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    /// Matching message
    pub message_id: String,
    /// Owning conversation
    pub conversation_id: String,
    /// Creation time of the message (ms)
    pub created_at: i64,
}
