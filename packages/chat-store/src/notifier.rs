//! # Change Notifier
//!
//! Post-commit change notifications.
//!
//! ## Delivery
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       CHANGE NOTIFICATION FLOW                          │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  write closure ──record()──► ChangeSet (per transaction)                │
//! │        │                                                                │
//! │        ├── closure returns Err ──► rollback, ChangeSet dropped          │
//! │        │                                                                │
//! │        └── COMMIT ──► writer slot released                              │
//! │                          │                                              │
//! │                          ▼  (unbounded mpsc)                            │
//! │              ┌──────────────────────────┐                               │
//! │              │ chat-store-notifier      │  dedicated thread             │
//! │              │  1. broadcast ChangeBatch│──► subscribe() / stream()     │
//! │              │  2. violations           │──► subscribe_violations()     │
//! │              │  3. post-commit hooks    │                               │
//! │              └──────────────────────────┘                               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing is delivered for a rolled-back transaction, and nothing is
//! delivered while the writer slot is held, so a subscriber that reacts by
//! writing cannot deadlock the store. Batches arrive in commit order.
//!
//! Subscribers that fall behind lose batches (the channel is bounded).
//! [`ChangeNotifier::stream`] turns that into a
//! [`StoreEvent::ResyncRequired`] so the UI can re-query.

use futures::Stream;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::storage::{MediaStatus, MessageSource, MessageStatus};

/// Deferred side effect, run once after a successful commit
pub type PostCommitHook = Box<dyn FnOnce() + Send + 'static>;

// ============================================================================
// EVENTS
// ============================================================================

/// What changed inside one conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConversationChange {
    /// A message was added
    MessageInserted {
        /// New message
        message_id: String,
        /// Origin of the message
        source: MessageSource,
    },
    /// Messages moved to a new status
    StatusChanged {
        /// Updated messages
        message_ids: Vec<String>,
        /// Their new status
        status: MessageStatus,
    },
    /// Mention rows were marked read
    MentionsRead {
        /// Mentioning messages
        message_ids: Vec<String>,
    },
    /// A message became a tombstone, or a quote of one was refreshed
    Recalled {
        /// Affected message
        message_id: String,
    },
    /// Content or attachment fields of a message changed
    MessageUpdated {
        /// Affected message
        message_id: String,
    },
    /// Attachment transfer state changed
    MediaStatusChanged {
        /// Affected message
        message_id: String,
        /// New transfer state
        status: MediaStatus,
    },
    /// Pins were added or removed
    PinsChanged,
    /// Conversation fields (name, mute, pin, expiry, status) changed
    MetadataChanged,
    /// Every message was removed
    Cleared,
}

/// One committed effect
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// Change scoped to a conversation
    Conversation {
        /// Conversation id
        conversation_id: String,
        /// What changed
        change: ConversationChange,
    },
    /// Messages were deleted (explicitly or by expiry)
    MessagesRemoved {
        /// Deleted message ids
        message_ids: Vec<String>,
    },
    /// A disappearing-message deadline was set; the sweep timer should
    /// re-check [`crate::ExpiryScheduler::next_expire_at`]
    ExpireAtUpdated,
    /// Attachment files and transcript children are no longer referenced
    AttachmentsReleased {
        /// Conversation they belonged to
        conversation_id: String,
        /// Local media URLs to delete from disk
        media_urls: Vec<String>,
        /// Transcripts whose child attachments can be deleted
        transcript_ids: Vec<String>,
    },
    /// The conversation row itself was deleted
    ConversationDeleted {
        /// Conversation id
        conversation_id: String,
    },
    /// The subscriber missed batches and should re-query
    ResyncRequired {
        /// Number of dropped batches
        missed_batches: u64,
    },
}

impl StoreEvent {
    /// Conversation this event is scoped to, if any
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            StoreEvent::Conversation {
                conversation_id, ..
            }
            | StoreEvent::AttachmentsReleased {
                conversation_id, ..
            }
            | StoreEvent::ConversationDeleted { conversation_id } => Some(conversation_id),
            _ => None,
        }
    }
}

/// All events of one committed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeBatch {
    /// Unique id of the commit
    pub batch_id: Uuid,
    /// Events in the order they were recorded
    pub events: Vec<StoreEvent>,
}

/// A write that was refused because it would break a stored invariant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IntegrityViolation {
    /// Status update on a FAILED message
    StatusOnFailedMessage {
        /// Target message
        message_id: String,
        /// Status that was refused
        attempted: MessageStatus,
    },
    /// Attempt to replace a deadline that is already set
    ExpireAtOverwrite {
        /// Target message
        message_id: String,
        /// Deadline on disk
        current: i64,
        /// Deadline that was refused
        attempted: i64,
    },
}

// ============================================================================
// PER-TRANSACTION COLLECTOR
// ============================================================================

/// Effects recorded inside one write transaction
#[derive(Default)]
pub(crate) struct ChangeSet {
    events: Vec<StoreEvent>,
    removed: Vec<String>,
    violations: Vec<IntegrityViolation>,
    hooks: Vec<PostCommitHook>,
}

impl ChangeSet {
    pub(crate) fn push(&mut self, event: StoreEvent) {
        self.events.push(event);
    }

    pub(crate) fn push_removed(&mut self, message_id: String) {
        self.removed.push(message_id);
    }

    pub(crate) fn push_violation(&mut self, violation: IntegrityViolation) {
        self.violations.push(violation);
    }

    pub(crate) fn push_hook(&mut self, hook: PostCommitHook) {
        self.hooks.push(hook);
    }

    fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.removed.is_empty()
            && self.violations.is_empty()
            && self.hooks.is_empty()
    }
}

// ============================================================================
// NOTIFIER
// ============================================================================

enum Dispatch {
    Commit {
        batch: Option<ChangeBatch>,
        violations: Vec<IntegrityViolation>,
        hooks: Vec<PostCommitHook>,
    },
    Flush(oneshot::Sender<()>),
}

/// Fans committed changes out to subscribers
pub struct ChangeNotifier {
    dispatch_tx: mpsc::UnboundedSender<Dispatch>,
    events_tx: broadcast::Sender<ChangeBatch>,
    violations_tx: broadcast::Sender<IntegrityViolation>,
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("subscribers", &self.events_tx.receiver_count())
            .finish()
    }
}

impl ChangeNotifier {
    /// Start the dispatch thread.
    ///
    /// `capacity` bounds how many batches a slow subscriber may fall behind.
    pub fn start(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidConfig(
                "event_capacity must be at least 1".into(),
            ));
        }

        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel::<Dispatch>();
        let (events_tx, _) = broadcast::channel(capacity);
        let (violations_tx, _) = broadcast::channel(capacity);

        let events = events_tx.clone();
        let violations = violations_tx.clone();
        std::thread::Builder::new()
            .name("chat-store-notifier".into())
            .spawn(move || {
                while let Some(dispatch) = dispatch_rx.blocking_recv() {
                    match dispatch {
                        Dispatch::Commit {
                            batch,
                            violations: found,
                            hooks,
                        } => {
                            if let Some(batch) = batch {
                                // No receivers is fine
                                let _ = events.send(batch);
                            }
                            for violation in found {
                                let _ = violations.send(violation);
                            }
                            for hook in hooks {
                                let outcome =
                                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(hook));
                                if outcome.is_err() {
                                    tracing::error!("Post-commit hook panicked");
                                }
                            }
                        }
                        Dispatch::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
                tracing::debug!("Change notifier stopped");
            })
            .map_err(|e| Error::Internal(format!("Failed to start notifier thread: {}", e)))?;

        Ok(Self {
            dispatch_tx,
            events_tx,
            violations_tx,
        })
    }

    /// Subscribe to committed change batches
    ///
    /// Multiple subscribers are supported.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeBatch> {
        self.events_tx.subscribe()
    }

    /// Subscribe to refused writes
    pub fn subscribe_violations(&self) -> broadcast::Receiver<IntegrityViolation> {
        self.violations_tx.subscribe()
    }

    /// Flattened event stream. Lag is reported as
    /// [`StoreEvent::ResyncRequired`] instead of ending the stream.
    pub fn stream(&self) -> impl Stream<Item = StoreEvent> + Send + 'static {
        let mut rx = self.events_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(batch) => {
                        for event in batch.events {
                            yield event;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("Change subscriber lagged by {} batches", missed);
                        yield StoreEvent::ResyncRequired { missed_batches: missed };
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    /// Resolves once everything committed before this call has been
    /// delivered and its hooks have run.
    pub async fn flushed(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.dispatch_tx.send(Dispatch::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Hand a committed transaction's effects to the dispatch thread
    pub(crate) fn publish(&self, changes: ChangeSet) {
        if changes.is_empty() {
            return;
        }

        let ChangeSet {
            mut events,
            removed,
            violations,
            hooks,
        } = changes;

        if !removed.is_empty() {
            events.push(StoreEvent::MessagesRemoved {
                message_ids: removed,
            });
        }

        let batch = if events.is_empty() {
            None
        } else {
            Some(ChangeBatch {
                batch_id: Uuid::new_v4(),
                events,
            })
        };

        if self
            .dispatch_tx
            .send(Dispatch::Commit {
                batch,
                violations,
                hooks,
            })
            .is_err()
        {
            tracing::warn!("Change notifier is gone; dropping committed changes");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn inserted(conversation_id: &str, message_id: &str) -> StoreEvent {
        StoreEvent::Conversation {
            conversation_id: conversation_id.into(),
            change: ConversationChange::MessageInserted {
                message_id: message_id.into(),
                source: MessageSource::Remote,
            },
        }
    }

    #[tokio::test]
    async fn test_publish_delivers_one_batch_per_commit() {
        let notifier = ChangeNotifier::start(16).unwrap();
        let mut rx = notifier.subscribe();

        let mut changes = ChangeSet::default();
        changes.push(inserted("c1", "m1"));
        changes.push_removed("m0".into());
        notifier.publish(changes);
        notifier.flushed().await;

        let batch = rx.try_recv().unwrap();
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.events[0], inserted("c1", "m1"));
        assert_eq!(
            batch.events[1],
            StoreEvent::MessagesRemoved {
                message_ids: vec!["m0".into()]
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_change_set_is_not_published() {
        let notifier = ChangeNotifier::start(16).unwrap();
        let mut rx = notifier.subscribe();

        notifier.publish(ChangeSet::default());
        notifier.flushed().await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_hooks_run_after_delivery() {
        let notifier = ChangeNotifier::start(16).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        let mut changes = ChangeSet::default();
        let counter = ran.clone();
        changes.push_hook(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        changes.push_hook(Box::new(|| panic!("hook failure is contained")));
        let counter = ran.clone();
        changes.push_hook(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        notifier.publish(changes);
        notifier.flushed().await;

        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_violations_go_to_their_own_channel() {
        let notifier = ChangeNotifier::start(16).unwrap();
        let mut events = notifier.subscribe();
        let mut violations = notifier.subscribe_violations();

        let mut changes = ChangeSet::default();
        changes.push_violation(IntegrityViolation::StatusOnFailedMessage {
            message_id: "m1".into(),
            attempted: MessageStatus::Read,
        });
        notifier.publish(changes);
        notifier.flushed().await;

        assert!(events.try_recv().is_err());
        assert!(matches!(
            violations.try_recv().unwrap(),
            IntegrityViolation::StatusOnFailedMessage { .. }
        ));
    }

    #[tokio::test]
    async fn test_stream_reports_lag_as_resync() {
        let notifier = ChangeNotifier::start(1).unwrap();
        let stream = notifier.stream();
        futures::pin_mut!(stream);

        for id in ["m1", "m2", "m3"] {
            let mut changes = ChangeSet::default();
            changes.push(inserted("c1", id));
            notifier.publish(changes);
        }
        notifier.flushed().await;

        assert_eq!(
            stream.next().await,
            Some(StoreEvent::ResyncRequired { missed_batches: 2 })
        );
        assert_eq!(stream.next().await, Some(inserted("c1", "m3")));
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        assert!(matches!(
            ChangeNotifier::start(0),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_event_conversation_scope() {
        assert_eq!(inserted("c9", "m1").conversation_id(), Some("c9"));
        assert_eq!(StoreEvent::ExpireAtUpdated.conversation_id(), None);
    }
}
