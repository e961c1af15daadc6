//! # Disappearing Messages
//!
//! Schedules and sweeps expiring messages.
//!
//! ## Schemes
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        EXPIRY SCHEMES                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  READ-TRIGGERED  (message carries expire_in)                            │
//! │    insert ──► expire_at = NULL                                          │
//! │    inbound reaches READ / own reaches SENT                              │
//! │           ──► expire_at = now + expire_in   (only if still NULL)        │
//! │                                                                         │
//! │  SEND-TRIGGERED  (conversation expire_in > 0)                           │
//! │    insert ──► expire_at = created_at/1000 + expire_in                   │
//! │                                                                         │
//! │  sweep(now)                                                             │
//! │    rows with expire_at <= now, oldest first, at most sweep_batch_size   │
//! │    ──► full message deletion + aggregate refresh, one transaction       │
//! │    ──► returns the next pending deadline                                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Once set, `expire_at` never changes. The store does not own a timer;
//! hosts call [`ExpiryScheduler::sweep`] themselves or run a
//! [`SweepRunner`] on their tokio runtime.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::conversations::aggregate;
use crate::error::Result;
use crate::messages;
use crate::notifier::{ChangeBatch, IntegrityViolation, StoreEvent};
use crate::storage::{
    Category, Database, ExpiryScheme, ExpirySchedule, MessageStatus, NewMessage,
};

/// How long an idle [`SweepRunner`] waits when nothing is scheduled
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Back-off after a failed sweep
const RETRY_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Expiry decided for a message at insert time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExpiryPlan {
    pub scheme: ExpiryScheme,
    pub expire_in: i64,
    pub expire_at: Option<i64>,
}

/// Pick the scheme for a new message. A per-message duration wins over the
/// conversation's.
pub(crate) fn plan(
    message: &NewMessage,
    conversation_expire_in: i64,
    is_own: bool,
    now_secs: i64,
) -> Option<ExpiryPlan> {
    if message.body.category() == Category::System {
        return None;
    }

    if let Some(expire_in) = message.expire_in.filter(|secs| *secs > 0) {
        return Some(ExpiryPlan {
            scheme: ExpiryScheme::ReadTriggered,
            expire_in,
            expire_at: countdown_started(message.status, is_own).then(|| now_secs + expire_in),
        });
    }

    (conversation_expire_in > 0).then(|| ExpiryPlan {
        scheme: ExpiryScheme::SendTriggered,
        expire_in: conversation_expire_in,
        expire_at: Some(message.created_at.div_euclid(1000) + conversation_expire_in),
    })
}

/// Whether a read-triggered countdown has begun at `status`
pub(crate) fn countdown_started(status: MessageStatus, is_own: bool) -> bool {
    if is_own {
        matches!(
            status,
            MessageStatus::Sent | MessageStatus::Delivered | MessageStatus::Read
        )
    } else {
        status == MessageStatus::Read
    }
}

pub(crate) fn insert_schedule(conn: &Connection, message_id: &str, plan: &ExpiryPlan) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO expired_messages (message_id, scheme, expire_in, expire_at)
         VALUES (?, ?, ?, ?)",
        params![message_id, plan.scheme, plan.expire_in, plan.expire_at],
    )?;
    Ok(())
}

/// Start read-triggered countdowns that have not started yet.
/// Returns how many deadlines were set.
pub(crate) fn start_countdown(
    conn: &Connection,
    message_ids: &[String],
    now_secs: i64,
) -> Result<usize> {
    let mut stmt = conn.prepare(
        "UPDATE expired_messages SET expire_at = ?1 + expire_in
         WHERE message_id = ?2 AND expire_at IS NULL",
    )?;
    let mut started = 0;
    for id in message_ids {
        started += stmt.execute(params![now_secs, id])?;
    }
    Ok(started)
}

pub(crate) fn remove(conn: &Connection, message_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM expired_messages WHERE message_id = ?",
        params![message_id],
    )?;
    Ok(())
}

pub(crate) fn next_expire_at(conn: &Connection) -> Result<Option<i64>> {
    Ok(conn.query_row(
        "SELECT MIN(expire_at) FROM expired_messages WHERE expire_at IS NOT NULL",
        [],
        |row| row.get(0),
    )?)
}

/// Outcome of one sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Messages deleted by this sweep
    pub deleted: Vec<String>,
    /// Soonest remaining deadline (Unix seconds)
    pub next_expire_at: Option<i64>,
    /// More rows were already due than one batch could take
    pub has_more: bool,
}

/// Schedule queries and the sweep
#[derive(Debug, Clone)]
pub struct ExpiryScheduler {
    db: Arc<Database>,
}

impl ExpiryScheduler {
    /// Create a scheduler over `db`
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Expiry row of a message
    pub fn schedule_for(&self, message_id: &str) -> Result<Option<ExpirySchedule>> {
        self.db.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT message_id, scheme, expire_in, expire_at FROM expired_messages
                     WHERE message_id = ?",
                    params![message_id],
                    |row| {
                        Ok(ExpirySchedule {
                            message_id: row.get(0)?,
                            scheme: row.get(1)?,
                            expire_in: row.get(2)?,
                            expire_at: row.get(3)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    /// Start countdowns for messages the user has seen outside the normal
    /// read path. Already-started countdowns are left alone.
    pub fn start_countdown(&self, message_ids: &[String]) -> Result<usize> {
        self.db.write(|txn| {
            let started = start_countdown(txn.conn(), message_ids, txn.now_secs())?;
            if started > 0 {
                txn.record_event(StoreEvent::ExpireAtUpdated);
            }
            Ok(started)
        })
    }

    /// Set an explicit deadline (for example one acknowledged by the
    /// server). Refused and reported if a different deadline is already set.
    pub fn set_expire_at(&self, message_id: &str, expire_at: i64) -> Result<bool> {
        self.db.write(|txn| {
            let current: Option<Option<i64>> = txn
                .conn()
                .query_row(
                    "SELECT expire_at FROM expired_messages WHERE message_id = ?",
                    params![message_id],
                    |row| row.get(0),
                )
                .optional()?;

            match current {
                None => Ok(false),
                Some(Some(current)) if current == expire_at => Ok(false),
                Some(Some(current)) => {
                    txn.record_violation(IntegrityViolation::ExpireAtOverwrite {
                        message_id: message_id.to_string(),
                        current,
                        attempted: expire_at,
                    });
                    Ok(false)
                }
                Some(None) => {
                    txn.conn().execute(
                        "UPDATE expired_messages SET expire_at = ? WHERE message_id = ?",
                        params![expire_at, message_id],
                    )?;
                    txn.record_event(StoreEvent::ExpireAtUpdated);
                    Ok(true)
                }
            }
        })
    }

    /// Soonest pending deadline (Unix seconds)
    pub fn next_expire_at(&self) -> Result<Option<i64>> {
        self.db.read(next_expire_at)
    }

    /// Sweep with the store's clock
    pub fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(self.db.clock().now_secs())
    }

    /// Delete messages whose deadline is at or before `now_secs`.
    ///
    /// Removes at most `sweep_batch_size` messages in one transaction;
    /// `has_more` tells the caller to sweep again straight away.
    pub fn sweep_at(&self, now_secs: i64) -> Result<SweepReport> {
        let batch_size = self.db.config().sweep_batch_size;

        self.db.write(|txn| {
            let local_user_id = txn.local_user_id();
            let conn = txn.conn();

            let due: Vec<String> = {
                let mut stmt = conn.prepare(
                    "SELECT message_id FROM expired_messages
                     WHERE expire_at IS NOT NULL AND expire_at <= ?1
                     ORDER BY expire_at, message_id LIMIT ?2",
                )?;
                let ids = stmt
                    .query_map(params![now_secs, batch_size as i64], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                ids
            };

            let mut removed = Vec::with_capacity(due.len());
            let mut touched = BTreeSet::new();
            for id in &due {
                match messages::delete_in(conn, id)? {
                    Some(message) => {
                        touched.insert(message.conversation_id.clone());
                        removed.push(message);
                    }
                    // Schedule row outlived its message
                    None => remove(conn, id)?,
                }
            }

            for conversation_id in &touched {
                aggregate::refresh_all(conn, conversation_id, local_user_id)?;
            }

            let next = next_expire_at(conn)?;
            let deleted: Vec<String> = removed.iter().map(|m| m.id.clone()).collect();
            messages::record_removals(txn, removed);

            if !deleted.is_empty() {
                tracing::info!(
                    "Expired {} message(s) across {} conversation(s)",
                    deleted.len(),
                    touched.len()
                );
            }

            Ok(SweepReport {
                deleted,
                has_more: next.map_or(false, |at| at <= now_secs),
                next_expire_at: next,
            })
        })
    }
}

// ============================================================================
// SWEEP RUNNER
// ============================================================================

/// Background task that sweeps whenever the next deadline passes.
///
/// Sleeps until the soonest deadline, and wakes early when a commit sets a
/// new one. Must be spawned from within a tokio runtime.
pub struct SweepRunner {
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl SweepRunner {
    /// Start sweeping in the background
    pub fn spawn(scheduler: ExpiryScheduler) -> Self {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let mut changes = scheduler.db.notifier().subscribe();

        let handle = tokio::spawn(async move {
            loop {
                let sweeper = scheduler.clone();
                let delay = match tokio::task::spawn_blocking(move || sweeper.sweep()).await {
                    Ok(Ok(report)) => match report.next_expire_at {
                        Some(at) => {
                            let now = scheduler.db.clock().now_secs();
                            Duration::from_secs(at.saturating_sub(now).max(0) as u64)
                        }
                        None => IDLE_SWEEP_INTERVAL,
                    },
                    Ok(Err(e)) => {
                        tracing::warn!("Expiry sweep failed: {}", e);
                        RETRY_SWEEP_INTERVAL
                    }
                    Err(e) => {
                        tracing::error!("Expiry sweep task panicked: {}", e);
                        RETRY_SWEEP_INTERVAL
                    }
                };

                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = tokio::time::sleep(delay) => {}
                    _ = deadline_changed(&mut changes) => {}
                }
            }
            tracing::debug!("Sweep runner stopped");
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            handle,
        }
    }

    /// Stop the runner and wait for it to finish
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.handle).await;
    }
}

impl Drop for SweepRunner {
    fn drop(&mut self) {
        if self.shutdown_tx.is_some() {
            self.handle.abort();
        }
    }
}

/// Resolves when a commit sets a deadline, or when we may have missed one
async fn deadline_changed(changes: &mut broadcast::Receiver<ChangeBatch>) {
    loop {
        match changes.recv().await {
            Ok(batch) => {
                if batch
                    .events
                    .iter()
                    .any(|event| matches!(event, StoreEvent::ExpireAtUpdated))
                {
                    return;
                }
            }
            Err(RecvError::Lagged(_)) => return,
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MessageBody, StoreConfig};
    use crate::time::ManualClock;

    const NOW_MS: i64 = 1_700_000_000_000;
    const NOW: i64 = 1_700_000_000;

    fn setup() -> (Arc<Database>, ExpiryScheduler) {
        let db = Database::open(
            StoreConfig::in_memory("me"),
            Arc::new(ManualClock::new(NOW_MS)),
        )
        .unwrap();
        (db.clone(), ExpiryScheduler::new(db))
    }

    fn add_expiring(db: &Database, id: &str, expire_at: Option<i64>) {
        db.write(|txn| {
            txn.conn().execute(
                "INSERT OR IGNORE INTO conversations (id, created_at) VALUES ('c1', 0)",
                [],
            )?;
            txn.conn().execute(
                "INSERT INTO messages (id, conversation_id, sender_id, category, content, status, created_at)
                 VALUES (?1, 'c1', 'bob', 'TEXT', 'x', 'DELIVERED', 0)",
                params![id],
            )?;
            insert_schedule(
                txn.conn(),
                id,
                &ExpiryPlan {
                    scheme: ExpiryScheme::ReadTriggered,
                    expire_in: 30,
                    expire_at,
                },
            )?;
            aggregate::refresh_all(txn.conn(), "c1", "me")?;
            if expire_at.is_some() {
                txn.record_event(StoreEvent::ExpireAtUpdated);
            }
            Ok(())
        })
        .unwrap();
    }

    fn message_count(db: &Database) -> i64 {
        db.read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?))
            .unwrap()
    }

    #[test]
    fn test_plan_prefers_message_duration() {
        let msg = NewMessage::new("m1", "c1", "bob", MessageBody::Text("x".into()), 5_000)
            .expiring_in(60);
        let plan = plan(&msg, 10, false, NOW).unwrap();
        assert_eq!(plan.scheme, ExpiryScheme::ReadTriggered);
        assert_eq!(plan.expire_in, 60);
        assert_eq!(plan.expire_at, None);
    }

    #[test]
    fn test_plan_send_triggered_uses_creation_time() {
        let msg = NewMessage::new("m1", "c1", "bob", MessageBody::Text("x".into()), 5_999);
        let plan = plan(&msg, 10, false, NOW).unwrap();
        assert_eq!(plan.scheme, ExpiryScheme::SendTriggered);
        assert_eq!(plan.expire_at, Some(15));
    }

    #[test]
    fn test_plan_skips_system_and_non_expiring() {
        let system = NewMessage::new("m1", "c1", "bob", MessageBody::System("joined".into()), 0);
        assert_eq!(plan(&system, 10, false, NOW), None);

        let plain = NewMessage::new("m2", "c1", "bob", MessageBody::Text("x".into()), 0);
        assert_eq!(plan(&plain, 0, false, NOW), None);
    }

    #[test]
    fn test_countdown_trigger() {
        assert!(countdown_started(MessageStatus::Read, false));
        assert!(!countdown_started(MessageStatus::Delivered, false));
        assert!(countdown_started(MessageStatus::Sent, true));
        assert!(!countdown_started(MessageStatus::Pending, true));
        assert!(!countdown_started(MessageStatus::Failed, true));
    }

    #[test]
    fn test_countdown_starts_once() {
        let (db, scheduler) = setup();
        add_expiring(&db, "m1", None);

        assert_eq!(scheduler.start_countdown(&["m1".into()]).unwrap(), 1);
        assert_eq!(
            scheduler.schedule_for("m1").unwrap().unwrap().expire_at,
            Some(NOW + 30)
        );

        assert_eq!(scheduler.start_countdown(&["m1".into()]).unwrap(), 0);
        assert_eq!(scheduler.next_expire_at().unwrap(), Some(NOW + 30));
    }

    #[tokio::test]
    async fn test_set_expire_at_refuses_overwrite() {
        let (db, scheduler) = setup();
        let mut violations = db.notifier().subscribe_violations();
        add_expiring(&db, "m1", None);

        assert!(scheduler.set_expire_at("m1", NOW + 5).unwrap());
        assert!(!scheduler.set_expire_at("m1", NOW + 5).unwrap());
        assert!(!scheduler.set_expire_at("m1", NOW + 99).unwrap());
        assert!(!scheduler.set_expire_at("missing", NOW).unwrap());
        db.notifier().flushed().await;

        assert_eq!(
            scheduler.schedule_for("m1").unwrap().unwrap().expire_at,
            Some(NOW + 5)
        );
        assert!(matches!(
            violations.try_recv().unwrap(),
            IntegrityViolation::ExpireAtOverwrite { attempted, .. } if attempted == NOW + 99
        ));
    }

    #[test]
    fn test_sweep_deletes_due_messages_only() {
        let (db, scheduler) = setup();
        add_expiring(&db, "due", Some(NOW - 1));
        add_expiring(&db, "later", Some(NOW + 60));
        add_expiring(&db, "unread", None);

        let report = scheduler.sweep_at(NOW).unwrap();
        assert_eq!(report.deleted, vec!["due".to_string()]);
        assert_eq!(report.next_expire_at, Some(NOW + 60));
        assert!(!report.has_more);
        assert_eq!(message_count(&db), 2);
        assert!(scheduler.schedule_for("due").unwrap().is_none());

        let unseen: i64 = db
            .read(|conn| {
                Ok(conn.query_row(
                    "SELECT unseen_message_count FROM conversations WHERE id = 'c1'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(unseen, 2);
    }

    #[test]
    fn test_sweep_is_batched() {
        let mut config = StoreConfig::in_memory("me");
        config.sweep_batch_size = 2;
        let db = Database::open(config, Arc::new(ManualClock::new(NOW_MS))).unwrap();
        let scheduler = ExpiryScheduler::new(db.clone());
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            add_expiring(&db, id, Some(NOW - 10 + i as i64));
        }

        let first = scheduler.sweep().unwrap();
        assert_eq!(first.deleted, vec!["a".to_string(), "b".to_string()]);
        assert!(first.has_more);

        let second = scheduler.sweep().unwrap();
        assert_eq!(second.deleted, vec!["c".to_string()]);
        assert!(!second.has_more);
        assert_eq!(second.next_expire_at, None);
    }

    #[test]
    fn test_sweep_drops_orphan_schedule_rows() {
        let (db, scheduler) = setup();
        db.write(|txn| {
            insert_schedule(
                txn.conn(),
                "ghost",
                &ExpiryPlan {
                    scheme: ExpiryScheme::SendTriggered,
                    expire_in: 1,
                    expire_at: Some(NOW - 1),
                },
            )
        })
        .unwrap();

        let report = scheduler.sweep().unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(report.next_expire_at, None);
        assert!(scheduler.schedule_for("ghost").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_runner_sweeps_on_new_deadline() {
        let (db, scheduler) = setup();
        add_expiring(&db, "early", Some(NOW - 1));

        let runner = SweepRunner::spawn(scheduler);
        wait_until_empty(&db, 0).await;

        add_expiring(&db, "late", Some(NOW));
        wait_until_empty(&db, 0).await;

        runner.shutdown().await;
    }

    async fn wait_until_empty(db: &Database, expected: i64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while message_count(db) != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sweep runner did not remove the message");
    }
}
