//! End-to-end behaviour of a file-backed store.

use std::sync::Arc;
use std::time::Duration;

use chat_store::{
    ChatStore, ConversationCategory, ConversationChange, ManualClock, MessageBody, MessageSource,
    MessageStatus, NewConversation, NewMessage, StatusUpdate, StoreConfig, StoreEvent,
    TranscriptChild,
};
use futures::StreamExt;
use tempfile::TempDir;

const T: i64 = 1_700_000_000_000;

fn open_store() -> (TempDir, Arc<ManualClock>, ChatStore) {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(T));
    let config = StoreConfig::at_path(dir.path().join("chat.db"), "me");
    let store = ChatStore::open_with_clock(config, clock.clone()).unwrap();
    (dir, clock, store)
}

fn from_peer(id: &str, conversation: &str, created_at: i64) -> NewMessage {
    NewMessage::new(id, conversation, "peer", MessageBody::Text(format!("text {}", id)), created_at)
        .with_status(MessageStatus::Delivered)
}

fn count(store: &ChatStore, sql: &str) -> i64 {
    store
        .database()
        .read(|conn| Ok(conn.query_row(sql, [], |row| row.get(0))?))
        .unwrap()
}

#[tokio::test]
async fn test_out_of_order_arrival_and_batched_read() {
    let (_dir, _clock, store) = open_store();
    store
        .conversations()
        .create(NewConversation::new("c1", ConversationCategory::Direct))
        .unwrap();

    // A: first message
    store.messages().insert(from_peer("m1", "c1", T), MessageSource::Remote).unwrap();
    let c1 = store.conversations().get("c1").unwrap().unwrap();
    assert_eq!(c1.last_message_id.as_deref(), Some("m1"));
    assert_eq!(c1.unseen_message_count, 1);

    // B: an older message arrives late
    store
        .messages()
        .insert(from_peer("m2", "c1", T - 5), MessageSource::Remote)
        .unwrap();
    let c1 = store.conversations().get("c1").unwrap().unwrap();
    assert_eq!(c1.last_message_id.as_deref(), Some("m1"));
    assert_eq!(c1.unseen_message_count, 2);

    // C: one batched read, one notification for c1
    store.flushed().await;
    let mut rx = store.subscribe();
    store
        .messages()
        .mark_read(&["m1".to_string(), "m2".to_string()], &[])
        .unwrap();
    store.flushed().await;

    let batch = rx.try_recv().unwrap();
    assert!(rx.try_recv().is_err());
    let for_c1: Vec<_> = batch
        .events
        .iter()
        .filter(|event| event.conversation_id() == Some("c1"))
        .collect();
    assert_eq!(for_c1.len(), 1);

    assert_eq!(store.messages().get("m1").unwrap().unwrap().status, MessageStatus::Read);
    assert_eq!(store.messages().get("m2").unwrap().unwrap().status, MessageStatus::Read);
    assert_eq!(store.conversations().get("c1").unwrap().unwrap().unseen_message_count, 0);
}

#[test]
fn test_send_triggered_expiry_sweep() {
    let (_dir, clock, store) = open_store();
    store
        .conversations()
        .create(NewConversation::new("c1", ConversationCategory::Direct))
        .unwrap();
    store.conversations().set_expire_in("c1", 10).unwrap();

    // D
    store.messages().insert(from_peer("m3", "c1", T), MessageSource::Remote).unwrap();
    assert_eq!(store.expiry().next_expire_at().unwrap(), Some(T / 1000 + 10));

    let early = store.expiry().sweep().unwrap();
    assert!(early.deleted.is_empty());

    clock.advance(Duration::from_secs(10));
    let report = store.expiry().sweep().unwrap();
    assert_eq!(report.deleted, vec!["m3".to_string()]);
    assert!(store.messages().get("m3").unwrap().is_none());

    let again = store.expiry().sweep().unwrap();
    assert!(again.deleted.is_empty());
    assert_eq!(again.next_expire_at, None);

    let c1 = store.conversations().get("c1").unwrap().unwrap();
    assert!(c1.last_message_id.is_none());
    assert_eq!(c1.unseen_message_count, 0);
}

#[test]
fn test_sweep_cascades_and_reports_next_deadline() {
    let (_dir, clock, store) = open_store();
    store.conversations().create(NewConversation::new("c1", ConversationCategory::Group)).unwrap();
    store.conversations().set_expire_in("c1", 30).unwrap();

    store
        .messages()
        .insert(from_peer("m1", "c1", T - 20_000).mentioning(["me"]), MessageSource::Remote)
        .unwrap();
    store
        .messages()
        .insert(
            NewMessage::new("t1", "c1", "peer", MessageBody::Transcript("forwarded".into()), T - 20_000)
                .with_status(MessageStatus::Delivered)
                .with_transcript_children(vec![TranscriptChild::text("x1", "carol", "inner", 1)]),
            MessageSource::Remote,
        )
        .unwrap();
    store.messages().insert(from_peer("m2", "c1", T), MessageSource::Remote).unwrap();
    store.pins().pin("m1").unwrap();
    assert_eq!(store.messages().search("text", Some("c1"), 10).unwrap().len(), 2);

    clock.advance(Duration::from_secs(15));
    let report = store.expiry().sweep().unwrap();

    let mut deleted = report.deleted.clone();
    deleted.sort();
    assert_eq!(deleted, vec!["m1".to_string(), "t1".to_string()]);
    assert_eq!(report.next_expire_at, Some(T / 1000 + 30));
    assert!(!report.has_more);

    assert_eq!(count(&store, "SELECT COUNT(*) FROM message_mentions"), 0);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM transcript_messages"), 0);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM pinned_messages"), 0);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM messages_fts"), 1);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM expired_messages"), 1);

    let c1 = store.conversations().get("c1").unwrap().unwrap();
    assert_eq!(c1.last_message_id.as_deref(), Some("m2"));
    assert_eq!(c1.unseen_message_count, 1);
    assert_eq!(c1.unseen_mention_count, 0);
}

#[test]
fn test_read_triggered_countdown_starts_on_read() {
    let (_dir, clock, store) = open_store();
    store
        .messages()
        .insert(from_peer("m1", "c1", T).expiring_in(60), MessageSource::Remote)
        .unwrap();
    assert_eq!(store.expiry().schedule_for("m1").unwrap().unwrap().expire_at, None);

    clock.advance(Duration::from_secs(5));
    store.messages().update_status("m1", MessageStatus::Read).unwrap();

    let schedule = store.expiry().schedule_for("m1").unwrap().unwrap();
    assert_eq!(schedule.expire_at, Some(T / 1000 + 5 + 60));

    // set once
    clock.advance(Duration::from_secs(5));
    store.expiry().start_countdown(&["m1".to_string()]).unwrap();
    assert_eq!(
        store.expiry().schedule_for("m1").unwrap().unwrap().expire_at,
        Some(T / 1000 + 65)
    );
}

#[test]
fn test_status_is_monotonic() {
    let (_dir, _clock, store) = open_store();
    store
        .messages()
        .insert(
            NewMessage::new("m1", "c1", "me", MessageBody::Text("hi".into()), T),
            MessageSource::LocalSend,
        )
        .unwrap();

    let sequence = [
        MessageStatus::Sent,
        MessageStatus::Pending,
        MessageStatus::Delivered,
        MessageStatus::Unknown,
        MessageStatus::Sent,
        MessageStatus::Read,
        MessageStatus::Delivered,
        MessageStatus::Failed,
        MessageStatus::Read,
        MessageStatus::Pending,
    ];
    let mut last = store.messages().get("m1").unwrap().unwrap().status;
    for status in sequence {
        store.messages().update_status("m1", status).unwrap();
        let now = store.messages().get("m1").unwrap().unwrap().status;
        assert!(now.ordinal() >= last.ordinal());
        last = now;
    }
    assert_eq!(last, MessageStatus::Failed);
    assert_eq!(
        store.messages().update_status("m1", MessageStatus::Read).unwrap(),
        StatusUpdate::Rejected
    );
}

#[test]
fn test_recall_is_idempotent() {
    let (_dir, _clock, store) = open_store();
    store
        .messages()
        .insert(
            from_peer("m1", "c1", T).with_status(MessageStatus::Failed),
            MessageSource::Remote,
        )
        .unwrap();

    store.messages().recall("m1").unwrap();
    let once = store.messages().get("m1").unwrap().unwrap();
    let conversation_once = store.conversations().get("c1").unwrap().unwrap();

    store.messages().recall("m1").unwrap();
    assert_eq!(store.messages().get("m1").unwrap().unwrap(), once);
    assert_eq!(store.conversations().get("c1").unwrap().unwrap(), conversation_once);
    assert_eq!(once.status, MessageStatus::Delivered);
    assert_eq!(once.body, MessageBody::Recalled);
}

#[test]
fn test_concurrent_writers_keep_aggregates_exact() {
    let (_dir, _clock, store) = open_store();

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..25 {
                    let created_at = T + (i * 4 + worker) as i64;
                    let id = format!("m{}-{}", worker, i);
                    store
                        .messages()
                        .insert(from_peer(&id, "c1", created_at), MessageSource::Remote)
                        .unwrap();
                    store.messages().get(&id).unwrap().unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let c1 = store.conversations().get("c1").unwrap().unwrap();
    assert_eq!(c1.unseen_message_count, 100);
    assert_eq!(c1.last_message_id.as_deref(), Some("m3-24"));
}

#[test]
fn test_reopen_keeps_data() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("chat.db");
    {
        let store = ChatStore::open(StoreConfig::at_path(&path, "me")).unwrap();
        store.messages().insert(from_peer("m1", "c1", T), MessageSource::Remote).unwrap();
    }

    let store = ChatStore::open(StoreConfig::at_path(&path, "me")).unwrap();
    assert!(store.messages().exists("m1").unwrap());
    assert_eq!(store.messages().search("text", None, 10).unwrap().len(), 1);
}

#[tokio::test]
async fn test_event_stream() {
    let (_dir, _clock, store) = open_store();
    let mut events = Box::pin(store.events());

    store.messages().insert(from_peer("m1", "c1", T), MessageSource::Remote).unwrap();
    store.messages().delete("m1").unwrap();

    assert_eq!(
        events.next().await,
        Some(StoreEvent::Conversation {
            conversation_id: "c1".into(),
            change: ConversationChange::MessageInserted {
                message_id: "m1".into(),
                source: MessageSource::Remote,
            },
        })
    );
    assert_eq!(
        events.next().await,
        Some(StoreEvent::MessagesRemoved {
            message_ids: vec!["m1".into()]
        })
    );
}
