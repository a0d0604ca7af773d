//! Tests for the message lifecycle engine.

use super::*;
use crate::error::ErrorKind;
use crate::registry::{QueueAttributes, QueueSettings};
use crate::stores::InMemoryStore;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

// ============================================================================
// Test Doubles
// ============================================================================

/// Store that fails every batch while `failing` is set
struct FailingStore {
    inner: InMemoryStore,
    failing: AtomicBool,
}

impl FailingStore {
    fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            failing: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl KeyValueStore for FailingStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.exists(key).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.inner.hget(key, field).await
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.inner.hget_all(key).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.inner.lrange(key, start, stop).await
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        self.inner.llen(key).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.inner.smembers(key).await
    }

    async fn execute(&self, batch: Batch) -> Result<BatchOutcome, StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::ConnectionFailed {
                message: "connection reset by peer".to_string(),
            });
        }
        self.inner.execute(batch).await
    }
}

/// Store whose guarded batches always lose the race on their second condition
struct ContendedStore {
    inner: InMemoryStore,
    aborted: AtomicU32,
}

#[async_trait]
impl KeyValueStore for ContendedStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.exists(key).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.inner.hget(key, field).await
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        self.inner.hget_all(key).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        self.inner.lrange(key, start, stop).await
    }

    async fn llen(&self, key: &str) -> Result<u64, StoreError> {
        self.inner.llen(key).await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.inner.smembers(key).await
    }

    async fn execute(&self, batch: Batch) -> Result<BatchOutcome, StoreError> {
        if batch.conditions().len() > 1 {
            self.aborted.fetch_add(1, Ordering::SeqCst);
            return Ok(BatchOutcome::Aborted { condition: 1 });
        }
        self.inner.execute(batch).await
    }
}

// ============================================================================
// Helpers
// ============================================================================

struct Fixture {
    store: InMemoryStore,
    registry: QueueRegistry,
    engine: MessageEngine,
}

fn fixture_with(config: QueueConfig) -> Fixture {
    let store = InMemoryStore::new();
    let config = Arc::new(config);
    let registry = QueueRegistry::new(Arc::new(store.clone()), config.clone());
    let engine = MessageEngine::new(Arc::new(store.clone()), config, registry.clone());
    Fixture {
        store,
        registry,
        engine,
    }
}

async fn fixture(settings: QueueSettings) -> Fixture {
    let fixture = fixture_with(QueueConfig::default());
    fixture.registry.create(&orders(), &settings).await.unwrap();
    fixture
}

fn orders() -> QueueName {
    QueueName::new("orders").unwrap()
}

fn default_settings() -> QueueSettings {
    QueueSettings::new(30, 0, 65536)
}

impl Fixture {
    async fn attributes(&self) -> QueueAttributes {
        self.registry.attributes(&orders()).await.unwrap()
    }

    async fn send(&self, body: &str) -> MessageId {
        self.engine
            .send(&orders(), body, &SendOptions::default())
            .await
            .unwrap()
    }

    async fn receive_with_timeout(&self, seconds: u32) -> ReceivedMessage {
        self.engine
            .receive(
                &orders(),
                &ReceiveOptions::new().with_visibility_timeout(seconds),
            )
            .await
            .unwrap()
    }
}

// ============================================================================
// Send
// ============================================================================

mod send {
    use super::*;

    #[tokio::test]
    async fn test_send_appends_pending_message() {
        let f = fixture(default_settings()).await;

        let id = f.send("A").await;

        let attributes = f.attributes().await;
        assert_eq!(attributes.pending_messages, 1);
        assert_eq!(attributes.hidden_messages, 0);
        assert_eq!(attributes.total_sent, 1);
        assert_eq!(
            f.store.lrange("rsmq:orders:P", 0, -1).await.unwrap(),
            vec![id.to_string()]
        );

        let record = f
            .store
            .hget_all(&format!("rsmq:orders:M:{}", id))
            .await
            .unwrap();
        assert_eq!(record.get(record::BODY), Some(&"A".to_string()));
        assert_eq!(record.get(record::RECEIVE_COUNT), Some(&"0".to_string()));
        assert_eq!(record.get(record::SENT), record.get(record::FIRST_SEEN));
        assert!(!record.contains_key(record::FIRST_RECEIVED));
    }

    #[tokio::test]
    async fn test_send_rejects_empty_body() {
        let f = fixture(default_settings()).await;

        let err = f
            .engine
            .send(&orders(), "", &SendOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::MissingParameter);
        assert_eq!(f.attributes().await.total_sent, 0);
    }

    #[tokio::test]
    async fn test_send_to_missing_queue() {
        let f = fixture_with(QueueConfig::default());

        let err = f
            .engine
            .send(&orders(), "A", &SendOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::QueueNotFound);
        assert_eq!(f.store.key_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_rejects_oversized_body() {
        let f = fixture(QueueSettings::new(30, 0, 1024)).await;

        f.send(&"x".repeat(1024)).await;
        let err = f
            .engine
            .send(&orders(), &"x".repeat(1025), &SendOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            QueueError::MessageTooLong {
                size: 1025,
                max_size: 1024
            }
        ));
        assert_eq!(f.attributes().await.pending_messages, 1);
    }

    #[tokio::test]
    async fn test_size_limit_counts_bytes() {
        let f = fixture(QueueSettings::new(30, 0, 1024)).await;

        let body = "é".repeat(513);
        let err = f
            .engine
            .send(&orders(), &body, &SendOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::MessageTooLong);
    }

    #[tokio::test]
    async fn test_send_rejects_out_of_range_delay() {
        let f = fixture(default_settings()).await;

        let err = f
            .engine
            .send(
                &orders(),
                "A",
                &SendOptions::new().with_delay(crate::registry::MAX_TIMEOUT_SECONDS + 1),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[tokio::test]
    async fn test_send_fails_when_capacity_reached() {
        let f = fixture(default_settings().with_max_messages(2)).await;
        let first = f.send("A").await;
        f.send("B").await;

        let err = f
            .engine
            .send(&orders(), "C", &SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::QueueFull {
                count: 2,
                capacity: 2,
                ..
            }
        ));

        // In-flight messages still count against the ceiling
        f.receive_with_timeout(30).await;
        assert_eq!(
            f.engine
                .send(&orders(), "C", &SendOptions::default())
                .await
                .unwrap_err()
                .kind(),
            ErrorKind::QueueFull
        );

        f.engine.delete(&orders(), &first, None).await.unwrap();
        f.send("C").await;
        assert_eq!(f.attributes().await.total_sent, 3);
    }
}

// ============================================================================
// Receive
// ============================================================================

mod receive {
    use super::*;

    #[tokio::test]
    async fn test_receive_locks_oldest_message() {
        let f = fixture(default_settings()).await;
        let first = f.send("A").await;
        f.send("B").await;

        let received = f
            .engine
            .receive(&orders(), &ReceiveOptions::default())
            .await
            .unwrap();

        assert_eq!(received.message_id(), first);
        assert_eq!(received.body(), "A");
        assert_eq!(received.message.receive_count, 1);
        assert!(received.message.first_received_at.is_some());
        assert!(!received.is_lock_expired());

        let attributes = f.attributes().await;
        assert_eq!(attributes.pending_messages, 1);
        assert_eq!(attributes.hidden_messages, 1);
        assert_eq!(attributes.total_received, 1);

        let deadline = f
            .store
            .hget("rsmq:orders:F", &first.to_string())
            .await
            .unwrap();
        assert_eq!(
            deadline,
            Some(received.visible_at.as_millis().to_string())
        );
    }

    #[tokio::test]
    async fn test_receive_uses_queue_visibility_timeout() {
        let f = fixture(QueueSettings::new(120, 0, 65536)).await;
        f.send("A").await;
        let before = Timestamp::now();

        let received = f
            .engine
            .receive(&orders(), &ReceiveOptions::default())
            .await
            .unwrap();

        assert!(received.visible_at >= before.add_seconds(120));
        assert!(received.visible_at <= Timestamp::now().add_seconds(120));
    }

    #[tokio::test]
    async fn test_receive_on_empty_queue_leaves_counters() {
        let f = fixture(default_settings()).await;
        let before = f.attributes().await;

        let err = f
            .engine
            .receive(&orders(), &ReceiveOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::QueueEmpty);
        assert_eq!(f.attributes().await, before);
    }

    #[tokio::test]
    async fn test_delayed_message_is_not_eligible() {
        let f = fixture(QueueSettings::new(30, 60, 65536)).await;
        f.send("later").await;
        let before = f.attributes().await;

        let err = f
            .engine
            .receive(&orders(), &ReceiveOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::QueueEmpty);
        assert_eq!(f.attributes().await, before);
    }

    #[tokio::test]
    async fn test_receive_skips_delayed_head() {
        let f = fixture(default_settings()).await;
        f.engine
            .send(&orders(), "later", &SendOptions::new().with_delay(60))
            .await
            .unwrap();
        let now = f.send("now").await;

        let received = f.receive_with_timeout(30).await;

        assert_eq!(received.message_id(), now);
        assert_eq!(f.attributes().await.pending_messages, 1);
    }

    #[tokio::test]
    async fn test_receive_rejects_out_of_range_timeout() {
        let f = fixture(default_settings()).await;
        f.send("A").await;

        let err = f
            .engine
            .receive(
                &orders(),
                &ReceiveOptions::new()
                    .with_visibility_timeout(crate::registry::MAX_TIMEOUT_SECONDS + 1),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidValue);
        assert_eq!(f.attributes().await.pending_messages, 1);
    }

    #[tokio::test]
    async fn test_receive_on_missing_queue() {
        let f = fixture_with(QueueConfig::default());

        let err = f
            .engine
            .receive(&orders(), &ReceiveOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::QueueNotFound);
    }

    #[tokio::test]
    async fn test_pop_removes_message() {
        let f = fixture(default_settings()).await;
        let id = f.send("A").await;

        let message = f.engine.pop(&orders()).await.unwrap();

        assert_eq!(message.message_id, id);
        assert_eq!(message.body, "A");
        assert_eq!(message.receive_count, 1);

        let attributes = f.attributes().await;
        assert_eq!(attributes.live_messages(), 0);
        assert_eq!(attributes.total_received, 1);
        assert!(f.store.keys_with_prefix("rsmq:orders:M:").unwrap().is_empty());
        assert_eq!(
            f.engine.pop(&orders()).await.unwrap_err().kind(),
            ErrorKind::QueueEmpty
        );
    }
}

// ============================================================================
// Delete
// ============================================================================

mod delete {
    use super::*;

    #[tokio::test]
    async fn test_delete_with_receipt_restores_counters() {
        let f = fixture(default_settings()).await;
        let id = f.send("A").await;
        let received = f.receive_with_timeout(30).await;

        f.engine
            .delete(&orders(), &id, Some(&received.receipt))
            .await
            .unwrap();

        let attributes = f.attributes().await;
        assert_eq!(attributes.pending_messages, 0);
        assert_eq!(attributes.hidden_messages, 0);
        assert!(f.store.keys_with_prefix("rsmq:orders:M:").unwrap().is_empty());
        assert!(!f.store.exists("rsmq:orders:F").await.unwrap());

        let err = f
            .engine
            .delete(&orders(), &id, Some(&received.receipt))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MessageNotFound);
    }

    #[tokio::test]
    async fn test_delete_with_wrong_receipt() {
        let f = fixture(default_settings()).await;
        let id = f.send("A").await;
        f.receive_with_timeout(30).await;

        let err = f
            .engine
            .delete(&orders(), &id, Some(&ReceiptToken::new()))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::MessageNotFound);
        assert_eq!(f.attributes().await.hidden_messages, 1);
    }

    #[tokio::test]
    async fn test_delete_pending_without_receipt() {
        let f = fixture(default_settings()).await;
        let id = f.send("A").await;
        f.send("B").await;

        f.engine.delete(&orders(), &id, None).await.unwrap();

        let attributes = f.attributes().await;
        assert_eq!(attributes.pending_messages, 1);
        assert_eq!(f.store.llen("rsmq:orders:P").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_pending_with_receipt_is_rejected() {
        let f = fixture(default_settings()).await;
        let id = f.send("A").await;

        let err = f
            .engine
            .delete(&orders(), &id, Some(&ReceiptToken::new()))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::MessageNotFound);
        assert_eq!(f.attributes().await.pending_messages, 1);
    }

    #[tokio::test]
    async fn test_delete_in_flight_without_receipt() {
        let f = fixture(default_settings()).await;
        let id = f.send("A").await;
        f.receive_with_timeout(30).await;

        f.engine.delete(&orders(), &id, None).await.unwrap();

        assert_eq!(f.attributes().await.live_messages(), 0);
    }

    #[tokio::test]
    async fn test_delete_unknown_message() {
        let f = fixture(default_settings()).await;

        let err = f
            .engine
            .delete(&orders(), &MessageId::new(), None)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::MessageNotFound);
    }
}

// ============================================================================
// Visibility and Reclamation
// ============================================================================

mod visibility {
    use super::*;

    #[tokio::test]
    async fn test_change_visibility_moves_deadline() {
        let f = fixture(default_settings()).await;
        let id = f.send("A").await;
        let received = f.receive_with_timeout(30).await;

        let deadline = f
            .engine
            .change_visibility(&orders(), &id, &received.receipt, 300)
            .await
            .unwrap();

        assert!(deadline > received.visible_at);
        assert_eq!(
            f.store.hget("rsmq:orders:F", &id.to_string()).await.unwrap(),
            Some(deadline.as_millis().to_string())
        );
        assert_eq!(f.attributes().await.total_changed, 1);
    }

    #[tokio::test]
    async fn test_change_visibility_rejects_wrong_receipt() {
        let f = fixture(default_settings()).await;
        let id = f.send("A").await;
        f.receive_with_timeout(30).await;

        let err = f
            .engine
            .change_visibility(&orders(), &id, &ReceiptToken::new(), 60)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::MessageNotFound);
        assert_eq!(f.attributes().await.total_changed, 0);
    }

    #[tokio::test]
    async fn test_change_visibility_rejects_out_of_range_timeout() {
        let f = fixture(default_settings()).await;
        let id = f.send("A").await;
        let received = f.receive_with_timeout(30).await;

        let err = f
            .engine
            .change_visibility(
                &orders(),
                &id,
                &received.receipt,
                crate::registry::MAX_TIMEOUT_SECONDS + 1,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[tokio::test]
    async fn test_change_visibility_of_pending_message() {
        let f = fixture(default_settings()).await;
        let id = f.send("A").await;

        let err = f
            .engine
            .change_visibility(&orders(), &id, &ReceiptToken::new(), 60)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::MessageNotFound);
    }

    #[tokio::test]
    async fn test_lapsed_lock_rejects_receipt_before_reclaim() {
        let f = fixture(default_settings()).await;
        let id = f.send("A").await;
        let received = f.receive_with_timeout(0).await;

        let err = f
            .engine
            .delete(&orders(), &id, Some(&received.receipt))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::MessageNotFound);
        assert_eq!(f.attributes().await.hidden_messages, 1);
    }

    #[tokio::test]
    async fn test_expired_message_is_redelivered_with_new_receipt() {
        let f = fixture(default_settings()).await;
        let id = f.send("A").await;
        let first = f.receive_with_timeout(0).await;

        let second = f.receive_with_timeout(30).await;

        assert_eq!(second.message_id(), id);
        assert_ne!(second.receipt, first.receipt);
        assert_eq!(second.message.receive_count, 2);
        assert_eq!(
            second.message.first_received_at,
            first.message.first_received_at
        );

        let err = f
            .engine
            .change_visibility(&orders(), &id, &first.receipt, 60)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MessageNotFound);

        f.engine
            .delete(&orders(), &id, Some(&second.receipt))
            .await
            .unwrap();
        assert_eq!(f.attributes().await.live_messages(), 0);
    }

    #[tokio::test]
    async fn test_reclaim_moves_expired_messages_to_head() {
        let f = fixture_with(QueueConfig {
            reclaim_on_receive: false,
            ..Default::default()
        });
        f.registry
            .create(&orders(), &default_settings())
            .await
            .unwrap();
        let a = f.send("A").await;
        let b = f.send("B").await;
        let c = f.send("C").await;
        f.receive_with_timeout(0).await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        f.receive_with_timeout(0).await;

        let reclaimed = f.engine.reclaim(&orders()).await.unwrap();

        assert_eq!(reclaimed, 2);
        assert_eq!(
            f.store.lrange("rsmq:orders:P", 0, -1).await.unwrap(),
            vec![a.to_string(), b.to_string(), c.to_string()]
        );
        let attributes = f.attributes().await;
        assert_eq!(attributes.pending_messages, 3);
        assert_eq!(attributes.hidden_messages, 0);

        let record = f
            .store
            .hget_all(&format!("rsmq:orders:M:{}", a))
            .await
            .unwrap();
        assert!(!record.contains_key(record::RECEIPT));
        assert!(!record.contains_key(record::VISIBLE_AT));
        assert_eq!(record.get(record::RECEIVE_COUNT), Some(&"1".to_string()));
    }

    #[tokio::test]
    async fn test_reclaim_leaves_live_locks() {
        let f = fixture(default_settings()).await;
        f.send("A").await;
        f.receive_with_timeout(30).await;

        assert_eq!(f.engine.reclaim(&orders()).await.unwrap(), 0);
        assert_eq!(f.attributes().await.hidden_messages, 1);
    }

    #[tokio::test]
    async fn test_second_reclaim_is_a_no_op() {
        let f = fixture(default_settings()).await;
        f.send("A").await;
        f.receive_with_timeout(0).await;

        assert_eq!(f.engine.reclaim(&orders()).await.unwrap(), 1);
        assert_eq!(f.engine.reclaim(&orders()).await.unwrap(), 0);
        assert_eq!(f.store.llen("rsmq:orders:P").await.unwrap(), 1);
    }
}

// ============================================================================
// Store Failures
// ============================================================================

mod store_failures {
    use super::*;

    #[tokio::test]
    async fn test_store_failure_is_passed_through() {
        let inner = InMemoryStore::new();
        let store = Arc::new(FailingStore::new(inner.clone()));
        let config = Arc::new(QueueConfig::default());
        let registry = QueueRegistry::new(store.clone(), config.clone());
        let engine = MessageEngine::new(store.clone(), config, registry.clone());
        registry
            .create(&orders(), &default_settings())
            .await
            .unwrap();

        store.failing.store(true, Ordering::SeqCst);
        let err = engine
            .send(&orders(), "A", &SendOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            QueueError::Store(StoreError::ConnectionFailed { .. })
        ));
        assert!(err.is_transient());
        assert!(inner.keys_with_prefix("rsmq:orders:M:").unwrap().is_empty());
        assert_eq!(
            registry.attributes(&orders()).await.unwrap().total_sent,
            0
        );
    }

    #[tokio::test]
    async fn test_repeated_conflicts_give_up() {
        let inner = InMemoryStore::new();
        let config = Arc::new(QueueConfig {
            max_conflict_retries: 3,
            reclaim_on_receive: false,
            ..Default::default()
        });
        let seeding = QueueRegistry::new(Arc::new(inner.clone()), config.clone());
        let seeding_engine =
            MessageEngine::new(Arc::new(inner.clone()), config.clone(), seeding.clone());
        seeding
            .create(&orders(), &default_settings())
            .await
            .unwrap();
        seeding_engine
            .send(&orders(), "A", &SendOptions::default())
            .await
            .unwrap();

        let store = Arc::new(ContendedStore {
            inner: inner.clone(),
            aborted: AtomicU32::new(0),
        });
        let registry = QueueRegistry::new(store.clone(), config.clone());
        let engine = MessageEngine::new(store.clone(), config, registry);

        let err = engine
            .receive(&orders(), &ReceiveOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            QueueError::Store(StoreError::Conflict { attempts: 3, .. })
        ));
        assert_eq!(store.aborted.load(Ordering::SeqCst), 3);
        assert_eq!(
            seeding.attributes(&orders()).await.unwrap().pending_messages,
            1
        );
    }

    #[tokio::test]
    async fn test_corrupted_record_is_reported() {
        let f = fixture(default_settings()).await;
        let id = f.send("A").await;
        f.store
            .hset(
                &format!("rsmq:orders:M:{}", id),
                &[(record::AVAILABLE_AT, "whenever")],
            )
            .await
            .unwrap();

        let err = f
            .engine
            .receive(&orders(), &ReceiveOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            QueueError::Store(StoreError::Corrupted { ref field, .. }) if field == record::AVAILABLE_AT
        ));
    }
}
