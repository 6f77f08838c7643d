//! Tests for the filesystem queue provider.

use super::*;
use crate::provider::RedeliveryPolicy;
use tempfile::TempDir;

fn queue(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

fn config_for(dir: &TempDir) -> FilesystemConfig {
    FilesystemConfig {
        data_dir: dir.path().join("store"),
        redelivery: RedeliveryPolicy {
            max_delivery_count: 3,
            enable_dead_letter_queue: true,
            redelivery_delay_ms: 0,
            ..RedeliveryPolicy::default()
        },
    }
}

async fn open(dir: &TempDir) -> FilesystemProvider {
    FilesystemProvider::open(config_for(dir)).await.unwrap()
}

/// Provider whose deliveries expire after 50ms
async fn open_short_lease(dir: &TempDir, max_delivery_count: u32) -> FilesystemProvider {
    let mut config = config_for(dir);
    config.redelivery.max_delivery_count = max_delivery_count;
    config.redelivery.visibility_timeout_ms = 50;
    FilesystemProvider::open(config).await.unwrap()
}

/// File stems of the entries in one set of a queue, in listing order
fn stems_in(provider: &FilesystemProvider, queue: &str, set: &str) -> Vec<String> {
    let mut stems: Vec<String> = std::fs::read_dir(provider.data_dir().join(queue).join(set))
        .unwrap()
        .filter_map(Result::ok)
        .filter_map(|e| {
            e.path()
                .file_stem()
                .and_then(|stem| stem.to_str())
                .map(str::to_string)
        })
        .collect();
    stems.sort();
    stems
}

fn count_files(dir: &Path, extension: &str) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some(extension))
                .count()
        })
        .unwrap_or(0)
}

// ============================================================================
// Layout Tests
// ============================================================================

mod layout {
    use super::*;

    #[tokio::test]
    async fn test_open_creates_data_dir() {
        let dir = TempDir::new().unwrap();

        let provider = open(&dir).await;

        assert!(provider.data_dir().is_dir());
        assert_eq!(provider.provider_type(), ProviderType::Filesystem);
    }

    #[tokio::test]
    async fn test_open_rejects_empty_data_dir() {
        let config = FilesystemConfig {
            data_dir: PathBuf::new(),
            ..FilesystemConfig::default()
        };

        let result = FilesystemProvider::open(config).await;

        assert!(matches!(result, Err(QueueError::ConfigurationError(_))));
    }

    /// Verify a published entry is a JSON file with a base64 body in ready/.
    #[tokio::test]
    async fn test_publish_writes_json_entry() {
        let dir = TempDir::new().unwrap();
        let provider = open(&dir).await;
        let q = queue("orders");

        provider.publish(&q, Bytes::from("hello")).await.unwrap();

        let ready_dir = provider.data_dir().join("orders").join("ready");
        assert_eq!(count_files(&ready_dir, "json"), 1);
        assert_eq!(count_files(&ready_dir, "tmp"), 0);

        let path = std::fs::read_dir(&ready_dir)
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(json["body"], "aGVsbG8=");
        assert_eq!(json["delivery_count"], 0);
    }

    #[tokio::test]
    async fn test_entry_names_follow_publish_order() {
        let dir = TempDir::new().unwrap();
        let provider = open(&dir).await;
        let q = queue("orders");

        for i in 0..20 {
            provider
                .publish(&q, Bytes::from(format!("m{:02}", i)))
                .await
                .unwrap();
        }

        let deliveries = provider.fetch(&q, "c", 20).await.unwrap();
        let bodies: Vec<_> = deliveries.iter().map(|d| d.body.clone()).collect();
        let expected: Vec<_> = (0..20).map(|i| Bytes::from(format!("m{:02}", i))).collect();
        assert_eq!(bodies, expected);
    }

    #[test]
    fn test_parse_handle() {
        assert_eq!(parse_handle("0001-abc:token"), Some(("0001-abc", "token")));
        assert_eq!(parse_handle("../escape:token"), None);
        assert_eq!(parse_handle("name:"), None);
        assert_eq!(parse_handle("no-separator"), None);
    }

    #[test]
    fn test_due_stem_orders_by_due_time() {
        let name = "00000000000000000001-abc";
        let early = due_stem(&Timestamp::now(), name);
        let late = due_stem(&Timestamp::after_millis(1_000), name);

        assert!(early < late);
        assert_eq!(entry_name(&late), name);
        assert_eq!(entry_name(name), name);
        assert_eq!(due_millis("0000000000000-"), None);
        assert_eq!(due_millis(name), None);
    }
}

// ============================================================================
// Delivery Tests
// ============================================================================

mod delivery {
    use super::*;

    #[tokio::test]
    async fn test_fetch_moves_entries_to_unacked() {
        let dir = TempDir::new().unwrap();
        let provider = open(&dir).await;
        let q = queue("orders");
        provider.publish(&q, Bytes::from("a")).await.unwrap();
        provider.publish(&q, Bytes::from("b")).await.unwrap();

        let deliveries = provider.fetch(&q, "c", 1).await.unwrap();

        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].delivery_count, 1);
        assert_eq!(deliveries[0].receipt_handle.consumer(), "c");
        assert_eq!(
            provider.stats(&q).await.unwrap(),
            QueueStats {
                ready: 1,
                unacked: 1,
                dead_lettered: 0
            }
        );
    }

    #[tokio::test]
    async fn test_acknowledge_deletes_entry() {
        let dir = TempDir::new().unwrap();
        let provider = open(&dir).await;
        let q = queue("orders");
        provider.publish(&q, Bytes::from("a")).await.unwrap();
        let delivery = provider.fetch(&q, "c", 1).await.unwrap().remove(0);

        provider.acknowledge(&delivery.receipt_handle).await.unwrap();

        assert_eq!(provider.stats(&q).await.unwrap(), QueueStats::default());
        assert!(matches!(
            provider.acknowledge(&delivery.receipt_handle).await,
            Err(QueueError::MessageNotFound { .. })
        ));
    }

    /// Verify a receipt from an earlier delivery cannot settle a later one.
    #[tokio::test]
    async fn test_stale_receipt_is_refused() {
        let dir = TempDir::new().unwrap();
        let provider = open(&dir).await;
        let q = queue("orders");
        provider.publish(&q, Bytes::from("a")).await.unwrap();
        let first = provider.fetch(&q, "c", 1).await.unwrap().remove(0);
        provider.reject(&first.receipt_handle).await.unwrap();
        let second = provider.fetch(&q, "c", 1).await.unwrap().remove(0);

        let result = provider.acknowledge(&first.receipt_handle).await;

        assert!(matches!(result, Err(QueueError::MessageNotFound { .. })));
        provider.acknowledge(&second.receipt_handle).await.unwrap();
    }

    #[tokio::test]
    async fn test_receipt_from_other_provider_is_refused() {
        let dir = TempDir::new().unwrap();
        let provider = open(&dir).await;
        let receipt = ReceiptHandle::new(
            "0001-abc:token".to_string(),
            queue("orders"),
            "c".to_string(),
            ProviderType::InMemory,
        );

        let result = provider.reject(&receipt).await;

        assert!(matches!(result, Err(QueueError::MessageNotFound { .. })));
    }

    #[tokio::test]
    async fn test_reject_dead_letters_after_max_deliveries() {
        let dir = TempDir::new().unwrap();
        let provider = open(&dir).await;
        let q = queue("orders");
        provider.publish(&q, Bytes::from("poison")).await.unwrap();

        let mut outcomes = Vec::new();
        for attempt in 1..=3 {
            let delivery = provider.fetch(&q, "c", 1).await.unwrap().remove(0);
            assert_eq!(delivery.delivery_count, attempt);
            outcomes.push(provider.reject(&delivery.receipt_handle).await.unwrap());
        }

        assert!(matches!(outcomes[0], RejectOutcome::Requeued { .. }));
        assert!(matches!(outcomes[1], RejectOutcome::Requeued { .. }));
        assert_eq!(outcomes[2], RejectOutcome::DeadLettered);
        assert!(provider.fetch(&q, "c", 1).await.unwrap().is_empty());
        assert_eq!(provider.stats(&q).await.unwrap().dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_redrive_dead_letters() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(&dir);
        config.redelivery.max_delivery_count = 1;
        let provider = FilesystemProvider::open(config).await.unwrap();
        let q = queue("orders");
        provider.publish(&q, Bytes::from("a")).await.unwrap();
        let delivery = provider.fetch(&q, "c", 1).await.unwrap().remove(0);
        provider.reject(&delivery.receipt_handle).await.unwrap();

        let redriven = provider.redrive_dead_letters(&q).await.unwrap();

        assert_eq!(redriven, 1);
        let again = provider.fetch(&q, "c", 1).await.unwrap().remove(0);
        assert_eq!(again.body, Bytes::from("a"));
        assert_eq!(again.delivery_count, 1);
    }

    #[tokio::test]
    async fn test_delayed_redelivery_is_held_back() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(&dir);
        config.redelivery.redelivery_delay_ms = 60_000;
        let provider = FilesystemProvider::open(config).await.unwrap();
        let q = queue("orders");
        provider.publish(&q, Bytes::from("a")).await.unwrap();
        let delivery = provider.fetch(&q, "c", 1).await.unwrap().remove(0);

        let outcome = provider.reject(&delivery.receipt_handle).await.unwrap();

        assert!(matches!(outcome, RejectOutcome::Requeued { .. }));
        assert!(provider.fetch(&q, "c", 1).await.unwrap().is_empty());
        assert_eq!(provider.stats(&q).await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn test_publish_rejects_oversized_body() {
        let dir = TempDir::new().unwrap();
        let provider = open(&dir).await;
        let body = Bytes::from(vec![b'x'; ProviderType::Filesystem.max_message_size() + 1]);

        let result = provider.publish(&queue("orders"), body).await;

        assert!(matches!(result, Err(QueueError::MessageTooLarge { .. })));
    }

    /// Verify a corrupt entry is set aside instead of blocking the queue.
    #[tokio::test]
    async fn test_corrupt_entry_is_quarantined() {
        let dir = TempDir::new().unwrap();
        let provider = open(&dir).await;
        let q = queue("orders");
        provider.publish(&q, Bytes::from("good")).await.unwrap();
        let ready_dir = provider.data_dir().join("orders").join("ready");
        std::fs::write(ready_dir.join("0000000000000-bad.json"), b"not json").unwrap();

        let deliveries = provider.fetch(&q, "c", 10).await.unwrap();

        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].body, Bytes::from("good"));
        let dead_dir = provider.data_dir().join("orders").join("dead");
        assert_eq!(count_files(&dead_dir, "corrupt"), 1);
    }

    /// Verify entries leased before a failing entry still reach the consumer.
    #[tokio::test]
    async fn test_fetch_returns_partial_batch_on_read_failure() {
        // Arrange
        let dir = TempDir::new().unwrap();
        let provider = open(&dir).await;
        let q = queue("orders");
        provider.publish(&q, Bytes::from("good")).await.unwrap();
        let stem = stems_in(&provider, "orders", READY_DIR).remove(0);
        let due = &stem[..DUE_WIDTH];
        let unreadable = provider
            .data_dir()
            .join("orders")
            .join(READY_DIR)
            .join(format!("{}-99999999999999999999-broken.json", due));
        std::fs::create_dir(&unreadable).unwrap();

        // Act
        let deliveries = provider.fetch(&q, "c", 10).await.unwrap();

        // Assert
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].body, Bytes::from("good"));
        assert_eq!(provider.stats(&q).await.unwrap().unacked, 1);
        provider.acknowledge(&deliveries[0].receipt_handle).await.unwrap();

        // With nothing leased the failure surfaces
        let result = provider.fetch(&q, "c", 10).await;
        assert!(matches!(result, Err(QueueError::Storage { .. })));
    }

    /// Verify a delayed entry is named by its due time and does not hold back due ones.
    #[tokio::test]
    async fn test_delayed_entry_does_not_block_due_entries() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(&dir);
        config.redelivery.redelivery_delay_ms = 60_000;
        let provider = FilesystemProvider::open(config).await.unwrap();
        let q = queue("orders");
        provider.publish(&q, Bytes::from("delayed")).await.unwrap();
        let delivery = provider.fetch(&q, "c", 1).await.unwrap().remove(0);
        provider.reject(&delivery.receipt_handle).await.unwrap();
        provider.publish(&q, Bytes::from("due")).await.unwrap();

        let deliveries = provider.fetch(&q, "c", 10).await.unwrap();

        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].body, Bytes::from("due"));
        let stems = stems_in(&provider, "orders", READY_DIR);
        assert_eq!(stems.len(), 1);
        let due = due_millis(&stems[0]).unwrap();
        assert!(due > now_millis() + 50_000);
    }
}

// ============================================================================
// Recovery Tests
// ============================================================================

mod recovery {
    use super::*;

    #[tokio::test]
    async fn test_recover_only_touches_given_consumer() {
        let dir = TempDir::new().unwrap();
        let provider = open(&dir).await;
        let q = queue("orders");
        for body in ["a", "b", "c"] {
            provider.publish(&q, Bytes::from(body)).await.unwrap();
        }
        provider.fetch(&q, "first", 2).await.unwrap();
        provider.fetch(&q, "second", 1).await.unwrap();

        let recovered = provider.recover(&q, "first").await.unwrap();

        assert_eq!(recovered, 2);
        let stats = provider.stats(&q).await.unwrap();
        assert_eq!(stats.ready, 2);
        assert_eq!(stats.unacked, 1);
    }

    /// Verify entries left unacknowledged by a crash are redelivered once their lease expires.
    #[tokio::test]
    async fn test_reopen_redelivers_expired_entries() {
        let dir = TempDir::new().unwrap();
        let q = queue("orders");
        {
            let provider = open_short_lease(&dir, 3).await;
            provider.publish(&q, Bytes::from("a")).await.unwrap();
            provider.publish(&q, Bytes::from("b")).await.unwrap();
            let delivered = provider.fetch(&q, "crashed", 1).await.unwrap();
            assert_eq!(delivered[0].body, Bytes::from("a"));
        }

        let provider = open_short_lease(&dir, 3).await;

        assert_eq!(
            provider.stats(&q).await.unwrap(),
            QueueStats {
                ready: 1,
                unacked: 1,
                dead_lettered: 0
            }
        );
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let deliveries = provider.fetch(&q, "restarted", 10).await.unwrap();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].body, Bytes::from("a"));
        assert_eq!(deliveries[0].delivery_count, 2);
        assert_eq!(deliveries[1].body, Bytes::from("b"));
        assert_eq!(deliveries[1].delivery_count, 1);
    }

    /// Verify opening a second store on the same directory leaves live deliveries alone.
    #[tokio::test]
    async fn test_second_store_does_not_steal_live_deliveries() {
        // Arrange
        let dir = TempDir::new().unwrap();
        let q = queue("orders");
        let running = open(&dir).await;
        running.publish(&q, Bytes::from("a")).await.unwrap();
        let delivery = running.fetch(&q, "consumer-1", 1).await.unwrap().remove(0);

        // Act
        let producer = open(&dir).await;
        producer.publish(&q, Bytes::from("b")).await.unwrap();

        // Assert
        running.acknowledge(&delivery.receipt_handle).await.unwrap();
        let redelivered = producer.fetch(&q, "consumer-2", 10).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].body, Bytes::from("b"));
        assert_eq!(
            producer.stats(&q).await.unwrap(),
            QueueStats {
                ready: 0,
                unacked: 1,
                dead_lettered: 0
            }
        );
    }

    /// Verify a delivery whose lease ran out goes to the next fetch and the old receipt is void.
    #[tokio::test]
    async fn test_expired_lease_is_reclaimed_by_fetch() {
        let dir = TempDir::new().unwrap();
        let provider = open_short_lease(&dir, 3).await;
        let q = queue("orders");
        provider.publish(&q, Bytes::from("a")).await.unwrap();
        let stuck = provider.fetch(&q, "hung", 1).await.unwrap().remove(0);

        assert!(provider.fetch(&q, "other", 1).await.unwrap().is_empty());
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let again = provider.fetch(&q, "other", 1).await.unwrap().remove(0);

        assert_eq!(again.body, Bytes::from("a"));
        assert_eq!(again.delivery_count, 2);
        assert!(matches!(
            provider.acknowledge(&stuck.receipt_handle).await,
            Err(QueueError::MessageNotFound { .. })
        ));
        provider.acknowledge(&again.receipt_handle).await.unwrap();
        assert_eq!(provider.stats(&q).await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn test_expired_lease_dead_letters_after_max_deliveries() {
        let dir = TempDir::new().unwrap();
        let provider = open_short_lease(&dir, 1).await;
        let q = queue("orders");
        provider.publish(&q, Bytes::from("a")).await.unwrap();
        provider.fetch(&q, "hung", 1).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let deliveries = provider.fetch(&q, "other", 1).await.unwrap();

        assert!(deliveries.is_empty());
        assert_eq!(
            provider.stats(&q).await.unwrap(),
            QueueStats {
                ready: 0,
                unacked: 0,
                dead_lettered: 1
            }
        );
    }

    /// Verify acknowledged entries do not come back after a restart.
    #[tokio::test]
    async fn test_reopen_keeps_acknowledged_entries_gone() {
        let dir = TempDir::new().unwrap();
        let q = queue("orders");
        {
            let provider = open(&dir).await;
            provider.publish(&q, Bytes::from("a")).await.unwrap();
            let delivery = provider.fetch(&q, "c", 1).await.unwrap().remove(0);
            provider.acknowledge(&delivery.receipt_handle).await.unwrap();
        }

        let provider = open(&dir).await;

        assert_eq!(provider.stats(&q).await.unwrap(), QueueStats::default());
    }

    /// Verify stray files in the data directory do not break opening.
    #[tokio::test]
    async fn test_open_ignores_stray_files() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        std::fs::create_dir_all(&config.data_dir).unwrap();
        std::fs::write(config.data_dir.join("README"), b"notes").unwrap();

        let result = FilesystemProvider::open(config).await;

        assert!(result.is_ok());
    }
}
