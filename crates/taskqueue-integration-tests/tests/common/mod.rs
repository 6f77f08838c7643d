//! Common test utilities for taskqueue integration tests
//!
//! This module provides:
//! - A recording processor with configurable failures
//! - A store wrapper that injects fetch failures
//! - Helpers for polling until a condition holds

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use taskqueue_runtime::{
    ConsumeOptions, Delivery, InMemoryConfig, InMemoryProvider, Message, MessageId,
    MessageProcessor, ProviderType, QueueError, QueueName, QueueProvider, QueueStats,
    ReceiptHandle, RedeliveryPolicy, RejectOutcome,
};

/// Upper bound for any wait in these tests
pub const WAIT: Duration = Duration::from_secs(10);

#[allow(dead_code)]
pub fn queue_name(name: &str) -> QueueName {
    QueueName::new(name.to_string()).unwrap()
}

/// Consume options with a short poll interval
#[allow(dead_code)]
pub fn options(batch_size: u32) -> ConsumeOptions {
    ConsumeOptions::new(batch_size, Duration::from_millis(10)).unwrap()
}

/// Redelivery policy without delay
#[allow(dead_code)]
pub fn immediate_redelivery(max_delivery_count: u32) -> RedeliveryPolicy {
    RedeliveryPolicy {
        max_delivery_count,
        enable_dead_letter_queue: true,
        redelivery_delay_ms: 0,
        ..RedeliveryPolicy::default()
    }
}

#[allow(dead_code)]
pub fn in_memory_store(max_delivery_count: u32) -> Arc<InMemoryProvider> {
    Arc::new(InMemoryProvider::new(InMemoryConfig {
        redelivery: immediate_redelivery(max_delivery_count),
        ..InMemoryConfig::default()
    }))
}

/// Poll `condition` until it holds or [`WAIT`] elapses
#[allow(dead_code)]
pub async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Poll the store until `condition` holds for the queue's stats
#[allow(dead_code)]
pub async fn wait_for_stats<F>(store: &dyn QueueProvider, queue: &QueueName, condition: F) -> bool
where
    F: Fn(&QueueStats) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition(&store.stats(queue).await.unwrap()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

// ============================================================================
// Recording Processor
// ============================================================================

/// Processor recording every message it receives
///
/// Each message fails its first `failures` deliveries.
#[derive(Clone)]
#[allow(dead_code)]
pub struct RecordingProcessor {
    received: Arc<Mutex<Vec<Message>>>,
    failures: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl RecordingProcessor {
    pub fn new() -> Self {
        Self {
            received: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(failures: usize) -> Self {
        let processor = Self::new();
        processor.failures.store(failures, Ordering::SeqCst);
        processor
    }

    pub fn received(&self) -> Vec<Message> {
        self.received.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    pub fn deliveries_of(&self, id: &MessageId) -> usize {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.id() == id)
            .count()
    }
}

#[async_trait]
impl MessageProcessor for RecordingProcessor {
    async fn process(&self, message: Message) -> anyhow::Result<()> {
        let attempt = {
            let mut received = self.received.lock().unwrap();
            let attempt = received.iter().filter(|m| m.id() == message.id()).count() + 1;
            received.push(message);
            attempt
        };

        if attempt <= self.failures.load(Ordering::SeqCst) {
            anyhow::bail!("simulated failure on attempt {}", attempt);
        }
        Ok(())
    }
}

// ============================================================================
// Fault-injecting Store
// ============================================================================

/// Store wrapper whose `fetch` fails a configured number of times
#[allow(dead_code)]
pub struct FaultyStore {
    inner: Arc<dyn QueueProvider>,
    transient_failures: AtomicUsize,
    fatal: bool,
    fetch_calls: AtomicUsize,
}

#[allow(dead_code)]
impl FaultyStore {
    /// Fail the first `count` fetches with a transient error
    pub fn transient(inner: Arc<dyn QueueProvider>, count: usize) -> Self {
        Self {
            inner,
            transient_failures: AtomicUsize::new(count),
            fatal: false,
            fetch_calls: AtomicUsize::new(0),
        }
    }

    /// Fail every fetch with a non-transient error
    pub fn fatal(inner: Arc<dyn QueueProvider>) -> Self {
        Self {
            inner,
            transient_failures: AtomicUsize::new(0),
            fatal: true,
            fetch_calls: AtomicUsize::new(0),
        }
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QueueProvider for FaultyStore {
    async fn publish(&self, queue: &QueueName, body: Bytes) -> Result<(), QueueError> {
        self.inner.publish(queue, body).await
    }

    async fn fetch(
        &self,
        queue: &QueueName,
        consumer: &str,
        max_deliveries: u32,
    ) -> Result<Vec<Delivery>, QueueError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        if self.fatal {
            return Err(QueueError::ConnectionClosed);
        }

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(QueueError::Storage {
                message: "simulated outage".to_string(),
            });
        }

        self.inner.fetch(queue, consumer, max_deliveries).await
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.inner.acknowledge(receipt).await
    }

    async fn reject(&self, receipt: &ReceiptHandle) -> Result<RejectOutcome, QueueError> {
        self.inner.reject(receipt).await
    }

    async fn recover(&self, queue: &QueueName, consumer: &str) -> Result<usize, QueueError> {
        self.inner.recover(queue, consumer).await
    }

    async fn redrive_dead_letters(&self, queue: &QueueName) -> Result<usize, QueueError> {
        self.inner.redrive_dead_letters(queue).await
    }

    async fn stats(&self, queue: &QueueName) -> Result<QueueStats, QueueError> {
        self.inner.stats(queue).await
    }

    fn provider_type(&self) -> ProviderType {
        self.inner.provider_type()
    }
}
