//! In-memory queue provider implementation for testing and development.
//!
//! This module provides a fully functional in-memory backing store that:
//! - Keeps ready entries in FIFO order
//! - Tracks unacknowledged deliveries per consumer, each under a lease that
//!   expires after the visibility timeout
//! - Applies the redelivery policy (delay, capped deliveries, dead-letter set)
//! - Provides thread-safe concurrent access
//!
//! Entries do not survive the process. Use the filesystem provider when
//! durability across restarts is required.

use crate::client::QueueProvider;
use crate::error::QueueError;
use crate::message::{Delivery, QueueName, QueueStats, ReceiptHandle, RejectOutcome, Timestamp};
use crate::provider::{InMemoryConfig, ProviderType, RedeliveryPolicy};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use tracing::warn;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// Thread-safe storage for all queues
struct QueueStorage {
    queues: HashMap<QueueName, InMemoryQueue>,
}

impl QueueStorage {
    fn new() -> Self {
        Self {
            queues: HashMap::new(),
        }
    }

    /// Get or create a queue
    fn get_or_create_queue(&mut self, queue_name: &QueueName) -> &mut InMemoryQueue {
        self.queues.entry(queue_name.clone()).or_default()
    }
}

/// Internal queue state for a single queue
#[derive(Default)]
struct InMemoryQueue {
    /// Entries waiting for delivery (FIFO order)
    ready: VecDeque<StoredMessage>,
    /// Entries whose deliveries were exhausted
    dead_letter: VecDeque<StoredMessage>,
    /// Delivered entries keyed by receipt handle
    in_flight: HashMap<String, InFlightMessage>,
}

impl InMemoryQueue {
    fn len(&self) -> usize {
        self.ready.len() + self.in_flight.len()
    }

    /// Remove up to `max` entries whose redelivery delay has elapsed
    fn take_available(&mut self, max: usize) -> Vec<StoredMessage> {
        let mut taken = Vec::new();
        let mut index = 0;
        while index < self.ready.len() && taken.len() < max {
            if self.ready[index].is_available() {
                if let Some(message) = self.ready.remove(index) {
                    taken.push(message);
                }
            } else {
                index += 1;
            }
        }
        taken
    }

    /// Put entries back at the front of the ready queue in enqueue order
    fn return_to_ready(&mut self, mut messages: Vec<StoredMessage>) {
        messages.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        for mut message in messages.into_iter().rev() {
            message.available_at = Timestamp::now();
            self.ready.push_front(message);
        }
    }

    /// Take back deliveries whose lease has run out
    ///
    /// Entries that already used up their deliveries are dead-lettered.
    fn reclaim_expired(&mut self, policy: &RedeliveryPolicy) -> usize {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, in_flight)| in_flight.is_expired())
            .map(|(handle, _)| handle.clone())
            .collect();

        let mut reclaimed = Vec::new();
        for handle in &expired {
            let Some(in_flight) = self.in_flight.remove(handle) else {
                continue;
            };
            if policy.should_dead_letter(in_flight.message.delivery_count) {
                self.dead_letter.push_back(in_flight.message);
            } else {
                reclaimed.push(in_flight.message);
            }
        }

        self.return_to_ready(reclaimed);
        expired.len()
    }
}

/// An entry stored in the queue with metadata
#[derive(Clone)]
struct StoredMessage {
    body: Bytes,
    enqueued_at: Timestamp,
    delivery_count: u32,
    available_at: Timestamp,
}

impl StoredMessage {
    fn new(body: Bytes) -> Self {
        let now = Timestamp::now();
        Self {
            body,
            enqueued_at: now.clone(),
            delivery_count: 0,
            available_at: now,
        }
    }

    /// Check if entry is available for delivery
    fn is_available(&self) -> bool {
        self.available_at.has_passed()
    }
}

/// An entry currently held by a consumer
struct InFlightMessage {
    message: StoredMessage,
    consumer: String,
    lease_expires_at: Timestamp,
}

impl InFlightMessage {
    fn is_expired(&self) -> bool {
        self.lease_expires_at.has_passed()
    }
}

// ============================================================================
// InMemoryProvider
// ============================================================================

/// In-memory queue provider implementation
pub struct InMemoryProvider {
    storage: Arc<RwLock<QueueStorage>>,
    config: InMemoryConfig,
}

impl InMemoryProvider {
    /// Create new in-memory provider with configuration
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            storage: Arc::new(RwLock::new(QueueStorage::new())),
            config,
        }
    }

    fn write_storage(&self) -> RwLockWriteGuard<'_, QueueStorage> {
        self.storage.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn not_found(receipt: &ReceiptHandle) -> QueueError {
        QueueError::MessageNotFound {
            receipt: receipt.to_string(),
        }
    }
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

#[async_trait]
impl QueueProvider for InMemoryProvider {
    async fn publish(&self, queue: &QueueName, body: Bytes) -> Result<(), QueueError> {
        let max_size = self.provider_type().max_message_size();
        if body.len() > max_size {
            return Err(QueueError::MessageTooLarge {
                size: body.len(),
                max_size,
            });
        }

        let mut storage = self.write_storage();
        let queue_state = storage.get_or_create_queue(queue);
        if queue_state.len() >= self.config.max_queue_size {
            return Err(QueueError::QueueFull {
                queue_name: queue.to_string(),
                max_size: self.config.max_queue_size,
            });
        }

        queue_state.ready.push_back(StoredMessage::new(body));
        Ok(())
    }

    async fn fetch(
        &self,
        queue: &QueueName,
        consumer: &str,
        max_deliveries: u32,
    ) -> Result<Vec<Delivery>, QueueError> {
        let policy = &self.config.redelivery;
        let mut storage = self.write_storage();
        let queue_state = storage.get_or_create_queue(queue);

        let reclaimed = queue_state.reclaim_expired(policy);
        if reclaimed > 0 {
            warn!(queue = %queue, reclaimed, "Reclaimed deliveries with expired leases");
        }

        let delivered_at = Timestamp::now();
        let lease_expires_at = Timestamp::after_millis(policy.visibility_timeout_ms);
        let mut deliveries = Vec::new();
        for mut message in queue_state.take_available(max_deliveries as usize) {
            message.delivery_count += 1;

            let handle = uuid::Uuid::new_v4().to_string();
            deliveries.push(Delivery {
                receipt_handle: ReceiptHandle::new(
                    handle.clone(),
                    queue.clone(),
                    consumer.to_string(),
                    ProviderType::InMemory,
                ),
                body: message.body.clone(),
                delivery_count: message.delivery_count,
                enqueued_at: message.enqueued_at.clone(),
                delivered_at: delivered_at.clone(),
            });

            queue_state.in_flight.insert(
                handle,
                InFlightMessage {
                    message,
                    consumer: consumer.to_string(),
                    lease_expires_at: lease_expires_at.clone(),
                },
            );
        }

        Ok(deliveries)
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut storage = self.write_storage();
        storage
            .queues
            .get_mut(receipt.queue())
            .and_then(|queue_state| queue_state.in_flight.remove(receipt.handle()))
            .map(|_| ())
            .ok_or_else(|| Self::not_found(receipt))
    }

    async fn reject(&self, receipt: &ReceiptHandle) -> Result<RejectOutcome, QueueError> {
        let mut storage = self.write_storage();
        let queue_state = storage
            .queues
            .get_mut(receipt.queue())
            .ok_or_else(|| Self::not_found(receipt))?;
        let in_flight = queue_state
            .in_flight
            .remove(receipt.handle())
            .ok_or_else(|| Self::not_found(receipt))?;

        let mut message = in_flight.message;
        let policy = &self.config.redelivery;
        if policy.should_dead_letter(message.delivery_count) {
            queue_state.dead_letter.push_back(message);
            return Ok(RejectOutcome::DeadLettered);
        }

        message.available_at = Timestamp::after_millis(policy.redelivery_delay_ms);
        let available_at = message.available_at.clone();
        queue_state.ready.push_back(message);
        Ok(RejectOutcome::Requeued { available_at })
    }

    async fn recover(&self, queue: &QueueName, consumer: &str) -> Result<usize, QueueError> {
        let mut storage = self.write_storage();
        let Some(queue_state) = storage.queues.get_mut(queue) else {
            return Ok(0);
        };

        let handles: Vec<String> = queue_state
            .in_flight
            .iter()
            .filter(|(_, in_flight)| in_flight.consumer == consumer)
            .map(|(handle, _)| handle.clone())
            .collect();

        let recovered: Vec<StoredMessage> = handles
            .iter()
            .filter_map(|handle| queue_state.in_flight.remove(handle))
            .map(|in_flight| in_flight.message)
            .collect();
        let count = recovered.len();

        // Recovered entries were fetched before anything still ready
        queue_state.return_to_ready(recovered);

        Ok(count)
    }

    async fn redrive_dead_letters(&self, queue: &QueueName) -> Result<usize, QueueError> {
        let mut storage = self.write_storage();
        let Some(queue_state) = storage.queues.get_mut(queue) else {
            return Ok(0);
        };

        let count = queue_state.dead_letter.len();
        while let Some(mut message) = queue_state.dead_letter.pop_front() {
            message.delivery_count = 0;
            message.available_at = Timestamp::now();
            queue_state.ready.push_back(message);
        }

        Ok(count)
    }

    async fn stats(&self, queue: &QueueName) -> Result<QueueStats, QueueError> {
        let storage = self.storage.read().unwrap_or_else(PoisonError::into_inner);
        Ok(storage
            .queues
            .get(queue)
            .map(|queue_state| QueueStats {
                ready: queue_state.ready.len(),
                unacked: queue_state.in_flight.len(),
                dead_lettered: queue_state.dead_letter.len(),
            })
            .unwrap_or_default())
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }
}
