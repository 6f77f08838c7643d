//! Client traits and the standard queue implementation.
//!
//! [`Queue`] is the contract producers and consumers program against.
//! [`QueueProvider`] is the boundary to the backing store that actually holds
//! the entries. [`StandardQueue`] implements the former on top of the latter.

use crate::connection::ConnectionInner;
use crate::consumer::{self, ConsumeOptions, ConsumerHandle, MessageProcessor};
use crate::error::QueueError;
use crate::message::{
    Delivery, MessageId, NewMessage, QueueName, QueueStats, ReceiptHandle, RejectOutcome,
};
use crate::provider::ProviderType;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// Producer and consumer contract for a single queue
#[async_trait]
pub trait Queue: Send + Sync {
    /// Add a message built from a name and raw payload bytes
    async fn add(&self, name: &str, payload: &[u8]) -> Result<MessageId, QueueError>;

    /// Add a message, assigning it a fresh identity
    async fn add_message(&self, message: NewMessage) -> Result<MessageId, QueueError>;

    /// Register `processor` as the consumer for this queue
    ///
    /// Returns as soon as the background polling task has been started.
    async fn start_consuming(
        &self,
        options: ConsumeOptions,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<ConsumerHandle, QueueError>;
}

/// Interface implemented by backing stores
///
/// Implementations must be safe for concurrent use by several producers and
/// consumers. Entries move between three sets: ready, unacknowledged (owned by
/// the consumer that fetched them) and dead-lettered.
#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Durably store a new entry in the ready set
    async fn publish(&self, queue: &QueueName, body: Bytes) -> Result<(), QueueError>;

    /// Move up to `max_deliveries` available ready entries to `consumer`
    async fn fetch(
        &self,
        queue: &QueueName,
        consumer: &str,
        max_deliveries: u32,
    ) -> Result<Vec<Delivery>, QueueError>;

    /// Permanently remove a delivered entry
    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Return a delivered entry for redelivery or dead-letter it
    async fn reject(&self, receipt: &ReceiptHandle) -> Result<RejectOutcome, QueueError>;

    /// Return every entry still held by `consumer` to the ready set
    async fn recover(&self, queue: &QueueName, consumer: &str) -> Result<usize, QueueError>;

    /// Move dead-lettered entries back to the ready set
    async fn redrive_dead_letters(&self, queue: &QueueName) -> Result<usize, QueueError>;

    /// Get entry counts for a queue
    async fn stats(&self, queue: &QueueName) -> Result<QueueStats, QueueError>;

    /// Get provider type
    fn provider_type(&self) -> ProviderType;
}

/// Standard queue implementation bound to a connection
///
/// Created through [`Connection::open_queue`](crate::Connection::open_queue).
/// Each handle supports at most one consumer registration.
pub struct StandardQueue {
    connection: Arc<ConnectionInner>,
    queue_name: QueueName,
    consumer_tag: Mutex<Option<String>>,
}

impl StandardQueue {
    pub(crate) fn new(connection: Arc<ConnectionInner>, queue_name: QueueName) -> Self {
        Self {
            connection,
            queue_name,
            consumer_tag: Mutex::new(None),
        }
    }

    /// Get the queue name
    pub fn name(&self) -> &QueueName {
        &self.queue_name
    }

    /// Get entry counts from the backing store
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.connection.ensure_open()?;
        self.connection.provider().stats(&self.queue_name).await
    }

    /// Move dead-lettered entries back to the ready set
    pub async fn redrive_dead_letters(&self) -> Result<usize, QueueError> {
        self.connection.ensure_open()?;
        let count = self
            .connection
            .provider()
            .redrive_dead_letters(&self.queue_name)
            .await?;
        info!(queue = %self.queue_name, count, "Redrove dead-lettered messages");
        Ok(count)
    }
}

#[async_trait]
impl Queue for StandardQueue {
    async fn add(&self, name: &str, payload: &[u8]) -> Result<MessageId, QueueError> {
        let message = NewMessage::from_bytes(name, payload)?;
        self.add_message(message).await
    }

    async fn add_message(&self, message: NewMessage) -> Result<MessageId, QueueError> {
        self.connection.ensure_open()?;

        let message_id = MessageId::generate();
        let message = message.into_message(message_id.clone());
        let body = message.encode()?;

        self.connection
            .provider()
            .publish(&self.queue_name, body)
            .await?;

        info!(
            queue = %self.queue_name,
            message_id = %message_id,
            name = message.name(),
            "Added message to queue"
        );
        debug!(message_id = %message_id, payload = message.payload(), "Message payload");

        Ok(message_id)
    }

    async fn start_consuming(
        &self,
        options: ConsumeOptions,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<ConsumerHandle, QueueError> {
        let mut registered = self
            .consumer_tag
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if registered.is_some() {
            return Err(QueueError::ConsumerAlreadyRegistered {
                queue_name: self.queue_name.to_string(),
            });
        }

        let tag = consumer::consumer_tag(&self.queue_name);
        let handle = self.connection.spawn_consumer(
            self.queue_name.clone(),
            tag.clone(),
            options,
            processor,
        )?;

        *registered = Some(tag);
        Ok(handle)
    }
}
