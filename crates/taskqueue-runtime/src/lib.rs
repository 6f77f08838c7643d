//! # Taskqueue Runtime
//!
//! At-least-once work queues with pluggable backing stores.
//!
//! Producers add named messages to a queue and get back the identity assigned
//! to each one. A consumer registers a processor with a queue; a background
//! task polls the store, invokes the processor for every delivery and then
//! acknowledges or rejects it. Rejected deliveries are redelivered by the
//! store until their delivery budget is spent, after which they move to a
//! dead-letter set.
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all queue operations
//! - [`message`] - Messages, identifiers and delivery records
//! - [`provider`] - Provider types, redelivery policy and configuration
//! - [`client`] - Queue and provider traits plus the standard queue
//! - [`connection`] - Connection lifecycle and consumer task ownership
//! - [`consumer`] - Polling loop and the acknowledge/reject protocol
//! - [`providers`] - In-memory and filesystem backing stores
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use taskqueue_runtime::{
//!     Connection, ConnectionConfig, ConsumeOptions, Message, Queue, QueueName,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connection = Connection::open(&ConnectionConfig::default()).await?;
//! let queue = connection.open_queue(QueueName::new("products".to_string())?);
//!
//! queue.add("new.product", br#"{"sku":"A-1"}"#).await?;
//!
//! let options = ConsumeOptions::new(10, Duration::from_millis(100))?;
//! queue
//!     .start_consuming(
//!         options,
//!         Arc::new(|message: Message| async move {
//!             println!("{}: {}", message.name(), message.payload());
//!             Ok::<(), anyhow::Error>(())
//!         }),
//!     )
//!     .await?;
//!
//! connection.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod consumer;
pub mod error;
pub mod message;
pub mod provider;
pub mod providers;

// Re-export commonly used types at crate root for convenience
pub use client::{Queue, QueueProvider, StandardQueue};
pub use connection::Connection;
pub use consumer::{
    handle_delivery, ConsumeOptions, ConsumerHandle, ConsumerState, DeliveryOutcome,
    MessageProcessor, RejectReason,
};
pub use error::{ConfigurationError, QueueError, SerializationError, ValidationError};
pub use message::{
    Delivery, Message, MessageId, NewMessage, QueueName, QueueStats, ReceiptHandle,
    RejectOutcome, Timestamp,
};
pub use provider::{
    ConnectionConfig, FilesystemConfig, InMemoryConfig, ProviderConfig, ProviderType,
    RedeliveryPolicy,
};
pub use providers::{FilesystemProvider, InMemoryProvider};
