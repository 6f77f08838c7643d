//! Polling consumer and the acknowledge/reject protocol.
//!
//! A consumer task polls its queue once per poll interval, fetching at most
//! one batch of deliveries. Deliveries in a batch are processed concurrently
//! and the next poll waits until the whole batch has been settled. For every
//! delivery the task decodes the message, invokes the processor and then
//! acknowledges (processor succeeded) or rejects (decode or processor
//! failure). Redelivery and dead-letter policy belong to the store.

use crate::client::QueueProvider;
use crate::error::{QueueError, ValidationError};
use crate::message::{Delivery, Message, QueueName, ReceiptHandle, RejectOutcome};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;

// ============================================================================
// Processor
// ============================================================================

/// Application logic invoked once per delivered message
///
/// Returning `Ok(())` acknowledges the delivery; returning an error rejects
/// it. The same message may be delivered more than once, so implementations
/// must tolerate repeated invocations for the same [`MessageId`]. Deliveries
/// of one batch may be processed concurrently.
///
/// Async closures taking a [`Message`] implement this trait:
///
/// ```rust
/// use std::sync::Arc;
/// use taskqueue_runtime::{Message, MessageProcessor};
///
/// let processor: Arc<dyn MessageProcessor> = Arc::new(|message: Message| async move {
///     println!("{} {}", message.id(), message.name());
///     Ok::<(), anyhow::Error>(())
/// });
/// ```
///
/// [`MessageId`]: crate::message::MessageId
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: Message) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageProcessor for F
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn process(&self, message: Message) -> anyhow::Result<()> {
        (self)(message).await
    }
}

// ============================================================================
// Options and Handle
// ============================================================================

/// Settings for a consumer registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    batch_size: u32,
    poll_interval: Duration,
}

impl ConsumeOptions {
    /// Create consume options with validation
    ///
    /// `batch_size` bounds how many deliveries are outstanding at once and
    /// `poll_interval` is the minimum time between two fetches.
    pub fn new(batch_size: u32, poll_interval: Duration) -> Result<Self, ValidationError> {
        if batch_size == 0 {
            return Err(ValidationError::OutOfRange {
                field: "batch_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if poll_interval.is_zero() {
            return Err(ValidationError::OutOfRange {
                field: "poll_interval".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        Ok(Self {
            batch_size,
            poll_interval,
        })
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// Lifecycle state of a consumer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerState {
    Running,
    /// Stopped because the connection was closed or dropped
    Stopped,
    /// Stopped because the store reported a non-transient error
    Failed(String),
}

impl ConsumerState {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

/// Handle to a running consumer registration
#[derive(Debug, Clone)]
pub struct ConsumerHandle {
    queue: QueueName,
    tag: String,
    state: watch::Receiver<ConsumerState>,
    acknowledged: watch::Receiver<u64>,
}

impl ConsumerHandle {
    pub(crate) fn new(
        queue: QueueName,
        tag: String,
        state: watch::Receiver<ConsumerState>,
        acknowledged: watch::Receiver<u64>,
    ) -> Self {
        Self {
            queue,
            tag,
            state,
            acknowledged,
        }
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// Tag identifying this consumer to the store
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn state(&self) -> ConsumerState {
        self.state.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.borrow().is_running()
    }

    /// Number of deliveries this consumer has acknowledged
    pub fn acknowledged(&self) -> u64 {
        *self.acknowledged.borrow()
    }

    /// Wait until at least `count` deliveries were acknowledged
    ///
    /// Returns the count reached, which is lower than `count` only when the
    /// consumer stopped first.
    pub async fn acknowledged_at_least(&self, count: u64) -> u64 {
        let mut acknowledged = self.acknowledged.clone();
        let reached = acknowledged.wait_for(|n| *n >= count).await.map(|n| *n);
        reached.unwrap_or_else(|_| self.acknowledged())
    }

    /// Wait until the consumer task has stopped and return its final state
    pub async fn stopped(&self) -> ConsumerState {
        let mut state = self.state.clone();
        let result = state
            .wait_for(|s| !s.is_running())
            .await
            .map(|final_state| final_state.clone());

        match result {
            Ok(final_state) => final_state,
            // Task went away without reporting, e.g. the runtime shut down
            Err(_) => match self.state() {
                ConsumerState::Running => ConsumerState::Stopped,
                other => other,
            },
        }
    }
}

/// Build a tag unique to one consumer registration
pub(crate) fn consumer_tag(queue: &QueueName) -> String {
    format!("taskqueue_{}_{}", queue, uuid::Uuid::new_v4().simple())
}

// ============================================================================
// Delivery Handling
// ============================================================================

/// Why a delivery was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Body could not be decoded into a message; processor was not invoked
    Undecodable,
    /// Processor returned an error or panicked
    ProcessingFailed,
}

/// Result of handling one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acknowledged,
    Rejected {
        reason: RejectReason,
        outcome: RejectOutcome,
    },
    /// The store refused the ack or reject; it stays unacknowledged until
    /// recovered
    Unsettled,
}

/// Decode, process and settle a single delivery
pub async fn handle_delivery(
    provider: &dyn QueueProvider,
    processor: &dyn MessageProcessor,
    delivery: Delivery,
) -> DeliveryOutcome {
    let receipt = delivery.receipt_handle;

    let message = match Message::decode(&delivery.body) {
        Ok(message) => message,
        Err(e) => {
            warn!(
                receipt = %receipt,
                delivery_count = delivery.delivery_count,
                error = %e,
                "Unable to decode delivery, rejecting"
            );
            return reject(provider, &receipt, RejectReason::Undecodable).await;
        }
    };

    debug!(
        queue = %receipt.queue(),
        message_id = %message.id(),
        name = message.name(),
        delivery_count = delivery.delivery_count,
        "Received message"
    );

    let message_id = message.id().clone();
    if let Err(e) = processor.process(message).await {
        warn!(
            queue = %receipt.queue(),
            message_id = %message_id,
            delivery_count = delivery.delivery_count,
            error = %e,
            "Processor failed, rejecting message"
        );
        return reject(provider, &receipt, RejectReason::ProcessingFailed).await;
    }

    match provider.acknowledge(&receipt).await {
        Ok(()) => {
            debug!(queue = %receipt.queue(), message_id = %message_id, "Acknowledged message");
            DeliveryOutcome::Acknowledged
        }
        Err(e) => {
            warn!(
                queue = %receipt.queue(),
                message_id = %message_id,
                error = %e,
                "Failed to acknowledge message"
            );
            DeliveryOutcome::Unsettled
        }
    }
}

async fn reject(
    provider: &dyn QueueProvider,
    receipt: &ReceiptHandle,
    reason: RejectReason,
) -> DeliveryOutcome {
    match provider.reject(receipt).await {
        Ok(outcome) => {
            if outcome == RejectOutcome::DeadLettered {
                warn!(receipt = %receipt, ?reason, "Delivery moved to dead-letter queue");
            } else {
                debug!(receipt = %receipt, ?reason, "Rejected delivery");
            }
            DeliveryOutcome::Rejected { reason, outcome }
        }
        Err(e) => {
            warn!(receipt = %receipt, error = %e, "Failed to reject delivery");
            DeliveryOutcome::Unsettled
        }
    }
}

// ============================================================================
// Polling Loop
// ============================================================================

type InFlight = VecDeque<(ReceiptHandle, JoinHandle<DeliveryOutcome>)>;

/// Body of a consumer task; runs until shutdown or a fatal store error
pub(crate) async fn run_consumer(
    provider: Arc<dyn QueueProvider>,
    queue: QueueName,
    tag: String,
    options: ConsumeOptions,
    processor: Arc<dyn MessageProcessor>,
    mut shutdown: watch::Receiver<bool>,
    state: watch::Sender<ConsumerState>,
    acknowledged: watch::Sender<u64>,
) {
    let final_state = poll_loop(
        provider,
        &queue,
        &tag,
        options,
        processor,
        &mut shutdown,
        Arc::new(acknowledged),
    )
    .await;

    if let ConsumerState::Failed(ref reason) = final_state {
        error!(queue = %queue, consumer = %tag, reason = %reason, "Consumer failed");
    } else {
        info!(queue = %queue, consumer = %tag, "Consumer loop finished");
    }
    state.send_replace(final_state);
}

async fn poll_loop(
    provider: Arc<dyn QueueProvider>,
    queue: &QueueName,
    tag: &str,
    options: ConsumeOptions,
    processor: Arc<dyn MessageProcessor>,
    shutdown: &mut watch::Receiver<bool>,
    acknowledged: Arc<watch::Sender<u64>>,
) -> ConsumerState {
    let mut ticker = tokio::time::interval(options.poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_signalled(shutdown) => return ConsumerState::Stopped,
            _ = ticker.tick() => {}
        }

        let deliveries = match provider.fetch(queue, tag, options.batch_size()).await {
            Ok(deliveries) => deliveries,
            Err(e) if e.is_transient() => {
                warn!(queue = %queue, consumer = %tag, error = %e, "Fetch failed, retrying on next poll");
                continue;
            }
            Err(e) => return ConsumerState::Failed(e.to_string()),
        };

        if deliveries.is_empty() {
            continue;
        }

        let mut in_flight: InFlight = deliveries
            .into_iter()
            .map(|delivery| {
                let receipt = delivery.receipt_handle.clone();
                let provider = Arc::clone(&provider);
                let processor = Arc::clone(&processor);
                let acknowledged = Arc::clone(&acknowledged);
                let task = tokio::spawn(async move {
                    let outcome =
                        handle_delivery(provider.as_ref(), processor.as_ref(), delivery).await;
                    if outcome == DeliveryOutcome::Acknowledged {
                        acknowledged.send_modify(|count| *count += 1);
                    }
                    outcome
                });
                (receipt, task)
            })
            .collect();

        let interrupted = tokio::select! {
            biased;
            _ = shutdown_signalled(shutdown) => true,
            _ = settle_batch(provider.as_ref(), &mut in_flight) => false,
        };

        if interrupted {
            // Unsettled deliveries stay with this consumer and are recovered
            // by the connection once the task has exited.
            for (_, task) in &in_flight {
                task.abort();
            }
            for (_, task) in in_flight {
                let _ = task.await;
            }
            return ConsumerState::Stopped;
        }
    }
}

/// Wait for every delivery of a batch to be handled
async fn settle_batch(provider: &dyn QueueProvider, in_flight: &mut InFlight) {
    while let Some((_, task)) = in_flight.front_mut() {
        let result = task.await;
        let Some((receipt, _)) = in_flight.pop_front() else {
            break;
        };

        if let Err(e) = result {
            if e.is_panic() {
                error!(receipt = %receipt, "Processor panicked, rejecting delivery");
                reject(provider, &receipt, RejectReason::ProcessingFailed).await;
            }
        }
    }
}

/// Resolves once shutdown was requested or the connection was dropped
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|closed| *closed).await;
}
