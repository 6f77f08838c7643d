//! Connection to a backing store.
//!
//! A [`Connection`] is an explicitly owned handle shared by the producer and
//! consumer paths of every queue opened on it. It also owns the lifecycle of
//! the background consumer tasks: closing the connection stops them and hands
//! their unacknowledged deliveries back to the store.

use crate::client::{QueueProvider, StandardQueue};
use crate::consumer::{self, ConsumeOptions, ConsumerHandle, ConsumerState, MessageProcessor};
use crate::error::QueueError;
use crate::message::QueueName;
use crate::provider::{ConnectionConfig, ProviderConfig};
use crate::providers::{FilesystemProvider, InMemoryProvider};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;

/// Handle to a backing store
///
/// Cloning is cheap; all clones refer to the same connection. Dropping every
/// clone (and every queue opened on it) stops the consumer tasks, but only
/// [`Connection::close`] waits for them and recovers in-flight deliveries.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Open a connection using the configured provider
    pub async fn open(config: &ConnectionConfig) -> Result<Self, QueueError> {
        config.validate()?;

        let provider: Arc<dyn QueueProvider> = match &config.provider {
            ProviderConfig::InMemory(in_memory_config) => {
                Arc::new(InMemoryProvider::new(in_memory_config.clone()))
            }
            ProviderConfig::Filesystem(filesystem_config) => {
                Arc::new(FilesystemProvider::open(filesystem_config.clone()).await?)
            }
        };

        info!(provider = %provider.provider_type(), "Opened queue connection");
        Ok(Self::with_provider(provider))
    }

    /// Wrap an existing provider
    ///
    /// Several connections may share one provider, which is how independent
    /// processes attached to the same store are modelled in tests.
    pub fn with_provider(provider: Arc<dyn QueueProvider>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ConnectionInner {
                provider,
                closed: AtomicBool::new(false),
                shutdown,
                consumers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Open a queue handle on this connection
    pub fn open_queue(&self, queue_name: QueueName) -> StandardQueue {
        StandardQueue::new(Arc::clone(&self.inner), queue_name)
    }

    /// Get the underlying provider
    pub fn provider(&self) -> Arc<dyn QueueProvider> {
        Arc::clone(&self.inner.provider)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Close the connection
    ///
    /// Producer calls fail with [`QueueError::ConnectionClosed`] afterwards.
    /// Every consumer task is signalled and awaited, so no processor call
    /// starts once this returns. Deliveries the consumers had not settled are
    /// returned to the store for redelivery. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), QueueError> {
        let consumers = {
            let mut consumers = self
                .inner
                .consumers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            self.inner.shutdown.send_replace(true);
            std::mem::take(&mut *consumers)
        };

        let mut first_error = None;
        for consumer in consumers {
            if let Err(e) = consumer.task.await {
                warn!(consumer = %consumer.tag, error = %e, "Consumer task ended abnormally");
            }

            match self
                .inner
                .provider
                .recover(&consumer.queue, &consumer.tag)
                .await
            {
                Ok(recovered) => {
                    info!(
                        queue = %consumer.queue,
                        consumer = %consumer.tag,
                        recovered,
                        "Consumer stopped"
                    );
                }
                Err(e) => {
                    warn!(
                        queue = %consumer.queue,
                        consumer = %consumer.tag,
                        error = %e,
                        "Failed to recover unacknowledged deliveries"
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        info!("Closed queue connection");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Consumer task owned by a connection
struct RegisteredConsumer {
    queue: QueueName,
    tag: String,
    task: JoinHandle<()>,
}

pub(crate) struct ConnectionInner {
    provider: Arc<dyn QueueProvider>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
    consumers: Mutex<Vec<RegisteredConsumer>>,
}

impl ConnectionInner {
    pub(crate) fn provider(&self) -> &dyn QueueProvider {
        self.provider.as_ref()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_open(&self) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::ConnectionClosed);
        }
        Ok(())
    }

    /// Spawn a polling task for `queue` and register it with this connection
    pub(crate) fn spawn_consumer(
        &self,
        queue: QueueName,
        tag: String,
        options: ConsumeOptions,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<ConsumerHandle, QueueError> {
        // Registration and close share this lock, so a consumer is either
        // seen by close() or refused here.
        let mut consumers = self
            .consumers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.ensure_open()?;

        let (state_tx, state_rx) = watch::channel(ConsumerState::Running);
        let (acked_tx, acked_rx) = watch::channel(0);
        let task = tokio::spawn(consumer::run_consumer(
            Arc::clone(&self.provider),
            queue.clone(),
            tag.clone(),
            options,
            processor,
            self.shutdown.subscribe(),
            state_tx,
            acked_tx,
        ));

        info!(
            queue = %queue,
            consumer = %tag,
            batch_size = options.batch_size(),
            poll_interval_ms = options.poll_interval().as_millis() as u64,
            "Started consuming"
        );

        consumers.push(RegisteredConsumer {
            queue: queue.clone(),
            tag: tag.clone(),
            task,
        });

        Ok(ConsumerHandle::new(queue, tag, state_rx, acked_rx))
    }
}
