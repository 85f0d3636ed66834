//! Outbound delivery queue and worker pool
//!
//! Producers push signed messages onto a bounded channel without blocking;
//! a fixed pool of workers drains it, capping in-flight requests with a
//! shared semaphore and retrying retryable failures with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;

use super::delivery::{DeliveryTransport, SignedMessage, attempt_label, send_with_timeout};
use crate::config::DeliveryConfig;
use crate::error::AppError;
use crate::metrics;

/// Create a bounded delivery queue.
///
/// # Panics
/// If `capacity` is zero (rejected earlier by config validation).
pub fn delivery_queue(capacity: usize) -> (DeliveryQueue, DeliveryQueueReceiver) {
    let (sender, receiver) = mpsc::channel(capacity);
    (
        DeliveryQueue { sender },
        DeliveryQueueReceiver {
            inner: Arc::new(Mutex::new(receiver)),
        },
    )
}

/// Producer side of the outbound queue
#[derive(Clone)]
pub struct DeliveryQueue {
    sender: mpsc::Sender<SignedMessage>,
}

impl DeliveryQueue {
    /// Enqueue without waiting.
    ///
    /// # Errors
    /// `QueueFull` at capacity, `QueueClosed` when no receiver remains.
    pub fn enqueue(&self, message: SignedMessage) -> Result<(), AppError> {
        match self.sender.try_send(message) {
            Ok(()) => {
                metrics::DELIVERY_QUEUE_DEPTH.inc();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(AppError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(AppError::QueueClosed),
        }
    }

    /// Messages waiting to be picked up
    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }
}

/// Consumer side, shared by all workers
#[derive(Clone)]
pub struct DeliveryQueueReceiver {
    inner: Arc<Mutex<mpsc::Receiver<SignedMessage>>>,
}

impl DeliveryQueueReceiver {
    /// Next message; `None` once every producer is gone and the queue drained.
    pub async fn recv(&self) -> Option<SignedMessage> {
        let message = self.inner.lock().await.recv().await;
        if message.is_some() {
            metrics::DELIVERY_QUEUE_DEPTH.dec();
        }
        message
    }
}

/// Exponential backoff schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Wait after failed attempt number `attempt` (1-based):
    /// `base_delay * 2^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Final state of a queued delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Remote accepted with this 2xx status
    Delivered(u16),
    /// Remote refused for good
    Rejected {
        status: Option<u16>,
        message: String,
    },
    /// Still failing after the last allowed attempt
    Exhausted {
        status: Option<u16>,
        message: String,
    },
    /// Shutdown interrupted the retry schedule
    Abandoned,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered(_) => "delivered",
            Self::Rejected { .. } => "rejected",
            Self::Exhausted { .. } => "exhausted",
            Self::Abandoned => "abandoned",
        }
    }
}

/// Reported once per dequeued message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub uri: String,
    pub attempt_count: u32,
    pub final_status: DeliveryStatus,
}

/// Receives delivery outcomes
pub trait DeliveryObserver: Send + Sync {
    fn on_outcome(&self, outcome: &DeliveryOutcome);
}

/// Logs outcomes and counts them in metrics
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl DeliveryObserver for TracingObserver {
    fn on_outcome(&self, outcome: &DeliveryOutcome) {
        metrics::DELIVERIES_TOTAL
            .with_label_values(&[outcome.final_status.as_str()])
            .inc();

        match &outcome.final_status {
            DeliveryStatus::Delivered(status) => tracing::info!(
                uri = %outcome.uri,
                status,
                attempts = outcome.attempt_count,
                "Successfully delivered activity"
            ),
            DeliveryStatus::Rejected { status, message }
            | DeliveryStatus::Exhausted { status, message } => tracing::warn!(
                uri = %outcome.uri,
                status = ?status,
                attempts = outcome.attempt_count,
                outcome = outcome.final_status.as_str(),
                "Delivery dropped: {}",
                message
            ),
            DeliveryStatus::Abandoned => tracing::warn!(
                uri = %outcome.uri,
                attempts = outcome.attempt_count,
                "Delivery abandoned at shutdown"
            ),
        }
    }
}

/// Fixed pool of delivery workers
///
/// Dropping the pool without [`DeliveryWorkerPool::shutdown`] detaches the
/// workers: they keep draining the queue and exit once every
/// [`DeliveryQueue`] handle is gone.
pub struct DeliveryWorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl DeliveryWorkerPool {
    /// Spawn `config.workers` workers on the current runtime.
    pub fn spawn(
        receiver: DeliveryQueueReceiver,
        transport: Arc<dyn DeliveryTransport>,
        observer: Arc<dyn DeliveryObserver>,
        config: &DeliveryConfig,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        let retry = RetryPolicy::from_config(config);
        let workers = config.workers.max(1);

        let handles = (0..workers)
            .map(|worker_id| {
                let worker = Worker {
                    id: worker_id,
                    receiver: receiver.clone(),
                    transport: transport.clone(),
                    observer: observer.clone(),
                    semaphore: semaphore.clone(),
                    retry,
                    shutdown: shutdown_rx.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        tracing::info!(
            workers,
            max_concurrent = config.max_concurrent,
            max_attempts = retry.max_attempts,
            "Delivery workers started"
        );

        Self { handles, shutdown }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Stop taking new messages and wait for workers to finish their current
    /// attempt.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                tracing::error!("Delivery worker panicked: {}", e);
            }
        }
        tracing::info!("Delivery workers stopped");
    }
}

/// Resolves once `shutdown()` has been called.
///
/// A dropped pool closes the channel without a request, which never resolves.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

struct Worker {
    id: usize,
    receiver: DeliveryQueueReceiver,
    transport: Arc<dyn DeliveryTransport>,
    observer: Arc<dyn DeliveryObserver>,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    async fn run(mut self) {
        tracing::debug!(worker = self.id, "Delivery worker running");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let message = tokio::select! {
                _ = shutdown_requested(&mut self.shutdown) => break,
                message = self.receiver.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            let outcome = self.deliver(&message).await;
            self.observer.on_outcome(&outcome);
        }
        tracing::debug!(worker = self.id, "Delivery worker exiting");
    }

    async fn deliver(&mut self, message: &SignedMessage) -> DeliveryOutcome {
        let mut attempt = 0;
        let final_status = loop {
            attempt += 1;

            let result = {
                let Ok(_permit) = self.semaphore.acquire().await else {
                    break DeliveryStatus::Abandoned;
                };
                send_with_timeout(self.transport.as_ref(), message).await
            };
            metrics::DELIVERY_ATTEMPTS_TOTAL
                .with_label_values(&["async", attempt_label(&result)])
                .inc();

            let (retryable, status, reason) = match result {
                Ok(status) => break DeliveryStatus::Delivered(status),
                Err(AppError::Delivery {
                    retryable,
                    status,
                    message,
                }) => (retryable, status, message),
                Err(e) => (false, None, e.to_string()),
            };

            if !retryable {
                break DeliveryStatus::Rejected {
                    status,
                    message: reason,
                };
            }
            if attempt >= self.retry.max_attempts {
                break DeliveryStatus::Exhausted {
                    status,
                    message: reason,
                };
            }

            let delay = self.retry.delay_for(attempt);
            tracing::debug!(
                uri = %message.uri,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying delivery: {}",
                reason
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown_requested(&mut self.shutdown) => break DeliveryStatus::Abandoned,
            }
        };

        DeliveryOutcome {
            uri: message.uri.to_string(),
            attempt_count: attempt,
            final_status,
        }
    }
}
