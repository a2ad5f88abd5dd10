use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::dispatcher::{DispatchStatus, MessageDispatcher};
use crate::config::QueueConfig;
use crate::error::Result;
use crate::queue::{QueueName, QueueTransport};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Receive one batch from the work queue and dispatch every message in it.
/// Returns how many messages were received.
pub async fn process_batch(
    transport: &dyn QueueTransport,
    dispatcher: &dyn MessageDispatcher,
    config: &QueueConfig,
) -> Result<usize> {
    let messages = transport
        .receive(
            QueueName::Work,
            config.receive_batch_size.max(1),
            config.visibility_timeout(),
        )
        .await?;
    let received = messages.len();

    for message in messages {
        match dispatcher.dispatch(&message.body).await {
            DispatchStatus::Success => {
                transport.complete(QueueName::Work, &message).await?;
            }
            DispatchStatus::Retry { error } => {
                trace!(
                    message_id = %message.id,
                    dequeue_count = message.dequeue_count,
                    error = %error,
                    "leaving message for redelivery"
                );
            }
            DispatchStatus::DeadLetter { error } => {
                warn!(
                    message_id = %message.id,
                    error = %error,
                    "message can never be handled, moving to poison queue"
                );
                transport
                    .send(QueueName::Poison, message.body.clone(), Duration::ZERO)
                    .await?;
                transport.complete(QueueName::Work, &message).await?;
            }
        }
    }
    Ok(received)
}

/// Tasks polling the work queue until cancelled.
pub struct QueueWorkerPool {
    transport: Arc<dyn QueueTransport>,
    dispatcher: Arc<dyn MessageDispatcher>,
    config: QueueConfig,
    parallelism: usize,
    shutdown_token: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for QueueWorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueWorkerPool")
            .field("parallelism", &self.parallelism)
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl QueueWorkerPool {
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        dispatcher: Arc<dyn MessageDispatcher>,
        config: QueueConfig,
        parallelism: usize,
    ) -> Self {
        Self {
            transport,
            dispatcher,
            config,
            parallelism: parallelism.max(1),
            shutdown_token: CancellationToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    /// Token that stops every worker when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub async fn start(&self) {
        let worker_group = format!("feedscan-{}", std::process::id());
        let mut handles = self.worker_handles.lock().await;
        for i in 0..self.parallelism {
            let worker_id = format!("{worker_group}-w{i}");
            let transport = Arc::clone(&self.transport);
            let dispatcher = Arc::clone(&self.dispatcher);
            let config = self.config.clone();
            let shutdown = self.shutdown_token.clone();

            handles.push(tokio::spawn(async move {
                debug!(worker = %worker_id, "worker started");
                loop {
                    let batch = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        batch = process_batch(
                            transport.as_ref(),
                            dispatcher.as_ref(),
                            &config,
                        ) => batch,
                    };
                    let idle = match batch {
                        Ok(received) => received == 0,
                        Err(err) => {
                            warn!(worker = %worker_id, error = %err, "queue poll failed");
                            true
                        }
                    };
                    if idle {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(config.idle_backoff()) => {}
                        }
                    }
                }
                info!(worker = %worker_id, "worker shutting down");
            }));
        }
        info!(workers = self.parallelism, "queue worker pool started");
    }

    /// Resolves once the token is cancelled.
    pub async fn wait(&self) {
        self.shutdown_token.cancelled().await;
    }

    pub async fn shutdown(&self) {
        info!("stopping queue worker pool");
        self.shutdown_token.cancel();

        let handles = {
            let mut guard = self.worker_handles.lock().await;
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("worker task failed: {e:?}"),
                Err(_) => warn!("worker task timed out during shutdown"),
            }
        }
        info!("queue worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryQueue;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recording {
        seen: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageDispatcher for Recording {
        async fn dispatch(&self, body: &str) -> DispatchStatus {
            self.seen.lock().unwrap().push(body.to_string());
            match body {
                "retry" => DispatchStatus::Retry {
                    error: "later".into(),
                },
                "dead" => DispatchStatus::DeadLetter {
                    error: "never".into(),
                },
                _ => DispatchStatus::Success,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn batch_outcomes_route_messages() {
        let queue = InMemoryQueue::default();
        for body in ["ok", "retry", "dead"] {
            queue
                .send(QueueName::Work, body.into(), Duration::ZERO)
                .await
                .unwrap();
        }
        let dispatcher = Recording::default();

        let received = process_batch(&queue, &dispatcher, &QueueConfig::default())
            .await
            .unwrap();

        assert_eq!(received, 3);
        assert_eq!(queue.bodies(QueueName::Work).await, vec!["retry".to_string()]);
        assert_eq!(queue.bodies(QueueName::Poison).await, vec!["dead".to_string()]);
    }

    #[tokio::test]
    async fn pool_drains_queue_and_stops_on_cancel() {
        let queue = Arc::new(InMemoryQueue::default());
        for i in 0..20 {
            queue
                .send(QueueName::Work, format!("m{i}"), Duration::ZERO)
                .await
                .unwrap();
        }
        let dispatcher = Arc::new(Recording::default());
        let pool = QueueWorkerPool::new(
            queue.clone(),
            dispatcher.clone(),
            QueueConfig {
                idle_backoff_ms: 5,
                receive_batch_size: 3,
                ..QueueConfig::default()
            },
            3,
        );
        pool.start().await;

        for _ in 0..200 {
            if queue.approximate_count(QueueName::Work).await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pool.shutdown().await;

        assert_eq!(queue.approximate_count(QueueName::Work).await.unwrap(), 0);
        assert_eq!(dispatcher.seen.lock().unwrap().len(), 20);
    }
}
