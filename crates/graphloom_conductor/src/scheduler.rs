//! Delayed-queue scheduler.
//!
//! Delayed items (retries) sit in a per-queue sorted set until their
//! ready time; this loop migrates ripe items into their queue at
//! least every 5 seconds.

use graphloom_kv::{KvError, QueueBroker};
use graphloom_protocol::defaults::SCHEDULER_INTERVAL_SECS;
use graphloom_protocol::QueueName;
use std::time::Duration;
use tracing::{debug, error, info};

pub struct DelayedScheduler {
    broker: QueueBroker,
}

impl DelayedScheduler {
    pub fn new(broker: QueueBroker) -> Self {
        Self { broker }
    }

    /// Promote ripe items across all queues. Returns the total moved.
    pub async fn promote_once(&self) -> Result<usize, KvError> {
        let mut promoted = 0;
        for queue in QueueName::ALL {
            promoted += self.broker.promote_scheduled(queue).await?;
        }
        if promoted > 0 {
            debug!(promoted, "promoted delayed items");
        }
        Ok(promoted)
    }

    pub async fn run(&self) {
        info!(
            interval_secs = SCHEDULER_INTERVAL_SECS,
            "delayed-queue scheduler running"
        );
        loop {
            if let Err(err) = self.promote_once().await {
                error!(%err, "scheduler promotion failed");
            }
            tokio::time::sleep(Duration::from_secs(SCHEDULER_INTERVAL_SECS)).await;
        }
    }
}
