//! Feed consumers and their supervisors.
//!
//! One task per feed pulls one message at a time, applies it to the
//! replica store and acks. A message that fails to decode or apply is
//! nacked and redelivered; it is never dropped. When the subscription
//! itself fails the supervisor resubscribes with exponential backoff, up
//! to a bounded number of consecutive restarts.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, Subscription};
use crate::envelope::{Exchanges, Feed, ReplicaEvent};
use crate::error::Result;
use crate::store::{Applied, ReplicaStore};

#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    /// Consecutive failed runs before the feed is abandoned.
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Pause before a nacked message is handed back to the broker.
    pub redelivery_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            redelivery_delay: Duration::from_secs(1),
        }
    }
}

impl RestartPolicy {
    /// Delay before restart number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Consumes one feed into the replica store.
#[derive(Clone)]
pub struct FeedConsumer {
    feed: Feed,
    exchange: String,
    queue: String,
    broker: Arc<dyn Broker>,
    store: ReplicaStore,
    redelivery_delay: Duration,
}

impl FeedConsumer {
    pub fn new(
        feed: Feed,
        exchanges: &Exchanges,
        service: &str,
        broker: Arc<dyn Broker>,
        store: ReplicaStore,
    ) -> Self {
        Self {
            feed,
            exchange: exchanges.name(feed).to_string(),
            queue: exchanges.queue(feed, service),
            broker,
            store,
            redelivery_delay: RestartPolicy::default().redelivery_delay,
        }
    }

    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    pub fn feed(&self) -> Feed {
        self.feed
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Decode and apply one payload.
    pub async fn handle(&self, payload: &[u8]) -> Result<Applied> {
        let event = ReplicaEvent::decode(self.feed, payload)?;
        self.store.apply(&event).await
    }

    /// Subscribe and consume until the broker closes or the subscription
    /// fails. `applied` counts messages acked during this run.
    pub async fn run(&self, applied: &mut u64) -> Result<()> {
        let mut subscription = self.broker.subscribe(&self.exchange, &self.queue).await?;
        info!(feed = %self.feed, "Consuming from {}", self.queue);

        self.consume(subscription.as_mut(), applied).await
    }

    async fn consume(&self, subscription: &mut dyn Subscription, applied: &mut u64) -> Result<()> {
        while let Some(delivery) = subscription.next().await? {
            if delivery.redelivered {
                debug!(feed = %self.feed, tag = delivery.tag, "Redelivered message");
            }

            match self.handle(&delivery.payload).await {
                Ok(_) => {
                    subscription.ack(delivery.tag).await?;
                    *applied += 1;
                }
                Err(e) => {
                    warn!(feed = %self.feed, "Rejecting message for redelivery: {}", e);
                    sleep(self.redelivery_delay).await;
                    subscription.nack(delivery.tag).await?;
                }
            }
        }

        info!(feed = %self.feed, "Broker closed, consumer stopping");
        Ok(())
    }
}

/// Run a feed consumer under supervision on its own task.
pub fn spawn_feed(consumer: FeedConsumer, policy: RestartPolicy) -> JoinHandle<()> {
    tokio::spawn(supervise(consumer, policy))
}

/// Spawn a supervised consumer for every feed.
pub fn spawn_all(
    exchanges: &Exchanges,
    service: &str,
    broker: Arc<dyn Broker>,
    store: ReplicaStore,
    policy: RestartPolicy,
) -> Vec<JoinHandle<()>> {
    Feed::ALL
        .iter()
        .map(|feed| {
            let consumer =
                FeedConsumer::new(*feed, exchanges, service, broker.clone(), store.clone())
                    .with_redelivery_delay(policy.redelivery_delay);
            spawn_feed(consumer, policy)
        })
        .collect()
}

async fn supervise(consumer: FeedConsumer, policy: RestartPolicy) {
    let feed = consumer.feed();
    let mut failures = 0u32;

    loop {
        let mut applied = 0u64;
        match consumer.run(&mut applied).await {
            Ok(()) => {
                info!(%feed, "Feed consumer finished");
                return;
            }
            Err(e) => {
                if applied > 0 {
                    failures = 0;
                }
                failures += 1;

                if failures > policy.max_restarts {
                    error!(
                        %feed,
                        "Feed consumer still failing after {} restarts, giving up: {}",
                        policy.max_restarts,
                        e
                    );
                    return;
                }

                let backoff = policy.backoff(failures);
                warn!(
                    %feed,
                    attempt = failures,
                    backoff_ms = backoff.as_millis() as u64,
                    "Feed consumer failed, restarting: {}",
                    e
                );
                sleep(backoff).await;
            }
        }
    }
}
