//! Broker connection seam.
//!
//! A [`Broker`] is an explicitly owned connection: it is created once,
//! shared as `Arc<dyn Broker>` with publishers and feed consumers, and
//! closed on shutdown. Exchanges are durable fanouts; each consuming
//! service owns one durable queue per exchange and receives one message at
//! a time (prefetch 1) until it acks or nacks.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{ReplicationError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: u64,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a persistent message to every queue bound to `exchange`.
    async fn publish(&self, exchange: &str, payload: Vec<u8>) -> Result<()>;

    /// Declare `queue`, bind it to `exchange` and start consuming.
    async fn subscribe(&self, exchange: &str, queue: &str) -> Result<Box<dyn Subscription>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery. `None` once the broker was closed.
    async fn next(&mut self) -> Result<Option<Delivery>>;

    async fn ack(&mut self, tag: u64) -> Result<()>;

    /// Reject and requeue at the head of the queue.
    async fn nack(&mut self, tag: u64) -> Result<()>;
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Delivery>,
    unacked: Option<Delivery>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct BrokerState {
    // exchange -> queue name -> queue
    exchanges: HashMap<String, HashMap<String, QueueState>>,
    next_tag: u64,
    closed: bool,
}

/// In-process fanout broker with durable queues.
///
/// Queues outlive their subscriptions: messages published while no
/// consumer is attached wait for the next `subscribe`, and an unacked
/// message is requeued when its subscription is dropped.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        lock(&self.state)
    }

    /// Messages waiting in `queue`, including one in flight.
    pub fn depth(&self, exchange: &str, queue: &str) -> usize {
        self.state()
            .exchanges
            .get(exchange)
            .and_then(|queues| queues.get(queue))
            .map(|q| q.ready.len() + usize::from(q.unacked.is_some()))
            .unwrap_or(0)
    }

    pub fn has_queue(&self, exchange: &str, queue: &str) -> bool {
        self.state()
            .exchanges
            .get(exchange)
            .is_some_and(|queues| queues.contains_key(queue))
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unavailable() -> ReplicationError {
    ReplicationError::BrokerUnavailable("connection closed".to_string())
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, exchange: &str, payload: Vec<u8>) -> Result<()> {
        let mut state = self.state();
        if state.closed {
            return Err(unavailable());
        }

        let queues = state.exchanges.entry(exchange.to_string()).or_default();
        let targets: Vec<String> = queues.keys().cloned().collect();
        if targets.is_empty() {
            debug!("No queue bound to {}, message dropped", exchange);
            return Ok(());
        }

        for name in targets {
            state.next_tag += 1;
            let tag = state.next_tag;
            if let Some(queue) = state
                .exchanges
                .get_mut(exchange)
                .and_then(|queues| queues.get_mut(&name))
            {
                queue.ready.push_back(Delivery {
                    tag,
                    payload: payload.clone(),
                    redelivered: false,
                });
                queue.notify.notify_one();
            }
        }
        Ok(())
    }

    async fn subscribe(&self, exchange: &str, queue: &str) -> Result<Box<dyn Subscription>> {
        let mut state = self.state();
        if state.closed {
            return Err(unavailable());
        }

        let notify = state
            .exchanges
            .entry(exchange.to_string())
            .or_default()
            .entry(queue.to_string())
            .or_default()
            .notify
            .clone();

        Ok(Box::new(MemorySubscription {
            state: self.state.clone(),
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            notify,
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state();
        state.closed = true;
        for queues in state.exchanges.values() {
            for queue in queues.values() {
                queue.notify.notify_waiters();
            }
        }
        Ok(())
    }
}

struct MemorySubscription {
    state: Arc<Mutex<BrokerState>>,
    exchange: String,
    queue: String,
    notify: Arc<Notify>,
}

impl MemorySubscription {
    fn with_queue<R>(&self, f: impl FnOnce(&mut QueueState) -> R) -> Option<R> {
        let mut state = lock(&self.state);
        state
            .exchanges
            .get_mut(&self.exchange)
            .and_then(|queues| queues.get_mut(&self.queue))
            .map(f)
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Result<Option<Delivery>> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = lock(&self.state);
                if state.closed {
                    return Ok(None);
                }
                let queue = state
                    .exchanges
                    .get_mut(&self.exchange)
                    .and_then(|queues| queues.get_mut(&self.queue))
                    .ok_or_else(unavailable)?;

                if queue.unacked.is_none() {
                    if let Some(delivery) = queue.ready.pop_front() {
                        queue.unacked = Some(delivery.clone());
                        return Ok(Some(delivery));
                    }
                }
            }
            notified.await;
        }
    }

    async fn ack(&mut self, tag: u64) -> Result<()> {
        let acked = self
            .with_queue(|queue| {
                if queue.unacked.as_ref().map(|d| d.tag) != Some(tag) {
                    return false;
                }
                queue.unacked = None;
                queue.notify.notify_one();
                true
            })
            .ok_or_else(unavailable)?;

        if acked {
            Ok(())
        } else {
            Err(ReplicationError::BrokerUnavailable(format!(
                "unknown delivery tag {}",
                tag
            )))
        }
    }

    async fn nack(&mut self, tag: u64) -> Result<()> {
        let requeued = self
            .with_queue(|queue| {
                if queue.unacked.as_ref().map(|d| d.tag) != Some(tag) {
                    return false;
                }
                if let Some(mut d) = queue.unacked.take() {
                    d.redelivered = true;
                    queue.ready.push_front(d);
                    queue.notify.notify_one();
                }
                true
            })
            .ok_or_else(unavailable)?;

        if requeued {
            Ok(())
        } else {
            Err(ReplicationError::BrokerUnavailable(format!(
                "unknown delivery tag {}",
                tag
            )))
        }
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.with_queue(|queue| {
            if let Some(mut d) = queue.unacked.take() {
                d.redelivered = true;
                queue.ready.push_front(d);
                queue.notify.notify_one();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fanout_reaches_every_queue() {
        let broker = MemoryBroker::new();
        let mut host = broker.subscribe("offers", "offers-vm-host-queue").await.unwrap();
        let mut billing = broker.subscribe("offers", "offers-billing-queue").await.unwrap();

        broker.publish("offers", b"one".to_vec()).await.unwrap();

        assert_eq!(host.next().await.unwrap().unwrap().payload, b"one");
        assert_eq!(billing.next().await.unwrap().unwrap().payload, b"one");
    }

    #[tokio::test]
    async fn test_prefetch_one_until_ack() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("users", "q").await.unwrap();
        broker.publish("users", b"1".to_vec()).await.unwrap();
        broker.publish("users", b"2".to_vec()).await.unwrap();

        let first = sub.next().await.unwrap().unwrap();
        let blocked = tokio::time::timeout(Duration::from_millis(50), sub.next()).await;
        assert!(blocked.is_err(), "second message delivered before ack");

        sub.ack(first.tag).await.unwrap();
        let second = sub.next().await.unwrap().unwrap();
        assert_eq!(second.payload, b"2");
    }

    #[tokio::test]
    async fn test_nack_redelivers_same_message_first() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("images", "q").await.unwrap();
        broker.publish("images", b"a".to_vec()).await.unwrap();
        broker.publish("images", b"b".to_vec()).await.unwrap();

        let first = sub.next().await.unwrap().unwrap();
        sub.nack(first.tag).await.unwrap();

        let again = sub.next().await.unwrap().unwrap();
        assert_eq!(again.payload, b"a");
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_queue_is_durable_across_subscriptions() {
        let broker = MemoryBroker::new();
        let sub = broker.subscribe("offers", "q").await.unwrap();
        drop(sub);

        broker.publish("offers", b"while away".to_vec()).await.unwrap();
        assert_eq!(broker.depth("offers", "q"), 1);

        let mut sub = broker.subscribe("offers", "q").await.unwrap();
        assert_eq!(sub.next().await.unwrap().unwrap().payload, b"while away");
    }

    #[tokio::test]
    async fn test_dropped_subscription_requeues_in_flight_message() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("offers", "q").await.unwrap();
        broker.publish("offers", b"x".to_vec()).await.unwrap();
        sub.next().await.unwrap().unwrap();
        drop(sub);

        let mut sub = broker.subscribe("offers", "q").await.unwrap();
        let d = sub.next().await.unwrap().unwrap();
        assert!(d.redelivered);
    }

    #[tokio::test]
    async fn test_closed_broker_fails_fast() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("offers", "q").await.unwrap();

        let waiter = tokio::spawn(async move { sub.next().await });
        tokio::task::yield_now().await;
        broker.close().await.unwrap();

        assert!(waiter.await.unwrap().unwrap().is_none());
        let err = broker.publish("offers", b"late".to_vec()).await.unwrap_err();
        assert!(err.is_connection_error());
        assert!(broker.subscribe("offers", "q").await.is_err());
    }
}
