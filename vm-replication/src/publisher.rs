use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info};

use crate::broker::Broker;
use crate::envelope::{Action, Envelope, Exchanges, Feed};
use crate::error::Result;

/// Publishes entity changes onto the feeds.
///
/// Nothing is buffered locally: if the broker is gone the call fails with
/// `BrokerUnavailable` and the caller decides what to do.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn Broker>,
    exchanges: Exchanges,
}

impl Publisher {
    pub fn new(broker: Arc<dyn Broker>, exchanges: Exchanges) -> Self {
        Self { broker, exchanges }
    }

    pub async fn publish<T: Serialize>(&self, feed: Feed, action: Action, data: T) -> Result<()> {
        let envelope = Envelope::new(action, data);
        let payload = serde_json::to_vec(&envelope)?;
        let exchange = self.exchanges.name(feed);

        match self.broker.publish(exchange, payload).await {
            Ok(()) => {
                info!("Published {} event on {}", action, exchange);
                Ok(())
            }
            Err(e) => {
                error!("Failed to publish {} event on {}: {}", action, exchange, e);
                Err(e)
            }
        }
    }
}
