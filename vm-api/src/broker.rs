use std::sync::Arc;

use tracing::info;
use vm_replication::{Broker, MemoryBroker};

use crate::config::BrokerConfig;

/// The replication broker for this process: RabbitMQ when a host is
/// configured and AMQP support is compiled in, otherwise in-process.
pub async fn connect_broker(config: &BrokerConfig) -> anyhow::Result<Arc<dyn Broker>> {
    let Some(host) = &config.host else {
        info!("RABBITMQ_HOST not set, using the in-process broker");
        return Ok(Arc::new(MemoryBroker::new()));
    };

    #[cfg(feature = "amqp")]
    {
        use vm_replication::amqp::{AmqpBroker, AmqpConfig};

        let amqp = AmqpConfig {
            host: host.clone(),
            port: config.port,
            user: config.user.clone(),
            password: config.password.clone(),
        };
        let broker = AmqpBroker::connect(&amqp).await?;
        info!("Connected to RabbitMQ at {}:{}", host, config.port);
        Ok(Arc::new(broker))
    }

    #[cfg(not(feature = "amqp"))]
    {
        tracing::warn!(
            "RABBITMQ_HOST={} ignored: built without the amqp feature, using the in-process broker",
            host
        );
        Ok(Arc::new(MemoryBroker::new()))
    }
}
