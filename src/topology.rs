// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module applies a topology to a live broker. The topology includes
//! exchanges, queues, and the bindings between them.
//!
//! The main components are:
//! - `TopologyChannel` trait: the declarations a broker channel must support
//! - `Topology` trait: Interface for topology management
//! - `AmqpTopology`: Implementation of the Topology trait for RabbitMQ
//!
//! Installation always declares every exchange, then every queue, then every
//! binding, whatever order the definitions were registered in. Declarations
//! are idempotent on the broker side, so installing the same topology again
//! converges without errors. The first failure aborts installation and
//! whatever was declared before it stays in place.

use crate::{
    descriptor::TopologyDescriptor,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::FieldTable,
    Channel,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Broker operations needed to install a topology.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TopologyChannel: Send + Sync {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;
}

#[async_trait]
impl TopologyChannel for Channel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.exchange_declare(
            &def.name,
            def.kind.into(),
            ExchangeDeclareOptions {
                passive: false,
                durable: def.durable,
                auto_delete: false,
                internal: false,
                nowait: false,
            },
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(
                error = err.to_string(),
                name = def.name,
                "error to declare the exchange"
            );
            AmqpError::DeclareExchangeError(def.name.clone())
        })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        match self
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the queue"
                );
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => Ok(()),
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.queue_bind(
            &binding.destination,
            &binding.source,
            &binding.routing_key,
            QueueBindOptions { nowait: false },
            FieldTable::default(),
        )
        .await
        .map_err(|err| {
            error!(error = err.to_string(), "error to bind queue to exchange");
            AmqpError::BindingExchangeToQueueError(
                binding.source.clone(),
                binding.destination.clone(),
            )
        })
    }
}

/// Trait defining the interface for topology management.
///
/// This trait provides methods for registering exchanges, queues, and bindings,
/// as well as installing the topology to the RabbitMQ server.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Adds every declaration of a descriptor to the topology.
    fn descriptor(self, descriptor: TopologyDescriptor) -> Self;

    /// Installs the topology to the RabbitMQ server.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology {
    channel: Arc<dyn TopologyChannel>,
    pub(crate) definitions: TopologyDescriptor,
}

impl AmqpTopology {
    pub fn new(channel: Arc<dyn TopologyChannel>) -> AmqpTopology {
        AmqpTopology {
            channel,
            definitions: TopologyDescriptor::default(),
        }
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.definitions.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.definitions.queues.push(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.definitions.bindings.push(binding);
        self
    }

    fn descriptor(mut self, descriptor: TopologyDescriptor) -> Self {
        self.definitions.exchanges.extend(descriptor.exchanges);
        self.definitions.queues.extend(descriptor.queues);
        self.definitions.bindings.extend(descriptor.bindings);
        self
    }

    /// Installs the topology to the RabbitMQ server.
    ///
    /// This method performs the following operations in order:
    /// 1. Rejects conflicting declarations without touching the broker
    /// 2. Creates all exchanges
    /// 3. Creates all queues
    /// 4. Sets up queue-to-exchange bindings
    async fn install(&self) -> Result<(), AmqpError> {
        self.definitions.check_conflicts()?;
        self.install_exchanges().await?;
        self.install_queues().await?;
        self.binding_queues().await
    }
}

impl AmqpTopology {
    async fn install_exchanges(&self) -> Result<(), AmqpError> {
        for exch in &self.definitions.exchanges {
            debug!("creating exchange: {}", exch.name);
            self.channel.declare_exchange(exch).await?;
            debug!("exchange: {} was created", exch.name);
        }

        Ok(())
    }

    async fn install_queues(&self) -> Result<(), AmqpError> {
        for queue in &self.definitions.queues {
            debug!("creating queue: {}", queue.name);
            self.channel.declare_queue(queue).await?;
            debug!("queue: {} was created", queue.name);
        }

        Ok(())
    }

    async fn binding_queues(&self) -> Result<(), AmqpError> {
        for binding in &self.definitions.bindings {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                binding.destination, binding.source, binding.routing_key
            );
            self.channel.bind_queue(binding).await?;
        }

        debug!("queues were bound");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeKind;
    use std::{collections::HashMap, sync::Mutex};

    /// In-memory broker that follows RabbitMQ's declare semantics: redeclaring
    /// with the same parameters succeeds, different parameters fail, and a
    /// binding needs both ends to exist.
    #[derive(Default)]
    struct FakeBroker {
        exchanges: Mutex<HashMap<String, (ExchangeKind, bool)>>,
        queues: Mutex<HashMap<String, bool>>,
        bindings: Mutex<Vec<(String, String, String)>>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TopologyChannel for FakeBroker {
        async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
            self.calls.lock().unwrap().push(format!("exchange:{}", def.name));
            let mut exchanges = self.exchanges.lock().unwrap();
            match exchanges.get(&def.name) {
                Some(existing) if *existing != (def.kind, def.durable) => {
                    Err(AmqpError::DeclareExchangeError(def.name.clone()))
                }
                _ => {
                    exchanges.insert(def.name.clone(), (def.kind, def.durable));
                    Ok(())
                }
            }
        }

        async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
            self.calls.lock().unwrap().push(format!("queue:{}", def.name));
            let mut queues = self.queues.lock().unwrap();
            match queues.get(&def.name) {
                Some(durable) if *durable != def.durable => {
                    Err(AmqpError::DeclareQueueError(def.name.clone()))
                }
                _ => {
                    queues.insert(def.name.clone(), def.durable);
                    Ok(())
                }
            }
        }

        async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("bind:{}->{}", binding.source, binding.destination));
            let exchange_exists = self.exchanges.lock().unwrap().contains_key(&binding.source);
            let queue_exists = self.queues.lock().unwrap().contains_key(&binding.destination);
            if !exchange_exists || !queue_exists {
                return Err(AmqpError::BindingExchangeToQueueError(
                    binding.source.clone(),
                    binding.destination.clone(),
                ));
            }

            let triple = (
                binding.source.clone(),
                binding.destination.clone(),
                binding.routing_key.clone(),
            );
            let mut bindings = self.bindings.lock().unwrap();
            if !bindings.contains(&triple) {
                bindings.push(triple);
            }
            Ok(())
        }
    }

    fn orders_descriptor() -> TopologyDescriptor {
        TopologyDescriptor::new()
            .exchange(ExchangeDefinition::new("orders").topic().durable())
            .queue(QueueDefinition::new("orders.created").durable())
            .binding(
                QueueBinding::new("orders.created")
                    .exchange("orders")
                    .routing_key("created"),
            )
    }

    #[tokio::test]
    async fn declares_exchanges_then_queues_then_bindings() {
        let broker = Arc::new(FakeBroker::default());

        // registered in reverse order on purpose
        AmqpTopology::new(broker.clone())
            .queue_binding(QueueBinding::new("q").exchange("ex").routing_key("k"))
            .queue(QueueDefinition::new("q"))
            .exchange(ExchangeDefinition::new("ex"))
            .install()
            .await
            .unwrap();

        assert_eq!(
            *broker.calls.lock().unwrap(),
            vec!["exchange:ex", "queue:q", "bind:ex->q"]
        );
    }

    #[tokio::test]
    async fn installing_twice_is_idempotent() {
        let broker = Arc::new(FakeBroker::default());
        let topology = AmqpTopology::new(broker.clone()).descriptor(orders_descriptor());

        topology.install().await.unwrap();
        topology.install().await.unwrap();

        assert_eq!(broker.exchanges.lock().unwrap().len(), 1);
        assert_eq!(broker.queues.lock().unwrap().len(), 1);
        assert_eq!(broker.bindings.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn conflicting_descriptor_never_reaches_the_broker() {
        let mut channel = MockTopologyChannel::new();
        channel.expect_declare_exchange().never();
        channel.expect_declare_queue().never();
        channel.expect_bind_queue().never();

        let err = AmqpTopology::new(Arc::new(channel))
            .queue(QueueDefinition::new("jobs").durable())
            .queue(QueueDefinition::new("jobs"))
            .install()
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::TopologyConflictError(..)));
    }

    #[tokio::test]
    async fn first_failure_aborts_installation() {
        let mut channel = MockTopologyChannel::new();
        channel
            .expect_declare_exchange()
            .withf(|def| def.name == "orders")
            .times(1)
            .returning(|def| Err(AmqpError::DeclareExchangeError(def.name.clone())));
        channel.expect_declare_queue().never();
        channel.expect_bind_queue().never();

        let err = AmqpTopology::new(Arc::new(channel))
            .descriptor(orders_descriptor())
            .install()
            .await
            .unwrap_err();

        assert_eq!(err, AmqpError::DeclareExchangeError("orders".to_owned()));
    }

    #[tokio::test]
    async fn queue_failure_skips_bindings() {
        let mut channel = MockTopologyChannel::new();
        channel.expect_declare_exchange().times(1).returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .times(1)
            .returning(|def| Err(AmqpError::DeclareQueueError(def.name.clone())));
        channel.expect_bind_queue().never();

        let res = AmqpTopology::new(Arc::new(channel))
            .descriptor(orders_descriptor())
            .install()
            .await;

        assert_eq!(
            res,
            Err(AmqpError::DeclareQueueError("orders.created".to_owned()))
        );
    }

    #[tokio::test]
    async fn empty_topology_is_a_no_op() {
        let mut channel = MockTopologyChannel::new();
        channel.expect_declare_exchange().never();
        channel.expect_declare_queue().never();
        channel.expect_bind_queue().never();

        AmqpTopology::new(Arc::new(channel)).install().await.unwrap();
    }
}
