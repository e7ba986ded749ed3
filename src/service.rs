// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Service
//!
//! `RabbitMQ` wires the pieces together. Consumers are registered first; then
//! `start`:
//! 1. loads the configs from `rabbitmq.yaml` when none were supplied
//! 2. opens the consumer and producer connections
//! 3. installs the topology found in the migrations directory
//! 4. subscribes every consumer and spawns its worker
//!
//! Every step failing aborts start with an error, leaving the decision to
//! exit to the application.

use crate::{
    channel::AmqpConnections,
    configs::{RabbitMQConfigs, CONFIG_FILE},
    descriptor::TopologyDescriptor,
    dispatcher::{ConsumerRegistry, RabbitMQDispatcher},
    errors::AmqpError,
    handler::Handlers,
    publisher::RabbitMQPublisher,
    reporter::{ErrorReporter, TracingErrorReporter},
    topology::{AmqpTopology, Topology},
};
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const SERVICE_NAME: &str = "RabbitMQ";

pub struct RabbitMQ {
    config: Option<RabbitMQConfigs>,
    config_file: PathBuf,
    registry: ConsumerRegistry,
    reporter: Arc<dyn ErrorReporter>,
    connections: Option<AmqpConnections>,
    publisher: Option<Arc<RabbitMQPublisher>>,
    workers: Vec<JoinHandle<()>>,
    started: bool,
}

impl RabbitMQ {
    /// Creates the service. Without `config`, `start` reads `rabbitmq.yaml`.
    pub fn new(config: Option<RabbitMQConfigs>) -> RabbitMQ {
        RabbitMQ {
            config,
            config_file: PathBuf::from(CONFIG_FILE),
            registry: ConsumerRegistry::new(),
            reporter: Arc::new(TracingErrorReporter),
            connections: None,
            publisher: None,
            workers: vec![],
            started: false,
        }
    }

    /// Name used in logs and by the application's service list.
    pub fn name(&self) -> &str {
        SERVICE_NAME
    }

    /// The configs in use. Set once `start` loaded them from file.
    pub fn config(&self) -> Option<&RabbitMQConfigs> {
        self.config.as_ref()
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// Whether `start` succeeded and `stop` was not called since.
    pub fn started(&self) -> bool {
        self.started
    }

    /// Overrides the file read when no configs were supplied.
    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = path.into();
        self
    }

    /// Replaces the default `tracing`-based failure reporter.
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Registers a consumer for `queue`. Ignored once the service started.
    pub fn with_consumer(mut self, queue: &str, handlers: Handlers) -> Self {
        if self.started {
            warn!(queue = queue, "consumer registered after start was ignored");
            return self;
        }
        self.registry = self.registry.with_consumer(queue, handlers);
        self
    }

    /// Starts the service. Calling it on a started service does nothing.
    ///
    /// # Returns
    /// Ok(()) once every consumer is subscribed, or the first startup error.
    /// Connections opened before the failure are closed again.
    pub async fn start(&mut self) -> Result<(), AmqpError> {
        if self.started {
            return Ok(());
        }

        let cfg = match &self.config {
            Some(cfg) => cfg.clone(),
            None => {
                let cfg = RabbitMQConfigs::from_yaml_file(&self.config_file).map_err(|err| {
                    error!(
                        error = err.to_string(),
                        service = SERVICE_NAME,
                        "failure to load configs"
                    );
                    err
                })?;
                self.config = Some(cfg.clone());
                cfg
            }
        };

        let connections = AmqpConnections::connect(&cfg).await?;

        let workers = match self.provision_and_consume(&cfg, &connections).await {
            Ok(workers) => workers,
            Err(err) => {
                error!(error = err.to_string(), service = SERVICE_NAME, "failure to start");
                connections.close().await;
                return Err(err);
            }
        };

        self.publisher = Some(RabbitMQPublisher::new(
            connections.producer_channel.clone(),
        ));
        self.connections = Some(connections);
        self.workers = workers;
        self.started = true;

        info!(
            service = SERVICE_NAME,
            consumers = self.registry.len(),
            "rabbitmq started"
        );

        Ok(())
    }

    async fn provision_and_consume(
        &self,
        cfg: &RabbitMQConfigs,
        connections: &AmqpConnections,
    ) -> Result<Vec<JoinHandle<()>>, AmqpError> {
        let descriptor = TopologyDescriptor::load_dir(&cfg.migrations_dir)?;

        AmqpTopology::new(connections.consumer_channel.clone())
            .descriptor(descriptor)
            .install()
            .await?;

        RabbitMQDispatcher::new(
            connections.consumer_channel.clone(),
            &cfg.host,
            self.registry.clone(),
            self.reporter.clone(),
        )
        .consume()
        .await
    }

    /// Stops the workers and closes both connections.
    pub async fn stop(&mut self) -> Result<(), AmqpError> {
        if !self.started {
            return Ok(());
        }

        for worker in self.workers.drain(..) {
            worker.abort();
        }

        self.publisher = None;
        if let Some(connections) = self.connections.take() {
            connections.close().await;
        }

        self.started = false;
        debug!(service = SERVICE_NAME, "rabbitmq stopped");

        Ok(())
    }

    /// The shared publisher, available once the service started.
    pub fn publisher(&self) -> Result<Arc<RabbitMQPublisher>, AmqpError> {
        self.publisher.clone().ok_or(AmqpError::NotStartedError)
    }

    /// Publishes `message` as JSON through the shared publisher.
    ///
    /// # Parameters
    /// * `message` - Any serializable payload
    /// * `exchange` - Target exchange
    /// * `routing_key` - Routing key of the message
    ///
    /// # Returns
    /// Ok(()) once the message was handed to the broker, NotStartedError before
    /// `start`, or the serialization or publishing error
    pub async fn publish<T>(
        &self,
        message: &T,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let Some(publisher) = &self.publisher else {
            return Err(AmqpError::NotStartedError);
        };

        publisher.publish(message, exchange, routing_key).await
    }
}
