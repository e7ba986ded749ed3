// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! This module subscribes the registered consumers to their queues and runs
//! one worker task per consumer. A worker handles its deliveries strictly in
//! the order the broker yields them; workers of different queues run
//! independently, so a slow handler only ever holds up its own queue.

use crate::{
    consumer::{consume, IncomingDelivery},
    errors::AmqpError,
    handler::Handlers,
    otel::CONSUMER_TRACER,
    reporter::{ErrorReporter, FailureRecord},
};
use futures_util::{Stream, StreamExt};
use lapin::{options::BasicConsumeOptions, types::FieldTable, Channel};
use opentelemetry::global;
use std::{collections::HashMap, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// A queue and the handlers for the routing keys expected on it.
#[derive(Debug, Clone)]
pub struct ConsumerDefinition {
    pub queue: String,
    pub handlers: Arc<Handlers>,
}

/// Consumers registered by the application before the service starts.
#[derive(Debug, Clone, Default)]
pub struct ConsumerRegistry {
    consumers: Vec<ConsumerDefinition>,
}

impl ConsumerRegistry {
    /// Creates an empty registry.
    pub fn new() -> ConsumerRegistry {
        ConsumerRegistry::default()
    }

    /// Adds a consumer for `queue`. Registering a queue twice starts two
    /// independent workers on it.
    pub fn with_consumer(mut self, queue: &str, handlers: Handlers) -> Self {
        self.consumers.push(ConsumerDefinition {
            queue: queue.to_owned(),
            handlers: Arc::new(handlers),
        });
        self
    }

    /// Iterates the consumers in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ConsumerDefinition> {
        self.consumers.iter()
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

/// Subscribes every registered consumer on the consumer channel.
pub struct RabbitMQDispatcher {
    channel: Arc<Channel>,
    host: String,
    registry: ConsumerRegistry,
    reporter: Arc<dyn ErrorReporter>,
}

impl RabbitMQDispatcher {
    /// Creates a dispatcher for the registered consumers.
    ///
    /// # Parameters
    /// * `channel` - The consumer channel subscriptions are made on
    /// * `host` - Broker host, used to build consumer tags
    /// * `registry` - The consumers to subscribe
    /// * `reporter` - Receives every per-delivery failure
    pub fn new(
        channel: Arc<Channel>,
        host: &str,
        registry: ConsumerRegistry,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        RabbitMQDispatcher {
            channel,
            host: host.to_owned(),
            registry,
            reporter,
        }
    }

    /// Subscribes to every registered queue and spawns its worker.
    ///
    /// Returns once all subscriptions are established. If one subscription
    /// fails, the workers spawned so far are aborted and the error returned.
    pub async fn consume(&self) -> Result<Vec<JoinHandle<()>>, AmqpError> {
        let tags = consumer_tags(&self.host, &self.registry);
        let mut workers: Vec<JoinHandle<()>> = vec![];

        for (def, tag) in self.registry.iter().zip(tags) {
            debug!(queue = def.queue, tag = tag, "subscribing consumer");

            let consumer = match self
                .channel
                .basic_consume(
                    &def.queue,
                    &tag,
                    BasicConsumeOptions {
                        no_local: false,
                        no_ack: false,
                        exclusive: false,
                        nowait: false,
                    },
                    FieldTable::default(),
                )
                .await
            {
                Ok(c) => c,
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        queue = def.queue,
                        "failure to create the consumer"
                    );
                    for worker in &workers {
                        worker.abort();
                    }
                    return Err(AmqpError::BindingConsumerError(def.queue.clone()));
                }
            };

            let deliveries = consumer.map(|result| {
                result
                    .map(IncomingDelivery::from)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            });

            workers.push(tokio::spawn(run_worker(
                def.queue.clone(),
                deliveries,
                def.handlers.clone(),
                self.reporter.clone(),
            )));
        }

        Ok(workers)
    }
}

/// `{host}-{queue}`, suffixed with a counter when a queue is registered more
/// than once so tags stay unique on the channel.
fn consumer_tags(host: &str, registry: &ConsumerRegistry) -> Vec<String> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    registry
        .iter()
        .map(|def| {
            let count = seen.entry(def.queue.as_str()).or_insert(0);
            *count += 1;
            match *count {
                1 => format!("{}-{}", host, def.queue),
                n => format!("{}-{}-{}", host, def.queue, n),
            }
        })
        .collect()
}

/// Drains `deliveries` one at a time until the stream ends.
pub(crate) async fn run_worker<S>(
    queue: String,
    mut deliveries: S,
    handlers: Arc<Handlers>,
    reporter: Arc<dyn ErrorReporter>,
) where
    S: Stream<Item = Result<IncomingDelivery, AmqpError>> + Unpin,
{
    let tracer = global::tracer(CONSUMER_TRACER);

    while let Some(result) = deliveries.next().await {
        match result {
            Ok(delivery) => {
                let outcome =
                    consume(&tracer, &queue, delivery, &handlers, reporter.as_ref()).await;
                debug!(queue = queue, outcome = ?outcome, "delivery resolved");
            }
            Err(err) => {
                error!(error = err.to_string(), "errors consume msg");
                reporter.report("consume", &err, &FailureRecord::for_queue(&queue));
            }
        }
    }

    warn!(queue = queue, "delivery stream closed, worker exiting");
    reporter.report(
        "stream",
        &AmqpError::ConsumerError(format!("delivery stream of `{queue}` closed")),
        &FailureRecord::for_queue(&queue),
    );
}
