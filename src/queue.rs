// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides types for defining RabbitMQ queues and the bindings
//! that attach them to exchanges.

use serde::Deserialize;

/// Definition of a RabbitMQ queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QueueDefinition {
    pub name: String,
    #[serde(default)]
    pub durable: bool,
}

impl QueueDefinition {
    /// Creates a new, non-durable queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: false,
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    ///
    /// Durable queues will survive broker restart, preserving messages.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }
}

/// Configuration for binding a queue to an exchange.
///
/// A binding has no identity beyond its `(source, destination, routing_key)`
/// triple; the same exchange or queue may appear in any number of bindings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct QueueBinding {
    /// Name of the exchange messages flow from.
    pub source: String,
    /// Name of the queue messages flow to.
    pub destination: String,
    #[serde(rename = "routingKey", alias = "routing_key", default)]
    pub routing_key: String,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    /// These should be set using the `exchange` and `routing_key` methods.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            source: String::new(),
            destination: queue.to_owned(),
            routing_key: String::new(),
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.source = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}
