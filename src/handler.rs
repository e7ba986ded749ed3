// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! Handlers receive one inbound message and answer whether it was processed.
//! `true` acknowledges the delivery; `false` rejects it without requeue. A
//! queue's handlers are grouped in a [`Handlers`] map keyed by routing key,
//! built once at registration time and never changed afterwards.

use async_trait::async_trait;
use lapin::{
    message::Delivery,
    types::{AMQPValue, ShortString},
};
use serde::de::DeserializeOwned;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};

/// A message handed to a handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    /// Broker-assigned tag, unique per channel.
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub headers: BTreeMap<ShortString, AMQPValue>,
}

impl InboundMessage {
    pub fn new(exchange: &str, routing_key: &str, body: impl Into<Vec<u8>>) -> InboundMessage {
        InboundMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body: body.into(),
            ..Default::default()
        }
    }

    /// Decodes the body as JSON, the encoding used by the publisher.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

impl From<&Delivery> for InboundMessage {
    fn from(delivery: &Delivery) -> Self {
        InboundMessage {
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            body: delivery.data.clone(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            headers: delivery
                .properties
                .headers()
                .as_ref()
                .map(|table| table.inner().clone())
                .unwrap_or_default(),
        }
    }
}

/// Processes the messages of one routing key.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    /// Returns `true` when the message was handled and can be acknowledged.
    async fn exec(&self, msg: &InboundMessage) -> bool;
}

/// Adapts a plain closure into a [`ConsumerHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> ConsumerHandler for FnHandler<F>
where
    F: Fn(&InboundMessage) -> bool + Send + Sync,
{
    async fn exec(&self, msg: &InboundMessage) -> bool {
        (self.0)(msg)
    }
}

pub fn handler_fn<F>(f: F) -> Arc<dyn ConsumerHandler>
where
    F: Fn(&InboundMessage) -> bool + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Routing key to handler map for a single queue.
///
/// Lookups are exact matches on the delivery's routing key.
#[derive(Clone, Default)]
pub struct Handlers {
    routes: HashMap<String, Arc<dyn ConsumerHandler>>,
}

impl Handlers {
    /// Creates an empty handler map.
    pub fn new() -> Handlers {
        Handlers::default()
    }

    /// Registers `handler` for `routing_key`, replacing any earlier one.
    pub fn on(mut self, routing_key: &str, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.routes.insert(routing_key.to_owned(), handler);
        self
    }

    /// Registers a plain closure as the handler for `routing_key`.
    pub fn on_fn<F>(self, routing_key: &str, f: F) -> Self
    where
        F: Fn(&InboundMessage) -> bool + Send + Sync + 'static,
    {
        self.on(routing_key, handler_fn(f))
    }

    /// Looks up the handler for a routing key.
    ///
    /// # Parameters
    /// * `routing_key` - The routing key of the delivery
    ///
    /// # Returns
    /// The registered handler, or None when the key is not handled
    pub fn get(&self, routing_key: &str) -> Option<&Arc<dyn ConsumerHandler>> {
        self.routes.get(routing_key)
    }

    pub fn routing_keys(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.routing_keys().collect();
        keys.sort_unstable();
        f.debug_struct("Handlers").field("routing_keys", &keys).finish()
    }
}
