// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module publishes JSON-encoded payloads to RabbitMQ exchanges on the
//! producer channel. Publishing is fire-and-forget: messages are sent neither
//! mandatory nor immediate, so the broker may drop a message no queue is bound
//! for. Failures are returned to the caller and never retried.

use crate::{errors::AmqpError, otel};
use async_trait::async_trait;
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Channel operation used to send an already encoded message.
///
/// Implementations must accept concurrent calls; lapin channels synchronize
/// internally.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PublishChannel: Send + Sync {
    async fn publish_bytes(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;
}

#[async_trait]
impl PublishChannel for Channel {
    async fn publish_bytes(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        match self
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(AmqpError::PublishingError(
                    exchange.to_owned(),
                    err.to_string(),
                ))
            }
            _ => Ok(()),
        }
    }
}

/// Publishes messages on the producer channel.
pub struct RabbitMQPublisher {
    channel: Arc<dyn PublishChannel>,
}

impl RabbitMQPublisher {
    /// Creates a new RabbitMQ publisher.
    ///
    /// Returns an Arc-wrapped instance; clones can publish concurrently.
    pub fn new(channel: Arc<dyn PublishChannel>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { channel })
    }

    /// Serializes `message` to JSON and publishes it to `exchange` with
    /// `routing_key`, carrying the current trace context.
    ///
    /// A serialization failure returns before anything is written to the
    /// channel.
    pub async fn publish<T>(
        &self,
        message: &T,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        self.publish_with_context(&Context::current(), message, exchange, routing_key)
            .await
    }

    pub async fn publish_with_context<T>(
        &self,
        ctx: &Context,
        message: &T,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(message).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::SerializePayloadError(err.to_string())
        })?;

        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject_context(ctx, &mut headers);

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));

        self.channel
            .publish_bytes(exchange, routing_key, &payload, properties)
            .await?;

        debug!(
            exchange = exchange,
            routing_key = routing_key,
            "message published"
        );

        Ok(())
    }
}
