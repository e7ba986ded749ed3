// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Integration
//!
//! `AmqpError` covers every failure the integration can surface: configuration
//! loading, connection and channel setup, topology descriptors and their
//! provisioning, consumer subscriptions, publishing and delivery resolution.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Startup failures (configuration, connection, descriptor, provisioning and
/// subscription variants) abort `RabbitMQ::start`. Resolution failures are only
/// ever reported, and publish failures are returned to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error loading the connection configuration
    #[error("failure to load configuration `{0}`: {1}")]
    ConfigLoadError(String, String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Error reading a topology descriptor file or directory
    #[error("failure to read topology descriptor `{0}`: {1}")]
    DescriptorReadError(String, String),

    /// Error decoding a topology descriptor file
    #[error("failure to parse topology descriptor `{0}`: {1}")]
    DescriptorParseError(String, String),

    /// Two declarations of the same exchange or queue disagree
    #[error("conflicting declarations for `{0}`: {1}")]
    TopologyConflictError(String, String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error binding a consumer to a queue
    #[error("failure to declare consumer `{0}`")]
    BindingConsumerError(String),

    /// Error serializing an outbound payload
    #[error("failure to serialize payload: {0}")]
    SerializePayloadError(String),

    /// Error publishing a message
    #[error("failure to publish to exchange `{0}`: {1}")]
    PublishingError(String, String),

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error rejecting a message
    #[error("failure to reject message: {0}")]
    RejectMessageError(String),

    /// A handler panicked while processing a delivery
    #[error("handler panicked: {0}")]
    HandlerPanicError(String),

    /// No handler is registered for the delivery's routing key
    #[error("no handler for routing key `{0}`")]
    UnhandledRoutingKeyError(String),

    /// The handler returned `false` for a delivery
    #[error("handler refused message with routing key `{0}`")]
    HandlerRefusedError(String),

    /// The consumer delivery stream yielded an error or ended
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// The service was used before `start` completed
    #[error("service not started")]
    NotStartedError,
}
