// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Failure Reporting
//!
//! Consumer workers have no synchronous caller, so per-delivery failures
//! (handler panics, ack or reject errors, a closed delivery stream) are handed
//! to an [`ErrorReporter`]. Reporting never changes how a delivery is resolved.

use crate::{errors::AmqpError, handler::InboundMessage};
use tracing::error;

/// Context attached to a reported failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureRecord {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    /// Message body, lossily decoded as UTF-8.
    pub body: String,
}

impl FailureRecord {
    pub fn new(queue: &str, msg: &InboundMessage) -> FailureRecord {
        FailureRecord {
            queue: queue.to_owned(),
            exchange: msg.exchange.clone(),
            routing_key: msg.routing_key.clone(),
            body: String::from_utf8_lossy(&msg.body).into_owned(),
        }
    }

    /// A record for failures that are not tied to a single delivery.
    pub fn for_queue(queue: &str) -> FailureRecord {
        FailureRecord {
            queue: queue.to_owned(),
            ..Default::default()
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait ErrorReporter: Send + Sync {
    fn report(&self, operation: &str, error: &AmqpError, record: &FailureRecord);
}

/// Emits every report as a `tracing` error event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, operation: &str, error: &AmqpError, record: &FailureRecord) {
        error!(
            operation = operation,
            error = error.to_string(),
            queue = record.queue,
            exchange = record.exchange,
            routing_key = record.routing_key,
            body = record.body,
            "error in rabbitmq consumer"
        );
    }
}
