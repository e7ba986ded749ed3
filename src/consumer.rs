// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Resolution of a single delivery. Each delivery is resolved exactly once:
//!
//! | situation                         | outcome                   |
//! |-----------------------------------|---------------------------|
//! | no handler for the routing key    | reject, no requeue + report |
//! | handler returned `true`           | ack                       |
//! | handler returned `false`          | reject, no requeue + report |
//! | handler panicked                  | reject, no requeue + report |
//!
//! A failing ack or reject is reported and otherwise ignored; the broker
//! redelivers unresolved messages according to its own policy.

use crate::{
    errors::AmqpError,
    handler::{Handlers, InboundMessage},
    otel,
    reporter::{ErrorReporter, FailureRecord},
};
use async_trait::async_trait;
use futures_util::FutureExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicRejectOptions},
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::{any::Any, fmt, panic::AssertUnwindSafe};
use tracing::{debug, error, warn};

/// Settles a delivery on the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryResolver: Send + Sync {
    async fn ack_message(&self) -> Result<(), AmqpError>;

    /// Rejects the delivery without requeueing it.
    async fn reject_message(&self) -> Result<(), AmqpError>;
}

#[async_trait]
impl DeliveryResolver for Acker {
    async fn ack_message(&self) -> Result<(), AmqpError> {
        Acker::ack(self, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn reject_message(&self) -> Result<(), AmqpError> {
        Acker::reject(self, BasicRejectOptions { requeue: false })
            .await
            .map_err(|err| AmqpError::RejectMessageError(err.to_string()))
    }
}

/// A message together with the means to settle it.
pub struct IncomingDelivery {
    pub message: InboundMessage,
    pub resolver: Box<dyn DeliveryResolver>,
}

impl From<Delivery> for IncomingDelivery {
    fn from(delivery: Delivery) -> Self {
        IncomingDelivery {
            message: InboundMessage::from(&delivery),
            resolver: Box::new(delivery.acker),
        }
    }
}

/// Why a delivery was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    UnhandledRoutingKey,
    HandlerRefused,
    /// Carries the panic message.
    HandlerPanicked(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::UnhandledRoutingKey => write!(f, "no handler for routing key"),
            RejectReason::HandlerRefused => write!(f, "handler returned false"),
            RejectReason::HandlerPanicked(msg) => write!(f, "handler panicked: {msg}"),
        }
    }
}

/// The decision taken for a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Rejected(RejectReason),
}

/// Runs the handler for `delivery` and settles it on the broker.
///
/// Never panics because of the handler; the returned outcome is the decision
/// that was sent to the broker, whether or not sending it succeeded.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    queue: &str,
    delivery: IncomingDelivery,
    handlers: &Handlers,
    reporter: &dyn ErrorReporter,
) -> DeliveryOutcome {
    let IncomingDelivery { message, resolver } = delivery;

    let mut span = otel::new_span(&message.headers, tracer, &message.routing_key);

    debug!(
        "received: {} - exchange: {}",
        message.routing_key, message.exchange
    );

    let outcome = match handlers.get(&message.routing_key) {
        None => {
            warn!(
                queue = queue,
                routing_key = message.routing_key,
                "rejecting message - reason: unsupported routing key"
            );
            let err = AmqpError::UnhandledRoutingKeyError(message.routing_key.clone());
            reporter.report("unhandled", &err, &FailureRecord::new(queue, &message));
            DeliveryOutcome::Rejected(RejectReason::UnhandledRoutingKey)
        }
        // exec runs inside the guarded future: it may panic before yielding one
        Some(handler) => match AssertUnwindSafe(async { handler.exec(&message).await })
            .catch_unwind()
            .await
        {
            Ok(true) => DeliveryOutcome::Acked,
            Ok(false) => {
                debug!("handler refused message");
                let err = AmqpError::HandlerRefusedError(message.routing_key.clone());
                reporter.report("refused", &err, &FailureRecord::new(queue, &message));
                DeliveryOutcome::Rejected(RejectReason::HandlerRefused)
            }
            Err(panic) => {
                let text = panic_message(panic.as_ref());
                let err = AmqpError::HandlerPanicError(text.clone());
                span.record_error(&err);
                reporter.report("consume", &err, &FailureRecord::new(queue, &message));
                DeliveryOutcome::Rejected(RejectReason::HandlerPanicked(text))
            }
        },
    };

    let resolution = match &outcome {
        DeliveryOutcome::Acked => resolver.ack_message().await,
        DeliveryOutcome::Rejected(_) => resolver.reject_message().await,
    };

    match (&outcome, resolution) {
        (_, Err(err)) => {
            error!(error = err.to_string(), "failure to resolve message");
            span.record_error(&err);
            otel::set_span_error(&mut span, err.to_string());
            let operation = match &outcome {
                DeliveryOutcome::Acked => "ack",
                DeliveryOutcome::Rejected(_) => "reject",
            };
            reporter.report(operation, &err, &FailureRecord::new(queue, &message));
        }
        (DeliveryOutcome::Acked, Ok(())) => {
            debug!("message successfully processed");
            span.set_status(Status::Ok);
        }
        (DeliveryOutcome::Rejected(reason), Ok(())) => {
            otel::set_span_error(&mut span, reason.to_string());
        }
    }

    span.end();
    outcome
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::MockErrorReporter;
    use opentelemetry::global;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    fn tracer() -> BoxedTracer {
        global::tracer("consumer tests")
    }

    fn delivery(routing_key: &str, resolver: MockDeliveryResolver) -> IncomingDelivery {
        IncomingDelivery {
            message: InboundMessage::new("orders", routing_key, r#"{"id":1}"#),
            resolver: Box::new(resolver),
        }
    }

    fn ack_once() -> MockDeliveryResolver {
        let mut resolver = MockDeliveryResolver::new();
        resolver.expect_ack_message().times(1).returning(|| Ok(()));
        resolver.expect_reject_message().never();
        resolver
    }

    fn reject_once() -> MockDeliveryResolver {
        let mut resolver = MockDeliveryResolver::new();
        resolver.expect_ack_message().never();
        resolver.expect_reject_message().times(1).returning(|| Ok(()));
        resolver
    }

    fn silent_reporter() -> MockErrorReporter {
        let mut reporter = MockErrorReporter::new();
        reporter.expect_report().never();
        reporter
    }

    #[tokio::test]
    async fn handler_true_acks_once() {
        let handlers = Handlers::new().on_fn("created", |_| true);

        let outcome = consume(
            &tracer(),
            "orders.created",
            delivery("created", ack_once()),
            &handlers,
            &silent_reporter(),
        )
        .await;

        assert_eq!(outcome, DeliveryOutcome::Acked);
    }

    #[tokio::test]
    async fn handler_false_rejects_once() {
        let handlers = Handlers::new().on_fn("created", |_| false);

        let mut reporter = MockErrorReporter::new();
        reporter
            .expect_report()
            .withf(|operation, error, record| {
                operation == "refused"
                    && *error == AmqpError::HandlerRefusedError("created".to_owned())
                    && record.queue == "orders.created"
            })
            .times(1)
            .return_const(());

        let outcome = consume(
            &tracer(),
            "orders.created",
            delivery("created", reject_once()),
            &handlers,
            &reporter,
        )
        .await;

        assert_eq!(outcome, DeliveryOutcome::Rejected(RejectReason::HandlerRefused));
    }

    #[tokio::test]
    async fn unknown_routing_key_rejects_without_running_handlers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handlers = Handlers::new().on_fn("created", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            true
        });

        let mut reporter = MockErrorReporter::new();
        reporter
            .expect_report()
            .withf(|operation, error, record| {
                operation == "unhandled"
                    && *error == AmqpError::UnhandledRoutingKeyError("deleted".to_owned())
                    && record.routing_key == "deleted"
            })
            .times(1)
            .return_const(());

        let outcome = consume(
            &tracer(),
            "orders.created",
            delivery("deleted", reject_once()),
            &handlers,
            &reporter,
        )
        .await;

        assert_eq!(
            outcome,
            DeliveryOutcome::Rejected(RejectReason::UnhandledRoutingKey)
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panicking_handler_is_rejected_and_reported() {
        let handlers = Handlers::new().on_fn("created", |_| panic!("boom"));

        let mut reporter = MockErrorReporter::new();
        reporter
            .expect_report()
            .withf(|operation, error, record| {
                operation == "consume"
                    && *error == AmqpError::HandlerPanicError("boom".to_owned())
                    && record.exchange == "orders"
                    && record.routing_key == "created"
                    && record.body == r#"{"id":1}"#
            })
            .times(1)
            .return_const(());

        let outcome = consume(
            &tracer(),
            "orders.created",
            delivery("created", reject_once()),
            &handlers,
            &reporter,
        )
        .await;

        assert_eq!(
            outcome,
            DeliveryOutcome::Rejected(RejectReason::HandlerPanicked("boom".to_owned()))
        );
    }

    #[tokio::test]
    async fn formatted_panic_message_is_captured() {
        let handlers = Handlers::new().on_fn("created", |msg| panic!("bad body {}", msg.body.len()));

        let mut reporter = MockErrorReporter::new();
        reporter.expect_report().times(1).return_const(());

        let outcome = consume(
            &tracer(),
            "orders.created",
            delivery("created", reject_once()),
            &handlers,
            &reporter,
        )
        .await;

        assert_eq!(
            outcome,
            DeliveryOutcome::Rejected(RejectReason::HandlerPanicked("bad body 8".to_owned()))
        );
    }

    #[tokio::test]
    async fn failed_ack_is_reported_and_not_retried() {
        let handlers = Handlers::new().on_fn("created", |_| true);

        let mut resolver = MockDeliveryResolver::new();
        resolver
            .expect_ack_message()
            .times(1)
            .returning(|| Err(AmqpError::AckMessageError("channel closed".to_owned())));
        resolver.expect_reject_message().never();

        let mut reporter = MockErrorReporter::new();
        reporter
            .expect_report()
            .withf(|operation, error, _| {
                operation == "ack" && matches!(error, AmqpError::AckMessageError(_))
            })
            .times(1)
            .return_const(());

        let outcome = consume(
            &tracer(),
            "orders.created",
            delivery("created", resolver),
            &handlers,
            &reporter,
        )
        .await;

        assert_eq!(outcome, DeliveryOutcome::Acked);
    }

    #[tokio::test]
    async fn failed_reject_is_reported() {
        let handlers = Handlers::new();

        let mut resolver = MockDeliveryResolver::new();
        resolver.expect_ack_message().never();
        resolver
            .expect_reject_message()
            .times(1)
            .returning(|| Err(AmqpError::RejectMessageError("channel closed".to_owned())));

        let mut reporter = MockErrorReporter::new();
        reporter
            .expect_report()
            .withf(|operation, _, _| operation == "unhandled")
            .times(1)
            .return_const(());
        reporter
            .expect_report()
            .withf(|operation, _, _| operation == "reject")
            .times(1)
            .return_const(());

        consume(
            &tracer(),
            "orders.created",
            delivery("created", resolver),
            &handlers,
            &reporter,
        )
        .await;
    }

    #[test]
    fn panic_payloads_are_described() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "unknown panic payload");
    }
}
