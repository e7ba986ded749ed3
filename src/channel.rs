// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module handles the creation of AMQP connections and channels. The
//! service keeps two independent connections, one for consuming and one for
//! producing, each with a single channel. Keeping them apart means a backed-up
//! consumer never throttles publishing, and an error on one channel (a failed
//! ack, say) never poisons the other.

use crate::{configs::RabbitMQConfigs, errors::AmqpError};
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Reply code sent to the broker on a normal close.
const REPLY_SUCCESS: u16 = 200;

/// The consumer and producer sides of the broker link.
pub struct AmqpConnections {
    pub consumer_conn: Arc<Connection>,
    pub consumer_channel: Arc<Channel>,
    pub producer_conn: Arc<Connection>,
    pub producer_channel: Arc<Channel>,
}

impl AmqpConnections {
    /// Opens the consumer and producer connections and a channel on each.
    ///
    /// Any failure is returned to the caller; nothing opened so far is kept.
    pub async fn connect(cfg: &RabbitMQConfigs) -> Result<AmqpConnections, AmqpError> {
        let (consumer_conn, consumer_channel) =
            new_amqp_channel(cfg, &format!("{}-consumer", cfg.app_name)).await?;

        let (producer_conn, producer_channel) =
            match new_amqp_channel(cfg, &format!("{}-producer", cfg.app_name)).await {
                Ok(pair) => pair,
                Err(err) => {
                    close_connection(&consumer_conn).await;
                    return Err(err);
                }
            };

        Ok(AmqpConnections {
            consumer_conn,
            consumer_channel,
            producer_conn,
            producer_channel,
        })
    }

    /// Closes both channels and both connections. Errors are only logged.
    pub async fn close(&self) {
        for (side, channel) in [
            ("consumer", &self.consumer_channel),
            ("producer", &self.producer_channel),
        ] {
            if let Err(err) = channel.close(REPLY_SUCCESS, "shutdown").await {
                warn!(error = err.to_string(), side = side, "failure to close channel");
            }
        }

        close_connection(&self.consumer_conn).await;
        close_connection(&self.producer_conn).await;
    }
}

/// Creates a new AMQP connection and a channel on it.
///
/// The connection is dialed as many times as the configured
/// [`ReconnectPolicy`](crate::configs::ReconnectPolicy) allows; with the
/// default policy the first failure is final.
pub async fn new_amqp_channel(
    cfg: &RabbitMQConfigs,
    connection_name: &str,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    let uri = cfg.amqp_uri()?;
    let attempts = cfg.reconnect.attempts();

    let mut attempt = 1;
    let conn = loop {
        debug!(attempt = attempt, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(connection_name.to_owned()));

        match Connection::connect(&uri, options).await {
            Ok(c) => break c,
            Err(err) if attempt < attempts => {
                warn!(
                    error = err.to_string(),
                    attempt = attempt,
                    "failure to connect, retrying"
                );
                attempt += 1;
                tokio::time::sleep(cfg.reconnect.interval()).await;
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                return Err(AmqpError::ConnectionError(err.to_string()));
            }
        }
    };
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            close_connection(&conn).await;
            Err(AmqpError::ChannelError(err.to_string()))
        }
    }
}

async fn close_connection(conn: &Connection) {
    if let Err(err) = conn.close(REPLY_SUCCESS, "shutdown").await {
        warn!(error = err.to_string(), "failure to close connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::ReconnectPolicy;
    use std::time::{Duration, Instant};

    fn unreachable_broker(reconnect: ReconnectPolicy) -> RabbitMQConfigs {
        RabbitMQConfigs {
            host: "127.0.0.1".to_owned(),
            // nothing listens on the discard port
            port: 9,
            reconnect,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unreachable_broker_is_a_connection_error() {
        let res = AmqpConnections::connect(&unreachable_broker(ReconnectPolicy::Never)).await;
        assert!(matches!(res, Err(AmqpError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn fixed_policy_retries_before_failing() {
        let cfg = unreachable_broker(ReconnectPolicy::Fixed {
            max_attempts: 3,
            interval_ms: 50,
        });

        let started = Instant::now();
        let res = new_amqp_channel(&cfg, "test").await;

        assert!(matches!(res, Err(AmqpError::ConnectionError(_))));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
