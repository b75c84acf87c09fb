// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! The relay talks to the broker through [`AmqpChannel`], opened on demand by
//! a [`BrokerConnector`]. Every delivery attempt opens its own channel and
//! closes it when done, so a broken connection never outlives one attempt.
//!
//! [`LapinConnector`] / [`LapinChannel`] are the RabbitMQ implementation.

use crate::{
    config::Settings, errors::AmqpError, exchange::ExchangeDefinition, publisher::OutboundMessage,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    Channel, Connection, ConnectionProperties,
};
use opentelemetry::Context;
use tracing::{debug, error, warn};

const REPLY_SUCCESS: u16 = 200;

/// Broker operations the relay needs.
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Idempotently declares an exchange.
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Idempotently declares a queue and its bindings.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    /// Publishes `msg` to `exchange` with `routing_key`.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange; the empty string is the default exchange
    /// * `routing_key` - Routing key, or the queue name on the default exchange
    /// * `msg` - Body and properties; the current trace context is added to
    ///   its headers
    ///
    /// # Returns
    /// `AmqpError::PublishingError` when the broker refuses the publish.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        msg: &OutboundMessage,
    ) -> Result<(), AmqpError>;

    /// Puts the channel in transactional mode.
    async fn tx_select(&self) -> Result<(), AmqpError>;

    /// Makes every publish since the last commit visible at once.
    async fn tx_commit(&self) -> Result<(), AmqpError>;

    /// Discards every publish since the last commit.
    async fn tx_rollback(&self) -> Result<(), AmqpError>;

    /// Closes the channel and its connection, if it owns one.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Opens broker channels on demand.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Opens a channel the caller owns and must close.
    async fn open_channel(&self) -> Result<Box<dyn AmqpChannel>, AmqpError>;
}

/// Connects to RabbitMQ with lapin.
#[derive(Debug, Clone)]
pub struct LapinConnector {
    uri: String,
    connection_name: String,
}

impl LapinConnector {
    pub fn new(uri: &str, connection_name: &str) -> LapinConnector {
        LapinConnector {
            uri: uri.to_owned(),
            connection_name: connection_name.to_owned(),
        }
    }

    pub fn from_settings(settings: &Settings) -> LapinConnector {
        LapinConnector::new(&settings.amqp_uri(), &settings.app_name)
    }

    /// Establishes a new connection.
    pub async fn connect(&self) -> Result<Connection, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError)
            }
        }?;
        debug!("amqp connected");

        Ok(conn)
    }

    /// Creates a channel on `conn`.
    pub async fn create_channel(conn: &Connection) -> Result<Channel, AmqpError> {
        debug!("creating amqp channel...");
        match conn.create_channel().await {
            Ok(c) => {
                debug!("channel created");
                Ok(c)
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError)
            }
        }
    }
}

#[async_trait]
impl BrokerConnector for LapinConnector {
    async fn open_channel(&self) -> Result<Box<dyn AmqpChannel>, AmqpError> {
        let connection = self.connect().await?;
        let channel = match Self::create_channel(&connection).await {
            Ok(channel) => channel,
            Err(err) => {
                let _ = connection.close(REPLY_SUCCESS, "channel failure").await;
                return Err(err);
            }
        };

        Ok(Box::new(LapinChannel {
            connection: Some(connection),
            channel,
        }))
    }
}

/// [`AmqpChannel`] over a lapin channel, optionally owning its connection.
pub struct LapinChannel {
    connection: Option<Connection>,
    channel: Channel,
}

impl LapinChannel {
    /// Wraps a channel whose connection is owned elsewhere.
    pub fn borrowed(channel: Channel) -> LapinChannel {
        LapinChannel {
            connection: None,
            channel,
        }
    }

    pub fn inner(&self) -> &Channel {
        &self.channel
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                lapin::ExchangeKind::from(&def.kind),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                def.field_table(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(AmqpError::DeclareExchangeError(def.name.clone()))
            }
            _ => Ok(()),
        }?;

        debug!("exchange: {} was created", def.name);
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                def.field_table(),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(def.name.clone()))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }?;

        for binding in &def.bindings {
            debug!(
                "binding queue: {} to the exchange: {} with the key: {}",
                def.name, binding.exchange_name, binding.routing_key
            );

            match self
                .channel
                .queue_bind(
                    &def.name,
                    &binding.exchange_name,
                    &binding.routing_key,
                    QueueBindOptions { nowait: false },
                    FieldTable::default(),
                )
                .await
            {
                Err(err) => {
                    error!(error = err.to_string(), "error to bind queue to exchange");

                    Err(AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        def.name.clone(),
                    ))
                }
                _ => Ok(()),
            }?;
        }

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        msg: &OutboundMessage,
    ) -> Result<(), AmqpError> {
        match self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.body,
                msg.properties(&Context::current()),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    exchange, routing_key, "error publishing message"
                );
                Err(AmqpError::PublishingError(exchange.to_owned()))
            }
            _ => Ok(()),
        }
    }

    async fn tx_select(&self) -> Result<(), AmqpError> {
        self.channel.tx_select().await.map_err(|err| {
            error!(error = err.to_string(), "failure to start channel transaction");
            AmqpError::TransactionError(err.to_string())
        })
    }

    async fn tx_commit(&self) -> Result<(), AmqpError> {
        self.channel.tx_commit().await.map_err(|err| {
            error!(error = err.to_string(), "failure to commit channel transaction");
            AmqpError::TransactionError(err.to_string())
        })
    }

    async fn tx_rollback(&self) -> Result<(), AmqpError> {
        self.channel.tx_rollback().await.map_err(|err| {
            error!(error = err.to_string(), "failure to roll back channel transaction");
            AmqpError::TransactionError(err.to_string())
        })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if let Err(err) = self.channel.close(REPLY_SUCCESS, "closing").await {
            warn!(error = err.to_string(), "failure to close channel");
        }

        if let Some(connection) = &self.connection {
            if let Err(err) = connection.close(REPLY_SUCCESS, "closing").await {
                warn!(error = err.to_string(), "failure to close connection");
                return Err(AmqpError::ConnectionError);
            }
        }

        Ok(())
    }
}
