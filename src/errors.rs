// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Delivery Layer
//!
//! Four error families live here:
//! - `AmqpError`: everything that can go wrong talking to RabbitMQ
//! - `StoreError`: persistence, owner-id validation and state machine violations
//! - `DeliveryError`: the top-level error returned by delivery, ingestion and
//!   reconciliation operations
//! - `ConfigError`: loading settings and declaration files
//!
//! "Not found" is never an error in this crate; reads return `Option`.

use crate::model::MessageState;
use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
///
/// Each variant names the broker operation that failed. The underlying lapin
/// error is logged at the failure site and, where useful, carried as text.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// A logical declaration key has no configured declaration
    #[error("declaration `{0}` not found")]
    UnknownDeclaration(String),

    /// A `$ref` could not be resolved against the parameter store
    #[error("parameter `{0}` not found")]
    UnresolvedParameter(String),

    /// Error publishing a message
    #[error("failure to publish to `{0}`")]
    PublishingError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error starting, committing or rolling back a channel transaction
    #[error("failure on channel transaction: {0}")]
    TransactionError(String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),
}

/// Errors raised by the persistence layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A required owning id (message id, subscription id) was empty
    #[error("{0} was required")]
    MissingOwner(&'static str),

    /// Input rejected before touching the store
    #[error("validation failed: {0}")]
    Validation(String),

    /// The named script is not registered
    #[error("script `{0}` not found")]
    UnknownScript(String),

    /// A row did not carry the expected column or type
    #[error("column `{column}` missing or not {expected}")]
    Decode {
        column: String,
        expected: &'static str,
    },

    /// The requested transition is not allowed by the message state machine
    #[error("message {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: MessageState,
        to: MessageState,
    },

    /// Error returned from the database driver
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Error running the schema migrations
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Failure reported by a non-SQL backend
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Top-level error for delivery, ingestion and reconciliation.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Amqp(#[from] AmqpError),

    #[error("failure to serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl DeliveryError {
    /// Whether the error was raised before any persistence happened and will
    /// fail the same way on every retry.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DeliveryError::Validation(_)
                | DeliveryError::Serialization(_)
                | DeliveryError::Store(StoreError::Validation(_))
                | DeliveryError::Store(StoreError::MissingOwner(_))
        )
    }
}

/// Errors raised while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failure to read environment settings: {0}")]
    Env(#[from] envy::Error),

    #[error("failure to read `{path}`: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failure to parse `{path}`: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}
