// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Declarations
//!
//! An exchange exists in two forms here:
//! - [`ExchangeDeclaration`]: the configured form, read from the declarations
//!   file, where names and argument values may be `$ref`s and unset flags
//!   fall back to safe defaults
//! - [`ExchangeDefinition`]: the resolved form handed to the broker

use crate::topology::ArgValue;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use serde::Deserialize;
use std::collections::BTreeMap;

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Extension for delayed message delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    #[serde(rename = "x-delayed-message")]
    XMessageDelayed,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
        }
    }
}

/// Configured exchange, keyed by its logical name.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExchangeDeclaration {
    /// Broker name; `$` means the parameter named like the logical key.
    pub name: String,
    #[serde(default, alias = "type")]
    pub kind: ExchangeKind,
    pub durable: Option<bool>,
    pub auto_delete: Option<bool>,
    pub internal: Option<bool>,
    pub no_wait: Option<bool>,
    #[serde(default)]
    pub arguments: BTreeMap<String, ArgValue>,
}

/// Resolved exchange, ready to be declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDefinition {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub delete: bool,
    pub internal: bool,
    pub no_wait: bool,
    pub params: BTreeMap<String, ArgValue>,
}

impl ExchangeDefinition {
    /// Creates a durable direct exchange definition.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            durable: true,
            delete: false,
            internal: false,
            no_wait: false,
            params: BTreeMap::default(),
        }
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn param(mut self, key: &str, value: ArgValue) -> Self {
        self.params.insert(key.to_owned(), value);
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn delete(mut self, delete: bool) -> Self {
        self.delete = delete;
        self
    }

    pub fn internal(mut self, internal: bool) -> Self {
        self.internal = internal;
        self
    }

    pub fn no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    /// Declaration arguments as an AMQP field table.
    pub fn field_table(&self) -> FieldTable {
        to_field_table(&self.params)
    }
}

pub(crate) fn to_field_table(params: &BTreeMap<String, ArgValue>) -> FieldTable {
    let mut table = BTreeMap::<ShortString, AMQPValue>::new();

    for (key, value) in params {
        let amqp = match value {
            ArgValue::Bool(v) => AMQPValue::Boolean(*v),
            ArgValue::Int(v) => AMQPValue::LongLongInt(*v),
            ArgValue::Text(v) => AMQPValue::LongString(LongString::from(v.as_str())),
        };
        table.insert(ShortString::from(key.as_str()), amqp);
    }

    FieldTable::from(table)
}
