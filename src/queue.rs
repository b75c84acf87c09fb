// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Declarations
//!
//! Configured ([`QueueDeclaration`]) and resolved ([`QueueDefinition`])
//! forms of a queue together with its exchange bindings.

use crate::{exchange::to_field_table, topology::ArgValue};
use lapin::types::FieldTable;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Configured binding; `exchange` may be a `$ref`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BindingDeclaration {
    pub exchange: String,
    #[serde(default, alias = "key")]
    pub routing_key: String,
}

/// Configured queue, keyed by its logical name.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct QueueDeclaration {
    /// Broker name; `$` means the parameter named like the logical key.
    pub name: String,
    pub durable: Option<bool>,
    pub auto_delete: Option<bool>,
    pub exclusive: Option<bool>,
    pub no_wait: Option<bool>,
    #[serde(default)]
    pub arguments: BTreeMap<String, ArgValue>,
    #[serde(default)]
    pub bindings: Vec<BindingDeclaration>,
}

/// Resolved queue, ready to be declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDefinition {
    pub name: String,
    pub durable: bool,
    pub delete: bool,
    pub exclusive: bool,
    pub no_wait: bool,
    pub params: BTreeMap<String, ArgValue>,
    pub bindings: Vec<QueueBinding>,
}

impl QueueDefinition {
    /// Creates a durable, shared queue definition.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            durable: true,
            delete: false,
            exclusive: false,
            no_wait: false,
            params: BTreeMap::default(),
            bindings: vec![],
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn delete(mut self, delete: bool) -> Self {
        self.delete = delete;
        self
    }

    pub fn exclusive(mut self, exclusive: bool) -> Self {
        self.exclusive = exclusive;
        self
    }

    pub fn no_wait(mut self, no_wait: bool) -> Self {
        self.no_wait = no_wait;
        self
    }

    pub fn param(mut self, key: &str, value: ArgValue) -> Self {
        self.params.insert(key.to_owned(), value);
        self
    }

    pub fn bind(mut self, exchange: &str, routing_key: &str) -> Self {
        self.bindings.push(QueueBinding {
            exchange_name: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        });
        self
    }

    pub fn field_table(&self) -> FieldTable {
        to_field_table(&self.params)
    }
}

/// Binding of a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub exchange_name: String,
    pub routing_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declaration_reads_bindings_with_short_keys() {
        let decl: QueueDeclaration = serde_json::from_str(
            r#"{"name": "$", "arguments": {"x-max-length": 1000, "x-queue-mode": "$mode"},
                "bindings": [{"exchange": "$backgroundjob_exchange", "key": "failsafe"}]}"#,
        )
        .unwrap();

        assert_eq!(decl.bindings[0].routing_key, "failsafe");
        assert_eq!(decl.arguments["x-max-length"], ArgValue::Int(1000));
        assert_eq!(decl.arguments["x-queue-mode"], ArgValue::Text("$mode".to_owned()));
        assert_eq!(decl.exclusive, None);
    }

    #[test]
    fn params_become_field_table_entries() {
        let def = QueueDefinition::new("jobs")
            .param("x-message-ttl", ArgValue::Int(30_000))
            .bind("ex", "jobs");

        assert_eq!(def.params["x-message-ttl"], ArgValue::Int(30_000));
        assert_eq!(def.bindings.len(), 1);
        assert_eq!(def.field_table().inner().len(), 1);
    }
}
