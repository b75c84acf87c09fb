// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Resolution
//!
//! Components refer to exchanges and queues by logical key
//! (`backgroundjob_exchange`, `rollback_exchange`, ...). The
//! [`TopologyResolver`] turns a key into a concrete broker declaration:
//!
//! - a name of `$` is the parameter named like the key
//! - any other string starting with `$` (names, binding exchanges, argument
//!   values) is the parameter it names
//! - unset flags take safe defaults: durable, not auto-delete, not
//!   exclusive, not internal
//!
//! Resolved declarations are cached; declaring is idempotent on the broker
//! side, so components declare lazily right before they use a key.

use crate::{
    channel::AmqpChannel,
    config::{Declarations, Parameters},
    errors::AmqpError,
    exchange::{ExchangeDeclaration, ExchangeDefinition},
    queue::{QueueDeclaration, QueueDefinition},
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::{
    collections::{BTreeMap, HashMap},
    sync::RwLock,
};
use tracing::debug;

const REF_PREFIX: char = '$';

/// A declaration argument value.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

#[derive(Default)]
struct Cache {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueDefinition>,
}

/// Resolves and declares exchanges and queues by logical key.
pub struct TopologyResolver {
    params: Parameters,
    declarations: Declarations,
    cache: RwLock<Cache>,
}

impl TopologyResolver {
    pub fn new(params: Parameters, declarations: Declarations) -> TopologyResolver {
        TopologyResolver {
            params,
            declarations,
            cache: RwLock::new(Cache::default()),
        }
    }

    pub fn resolve_exchange(&self, key: &str) -> Result<ExchangeDefinition, AmqpError> {
        if let Some(def) = self.read_cache(|c| c.exchanges.get(key).cloned()) {
            return Ok(def);
        }

        let decl = self
            .declarations
            .exchanges
            .get(key)
            .ok_or_else(|| AmqpError::UnknownDeclaration(key.to_owned()))?;
        let def = self.resolve_exchange_declaration(key, decl)?;
        debug!(key, name = def.name, "exchange resolved");

        self.write_cache(|c| {
            c.exchanges.insert(key.to_owned(), def.clone());
        });
        Ok(def)
    }

    pub fn resolve_queue(&self, key: &str) -> Result<QueueDefinition, AmqpError> {
        if let Some(def) = self.read_cache(|c| c.queues.get(key).cloned()) {
            return Ok(def);
        }

        let decl = self
            .declarations
            .queues
            .get(key)
            .ok_or_else(|| AmqpError::UnknownDeclaration(key.to_owned()))?;
        let def = self.resolve_queue_declaration(key, decl)?;
        debug!(key, name = def.name, "queue resolved");

        self.write_cache(|c| {
            c.queues.insert(key.to_owned(), def.clone());
        });
        Ok(def)
    }

    /// Declares the exchange of `key` and returns its broker name.
    pub async fn declare_exchange(
        &self,
        channel: &dyn AmqpChannel,
        key: &str,
    ) -> Result<String, AmqpError> {
        let def = self.resolve_exchange(key)?;
        channel.declare_exchange(&def).await?;
        Ok(def.name)
    }

    /// Declares the queue of `key` with its bindings and returns its broker
    /// name. Bound exchanges must already exist.
    pub async fn declare_queue(
        &self,
        channel: &dyn AmqpChannel,
        key: &str,
    ) -> Result<String, AmqpError> {
        let def = self.resolve_queue(key)?;
        channel.declare_queue(&def).await?;
        Ok(def.name)
    }

    fn resolve_exchange_declaration(
        &self,
        key: &str,
        decl: &ExchangeDeclaration,
    ) -> Result<ExchangeDefinition, AmqpError> {
        let mut def = ExchangeDefinition::new(&self.resolve_name(key, &decl.name)?)
            .kind(decl.kind.clone())
            .durable(decl.durable.unwrap_or(true))
            .delete(decl.auto_delete.unwrap_or(false))
            .internal(decl.internal.unwrap_or(false))
            .no_wait(decl.no_wait.unwrap_or(false));

        for (arg, value) in self.resolve_args(&decl.arguments)? {
            def = def.param(&arg, value);
        }

        Ok(def)
    }

    fn resolve_queue_declaration(
        &self,
        key: &str,
        decl: &QueueDeclaration,
    ) -> Result<QueueDefinition, AmqpError> {
        let mut def = QueueDefinition::new(&self.resolve_name(key, &decl.name)?)
            .durable(decl.durable.unwrap_or(true))
            .delete(decl.auto_delete.unwrap_or(false))
            .exclusive(decl.exclusive.unwrap_or(false))
            .no_wait(decl.no_wait.unwrap_or(false));

        for (arg, value) in self.resolve_args(&decl.arguments)? {
            def = def.param(&arg, value);
        }

        for binding in &decl.bindings {
            let exchange = self.resolve_text(&binding.exchange)?;
            def = def.bind(&exchange, &binding.routing_key);
        }

        Ok(def)
    }

    fn resolve_name(&self, key: &str, name: &str) -> Result<String, AmqpError> {
        if name.len() == 1 && name.starts_with(REF_PREFIX) {
            return self
                .params
                .text(key)
                .ok_or_else(|| AmqpError::UnresolvedParameter(key.to_owned()));
        }

        self.resolve_text(name)
    }

    fn resolve_text(&self, raw: &str) -> Result<String, AmqpError> {
        match raw.strip_prefix(REF_PREFIX) {
            Some(param) => self
                .params
                .text(param)
                .ok_or_else(|| AmqpError::UnresolvedParameter(param.to_owned())),
            None => Ok(raw.to_owned()),
        }
    }

    fn resolve_args(
        &self,
        args: &BTreeMap<String, ArgValue>,
    ) -> Result<BTreeMap<String, ArgValue>, AmqpError> {
        let mut resolved = BTreeMap::new();

        for (name, value) in args {
            let value = match value {
                ArgValue::Text(raw) => match raw.strip_prefix(REF_PREFIX) {
                    Some(param) => self.param_arg(param)?,
                    None => value.clone(),
                },
                other => other.clone(),
            };
            resolved.insert(name.clone(), value);
        }

        Ok(resolved)
    }

    fn param_arg(&self, param: &str) -> Result<ArgValue, AmqpError> {
        match self.params.get(param) {
            Some(JsonValue::Number(n)) => n
                .as_i64()
                .map(ArgValue::Int)
                .ok_or_else(|| AmqpError::UnresolvedParameter(param.to_owned())),
            Some(JsonValue::Bool(b)) => Ok(ArgValue::Bool(*b)),
            Some(JsonValue::String(s)) => Ok(ArgValue::Text(s.clone())),
            _ => Err(AmqpError::UnresolvedParameter(param.to_owned())),
        }
    }

    fn read_cache<T>(&self, f: impl FnOnce(&Cache) -> Option<T>) -> Option<T> {
        match self.cache.read() {
            Ok(cache) => f(&cache),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }

    fn write_cache(&self, f: impl FnOnce(&mut Cache)) {
        match self.cache.write() {
            Ok(mut cache) => f(&mut cache),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{resolve_declarations, DeclarationsFile, Settings},
        testing::RecordingBroker,
    };

    fn resolver(raw: &str) -> TopologyResolver {
        let file = DeclarationsFile::parse("inline", raw).unwrap();
        let (params, declarations) = resolve_declarations(&Settings::default(), file);
        TopologyResolver::new(params, declarations)
    }

    #[test]
    fn dollar_name_resolves_to_the_keyed_parameter() {
        let resolver = resolver(r#"{"parameters": {"backgroundjob_exchange": "jobs.direct"}}"#);

        let def = resolver.resolve_exchange("backgroundjob_exchange").unwrap();
        assert_eq!(def.name, "jobs.direct");
        assert!(def.durable);
        assert!(!def.delete);

        let queue = resolver.resolve_queue("backgroundjob_failsafe").unwrap();
        assert_eq!(queue.bindings[0].exchange_name, "jobs.direct");
        assert_eq!(queue.bindings[0].routing_key, "backgroundjob_failsafe");
    }

    #[test]
    fn numeric_parameters_become_integer_arguments() {
        let resolver = resolver(
            r#"{"parameters": {"ttl": 30000, "mode": "lazy"},
                "queues": {"audit": {"name": "audit", "durable": false,
                    "arguments": {"x-message-ttl": "$ttl", "x-queue-mode": "$mode", "x-single-active-consumer": true}}}}"#,
        );

        let def = resolver.resolve_queue("audit").unwrap();
        assert!(!def.durable);
        assert_eq!(def.params["x-message-ttl"], ArgValue::Int(30_000));
        assert_eq!(def.params["x-queue-mode"], ArgValue::Text("lazy".to_owned()));
        assert_eq!(def.params["x-single-active-consumer"], ArgValue::Bool(true));
    }

    #[test]
    fn unresolved_references_and_unknown_keys_fail() {
        let resolver = resolver(r#"{"exchanges": {"audit": {"name": "$missing"}}}"#);

        assert_eq!(
            resolver.resolve_exchange("audit"),
            Err(AmqpError::UnresolvedParameter("missing".to_owned()))
        );
        assert_eq!(
            resolver.resolve_queue("nope"),
            Err(AmqpError::UnknownDeclaration("nope".to_owned()))
        );
    }

    #[tokio::test]
    async fn declares_through_the_channel() {
        let resolver = resolver("{}");
        let broker = RecordingBroker::new();
        let channel = broker.channel();

        let exchange = resolver
            .declare_exchange(&channel, "backgroundjob_exchange")
            .await
            .unwrap();
        let queue = resolver
            .declare_queue(&channel, "backgroundjob_failsafe")
            .await
            .unwrap();

        assert_eq!(exchange, "backgroundjob_exchange");
        assert_eq!(queue, "backgroundjob_failsafe");
        assert_eq!(
            broker.declared_exchanges(),
            vec!["backgroundjob_exchange".to_owned()]
        );
        assert_eq!(
            broker.declared_queues(),
            vec!["backgroundjob_failsafe".to_owned()]
        );
    }
}
