// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! [`RecordingBroker`] stands in for RabbitMQ in tests: it records declares,
//! publishes and channel-transaction events, and can be told to fail the next
//! connects, publishes or transaction commits. Publishes made inside a
//! channel transaction only become visible on `tx_commit`.

use crate::{
    channel::{AmqpChannel, BrokerConnector},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    publisher::OutboundMessage,
    queue::QueueDefinition,
};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};

/// A publish that reached the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub message: OutboundMessage,
}

/// Broker-side events in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connect,
    DeclareExchange(String),
    DeclareQueue(String),
    Publish(String, String),
    TxSelect,
    TxCommit,
    TxRollback,
    Close,
}

#[derive(Default)]
struct State {
    events: Vec<BrokerEvent>,
    published: Vec<Published>,
    exchanges: Vec<String>,
    queues: Vec<String>,
    fail_connects: usize,
    fail_publishes: usize,
    fail_commits: usize,
    fail_closes: usize,
}

/// Recording [`BrokerConnector`].
#[derive(Clone, Default)]
pub struct RecordingBroker {
    state: Arc<Mutex<State>>,
}

impl RecordingBroker {
    pub fn new() -> RecordingBroker {
        RecordingBroker::default()
    }

    /// A channel on this broker, bypassing connect failure injection.
    pub fn channel(&self) -> RecordingChannel {
        RecordingChannel {
            broker: self.clone(),
            tx: Mutex::new(None),
        }
    }

    pub fn fail_connects(&self, times: usize) {
        self.lock().fail_connects = times;
    }

    pub fn fail_publishes(&self, times: usize) {
        self.lock().fail_publishes = times;
    }

    pub fn fail_commits(&self, times: usize) {
        self.lock().fail_commits = times;
    }

    /// Makes the next `times` channel closes report a connection error
    /// after recording the close.
    pub fn fail_closes(&self, times: usize) {
        self.lock().fail_closes = times;
    }

    pub fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    /// `(exchange, routing_key)` of every visible publish.
    pub fn routes(&self) -> Vec<(String, String)> {
        self.lock()
            .published
            .iter()
            .map(|p| (p.exchange.clone(), p.routing_key.clone()))
            .collect()
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.lock().events.clone()
    }

    pub fn declared_exchanges(&self) -> Vec<String> {
        self.lock().exchanges.clone()
    }

    pub fn declared_queues(&self) -> Vec<String> {
        self.lock().queues.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BrokerConnector for RecordingBroker {
    async fn open_channel(&self) -> Result<Box<dyn AmqpChannel>, AmqpError> {
        {
            let mut state = self.lock();
            if state.fail_connects > 0 {
                state.fail_connects -= 1;
                return Err(AmqpError::ConnectionError);
            }
            state.events.push(BrokerEvent::Connect);
        }

        Ok(Box::new(self.channel()))
    }
}

/// Channel of a [`RecordingBroker`].
pub struct RecordingChannel {
    broker: RecordingBroker,
    tx: Mutex<Option<Vec<Published>>>,
}

impl RecordingChannel {
    fn tx(&self) -> MutexGuard<'_, Option<Vec<Published>>> {
        self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AmqpChannel for RecordingChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.events.push(BrokerEvent::DeclareExchange(def.name.clone()));
        if !state.exchanges.contains(&def.name) {
            state.exchanges.push(def.name.clone());
        }
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.events.push(BrokerEvent::DeclareQueue(def.name.clone()));
        if !state.queues.contains(&def.name) {
            state.queues.push(def.name.clone());
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        msg: &OutboundMessage,
    ) -> Result<(), AmqpError> {
        let published = Published {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            message: msg.clone(),
        };

        let mut state = self.broker.lock();
        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(AmqpError::PublishingError(exchange.to_owned()));
        }
        state
            .events
            .push(BrokerEvent::Publish(exchange.to_owned(), routing_key.to_owned()));

        match self.tx().as_mut() {
            Some(pending) => pending.push(published),
            None => state.published.push(published),
        }
        Ok(())
    }

    async fn tx_select(&self) -> Result<(), AmqpError> {
        self.broker.lock().events.push(BrokerEvent::TxSelect);
        *self.tx() = Some(Vec::new());
        Ok(())
    }

    async fn tx_commit(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        if state.fail_commits > 0 {
            state.fail_commits -= 1;
            return Err(AmqpError::TransactionError("injected".to_owned()));
        }
        state.events.push(BrokerEvent::TxCommit);

        let mut tx = self.tx();
        if let Some(pending) = tx.as_mut() {
            state.published.append(pending);
        }
        Ok(())
    }

    async fn tx_rollback(&self) -> Result<(), AmqpError> {
        self.broker.lock().events.push(BrokerEvent::TxRollback);
        if let Some(pending) = self.tx().as_mut() {
            pending.clear();
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let mut state = self.broker.lock();
        state.events.push(BrokerEvent::Close);
        if state.fail_closes > 0 {
            state.fail_closes -= 1;
            return Err(AmqpError::ConnectionError);
        }
        Ok(())
    }
}
