// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Connection Factory
//!
//! Hands out store transactions and broker channels. It holds no state of
//! its own beyond the two backends, so it is cheap to clone into every
//! component that needs either.

use crate::{
    channel::{AmqpChannel, BrokerConnector},
    errors::{AmqpError, StoreError},
    store::{Store, Transaction},
};
use std::sync::Arc;

#[derive(Clone)]
pub struct ConnectionFactory {
    store: Arc<dyn Store>,
    broker: Arc<dyn BrokerConnector>,
}

impl ConnectionFactory {
    pub fn new(store: Arc<dyn Store>, broker: Arc<dyn BrokerConnector>) -> ConnectionFactory {
        ConnectionFactory { store, broker }
    }

    /// Begins a read-committed store transaction.
    pub async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
        self.store.begin().await
    }

    /// Opens a new broker channel on a new connection.
    pub async fn open_channel(&self) -> Result<Box<dyn AmqpChannel>, AmqpError> {
        self.broker.open_channel().await
    }
}
