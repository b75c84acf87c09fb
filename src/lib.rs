// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Reliable at-least-once delivery of messages from a PostgreSQL outbox to
//! RabbitMQ, with delayed jobs, bounded retries and reconciliation sweeps.

mod otel;

pub mod channel;
pub mod config;
pub mod consumer;
pub mod delivery;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod factory;
pub mod failsafe;
pub mod ingest;
pub mod model;
pub mod payload;
pub mod processor;
pub mod publisher;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod topology;

#[cfg(any(test, feature = "test-tools"))]
pub mod testing;
