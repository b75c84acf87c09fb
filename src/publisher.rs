// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Outbound Messages
//!
//! [`OutboundMessage`] is what the relay hands to an
//! [`AmqpChannel`](crate::channel::AmqpChannel) for publishing. Converting it
//! into AMQP properties injects the current OpenTelemetry context into the
//! message headers, so consumers can continue the trace.

use crate::otel::HeaderCarrier;
use lapin::{
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties,
};
use opentelemetry::{global, Context};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// A message ready to be published.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub kind: Option<String>,
    pub message_id: Option<String>,
    /// Per-message TTL in milliseconds.
    pub expiration: Option<u64>,
    pub persistent: bool,
}

impl OutboundMessage {
    /// Creates a persistent message carrying `body`.
    pub fn new(body: Vec<u8>) -> OutboundMessage {
        OutboundMessage {
            body,
            persistent: true,
            ..OutboundMessage::default()
        }
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    pub fn expiration(mut self, ttl_ms: Option<u64>) -> Self {
        self.expiration = ttl_ms;
        self
    }

    /// Builds the AMQP properties, propagating `ctx` in the headers.
    pub(crate) fn properties(&self, ctx: &Context) -> BasicProperties {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(ctx, &mut HeaderCarrier::new(&mut btree))
        });

        let message_id = self
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_message_id(ShortString::from(message_id))
            .with_headers(FieldTable::from(btree));

        if let Some(kind) = &self.kind {
            props = props.with_type(ShortString::from(kind.as_str()));
        }
        if let Some(ttl) = self.expiration {
            props = props.with_expiration(ShortString::from(ttl.to_string()));
        }
        if self.persistent {
            props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        props
    }
}
