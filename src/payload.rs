// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Wire Payloads
//!
//! JSON shapes crossing the process boundary and the typed values parsed out
//! of them. The loosely-typed `extensions` map is read exactly once, here;
//! everything downstream consumes [`DelayRequest`], [`JobRequest`] and
//! [`RoutingOverride`].

use crate::{
    errors::DeliveryError,
    model::{unix_now, Message},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Extension carrying the delay in seconds of a background job.
pub const EXT_DELAY: &str = "delay";
/// Longest accepted job delay, ten years in seconds.
pub const MAX_DELAY_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;
/// Extension carrying the at-style expression of a background job.
pub const EXT_EXPRESSION: &str = "expression";
pub const EXT_EVENT_EXCHANGE: &str = "x-event-exchange";
pub const EXT_EVENT_ROUTEKEY: &str = "x-event-routekey";
pub const EXT_EVENT_QUEUE: &str = "x-event-queue";

/// Routing hints attached to a [`DeliveryMessage`].
pub const HINT_TAG: &str = "x-relay-tag";
pub const HINT_EXCHANGE: &str = "x-relay-exchange";
pub const HINT_ROUTEKEY: &str = "x-relay-routekey";
pub const HINT_QUEUE: &str = "x-relay-queue";
pub const HINT_PUBLISHER: &str = "x-relay-publisher";

/// Ingestion payload as sent by producers or read from the failsafe queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestPayload {
    #[serde(rename = "type", default)]
    pub message_type: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default, alias = "subs")]
    pub subscriptions: Vec<SubscriptionPayload>,
    #[serde(default, alias = "exts")]
    pub extensions: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: PayloadHeaders,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionPayload {
    pub tag: String,
    pub exchange: String,
    #[serde(alias = "key")]
    pub route_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadHeaders {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<TimeHeader>,
}

/// Publish time header, accepted both as a JSON number and as a string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeHeader {
    Unix(i64),
    Text(String),
}

impl TimeHeader {
    fn seconds(&self) -> Result<i64, DeliveryError> {
        match self {
            TimeHeader::Unix(v) => Ok(*v),
            TimeHeader::Text(v) => v
                .trim()
                .parse()
                .map_err(|_| DeliveryError::Validation(format!("header `time` is not a unix time: {v}"))),
        }
    }
}

/// Payload of the change-state operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeStatePayload {
    pub message_id: String,
    #[serde(rename = "state")]
    pub new_state: String,
    #[serde(rename = "tag")]
    pub client_tag: String,
    #[serde(default)]
    pub remark: String,
    #[serde(default)]
    pub exts: BTreeMap<String, String>,
}

/// Delay of a background job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DelayRequest {
    pub seconds: u64,
}

impl DelayRequest {
    /// Reads the optional `delay` extension.
    pub fn from_extensions(
        exts: &BTreeMap<String, String>,
    ) -> Result<Option<DelayRequest>, DeliveryError> {
        let Some(raw) = exts.get(EXT_DELAY) else {
            return Ok(None);
        };

        match raw.trim().parse::<u64>() {
            Ok(seconds) if seconds <= MAX_DELAY_SECONDS => Ok(Some(DelayRequest { seconds })),
            Ok(_) => Err(DeliveryError::Validation(format!(
                "extension item '{EXT_DELAY}' exceeds {MAX_DELAY_SECONDS} seconds: {raw}"
            ))),
            Err(_) => Err(DeliveryError::Validation(format!(
                "extension item '{EXT_DELAY}' is not a non-negative integer: {raw}"
            ))),
        }
    }

    /// Reads the `delay` extension, failing when it is absent.
    pub fn require(exts: &BTreeMap<String, String>) -> Result<DelayRequest, DeliveryError> {
        Self::from_extensions(exts)?.ok_or_else(|| {
            DeliveryError::Validation(format!("extension item '{EXT_DELAY}' was required"))
        })
    }

    pub fn is_immediate(&self) -> bool {
        self.seconds == 0
    }
}

/// Scheduling extension of a background or delayed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub delay: DelayRequest,
    pub expression: String,
}

impl JobRequest {
    pub fn from_extensions(exts: &BTreeMap<String, String>) -> Result<JobRequest, DeliveryError> {
        let delay = DelayRequest::from_extensions(exts)?.unwrap_or_default();
        let expression = match exts.get(EXT_EXPRESSION) {
            Some(expr) if !expr.trim().is_empty() => expr.trim().to_owned(),
            _ => format!("now + {} seconds", delay.seconds),
        };

        Ok(JobRequest { delay, expression })
    }
}

/// Direct routing of a real-time event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingOverride {
    pub exchange: String,
    pub route_key: String,
    pub queue: Option<String>,
}

impl RoutingOverride {
    pub fn from_extensions(
        exts: &BTreeMap<String, String>,
    ) -> Result<Option<RoutingOverride>, DeliveryError> {
        let Some(exchange) = exts.get(EXT_EVENT_EXCHANGE) else {
            return Ok(None);
        };
        let Some(route_key) = exts.get(EXT_EVENT_ROUTEKEY) else {
            return Err(DeliveryError::Validation(format!(
                "key `{EXT_EVENT_ROUTEKEY}` not found in extensions"
            )));
        };

        Ok(Some(RoutingOverride {
            exchange: exchange.clone(),
            route_key: route_key.clone(),
            queue: exts.get(EXT_EVENT_QUEUE).filter(|q| !q.is_empty()).cloned(),
        }))
    }

    /// A target queue replaces the routing key.
    pub fn effective_route_key(&self) -> &str {
        self.queue.as_deref().unwrap_or(&self.route_key)
    }
}

/// Ingestion payload after boundary parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRequest {
    pub message_type: String,
    pub content: String,
    pub env: String,
    pub publisher: String,
    pub publish_time: i64,
    pub template: Option<String>,
    pub subscriptions: Vec<SubscriptionPayload>,
    pub job: JobRequest,
    pub routing: Option<RoutingOverride>,
}

impl IngestRequest {
    pub fn parse(payload: IngestPayload) -> Result<IngestRequest, DeliveryError> {
        let job = JobRequest::from_extensions(&payload.extensions)?;
        let routing = RoutingOverride::from_extensions(&payload.extensions)?;
        let publish_time = match &payload.headers.time {
            Some(time) => time.seconds()?,
            None => 0,
        };

        Ok(IngestRequest {
            message_type: payload.message_type,
            content: payload.content,
            env: payload.env,
            publisher: payload.headers.client.unwrap_or_default(),
            publish_time,
            template: payload.template,
            subscriptions: payload.subscriptions,
            job,
            routing,
        })
    }

    pub fn from_json(body: &[u8]) -> Result<IngestRequest, DeliveryError> {
        Self::parse(serde_json::from_slice(body)?)
    }
}

/// Body published to the broker for every delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryMessage {
    pub message_id: String,
    pub message_type: String,
    pub content: String,
    pub publish_time: i64,
    #[serde(rename = "exts", default)]
    pub extensions: BTreeMap<String, String>,
}

impl DeliveryMessage {
    /// Builds the wire form of a stored message, stamped with the current time.
    pub fn for_message(msg: &Message) -> DeliveryMessage {
        DeliveryMessage {
            message_id: msg.id.clone(),
            message_type: msg.message_type.clone(),
            content: msg.content.clone(),
            publish_time: unix_now(),
            extensions: BTreeMap::new(),
        }
    }

    pub fn with_extension(mut self, key: &str, value: impl Into<String>) -> Self {
        self.extensions.insert(key.to_owned(), value.into());
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, DeliveryError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(body: &[u8]) -> Result<DeliveryMessage, DeliveryError> {
        Ok(serde_json::from_slice(body)?)
    }
}
