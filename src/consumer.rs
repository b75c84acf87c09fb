// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Handling
//!
//! Every delivery taken off a queue goes through a [`ConsumeHandler`], which
//! decides a [`Disposition`]; the disposition is then applied through an
//! [`Acknowledger`]. The handler never touches the acknowledgement itself.

use crate::{
    channel::AmqpChannel,
    errors::{AmqpError, DeliveryError},
    otel,
};
use async_trait::async_trait;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicNackOptions},
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::borrow::Cow;
use tracing::{debug, error};

/// What to do with a consumed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The delivery was handled and leaves the queue
    Ack,
    /// The delivery was rejected; `requeue` puts it back on the queue
    Nack { requeue: bool },
}

/// Acknowledges one delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

#[async_trait]
impl Acknowledger for Acker {
    async fn ack(&self) -> Result<(), AmqpError> {
        Acker::ack(self, BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        Acker::nack(
            self,
            BasicNackOptions {
                multiple: false,
                requeue,
            },
        )
        .await
        .map(|_| ())
        .map_err(|err| {
            error!(error = err.to_string(), "error whiling nack msg");
            AmqpError::NackMessageError
        })
    }
}

/// Handles the deliveries of one queue.
#[async_trait]
pub trait ConsumeHandler: Send + Sync {
    /// Declares whatever the queue needs and returns the queue name to
    /// consume. Runs on every (re)connection.
    async fn setup(&self, channel: &dyn AmqpChannel) -> Result<String, DeliveryError>;

    /// Decides the fate of one delivery body.
    async fn handle(&self, body: &[u8]) -> Disposition;
}

/// Applies `disposition` through `acker`.
pub async fn settle(acker: &dyn Acknowledger, disposition: Disposition) -> Result<(), AmqpError> {
    match disposition {
        Disposition::Ack => acker.ack().await,
        Disposition::Nack { requeue } => acker.nack(requeue).await,
    }
}

/// Runs `handler` on `body` and settles the delivery.
pub async fn process(
    handler: &dyn ConsumeHandler,
    body: &[u8],
    acker: &dyn Acknowledger,
) -> Result<Disposition, AmqpError> {
    let disposition = handler.handle(body).await;
    settle(acker, disposition).await?;
    Ok(disposition)
}

/// Processes a lapin delivery inside a consumer span continuing the
/// producer's trace.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    queue: &str,
    delivery: &Delivery,
    handler: &dyn ConsumeHandler,
) -> Result<(), AmqpError> {
    let mut span = otel::consumer_span(&delivery.properties, tracer, queue);
    debug!(queue, delivery_tag = delivery.delivery_tag, "received delivery");

    match process(handler, &delivery.data, &delivery.acker).await {
        Ok(Disposition::Ack) => {
            span.set_status(Status::Ok);
            Ok(())
        }
        Ok(Disposition::Nack { requeue }) => {
            span.set_status(Status::Error {
                description: Cow::from(if requeue { "requeued" } else { "rejected" }),
            });
            Ok(())
        }
        Err(err) => {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("failure to settle delivery"),
            });
            Err(err)
        }
    }
}
