// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Ingestion
//!
//! Entry points a producer-facing layer calls. Every operation persists first
//! and talks to the broker or the scheduler only once the store accepted the
//! message, so nothing is published for a message that does not exist.

use crate::{
    config::Settings,
    delivery::DeliveryJob,
    errors::DeliveryError,
    factory::ConnectionFactory,
    model::{ExtensionHandler, JobExtension, Message, MessageState, Subscription},
    payload::{
        ChangeStatePayload, DelayRequest, DeliveryMessage, IngestPayload, IngestRequest,
        EXT_EVENT_EXCHANGE, HINT_EXCHANGE, HINT_QUEUE, HINT_ROUTEKEY, HINT_TAG,
    },
    publisher::OutboundMessage,
    scheduler::Schedule,
    topology::TopologyResolver,
};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exchange and routing key recorded for a subscription first seen through
/// a status report.
const UNKNOWN_ROUTE: &str = "UNKNOWN";

/// Producer-facing operations over the outbox: background and delayed
/// jobs, failsafe parking, real-time events and receiver status reports.
pub struct Ingestor {
    factory: ConnectionFactory,
    topology: Arc<TopologyResolver>,
    job: Arc<DeliveryJob>,
    failsafe_exchange: String,
    failsafe_queue: String,
    failsafe_retry: Duration,
}

impl Ingestor {
    /// Creates an ingestor.
    ///
    /// # Parameters
    /// * `factory` - Source of store transactions and broker channels
    /// * `topology` - Resolves the failsafe exchange and queue
    /// * `job` - Delivery job that scheduled messages are armed on
    /// * `settings` - Failsafe declaration keys and retry interval
    pub fn new(
        factory: ConnectionFactory,
        topology: Arc<TopologyResolver>,
        job: Arc<DeliveryJob>,
        settings: &Settings,
    ) -> Ingestor {
        Ingestor {
            factory,
            topology,
            job,
            failsafe_exchange: settings.failsafe_exchange.clone(),
            failsafe_queue: settings.failsafe_queue.clone(),
            failsafe_retry: settings.failsafe_retry(),
        }
    }

    /// Persists a background or delayed job and arms its delivery. Returns
    /// the message id.
    pub async fn schedule_job(&self, payload: IngestPayload) -> Result<String, DeliveryError> {
        let request = IngestRequest::parse(payload)?;
        self.schedule(&request).await
    }

    /// Persists `request` with its job row, moving delayed messages straight
    /// to Processing, then arms the delivery once the transaction committed.
    pub async fn schedule(&self, request: &IngestRequest) -> Result<String, DeliveryError> {
        let delay = request.job.delay;
        let extension = JobExtension::new(request.job.clone());
        let handler: &dyn ExtensionHandler = &extension;

        let mut tx = self.factory.begin().await?;
        let mut message = Message::append_message(request, Some(handler), tx.executor()).await?;
        if !delay.is_immediate() {
            message
                .change_state(MessageState::Processing, tx.executor())
                .await?;
        }
        tx.commit().await?;

        self.job.arm(&message.id, Schedule::after_secs(delay.seconds));
        info!(
            message_id = message.id,
            delay = delay.seconds,
            "job scheduled"
        );

        Ok(message.id)
    }

    /// Parks a delayed job on the failsafe queue, retrying until the broker
    /// accepts it or `token` is cancelled.
    pub async fn enqueue_failsafe(
        &self,
        payload: &IngestPayload,
        token: &CancellationToken,
    ) -> Result<(), DeliveryError> {
        DelayRequest::require(&payload.extensions)?;
        let outbound = OutboundMessage::new(serde_json::to_vec(payload)?).kind(&payload.message_type);

        loop {
            match self.try_enqueue(&outbound).await {
                Ok(()) => {
                    debug!(queue = self.failsafe_queue, "payload parked on failsafe queue");
                    return Ok(());
                }
                Err(err) => warn!(
                    error = err.to_string(),
                    retry_in = self.failsafe_retry.as_secs(),
                    "failure to enqueue on failsafe queue"
                ),
            }

            tokio::select! {
                _ = token.cancelled() => return Err(DeliveryError::Cancelled),
                _ = tokio::time::sleep(self.failsafe_retry) => {}
            }
        }
    }

    async fn try_enqueue(&self, outbound: &OutboundMessage) -> Result<(), DeliveryError> {
        let channel = self.factory.open_channel().await?;

        let result = async {
            let exchange = self
                .topology
                .declare_exchange(channel.as_ref(), &self.failsafe_exchange)
                .await?;
            let queue = self
                .topology
                .declare_queue(channel.as_ref(), &self.failsafe_queue)
                .await?;
            channel.publish(&exchange, &queue, outbound).await
        }
        .await;

        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "failure to close failsafe channel");
        }
        Ok(result?)
    }

    /// Publishes a real-time event straight to the exchange named in its
    /// extensions, keeping the usual audit trail. Returns the message id.
    pub async fn publish_event(&self, payload: IngestPayload) -> Result<String, DeliveryError> {
        let request = IngestRequest::parse(payload)?;
        let routing = request.routing.clone().ok_or_else(|| {
            DeliveryError::Validation(format!("key `{EXT_EVENT_EXCHANGE}` not found in extensions"))
        })?;

        let mut tx = self.factory.begin().await?;
        let message = Message::append_message(&request, None, tx.executor()).await?;

        let mut wire = DeliveryMessage::for_message(&message)
            .with_extension(HINT_TAG, &message.publisher)
            .with_extension(HINT_EXCHANGE, &routing.exchange)
            .with_extension(HINT_ROUTEKEY, &routing.route_key);
        if let Some(queue) = &routing.queue {
            wire = wire.with_extension(HINT_QUEUE, queue);
        }
        let outbound = OutboundMessage::new(wire.to_bytes()?)
            .kind(&message.message_type)
            .message_id(&message.id);

        let channel = self.factory.open_channel().await?;
        let published = channel
            .publish(&routing.exchange, routing.effective_route_key(), &outbound)
            .await;
        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "failure to close event channel");
        }
        published?;
        tx.commit().await?;

        let mut tx = self.factory.begin().await?;
        if let Some(mut stored) = Message::find_one(&message.id, true, tx.executor()).await? {
            if stored.state == MessageState::Scheduled {
                stored
                    .change_state(MessageState::Processing, tx.executor())
                    .await?;
            }
        }
        tx.commit().await?;

        debug!(message_id = message.id, exchange = routing.exchange, "event published");
        Ok(message.id)
    }

    /// Records a receiver's status for a message, creating its subscription
    /// on first report.
    pub async fn change_state(&self, payload: &ChangeStatePayload) -> Result<(), DeliveryError> {
        for (field, value) in [
            ("message_id", &payload.message_id),
            ("state", &payload.new_state),
            ("tag", &payload.client_tag),
        ] {
            if value.trim().is_empty() {
                return Err(DeliveryError::Validation(format!("`{field}` was required")));
            }
        }

        let mut tx = self.factory.begin().await?;
        match Subscription::find_one_locked(&payload.message_id, &payload.client_tag, tx.executor())
            .await?
        {
            Some(mut subscription) => {
                subscription
                    .change_state(&payload.new_state, &payload.remark, tx.executor())
                    .await?;
            }
            None => {
                let route = |key: &str| {
                    payload
                        .exts
                        .get(key)
                        .cloned()
                        .unwrap_or_else(|| UNKNOWN_ROUTE.to_owned())
                };
                let mut subscription = Subscription {
                    message_id: payload.message_id.clone(),
                    receiver_tag: payload.client_tag.clone(),
                    exchange: route(HINT_EXCHANGE),
                    route_key: route(HINT_ROUTEKEY),
                    state_name: payload.new_state.clone(),
                    ..Subscription::default()
                };
                subscription.append(tx.executor()).await?;
                subscription
                    .append_flow(&payload.remark, tx.executor())
                    .await?;
            }
        }
        tx.commit().await?;

        debug!(
            message_id = payload.message_id,
            tag = payload.client_tag,
            state = payload.new_state,
            "subscription state changed"
        );
        Ok(())
    }
}
