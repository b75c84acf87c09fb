// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Job
//!
//! One delivery attempt for one message:
//!
//! 1. lock the message row; a missing or settled message is a no-op
//! 2. publish the wire form to every subscription still `Scheduled`,
//!    marking each `Published` in its own short transaction
//! 3. move a `Scheduled` message to `Processing` once every publish went out
//!
//! A failed attempt bumps the retry counter and re-arms itself after a fixed
//! backoff, or marks the message `Failed` once the ceiling is reached. The
//! counter is committed either way.
//!
//! An attempt holds two store transactions at its peak, the locked outer one
//! and a short one per `Published` mark. Attempts are therefore capped at
//! half the pool size so armed jobs can never starve each other of
//! connections.

use crate::{
    channel::AmqpChannel,
    config::Settings,
    errors::DeliveryError,
    factory::ConnectionFactory,
    model::{Message, MessageState, Subscription, SUBSCRIPTION_PUBLISHED},
    payload::{DeliveryMessage, HINT_TAG},
    publisher::OutboundMessage,
    scheduler::{Schedule, ScheduledJob, Scheduler},
    store::Transaction,
};
use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Retry policy and per-publish options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Failed attempts after which the message is marked `Failed`.
    pub max_retries: i64,
    /// Wait before a failed attempt runs again.
    pub backoff: Duration,
    /// Per-message TTL in milliseconds.
    pub message_ttl: Option<u64>,
    /// Attempts allowed to run at the same time.
    pub max_in_flight: usize,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        DeliveryPolicy {
            max_retries: 10,
            backoff: Duration::from_secs(15),
            message_ttl: None,
            max_in_flight: 5,
        }
    }
}

impl DeliveryPolicy {
    /// Reads the retry tunables and sizes the in-flight cap to half the
    /// store pool, never below one.
    pub fn from_settings(settings: &Settings) -> DeliveryPolicy {
        DeliveryPolicy {
            max_retries: settings.max_retries,
            backoff: settings.retry_backoff(),
            message_ttl: settings.message_ttl,
            max_in_flight: (settings.database_max_connections as usize / 2).max(1),
        }
    }
}

/// Result of an attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// No message with the requested id exists.
    Missing,
    /// The message already reached `Succeeded`, `Failed` or `Rollback`.
    AlreadySettled,
    /// Every pending subscription was published.
    Delivered { published: usize },
}

/// Delivers outbox messages to their subscriptions and re-arms failed
/// attempts on the [`Scheduler`].
///
/// Always handled through an `Arc`, since armed attempts keep a reference
/// to the job that runs them.
pub struct DeliveryJob {
    factory: ConnectionFactory,
    scheduler: Scheduler,
    policy: DeliveryPolicy,
    in_flight: Semaphore,
}

impl DeliveryJob {
    /// Creates a delivery job.
    ///
    /// # Parameters
    /// * `factory` - Source of store transactions and broker channels
    /// * `scheduler` - Scheduler that armed attempts are registered with
    /// * `policy` - Retry, TTL and concurrency settings
    pub fn new(
        factory: ConnectionFactory,
        scheduler: Scheduler,
        policy: DeliveryPolicy,
    ) -> Arc<DeliveryJob> {
        let in_flight = Semaphore::new(policy.max_in_flight.max(1));

        Arc::new(DeliveryJob {
            factory,
            scheduler,
            policy,
            in_flight,
        })
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Arms a delivery attempt of `message_id`.
    pub fn arm(self: &Arc<Self>, message_id: &str, schedule: Schedule) {
        self.scheduler.arm(message_id, schedule, self.clone());
    }

    /// Re-arms every `Processing` message immediately. Returns how many were
    /// armed.
    pub async fn rebuild(self: &Arc<Self>) -> Result<usize, DeliveryError> {
        let ids = {
            let mut tx = self.factory.begin().await?;
            Message::find_processing_ids(tx.executor()).await?
        };

        for id in &ids {
            self.arm(id, Schedule::Now);
        }
        info!(count = ids.len(), "scheduler rebuilt from processing messages");

        Ok(ids.len())
    }

    /// Runs one delivery attempt, waiting for a free in-flight slot first.
    ///
    /// # Returns
    /// The outcome of the attempt, or the error that failed it once the
    /// retry counter was recorded.
    pub async fn deliver(self: &Arc<Self>, message_id: &str) -> Result<DeliveryOutcome, DeliveryError> {
        let _slot = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| DeliveryError::Cancelled)?;
        let mut tx = self.factory.begin().await?;

        let Some(mut message) = Message::find_one(message_id, true, tx.executor()).await? else {
            debug!(message_id, "message not found, nothing to deliver");
            return Ok(DeliveryOutcome::Missing);
        };
        if message.state.is_settled() {
            debug!(message_id, state = %message.state, "message already settled");
            return Ok(DeliveryOutcome::AlreadySettled);
        }

        let pending: Vec<Subscription> = message
            .fetch_subscriptions(tx.executor())
            .await?
            .into_iter()
            .filter(Subscription::is_scheduled)
            .collect();

        match self.publish_pending(&message, &pending).await {
            Ok(published) => {
                if message.state == MessageState::Scheduled {
                    message
                        .change_state(MessageState::Processing, tx.executor())
                        .await?;
                }
                tx.commit().await?;

                debug!(message_id, published, "delivery attempt succeeded");
                Ok(DeliveryOutcome::Delivered { published })
            }
            Err(err) => {
                warn!(error = err.to_string(), message_id, "delivery attempt failed");
                self.record_failure(&mut message, tx).await?;
                Err(err)
            }
        }
    }

    async fn publish_pending(
        &self,
        message: &Message,
        pending: &[Subscription],
    ) -> Result<usize, DeliveryError> {
        if pending.is_empty() {
            return Ok(0);
        }

        let channel = self.factory.open_channel().await?;
        let result = self.publish_each(channel.as_ref(), message, pending).await;

        if let Err(err) = channel.close().await {
            warn!(error = err.to_string(), "failure to close delivery channel");
        }

        result
    }

    async fn publish_each(
        &self,
        channel: &dyn AmqpChannel,
        message: &Message,
        pending: &[Subscription],
    ) -> Result<usize, DeliveryError> {
        let body = DeliveryMessage::for_message(message)
            .with_extension(HINT_TAG, &message.publisher)
            .to_bytes()?;
        let outbound = OutboundMessage::new(body)
            .kind(&message.message_type)
            .message_id(&message.id)
            .expiration(self.policy.message_ttl);

        for subscription in pending {
            channel
                .publish(&subscription.exchange, &subscription.route_key, &outbound)
                .await?;
            self.mark_published(subscription).await?;
        }

        Ok(pending.len())
    }

    async fn mark_published(&self, subscription: &Subscription) -> Result<(), DeliveryError> {
        let mut tx = self.factory.begin().await?;
        let mut subscription = subscription.clone();

        subscription
            .change_state(SUBSCRIPTION_PUBLISHED, "", tx.executor())
            .await?;
        tx.commit().await?;

        Ok(())
    }

    async fn record_failure(
        self: &Arc<Self>,
        message: &mut Message,
        mut tx: Box<dyn Transaction>,
    ) -> Result<(), DeliveryError> {
        let retry = if message.retry >= self.policy.max_retries {
            message.retry
        } else {
            message.increase_retry(tx.executor()).await?
        };

        if retry >= self.policy.max_retries {
            message
                .change_state(MessageState::Failed, tx.executor())
                .await?;
            tx.commit().await?;
            self.scheduler.cancel(&message.id);

            error!(message_id = message.id, retry, "retries exhausted, message failed");
            return Ok(());
        }

        tx.commit().await?;
        self.arm(&message.id, Schedule::After(self.policy.backoff));
        debug!(message_id = message.id, retry, "delivery re-armed");

        Ok(())
    }
}

#[async_trait]
impl ScheduledJob for DeliveryJob {
    async fn run(self: Arc<Self>, message_id: String) {
        if let Err(err) = self.deliver(&message_id).await {
            error!(error = err.to_string(), message_id, "delivery job failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::StoreError,
        payload::{IngestPayload, IngestRequest, SubscriptionPayload},
        store::{memory::MemoryStore, Row, ScriptExecutor, Store, Value},
        testing::RecordingBroker,
    };
    use tokio::sync::OwnedSemaphorePermit;

    /// Hands out at most `size` transactions at once and gives up after an
    /// acquire timeout, the way a connection pool does.
    struct BoundedStore {
        inner: MemoryStore,
        pool: Arc<Semaphore>,
    }

    impl BoundedStore {
        fn new(inner: MemoryStore, size: usize) -> BoundedStore {
            BoundedStore {
                inner,
                pool: Arc::new(Semaphore::new(size)),
            }
        }
    }

    struct Pooled {
        inner: Box<dyn Transaction>,
        _connection: OwnedSemaphorePermit,
    }

    #[async_trait]
    impl Store for BoundedStore {
        async fn begin(&self) -> Result<Box<dyn Transaction>, StoreError> {
            tokio::task::yield_now().await;
            let connection =
                tokio::time::timeout(Duration::from_secs(30), self.pool.clone().acquire_owned())
                    .await
                    .map_err(|_| StoreError::Backend("pool timed out".to_owned()))?
                    .map_err(|_| StoreError::Backend("pool closed".to_owned()))?;

            Ok(Box::new(Pooled {
                inner: self.inner.begin().await?,
                _connection: connection,
            }))
        }
    }

    #[async_trait]
    impl ScriptExecutor for Pooled {
        async fn exec_script(&mut self, name: &str, params: &[Value]) -> Result<u64, StoreError> {
            self.inner.exec_script(name, params).await
        }

        async fn query_script(
            &mut self,
            name: &str,
            params: &[Value],
        ) -> Result<Vec<Row>, StoreError> {
            self.inner.query_script(name, params).await
        }
    }

    #[async_trait]
    impl Transaction for Pooled {
        async fn commit(self: Box<Self>) -> Result<(), StoreError> {
            let Pooled { inner, _connection } = *self;
            inner.commit().await
        }

        fn executor(&mut self) -> &mut dyn ScriptExecutor {
            self
        }
    }

    struct Fixture {
        store: MemoryStore,
        broker: RecordingBroker,
        job: Arc<DeliveryJob>,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let broker = RecordingBroker::new();
        let factory = ConnectionFactory::new(Arc::new(store.clone()), Arc::new(broker.clone()));
        let job = DeliveryJob::new(factory, Scheduler::new(), DeliveryPolicy::default());

        Fixture { store, broker, job }
    }

    async fn ingest(store: &MemoryStore, subs: &[(&str, &str, &str)]) -> Message {
        let request = IngestRequest::parse(IngestPayload {
            message_type: "order.created".to_owned(),
            content: "{\"id\":7}".to_owned(),
            subscriptions: subs
                .iter()
                .map(|(tag, exchange, key)| SubscriptionPayload {
                    tag: tag.to_string(),
                    exchange: exchange.to_string(),
                    route_key: key.to_string(),
                })
                .collect(),
            ..IngestPayload::default()
        })
        .unwrap();

        let mut tx = store.begin().await.unwrap();
        let msg = Message::append_message(&request, None, tx.executor())
            .await
            .unwrap();
        tx.commit().await.unwrap();
        msg
    }

    async fn load(store: &MemoryStore, id: &str) -> (Message, Vec<Subscription>) {
        let mut tx = store.begin().await.unwrap();
        let msg = Message::find_one(id, false, tx.executor())
            .await
            .unwrap()
            .unwrap();
        let subs = msg.fetch_subscriptions(tx.executor()).await.unwrap();
        (msg, subs)
    }

    #[tokio::test]
    async fn missing_message_is_a_no_op() {
        let f = fixture();

        let outcome = f.job.deliver("0190a7c2d1e84b7f9c1e2d3f4a5b6c7d").await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Missing);
        assert!(f.broker.events().is_empty());
    }

    #[tokio::test]
    async fn publishes_every_scheduled_subscription() {
        let f = fixture();
        let msg = ingest(
            &f.store,
            &[("billing", "orders", "billing.new"), ("mail", "notify", "mail.new")],
        )
        .await;

        let outcome = f.job.deliver(&msg.id).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Delivered { published: 2 });
        assert_eq!(
            f.broker.routes(),
            vec![
                ("orders".to_owned(), "billing.new".to_owned()),
                ("notify".to_owned(), "mail.new".to_owned())
            ]
        );
        let (stored, subs) = load(&f.store, &msg.id).await;
        assert_eq!(stored.state, MessageState::Processing);
        assert!(subs.iter().all(|s| s.state_name == SUBSCRIPTION_PUBLISHED));

        let wire = DeliveryMessage::from_bytes(&f.broker.published()[0].message.body).unwrap();
        assert_eq!(wire.message_id, msg.id);
        assert_eq!(wire.content, "{\"id\":7}");
    }

    #[tokio::test]
    async fn delivered_message_produces_no_writes() {
        let f = fixture();
        let msg = ingest(&f.store, &[("billing", "orders", "billing.new")]).await;
        f.job.deliver(&msg.id).await.unwrap();
        let logs_before = f.store.rows("message_logs").len();
        let flows_before = f.store.rows("flows").len();

        let outcome = f.job.deliver(&msg.id).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Delivered { published: 0 });
        assert_eq!(f.broker.published().len(), 1);
        assert_eq!(f.store.rows("message_logs").len(), logs_before);
        assert_eq!(f.store.rows("flows").len(), flows_before);
    }

    #[tokio::test]
    async fn settled_message_is_left_alone() {
        let f = fixture();
        let msg = ingest(&f.store, &[("billing", "orders", "billing.new")]).await;
        let mut tx = f.store.begin().await.unwrap();
        let mut stored = Message::find_one(&msg.id, true, tx.executor())
            .await
            .unwrap()
            .unwrap();
        stored
            .change_state(MessageState::Failed, tx.executor())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(
            f.job.deliver(&msg.id).await.unwrap(),
            DeliveryOutcome::AlreadySettled
        );
        assert!(f.broker.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_publish_is_retried_after_backoff() {
        let f = fixture();
        let msg = ingest(&f.store, &[("billing", "orders", "billing.new")]).await;
        f.broker.fail_publishes(1);

        assert!(f.job.deliver(&msg.id).await.is_err());
        let (stored, _) = load(&f.store, &msg.id).await;
        assert_eq!(stored.retry, 1);
        assert_eq!(stored.state, MessageState::Scheduled);
        assert!(f.job.scheduler().is_armed(&msg.id));

        tokio::time::sleep(Duration::from_secs(14)).await;
        assert!(f.broker.published().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        let (stored, subs) = load(&f.store, &msg.id).await;
        assert_eq!(stored.state, MessageState::Processing);
        assert_eq!(subs[0].state_name, SUBSCRIPTION_PUBLISHED);
        assert_eq!(f.broker.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_the_message() {
        let f = fixture();
        let msg = ingest(&f.store, &[("billing", "orders", "billing.new")]).await;
        f.broker.fail_publishes(usize::MAX);

        f.job.arm(&msg.id, Schedule::Now);
        tokio::time::sleep(Duration::from_secs(10 * 15 + 60)).await;

        let (stored, _) = load(&f.store, &msg.id).await;
        assert_eq!(stored.state, MessageState::Failed);
        assert_eq!(stored.retry, 10);
        assert!(!f.job.scheduler().is_armed(&msg.id));

        let mut tx = f.store.begin().await.unwrap();
        let logs = stored.fetch_logs(tx.executor()).await.unwrap();
        let path: Vec<_> = logs.iter().map(|l| (l.original_state, l.state)).collect();
        assert_eq!(
            path,
            vec![
                (MessageState::Unknown, MessageState::Scheduled),
                (MessageState::Scheduled, MessageState::Failed)
            ]
        );
    }

    #[tokio::test]
    async fn unreachable_broker_counts_as_a_failed_attempt() {
        let f = fixture();
        let msg = ingest(&f.store, &[("billing", "orders", "billing.new")]).await;
        f.broker.fail_connects(1);

        let err = f.job.deliver(&msg.id).await.unwrap_err();

        assert!(matches!(err, DeliveryError::Amqp(_)));
        assert_eq!(load(&f.store, &msg.id).await.0.retry, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsaved_retry_counter_is_surfaced_and_not_rearmed() {
        let f = fixture();
        let msg = ingest(&f.store, &[("billing", "orders", "billing.new")]).await;
        f.broker.fail_publishes(1);
        f.store.fail_next("IncreaseMessageRetry", 1);

        let err = f.job.deliver(&msg.id).await.unwrap_err();

        assert!(matches!(err, DeliveryError::Store(_)));
        assert!(!f.job.scheduler().is_armed(&msg.id));
        let (stored, _) = load(&f.store, &msg.id).await;
        assert_eq!(stored.retry, 0);
        assert_eq!(stored.state, MessageState::Scheduled);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_published_mark_counts_as_a_failed_attempt() {
        let f = fixture();
        let msg = ingest(&f.store, &[("billing", "orders", "billing.new")]).await;
        f.store.fail_next("ChangeSubscriptionState", 1);

        assert!(f.job.deliver(&msg.id).await.is_err());

        let (stored, subs) = load(&f.store, &msg.id).await;
        assert_eq!(stored.retry, 1);
        assert_eq!(stored.state, MessageState::Scheduled);
        assert_eq!(subs[0].state_name, "Scheduled");
        assert_eq!(f.broker.published().len(), 1);
        assert!(f.job.scheduler().is_armed(&msg.id));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_attempts_on_one_message_publish_once() {
        let f = fixture();
        let msg = ingest(&f.store, &[("billing", "orders", "billing.new")]).await;

        let mut holder = f.store.begin().await.unwrap();
        Message::find_one(&msg.id, true, holder.executor())
            .await
            .unwrap();

        let attempts: Vec<_> = (0..2)
            .map(|_| {
                let job = f.job.clone();
                let id = msg.id.clone();
                tokio::spawn(async move { job.deliver(&id).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(f.broker.published().is_empty());

        drop(holder);
        let mut outcomes = Vec::new();
        for attempt in attempts {
            outcomes.push(attempt.await.unwrap().unwrap());
        }

        assert!(outcomes.contains(&DeliveryOutcome::Delivered { published: 1 }));
        assert!(outcomes.contains(&DeliveryOutcome::Delivered { published: 0 }));
        assert_eq!(f.broker.published().len(), 1);

        let (stored, _) = load(&f.store, &msg.id).await;
        let mut tx = f.store.begin().await.unwrap();
        let logs = stored.fetch_logs(tx.executor()).await.unwrap();
        let promotions = logs
            .iter()
            .filter(|l| {
                l.original_state == MessageState::Scheduled && l.state == MessageState::Processing
            })
            .count();
        assert_eq!(promotions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_never_exhaust_the_pool() {
        let store = MemoryStore::new();
        let broker = RecordingBroker::new();
        let factory = ConnectionFactory::new(
            Arc::new(BoundedStore::new(store.clone(), 2)),
            Arc::new(broker.clone()),
        );
        let policy = DeliveryPolicy {
            max_in_flight: 1,
            ..DeliveryPolicy::default()
        };
        let job = DeliveryJob::new(factory, Scheduler::new(), policy);
        let first = ingest(&store, &[("billing", "orders", "billing.new")]).await;
        let second = ingest(&store, &[("mail", "notify", "mail.new")]).await;

        let (a, b) = tokio::join!(job.deliver(&first.id), job.deliver(&second.id));

        assert_eq!(a.unwrap(), DeliveryOutcome::Delivered { published: 1 });
        assert_eq!(b.unwrap(), DeliveryOutcome::Delivered { published: 1 });
        assert_eq!(broker.published().len(), 2);
        for id in [&first.id, &second.id] {
            let (stored, subs) = load(&store, id).await;
            assert_eq!(stored.retry, 0);
            assert_eq!(stored.state, MessageState::Processing);
            assert_eq!(subs[0].state_name, SUBSCRIPTION_PUBLISHED);
        }
    }

    #[test]
    fn in_flight_cap_is_half_the_pool() {
        let mut settings = Settings::default();
        assert_eq!(DeliveryPolicy::from_settings(&settings).max_in_flight, 5);

        settings.database_max_connections = 1;
        assert_eq!(DeliveryPolicy::from_settings(&settings).max_in_flight, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rebuild_rearms_processing_messages() {
        let f = fixture();
        let msg = ingest(&f.store, &[("billing", "orders", "billing.new")]).await;
        let mut tx = f.store.begin().await.unwrap();
        let mut stored = Message::find_one(&msg.id, true, tx.executor())
            .await
            .unwrap()
            .unwrap();
        stored
            .change_state(MessageState::Processing, tx.executor())
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(f.job.rebuild().await.unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(f.broker.published().len(), 1);
        assert_eq!(load(&f.store, &msg.id).await.1[0].state_name, SUBSCRIPTION_PUBLISHED);
    }
}
