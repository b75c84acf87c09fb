// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Reconciliation Processors
//!
//! Sweepers that settle messages the delivery path left behind. Each call to
//! [`Processor::process`] handles at most one message, picked with
//! `FOR UPDATE SKIP LOCKED` so concurrent sweepers never contend on a row.

use crate::{
    channel::AmqpChannel,
    config::Settings,
    errors::DeliveryError,
    factory::ConnectionFactory,
    model::{unix_now, Message, MessageState, Subscription},
    payload::{DeliveryMessage, HINT_EXCHANGE, HINT_PUBLISHER, HINT_ROUTEKEY, HINT_TAG},
    publisher::OutboundMessage,
    topology::TopologyResolver,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Tag set on compensating messages.
pub const ROLLBACK_TAG: &str = "rollback_processor";

/// Outcome of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// A message was handled; call again right away.
    MoreWork,
    /// Nothing to do for now.
    Idle,
}

/// A background loop body driven by the
/// [`Supervisor`](crate::supervisor::Supervisor).
#[async_trait]
pub trait Processor: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Runs one unit of work.
    ///
    /// # Returns
    /// * `Ok(Progress::MoreWork)` - Something was handled; call again at once
    /// * `Ok(Progress::Idle)` - No candidate was found
    /// * `Err(DeliveryError)` - The unit failed and its transaction was
    ///   rolled back
    async fn process(&self) -> Result<Progress, DeliveryError>;
}

/// Moves one aged Processing message to a terminal state.
pub struct StateSweeper {
    name: &'static str,
    factory: ConnectionFactory,
    script: &'static str,
    target: MessageState,
    age_secs: i64,
}

impl StateSweeper {
    /// Processing messages with every subscription delivered become
    /// Succeeded after `age_secs`.
    pub fn succeeded(factory: ConnectionFactory, age_secs: i64) -> StateSweeper {
        StateSweeper {
            name: "succeed_processor",
            factory,
            script: "FindOneSucceedMessage",
            target: MessageState::Succeeded,
            age_secs,
        }
    }

    /// Processing messages with an undelivered subscription become Failed
    /// after `age_secs`.
    pub fn failed(factory: ConnectionFactory, age_secs: i64) -> StateSweeper {
        StateSweeper {
            name: "failed_processor",
            factory,
            script: "FindOneFailedMessage",
            target: MessageState::Failed,
            age_secs,
        }
    }
}

#[async_trait]
impl Processor for StateSweeper {
    fn name(&self) -> &str {
        self.name
    }

    async fn process(&self) -> Result<Progress, DeliveryError> {
        let threshold = unix_now() - self.age_secs;
        let mut tx = self.factory.begin().await?;

        let Some(mut message) =
            Message::find_one_by(self.script, &[threshold.into()], tx.executor()).await?
        else {
            return Ok(Progress::Idle);
        };

        message.change_state(self.target, tx.executor()).await?;
        tx.commit().await?;

        info!(message_id = message.id, state = %self.target, "message settled by sweeper");
        Ok(Progress::MoreWork)
    }
}

/// Sends compensating messages for one Failed message and moves it to
/// Rollback.
///
/// The broker transaction commits before the store one: a store commit
/// failure leaves the message Failed, so it is swept again and receivers may
/// see its compensation twice, but never miss it.
pub struct RollbackSweeper {
    factory: ConnectionFactory,
    topology: Arc<TopologyResolver>,
    exchange_key: String,
}

impl RollbackSweeper {
    /// Creates the sweeper publishing to the rollback exchange named in
    /// `settings`.
    pub fn new(
        factory: ConnectionFactory,
        topology: Arc<TopologyResolver>,
        settings: &Settings,
    ) -> RollbackSweeper {
        RollbackSweeper {
            factory,
            topology,
            exchange_key: settings.rollback_exchange.clone(),
        }
    }

    async fn compensate(
        &self,
        channel: &dyn AmqpChannel,
        message: &Message,
        subscriptions: &[Subscription],
    ) -> Result<(), DeliveryError> {
        let exchange = self
            .topology
            .declare_exchange(channel, &self.exchange_key)
            .await?;
        channel.tx_select().await?;

        let published = async {
            for subscription in subscriptions {
                let body = DeliveryMessage::for_message(message)
                    .with_extension(HINT_EXCHANGE, &subscription.exchange)
                    .with_extension(HINT_ROUTEKEY, &subscription.route_key)
                    .with_extension(HINT_PUBLISHER, &message.publisher)
                    .with_extension(HINT_TAG, ROLLBACK_TAG)
                    .to_bytes()?;
                let outbound = OutboundMessage::new(body)
                    .kind(&message.message_type)
                    .message_id(&message.id);

                channel
                    .publish(&exchange, &subscription.receiver_tag, &outbound)
                    .await?;
            }
            channel.tx_commit().await?;
            Ok::<(), DeliveryError>(())
        }
        .await;

        if published.is_err() {
            if let Err(err) = channel.tx_rollback().await {
                warn!(error = err.to_string(), "failure to roll back broker transaction");
            }
        }

        published
    }
}

#[async_trait]
impl Processor for RollbackSweeper {
    fn name(&self) -> &str {
        "rollback_processor"
    }

    async fn process(&self) -> Result<Progress, DeliveryError> {
        let mut tx = self.factory.begin().await?;

        let Some(mut message) =
            Message::find_one_by("FindOneRollbackMessage", &[], tx.executor()).await?
        else {
            return Ok(Progress::Idle);
        };

        let subscriptions = message.fetch_subscriptions(tx.executor()).await?;
        message
            .change_state(MessageState::Rollback, tx.executor())
            .await?;

        if !subscriptions.is_empty() {
            let channel = self.factory.open_channel().await?;
            let result = self.compensate(channel.as_ref(), &message, &subscriptions).await;
            if let Err(err) = channel.close().await {
                warn!(error = err.to_string(), "failure to close rollback channel");
            }
            result?;
        }

        if let Err(err) = tx.commit().await {
            error!(
                error = err.to_string(),
                message_id = message.id,
                "compensation sent but rollback state not stored"
            );
            return Err(err.into());
        }

        debug!(
            message_id = message.id,
            receivers = subscriptions.len(),
            "message rolled back"
        );
        Ok(Progress::MoreWork)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{resolve_declarations, DeclarationsFile},
        payload::{IngestPayload, IngestRequest, SubscriptionPayload},
        store::{memory::MemoryStore, Store},
        testing::{BrokerEvent, RecordingBroker},
    };

    struct Fixture {
        store: MemoryStore,
        broker: RecordingBroker,
        factory: ConnectionFactory,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let broker = RecordingBroker::new();
        let factory = ConnectionFactory::new(Arc::new(store.clone()), Arc::new(broker.clone()));

        Fixture {
            store,
            broker,
            factory,
        }
    }

    fn rollback_sweeper(f: &Fixture) -> RollbackSweeper {
        let settings = Settings::default();
        let (params, declarations) = resolve_declarations(&settings, DeclarationsFile::default());

        RollbackSweeper::new(
            f.factory.clone(),
            Arc::new(TopologyResolver::new(params, declarations)),
            &settings,
        )
    }

    /// Stores a message with `(tag, state_name)` subscriptions and walks it
    /// to `state`.
    async fn seed(store: &MemoryStore, subs: &[(&str, &str)], state: MessageState) -> String {
        let request = IngestRequest::parse(IngestPayload {
            message_type: "order.paid".to_owned(),
            content: "{}".to_owned(),
            subscriptions: subs
                .iter()
                .map(|(tag, _)| SubscriptionPayload {
                    tag: tag.to_string(),
                    exchange: format!("{tag}_exchange"),
                    route_key: format!("{tag}.key"),
                })
                .collect(),
            ..IngestPayload::default()
        })
        .unwrap();

        let mut tx = store.begin().await.unwrap();
        let mut message = Message::append_message(&request, None, tx.executor())
            .await
            .unwrap();
        for mut sub in message.fetch_subscriptions(tx.executor()).await.unwrap() {
            let (_, name) = subs.iter().find(|(tag, _)| *tag == sub.receiver_tag).unwrap();
            if *name != sub.state_name {
                sub.change_state(name, "", tx.executor()).await.unwrap();
            }
        }
        for next in [MessageState::Processing, MessageState::Failed] {
            if message.state == state {
                break;
            }
            message.change_state(next, tx.executor()).await.unwrap();
        }
        tx.commit().await.unwrap();

        message.id
    }

    async fn state_of(store: &MemoryStore, id: &str) -> MessageState {
        let mut tx = store.begin().await.unwrap();
        Message::find_one(id, false, tx.executor())
            .await
            .unwrap()
            .unwrap()
            .state
    }

    #[tokio::test]
    async fn delivered_message_succeeds_once_old_enough() {
        let f = fixture();
        let id = seed(&f.store, &[("a", "Published")], MessageState::Processing).await;
        let sweeper = StateSweeper::succeeded(f.factory.clone(), 60);

        assert_eq!(sweeper.process().await.unwrap(), Progress::Idle);
        assert_eq!(state_of(&f.store, &id).await, MessageState::Processing);

        f.store.backdate_message(&id, 61);
        assert_eq!(sweeper.process().await.unwrap(), Progress::MoreWork);
        assert_eq!(state_of(&f.store, &id).await, MessageState::Succeeded);
        assert_eq!(sweeper.process().await.unwrap(), Progress::Idle);
    }

    #[tokio::test]
    async fn undelivered_message_fails_after_two_minutes() {
        let f = fixture();
        let old = seed(
            &f.store,
            &[("a", "Published"), ("b", "Scheduled")],
            MessageState::Processing,
        )
        .await;
        let young = seed(&f.store, &[("b", "Scheduled")], MessageState::Processing).await;
        f.store.backdate_message(&old, 121);
        f.store.backdate_message(&young, 90);

        let failed = StateSweeper::failed(f.factory.clone(), 120);
        let succeeded = StateSweeper::succeeded(f.factory.clone(), 60);

        assert_eq!(succeeded.process().await.unwrap(), Progress::Idle);
        assert_eq!(failed.process().await.unwrap(), Progress::MoreWork);
        assert_eq!(failed.process().await.unwrap(), Progress::Idle);

        assert_eq!(state_of(&f.store, &old).await, MessageState::Failed);
        assert_eq!(state_of(&f.store, &young).await, MessageState::Processing);
    }

    #[tokio::test]
    async fn rollback_publishes_compensation_per_receiver() {
        let f = fixture();
        let id = seed(
            &f.store,
            &[("billing", "Published"), ("stock", "Failed")],
            MessageState::Failed,
        )
        .await;

        assert_eq!(
            rollback_sweeper(&f).process().await.unwrap(),
            Progress::MoreWork
        );

        assert_eq!(state_of(&f.store, &id).await, MessageState::Rollback);
        assert_eq!(
            f.broker.routes(),
            vec![
                ("rollback_exchange".to_owned(), "billing".to_owned()),
                ("rollback_exchange".to_owned(), "stock".to_owned())
            ]
        );
        let wire = DeliveryMessage::from_bytes(&f.broker.published()[1].message.body).unwrap();
        assert_eq!(wire.message_id, id);
        assert_eq!(wire.extensions.get(HINT_TAG).unwrap(), ROLLBACK_TAG);
        assert_eq!(wire.extensions.get(HINT_EXCHANGE).unwrap(), "stock_exchange");
        assert_eq!(wire.extensions.get(HINT_ROUTEKEY).unwrap(), "stock.key");

        let events = f.broker.events();
        let select = events.iter().position(|e| *e == BrokerEvent::TxSelect).unwrap();
        let commit = events.iter().position(|e| *e == BrokerEvent::TxCommit).unwrap();
        assert!(select < commit);
    }

    #[tokio::test]
    async fn broker_failure_keeps_the_message_failed() {
        let f = fixture();
        let id = seed(&f.store, &[("billing", "Published")], MessageState::Failed).await;
        f.broker.fail_commits(1);

        assert!(rollback_sweeper(&f).process().await.is_err());

        assert_eq!(state_of(&f.store, &id).await, MessageState::Failed);
        assert!(f.broker.published().is_empty());
        assert!(f.broker.events().contains(&BrokerEvent::TxRollback));

        assert_eq!(
            rollback_sweeper(&f).process().await.unwrap(),
            Progress::MoreWork
        );
        assert_eq!(state_of(&f.store, &id).await, MessageState::Rollback);
        assert_eq!(f.broker.published().len(), 1);
    }

    #[tokio::test]
    async fn close_failure_does_not_undo_the_rollback() {
        let f = fixture();
        let id = seed(&f.store, &[("billing", "Published")], MessageState::Failed).await;
        f.broker.fail_closes(1);

        assert_eq!(
            rollback_sweeper(&f).process().await.unwrap(),
            Progress::MoreWork
        );
        assert_eq!(state_of(&f.store, &id).await, MessageState::Rollback);
        assert!(f.broker.events().contains(&BrokerEvent::Close));
    }

    #[tokio::test]
    async fn nothing_to_roll_back_is_idle() {
        let f = fixture();
        seed(&f.store, &[("billing", "Published")], MessageState::Processing).await;

        assert_eq!(rollback_sweeper(&f).process().await.unwrap(), Progress::Idle);
        assert!(f.broker.events().is_empty());
    }
}
