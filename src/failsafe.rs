// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Failsafe Queue Handler
//!
//! Delayed jobs that could not be scheduled directly are parked on the
//! failsafe queue. [`FailsafeHandler`] turns each parked payload into a
//! persisted message plus an armed delivery.

use crate::{
    channel::AmqpChannel,
    config::Settings,
    consumer::{ConsumeHandler, Disposition},
    errors::DeliveryError,
    ingest::Ingestor,
    payload::{DelayRequest, IngestPayload, IngestRequest},
    topology::TopologyResolver,
};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, warn};

/// [`ConsumeHandler`] of the failsafe queue.
///
/// Invalid payloads are dropped, persistence failures are requeued and
/// everything else is acknowledged once the message is stored and armed.
pub struct FailsafeHandler {
    ingestor: Arc<Ingestor>,
    topology: Arc<TopologyResolver>,
    exchange_key: String,
    queue_key: String,
}

impl FailsafeHandler {
    /// Creates the handler for the failsafe exchange and queue named in
    /// `settings`.
    ///
    /// # Parameters
    /// * `ingestor` - Persists and arms each parked payload
    /// * `topology` - Resolves and declares the failsafe topology
    /// * `settings` - Supplies the failsafe declaration keys
    pub fn new(
        ingestor: Arc<Ingestor>,
        topology: Arc<TopologyResolver>,
        settings: &Settings,
    ) -> FailsafeHandler {
        FailsafeHandler {
            ingestor,
            topology,
            exchange_key: settings.failsafe_exchange.clone(),
            queue_key: settings.failsafe_queue.clone(),
        }
    }

    /// A parked payload must carry a valid delay.
    fn parse(body: &[u8]) -> Result<IngestRequest, DeliveryError> {
        let payload: IngestPayload = serde_json::from_slice(body)?;
        DelayRequest::require(&payload.extensions)?;
        IngestRequest::parse(payload)
    }
}

#[async_trait]
impl ConsumeHandler for FailsafeHandler {
    async fn setup(&self, channel: &dyn AmqpChannel) -> Result<String, DeliveryError> {
        self.topology
            .declare_exchange(channel, &self.exchange_key)
            .await?;
        Ok(self.topology.declare_queue(channel, &self.queue_key).await?)
    }

    async fn handle(&self, body: &[u8]) -> Disposition {
        let request = match Self::parse(body) {
            Ok(request) => request,
            Err(err) => {
                warn!(error = err.to_string(), "dropping invalid failsafe payload");
                return Disposition::Nack { requeue: false };
            }
        };

        match self.ingestor.schedule(&request).await {
            Ok(_) => Disposition::Ack,
            Err(err) if err.is_validation() => {
                warn!(error = err.to_string(), "dropping rejected failsafe payload");
                Disposition::Nack { requeue: false }
            }
            Err(err) => {
                error!(error = err.to_string(), "failure to persist failsafe payload");
                Disposition::Nack { requeue: true }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{resolve_declarations, DeclarationsFile},
        delivery::{DeliveryJob, DeliveryPolicy},
        factory::ConnectionFactory,
        model::{Job, JobKind, Message, MessageState},
        scheduler::Scheduler,
        store::{memory::MemoryStore, Store},
        testing::RecordingBroker,
    };
    use std::time::Duration;

    struct Fixture {
        store: MemoryStore,
        broker: RecordingBroker,
        handler: FailsafeHandler,
    }

    fn fixture() -> Fixture {
        let settings = Settings::default();
        let store = MemoryStore::new();
        let broker = RecordingBroker::new();
        let factory = ConnectionFactory::new(Arc::new(store.clone()), Arc::new(broker.clone()));
        let (params, declarations) = resolve_declarations(&settings, DeclarationsFile::default());
        let topology = Arc::new(TopologyResolver::new(params, declarations));
        let job = DeliveryJob::new(factory.clone(), Scheduler::new(), DeliveryPolicy::default());
        let ingestor = Arc::new(Ingestor::new(factory, topology.clone(), job, &settings));

        Fixture {
            store,
            broker,
            handler: FailsafeHandler::new(ingestor, topology, &settings),
        }
    }

    fn body(delay: Option<&str>) -> Vec<u8> {
        let exts = match delay {
            Some(delay) => format!(r#"{{"delay":"{delay}"}}"#),
            None => "{}".to_owned(),
        };
        format!(
            r#"{{"type":"report.requested","content":"{{}}","subs":[{{"tag":"reports","exchange":"jobs","key":"reports.build"}}],"exts":{exts}}}"#
        )
        .into_bytes()
    }

    #[tokio::test]
    async fn setup_declares_the_failsafe_topology() {
        let f = fixture();

        let queue = f.handler.setup(&f.broker.channel()).await.unwrap();

        assert_eq!(queue, "backgroundjob_failsafe");
        assert_eq!(f.broker.declared_exchanges(), vec!["backgroundjob_exchange"]);
        assert_eq!(f.broker.declared_queues(), vec!["backgroundjob_failsafe"]);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_payload_fires_after_its_delay() {
        let f = fixture();

        assert_eq!(f.handler.handle(&body(Some("5"))).await, Disposition::Ack);

        let id = f.store.rows("messages")[0].text("id").unwrap();
        let mut tx = f.store.begin().await.unwrap();
        let message = Message::find_one(&id, false, tx.executor())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.state, MessageState::Processing);
        let job = Job::find_by_message(&id, tx.executor()).await.unwrap().unwrap();
        assert_eq!(job.kind, JobKind::DelayJob);
        assert_eq!(job.delay_seconds, 5);
        drop(tx);

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(f.broker.published().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(
            f.broker.routes(),
            vec![("jobs".to_owned(), "reports.build".to_owned())]
        );
    }

    #[tokio::test]
    async fn poison_payloads_are_dropped() {
        let f = fixture();

        for bad in [b"not json".to_vec(), body(None), body(Some("-3"))] {
            assert_eq!(
                f.handler.handle(&bad).await,
                Disposition::Nack { requeue: false }
            );
        }
        assert!(f.store.rows("messages").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_delay_is_dropped_without_persisting() {
        let f = fixture();

        let handled = tokio::spawn(async move {
            let disposition = f.handler.handle(&body(Some("18446744073709551615"))).await;
            (disposition, f.store.rows("messages").len(), f.store.rows("background_jobs").len())
        })
        .await;

        let (disposition, messages, jobs) = handled.unwrap();
        assert_eq!(disposition, Disposition::Nack { requeue: false });
        assert_eq!((messages, jobs), (0, 0));
    }

    #[tokio::test]
    async fn persistence_failure_requeues() {
        let f = fixture();
        f.store.fail_next("commit", 1);

        assert_eq!(
            f.handler.handle(&body(Some("5"))).await,
            Disposition::Nack { requeue: true }
        );
        assert!(f.store.rows("messages").is_empty());
    }
}
