// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use outbox_relay::{
    channel::LapinConnector,
    config::{resolve_declarations, DeclarationsFile, Settings},
    delivery::{DeliveryJob, DeliveryPolicy},
    dispatcher::ResilientConsumer,
    factory::ConnectionFactory,
    failsafe::FailsafeHandler,
    ingest::Ingestor,
    processor::{RollbackSweeper, StateSweeper},
    scheduler::Scheduler,
    store::{postgres::PgStore, scripts::ScriptStore},
    supervisor::Supervisor,
    topology::TopologyResolver,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::load()?;

    let store = PgStore::connect(
        &settings.database_url,
        settings.database_max_connections,
        ScriptStore::postgres(&settings.table_prefix),
    )
    .await?;
    if settings.run_migrations {
        store.migrate().await?;
        info!("migrations applied");
    }

    let connector = LapinConnector::from_settings(&settings);
    let file = DeclarationsFile::load_or_empty(settings.declarations_path.as_deref())?;
    let (params, declarations) = resolve_declarations(&settings, file);
    let topology = Arc::new(TopologyResolver::new(params, declarations));

    let scheduler = Scheduler::new();
    let factory = ConnectionFactory::new(Arc::new(store), Arc::new(connector.clone()));
    let job = DeliveryJob::new(
        factory.clone(),
        scheduler.clone(),
        DeliveryPolicy::from_settings(&settings),
    );
    let ingestor = Arc::new(Ingestor::new(
        factory.clone(),
        topology.clone(),
        job.clone(),
        &settings,
    ));

    let token = CancellationToken::new();

    let mut supervisor = Supervisor::new(settings.sweep_idle(), token.child_token());
    supervisor.spawn(Arc::new(StateSweeper::succeeded(
        factory.clone(),
        settings.succeed_after_secs,
    )));
    supervisor.spawn(Arc::new(StateSweeper::failed(
        factory.clone(),
        settings.fail_after_secs,
    )));
    supervisor.spawn(Arc::new(RollbackSweeper::new(
        factory.clone(),
        topology.clone(),
        &settings,
    )));

    let failsafe = ResilientConsumer::new(
        connector,
        Arc::new(FailsafeHandler::new(ingestor, topology, &settings)),
        settings.reconnect_interval(),
        token.child_token(),
    );
    let consumer = failsafe.spawn();

    job.rebuild().await?;
    info!(app = settings.app_name, "relay started");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    failsafe.stop();
    consumer.await?;
    supervisor.stop().await;
    scheduler.shutdown();
    token.cancel();

    Ok(())
}
