//! Process wiring
//!
//! Builds both services on one backend (PostgreSQL when configured,
//! in-memory otherwise), connects them through the channel broker and
//! starts every background loop.
//!
//! ```text
//! account_outbox ──publisher──▶ account-out-0 ──▶ TransferEventListener
//! transfer_outbox ─publisher──▶ transfer-out-0 ─▶ TransferCommandHandler
//!            (poison messages) ▶ *-dlq-0 ───────▶ DeadLetterMonitor
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::api::{AppState, create_router};
use crate::broker::{BrokerMessage, ChannelBroker, DeadLetterMonitor, EventConsumer, MessageBroker};
use crate::config::AppConfig;
use crate::db::Database;
use crate::ledger::pg::ACCOUNT_OUTBOX_TABLE;
use crate::ledger::{Ledger, LedgerStore, MemoryLedgerStore, PgLedgerStore, TransferCommandHandler};
use crate::outbox::{MemoryOutbox, OutboxCleanup, OutboxPublisher, OutboxStore, PgOutboxStore};
use crate::transfer::pg::TRANSFER_OUTBOX_TABLE;
use crate::transfer::{
    IdempotencyLock, InProcessLock, MemoryTransferStore, PgTransferStore, SagaOrchestrator,
    SagaReconciler, TransferEventListener, TransferService, TransferStore,
};

/// Both services built on one backend
#[derive(Clone)]
pub struct Services {
    pub ledger: Arc<Ledger>,
    pub account_outbox: Arc<dyn OutboxStore>,
    pub transfers: Arc<TransferService>,
    pub transfer_store: Arc<dyn TransferStore>,
    pub transfer_outbox: Arc<dyn OutboxStore>,
    pub orchestrator: Arc<SagaOrchestrator>,
    pub db: Option<Database>,
}

impl Services {
    /// Memory stores; state is lost on exit.
    pub fn in_memory(config: &AppConfig, lock: Arc<dyn IdempotencyLock>) -> Self {
        let account_outbox = MemoryOutbox::new();
        let transfer_outbox = MemoryOutbox::new();
        let ledger_store: Arc<dyn LedgerStore> =
            Arc::new(MemoryLedgerStore::new(account_outbox.clone()));
        let transfer_store: Arc<dyn TransferStore> =
            Arc::new(MemoryTransferStore::new(transfer_outbox.clone()));

        Self::assemble(
            config,
            ledger_store,
            Arc::new(account_outbox),
            transfer_store,
            Arc::new(transfer_outbox),
            lock,
            None,
        )
    }

    pub fn postgres(config: &AppConfig, db: Database, lock: Arc<dyn IdempotencyLock>) -> Self {
        let pool = db.pool().clone();
        Self::assemble(
            config,
            Arc::new(PgLedgerStore::new(pool.clone())),
            Arc::new(PgOutboxStore::new(pool.clone(), ACCOUNT_OUTBOX_TABLE)),
            Arc::new(PgTransferStore::new(pool.clone())),
            Arc::new(PgOutboxStore::new(pool, TRANSFER_OUTBOX_TABLE)),
            lock,
            Some(db),
        )
    }

    fn assemble(
        config: &AppConfig,
        ledger_store: Arc<dyn LedgerStore>,
        account_outbox: Arc<dyn OutboxStore>,
        transfer_store: Arc<dyn TransferStore>,
        transfer_outbox: Arc<dyn OutboxStore>,
        lock: Arc<dyn IdempotencyLock>,
        db: Option<Database>,
    ) -> Self {
        let ledger = Arc::new(Ledger::new(ledger_store, config.account.ledger_config()));
        let transfers = Arc::new(TransferService::new(
            transfer_store.clone(),
            lock,
            config.transfer.service_config(),
        ));
        let orchestrator = Arc::new(SagaOrchestrator::new(transfer_store.clone()));
        Self {
            ledger,
            account_outbox,
            transfers,
            transfer_store,
            transfer_outbox,
            orchestrator,
            db,
        }
    }

    /// Pick the backend from config. Applies the schema on PostgreSQL.
    pub async fn build(config: &AppConfig) -> Result<Self> {
        let lock = build_lock(config).await?;
        match &config.postgres_url {
            Some(url) => {
                let db = Database::connect(url)
                    .await
                    .context("Failed to connect to PostgreSQL")?;
                db.apply_schema().await?;
                info!("Using PostgreSQL backend");
                Ok(Self::postgres(config, db, lock))
            }
            None => {
                warn!("postgres_url not set, using in-memory stores");
                Ok(Self::in_memory(config, lock))
            }
        }
    }

    pub fn app_state(&self, config: &AppConfig) -> AppState {
        AppState::new(
            self.ledger.clone(),
            self.transfers.clone(),
            self.db.clone(),
            config.account.default_currency.clone(),
        )
    }
}

#[cfg(feature = "redis")]
async fn build_lock(config: &AppConfig) -> Result<Arc<dyn IdempotencyLock>> {
    match &config.redis_url {
        Some(url) => {
            let lock = crate::transfer::RedisLock::connect(url)
                .await
                .context("Failed to connect to Redis")?;
            Ok(Arc::new(lock))
        }
        None => Ok(Arc::new(InProcessLock::new())),
    }
}

#[cfg(not(feature = "redis"))]
async fn build_lock(config: &AppConfig) -> Result<Arc<dyn IdempotencyLock>> {
    if config.redis_url.is_some() {
        warn!("redis_url is set but the `redis` feature is disabled, using in-process lock");
    }
    Ok(Arc::new(InProcessLock::new()))
}

/// Start publishers, cleanups, consumers, dead-letter monitors and the
/// reconciliation scanner.
pub fn spawn_background(
    services: &Services,
    config: &AppConfig,
    broker: &Arc<ChannelBroker>,
) -> Result<Vec<JoinHandle<()>>> {
    let commands_rx = subscribe(broker, &config.transfer.topic)?;
    let saga_events_rx = subscribe(broker, &config.account.topic)?;
    let transfer_dlq_rx = subscribe(broker, &config.transfer.dlq_topic)?;
    let account_dlq_rx = subscribe(broker, &config.account.dlq_topic)?;

    let mut handles = Vec::new();
    let bus: Arc<dyn MessageBroker> = broker.clone();

    // Outbound
    let transfer_publisher = OutboxPublisher::new(
        "transfer-outbox",
        services.transfer_outbox.clone(),
        bus.clone(),
        config.transfer.publisher_config(),
    );
    let account_publisher = OutboxPublisher::new(
        "account-outbox",
        services.account_outbox.clone(),
        bus.clone(),
        config.account.publisher_config(),
    );
    handles.push(tokio::spawn(async move { transfer_publisher.run().await }));
    handles.push(tokio::spawn(async move { account_publisher.run().await }));

    let transfer_cleanup = OutboxCleanup::new(
        "transfer-outbox",
        services.transfer_outbox.clone(),
        config.transfer.cleanup.cleanup_config(),
    );
    let account_cleanup = OutboxCleanup::new(
        "account-outbox",
        services.account_outbox.clone(),
        config.account.cleanup.cleanup_config(),
    );
    handles.push(tokio::spawn(async move { transfer_cleanup.run().await }));
    handles.push(tokio::spawn(async move { account_cleanup.run().await }));

    // Inbound
    let commands = EventConsumer::new(
        "account-service",
        Arc::new(TransferCommandHandler::new(services.ledger.clone())),
        bus.clone(),
        config.transfer.dlq_topic.clone(),
        config.consumer.consumer_config(),
    );
    let saga_events = EventConsumer::new(
        "transfer-service",
        Arc::new(TransferEventListener::new(services.orchestrator.clone())),
        bus,
        config.account.dlq_topic.clone(),
        config.consumer.consumer_config(),
    );
    handles.push(tokio::spawn(commands.run(commands_rx)));
    handles.push(tokio::spawn(saga_events.run(saga_events_rx)));

    let transfer_dlq = DeadLetterMonitor::new(config.transfer.dlq_topic.as_str());
    let account_dlq = DeadLetterMonitor::new(config.account.dlq_topic.as_str());
    handles.push(tokio::spawn(transfer_dlq.run(transfer_dlq_rx)));
    handles.push(tokio::spawn(account_dlq.run(account_dlq_rx)));

    let reconciler = SagaReconciler::new(
        services.transfer_store.clone(),
        services.orchestrator.clone(),
        config.transfer.reconciliation_config(),
    );
    handles.push(tokio::spawn(async move { reconciler.run().await }));

    Ok(handles)
}

fn subscribe(
    broker: &ChannelBroker,
    topic: &str,
) -> Result<mpsc::Receiver<BrokerMessage>> {
    broker
        .subscribe(topic)
        .with_context(|| format!("Topic {} already has a consumer", topic))
}

/// Build everything, start the background loops and serve HTTP until the
/// server stops.
pub async fn run(config: AppConfig) -> Result<()> {
    let services = Services::build(&config).await?;
    let broker = Arc::new(ChannelBroker::default());
    let _handles = spawn_background(&services, &config, &broker)?;

    let app = create_router(services.app_state(&config));
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(addr = %addr, "HTTP server listening");
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
