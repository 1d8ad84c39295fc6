/// Order Payment Backend Application
///
/// Main entry point for the order-payment backend service. The application
/// exposes a REST API for creating and querying orders, runs the synchronous
/// part of the payment saga against the catalog and the payment provider,
/// and consumes asynchronous payment outcomes from Kafka to settle orders.
///
/// # Architecture
///
/// - Repository layer for data access (orders, payment transactions)
/// - Service layer for the order orchestration and payment reconciliation
/// - HTTP layer for order endpoints, payment endpoints, and webhook ingress
/// - Kafka producer/consumer pair carrying payment outcomes between the two
///   service halves
/// - Metrics for monitoring
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use app_config::AppConfig;
use catalog_client::HttpCatalogClient;
use kafka_consumer::PaymentEventsConsumer;
use kafka_producer::KafkaPaymentEventPublisher;
use payment::{HttpProviderClient, PaymentServiceImpl};
use repository::{PgOrdersRepository, PgPaymentTransactionsRepository};
use server::Server;
use service::OrderServiceImpl;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    info!("Order Payment Backend starting...");

    // Cancellation token for graceful shutdown of the Kafka consumer; the
    // HTTP server installs its own signal handler.
    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal");
                shutdown_signal.notify_waiters();
            }
            Err(err) => {
                error!("Failed to listen for shutdown signal: {}", err);
            }
        }
    });

    let config = AppConfig::load().context("Failed to load configuration")?;

    let db_pool = match db::init_db_pool(&config).await {
        Ok(pool) => {
            info!("Database initialized successfully");
            pool
        }
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            return Err(anyhow::anyhow!("Failed to initialize database"));
        }
    };

    // Repositories share the pool; each call checks out its own connection.
    let orders_repo = PgOrdersRepository::new(db_pool.clone());
    let transactions_repo = PgPaymentTransactionsRepository::new(db_pool);

    // Outbound collaborators.
    let catalog = HttpCatalogClient::new(&config.catalog_base_url, config.upstream_timeout)
        .context("Failed to build catalog client")?;
    let provider = HttpProviderClient::new(
        &config.provider_base_url,
        &config.provider_secret_key,
        config.upstream_timeout,
    )
    .context("Failed to build payment provider client")?;
    let publisher = KafkaPaymentEventPublisher::new(&config.kafka_brokers, &config.kafka_topic)
        .context("Failed to initialize Kafka producer")?;

    // One payment service instance serves both the in-process orchestrator
    // and the HTTP payment endpoints.
    let payment_service = Arc::new(PaymentServiceImpl::new(
        transactions_repo,
        provider,
        publisher,
    ));

    let order_service = Arc::new(OrderServiceImpl::new(
        orders_repo,
        catalog,
        payment_service.clone(),
        config.order_currency.clone(),
    ));

    let mut tasks = JoinSet::new();

    // Payment events consumer settles orders from asynchronous outcomes.
    info!("Initializing Kafka consumer");
    match PaymentEventsConsumer::new(
        &config.kafka_brokers,
        &config.kafka_topic,
        &config.kafka_group_id,
        order_service.clone(),
    ) {
        Ok(consumer) => {
            let kafka_shutdown = shutdown.clone();
            tasks.spawn(async move {
                info!("Starting Kafka consumer");
                if let Err(err) = consumer.run(kafka_shutdown).await {
                    error!("Kafka consumer error: {}", err);
                }
            });
        }
        Err(err) => {
            error!("Failed to initialize Kafka consumer: {}", err);
        }
    }

    let http_server = Server::new(
        config.http_port.to_string(),
        order_service,
        payment_service,
        config.provider_webhook_secret.clone(),
    );
    tasks.spawn(async move {
        if let Err(err) = http_server.start().await {
            error!("HTTP server error: {}", err);
            std::process::exit(1);
        }
    });

    // Once the first task exits (normally on shutdown), give the rest the
    // configured grace period before aborting them.
    if let Some(res) = tasks.join_next().await {
        if let Err(err) = res {
            error!("Task error: {}", err);
        }
        shutdown.notify_waiters();
        let drained = tokio::time::timeout(config.shutdown_timeout, async {
            while let Some(res) = tasks.join_next().await {
                if let Err(err) = res {
                    error!("Task error: {}", err);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("Shutdown grace period elapsed, aborting remaining tasks");
            tasks.abort_all();
        }
    }

    info!("Application stopped");
    Ok(())
}
