//! Consume ledger transaction notifications and index them into the transactions workbook.
use std::sync::Arc;

use axum::{routing, Router};
use envconfig::Envconfig;
use health::HealthRegistry;
use passport_common::event::TransactionKind;
use passport_common::metrics::{serve, setup_metrics_recorder, track_metrics};
use passport_common::store::WorkbookStore;
use passport_common::time::SystemTime;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use passport_indexer::config::Config;
use passport_indexer::enricher::Enricher;
use passport_indexer::error::IndexerError;
use passport_indexer::lookup::RegistryClient;
use passport_indexer::pipeline::Pipeline;
use passport_indexer::subscription::{KafkaNotificationSource, SubscriptionManager};

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("Shutting down gracefully...");
}

async fn index() -> &'static str {
    "passport indexer"
}

#[tokio::main]
async fn main() -> Result<(), IndexerError> {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(log_layer).init();

    let config = Config::init_from_env().expect("Invalid configuration:");
    let liveness_deadline = time::Duration::try_from(config.liveness_deadline.0)
        .expect("liveness deadline out of range");

    let liveness = HealthRegistry::new("liveness");
    let recorder_handle = setup_metrics_recorder();

    let store = WorkbookStore::new(config.store_path.clone(), config.sheet_name.as_str());
    match store.load().await {
        Ok(Some(workbook)) => {
            let rows = workbook
                .sheet(config.sheet_name.as_str())
                .map(|sheet| sheet.rows.len().saturating_sub(1))
                .unwrap_or_default();
            info!(path = %store.path().display(), rows, "opened transactions workbook");
        }
        Ok(None) => info!(
            path = %store.path().display(),
            "no transactions workbook yet, it will be created on the first write"
        ),
        Err(e) => error!(
            "transactions workbook is unreadable, it will be moved aside on the first write: {}",
            e
        ),
    }

    let lookup = RegistryClient::new(&config.registry_url, config.lookup_timeout.0)?;
    let enricher = Enricher::new(lookup, SystemTime {}, config.lookup_retry_policy());
    let pipeline = Arc::new(Pipeline::start(enricher, store, config.max_batch_size));

    let flush_timer = pipeline.spawn_flush_timer(
        config.batch_interval.0,
        liveness
            .register("batch_timer".to_owned(), liveness_deadline)
            .await,
    );

    let subscriptions = SubscriptionManager::new(
        pipeline.clone(),
        config.poll_interval.0,
        config.subscription_error_backoff.0,
    );

    let mut topic_loops = Vec::new();
    for kind in TransactionKind::ALL {
        let topic = config.kafka.topic(kind);
        let source = KafkaNotificationSource::new(&config.kafka, topic).map_err(|error| {
            IndexerError::SubscribeError {
                topic: topic.to_owned(),
                error,
            }
        })?;
        let handle = liveness
            .register(format!("subscription_{}", kind.label()), liveness_deadline)
            .await;
        topic_loops.push(subscriptions.subscribe(kind, source, handle));
    }

    if let Some(topic) = &config.kafka.passport_created_topic {
        let source = KafkaNotificationSource::new(&config.kafka, topic.as_str()).map_err(|error| {
            IndexerError::SubscribeError {
                topic: topic.as_str().to_owned(),
                error,
            }
        })?;
        let handle = liveness
            .register("subscription_passport_created".to_owned(), liveness_deadline)
            .await;
        topic_loops.push(subscriptions.subscribe_passport_created(source, handle));
    }

    let app = Router::new()
        .route("/", routing::get(index))
        .route(
            "/_liveness",
            routing::get(move || std::future::ready(liveness.get_status())),
        )
        .route(
            "/metrics",
            routing::get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics));

    let bind = config.bind();
    info!("listening on {}", bind);

    let served = tokio::select! {
        result = serve(app, &bind) => result,
        _ = shutdown() => Ok(()),
    };
    if let Err(e) = &served {
        error!("http server stopped: {}", e);
    }

    subscriptions.stop();
    for topic_loop in topic_loops {
        drop(topic_loop.await);
    }
    flush_timer.abort();

    if let Err(e) = pipeline.shutdown().await {
        error!("failed to drain pending writes: {}", e);
    }
    info!("all pending writes applied, exiting");

    served?;
    Ok(())
}
