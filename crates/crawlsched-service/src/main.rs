//! Service entrypoint — §9.
//!
//! Wires the dependency-injected service graph once at startup: DB pool,
//! broker connection, work-store repositories, the two scheduler cron
//! loops, the reaper sweep, the dead-letter relay, and the intake HTTP
//! server. No runtime container: everything is constructed here and
//! handed out by reference or `Arc`.

mod config;
mod dlq_consumer;

use std::sync::Arc;

use anyhow::{Context, Result};
use crawlsched_broker_amqp::AmqpBroker;
use crawlsched_core::broker::TopologyDeclarer;
use crawlsched_core::events::RabbitMqEvent;
use crawlsched_core::store::{UrlRepository, WorkStore};
use crawlsched_intake::AppState;
use crawlsched_reaper::Reaper;
use crawlsched_store_postgres::{PgUrlRepository, PgWorkStore};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::Settings::load().context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{},crawlsched=debug", settings.app.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    tracing::info!(environment = %settings.app.environment, debug = settings.app.debug, "starting crawl scheduler");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&settings.database.database_url)
        .await
        .context("failed to connect to database")?;

    tracing::info!("running database migrations");
    sqlx::migrate!("../../migrations")
        .run(&pool)
        .await
        .context("failed to run database migrations")?;

    let broker = AmqpBroker::connect(&settings.broker.amqp_url)
        .await
        .context("failed to connect to broker")?;

    for event in RabbitMqEvent::ALL {
        broker
            .declare_event_topology(event)
            .await
            .with_context(|| format!("failed to declare topology for {event:?}"))?;
    }

    let store: Arc<dyn WorkStore> = Arc::new(PgWorkStore::new(pool.clone()));
    let urls: Arc<dyn UrlRepository> = Arc::new(PgUrlRepository::new(pool));
    let publisher = Arc::new(broker.clone());

    let _scheduler = crawlsched_scheduler::start(store.clone(), publisher.clone())
        .await
        .context("failed to start scheduler core")?;

    Arc::new(Reaper::new(store.clone())).spawn();

    let _dlq_relays = dlq_consumer::spawn_all(broker);

    let app = crawlsched_intake::router(AppState { store, urls });
    let listener = tokio::net::TcpListener::bind(&settings.api.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.api.bind_addr))?;
    tracing::info!(addr = %settings.api.bind_addr, "intake api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("intake api server failed")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
