//! Emissary event delivery service.
//!
//! Main entry point: initializes configuration, tracing, the database pool
//! and schema, then runs the outbox dispatcher and queue worker until a
//! shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use emissary_core::{storage::Storage, RealClock};
use emissary_delivery::{
    AuditHandler, DispatcherConfig, HandlerRegistry, InMemoryQueue, OutboxDispatcher,
    PostgresAuditStorage, PostgresDispatchStorage, PostgresWorkerStorage, QueueWorker,
    WorkerConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting emissary event delivery service");

    let config = Config::from_env()?;
    info!(
        database_url = %config.database_url_masked(),
        max_connections = config.database_max_connections,
        batch_size = config.dispatch_batch_size,
        "configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    run_migrations(&db_pool).await?;
    info!("database migrations completed");

    let storage = Arc::new(Storage::new(db_pool.clone()));
    let clock = Arc::new(RealClock::new());
    let shutdown = CancellationToken::new();

    // Deterministic handler wiring; duplicate names or unknown event types
    // abort startup.
    let registry = Arc::new(
        HandlerRegistry::builder()
            .register(Arc::new(AuditHandler::new(Arc::new(PostgresAuditStorage::new(
                storage.clone(),
            )))))
            .context("handler registration failed")?
            .build(),
    );
    info!(handlers = registry.len(), "handler registry assembled");

    let queue = Arc::new(InMemoryQueue::new());

    let dispatcher = Arc::new(OutboxDispatcher::new(
        Arc::new(PostgresDispatchStorage::new(storage.clone(), clock.clone())),
        queue.clone(),
        DispatcherConfig {
            batch_size: config.dispatch_batch_size,
            poll_interval: config.dispatch_poll_interval,
            ..DispatcherConfig::default()
        },
        clock.clone(),
        shutdown.clone(),
    ));

    let worker = Arc::new(QueueWorker::new(
        queue.clone(),
        registry,
        Arc::new(PostgresWorkerStorage::new(storage.clone(), clock.clone())),
        WorkerConfig::default(),
        shutdown.clone(),
    ));

    let dispatcher_handle = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.run().await }
    });
    let worker_handle = tokio::spawn({
        let worker = worker.clone();
        async move { worker.run().await }
    });

    info!(queue = emissary_delivery::queue::QUEUE_NAME, "emissary is dispatching events");

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    // Refuse new claim cycles; the in-flight batch completes and the queue
    // closes, draining the worker.
    shutdown.cancel();

    let drain = async {
        if let Err(e) = dispatcher_handle.await {
            error!(error = %e, "dispatcher task join failed");
        }
        if let Err(e) = worker_handle.await {
            error!(error = %e, "worker task join failed");
        }
    };

    tokio::select! {
        () = drain => {
            info!("dispatcher and worker stopped");
        }
        () = tokio::time::sleep(Duration::from_secs(30)) => {
            error!("shutdown grace period expired with tasks still running");
        }
    }

    match dispatcher.metrics().await {
        Ok(counts) => info!(
            pending = counts.pending,
            processing = counts.processing,
            completed = counts.completed,
            failed = counts.failed,
            "final outbox state"
        ),
        Err(e) => error!(error = %e, "failed to read final outbox metrics"),
    }

    db_pool.close().await;
    info!("database connections closed, shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,emissary=debug"))
        .expect("invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Creates the schema idempotently.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS domain_events (
            id UUID PRIMARY KEY,
            aggregate_type TEXT NOT NULL,
            aggregate_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            event_version INTEGER NOT NULL CHECK (event_version >= 1),
            payload JSONB NOT NULL,
            metadata JSONB NOT NULL,
            occurred_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create domain_events table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS event_outbox (
            id UUID PRIMARY KEY,
            event_id UUID NOT NULL REFERENCES domain_events(id),
            event_type TEXT NOT NULL,
            aggregate_type TEXT NOT NULL,
            aggregate_id TEXT NOT NULL,
            payload JSONB NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            retry_count INTEGER NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 5,
            last_error TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            processed_at TIMESTAMPTZ,
            next_retry_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create event_outbox table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processed_events (
            id UUID PRIMARY KEY,
            event_id UUID NOT NULL,
            handler_name TEXT NOT NULL,
            processed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE(event_id, handler_name)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create processed_events table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS actions (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            cancel_reason TEXT,
            version INTEGER NOT NULL CHECK (version >= 1),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            completed_at TIMESTAMPTZ,
            cancelled_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create actions table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS policies (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            rules JSONB NOT NULL,
            status TEXT NOT NULL DEFAULT 'draft',
            suspend_reason TEXT,
            revoke_reason TEXT,
            revoked_by TEXT,
            version INTEGER NOT NULL CHECK (version >= 1),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            activated_at TIMESTAMPTZ,
            revoked_at TIMESTAMPTZ
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create policies table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_log (
            id UUID PRIMARY KEY,
            correlation_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            action TEXT NOT NULL,
            actor JSONB NOT NULL,
            before_snapshot JSONB,
            after_snapshot JSONB,
            changes JSONB NOT NULL,
            metadata JSONB NOT NULL,
            occurred_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create audit_log table")?;

    for statement in [
        "CREATE INDEX IF NOT EXISTS idx_domain_events_aggregate
         ON domain_events(aggregate_type, aggregate_id)",
        "CREATE INDEX IF NOT EXISTS idx_domain_events_type ON domain_events(event_type)",
        "CREATE INDEX IF NOT EXISTS idx_domain_events_occurred ON domain_events(occurred_at)",
        "CREATE INDEX IF NOT EXISTS idx_domain_events_correlation
         ON domain_events((metadata->>'correlation_id'))",
        "CREATE INDEX IF NOT EXISTS idx_event_outbox_status ON event_outbox(status)",
        "CREATE INDEX IF NOT EXISTS idx_event_outbox_created ON event_outbox(created_at)",
        "CREATE INDEX IF NOT EXISTS idx_event_outbox_retry ON event_outbox(next_retry_at)",
        "CREATE INDEX IF NOT EXISTS idx_audit_log_entity ON audit_log(entity_type, entity_id)",
        "CREATE INDEX IF NOT EXISTS idx_audit_log_correlation ON audit_log(correlation_id)",
    ] {
        sqlx::query(statement).execute(pool).await.context("failed to create index")?;
    }

    Ok(())
}

/// Waits for a shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received CTRL+C signal");
        },
        _ = terminate => {
            info!("received SIGTERM signal");
        },
    }
}

/// Service configuration.
struct Config {
    /// PostgreSQL connection string.
    database_url: String,
    /// Maximum database connections.
    database_max_connections: u32,
    /// Outbox rows claimed per dispatcher tick.
    dispatch_batch_size: usize,
    /// Dispatcher polling period.
    dispatch_poll_interval: Duration,
}

impl Config {
    /// Loads configuration from environment variables.
    fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL environment variable not set")?;

        let database_max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let dispatch_batch_size = std::env::var("DISPATCH_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(emissary_delivery::DEFAULT_BATCH_SIZE);

        let dispatch_poll_interval = std::env::var("DISPATCH_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(emissary_delivery::DEFAULT_POLL_INTERVAL);

        Ok(Self {
            database_url,
            database_max_connections,
            dispatch_batch_size,
            dispatch_poll_interval,
        })
    }

    /// Returns the database URL with the password masked for logging.
    fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(password_start) = self.database_url[..at_pos].rfind(':') {
                if let Some(user_start) = self.database_url[..password_start].rfind('/') {
                    return format!(
                        "{}//{}:***@{}",
                        &self.database_url[..user_start],
                        &self.database_url[user_start + 2..password_start],
                        &self.database_url[at_pos + 1..]
                    );
                }
            }
        }
        "postgresql://***".to_string()
    }
}
