use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use ara_task_queue::config::{ProviderConfig, Settings, StoreKind};
use ara_task_queue::postgres::PostgresPool;
use ara_task_queue::processors::{
    BulkMessageProcessor, ContactImportProcessor, EmailNotificationProcessor, HttpEmailSender,
    HttpMessageSender, TemplateProcessingProcessor,
};
use ara_task_queue::queue::{create_job_store, QueueManager, QueueManagerConfig, QueueRegistry};
use ara_task_queue::ratelimit::{create_rate_limiter, RateLimiter};
use ara_task_queue::redis::{CircuitBreaker, RedisPool};
use ara_task_queue::repository::{
    ContactRepository, MemoryContactRepository, MemoryTemplateRepository,
    PostgresContactRepository, PostgresTemplateRepository, TemplateRepository,
};
use ara_task_queue::server::{create_app, AppState};
use ara_task_queue::shutdown::{wait_for_signal, GracefulShutdown};
use ara_task_queue::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new().context("Failed to load configuration")?;
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!("Configuration loaded");

    // Redis backs the job store and the distributed rate limiters
    let redis_pool = match settings.queues.store {
        StoreKind::Redis => {
            let pool = Arc::new(RedisPool::from_config(settings.redis.clone())?);
            if let Err(e) = pool.ping().await {
                tracing::warn!(error = %e, addr = %pool.target(), "Redis not reachable at startup");
            }
            Some(pool)
        }
        StoreKind::Memory => None,
    };
    let store = create_job_store(&settings.queues, redis_pool.clone());

    let postgres_pool = match &settings.database {
        Some(db) => {
            let pool = PostgresPool::new(db, Arc::new(CircuitBreaker::new()))
                .await
                .context("Failed to connect to PostgreSQL")?;
            pool.migrate().await?;
            Some(Arc::new(pool))
        }
        None => {
            tracing::info!("No database configured, using in-memory contacts and templates");
            None
        }
    };

    let (contacts, templates): (Arc<dyn ContactRepository>, Arc<dyn TemplateRepository>) =
        match &postgres_pool {
            Some(pool) => (
                Arc::new(PostgresContactRepository::new(pool.as_ref().clone())),
                Arc::new(PostgresTemplateRepository::new(pool.as_ref().clone())),
            ),
            None => (
                Arc::new(MemoryContactRepository::new()),
                Arc::new(MemoryTemplateRepository::new()),
            ),
        };

    let providers = &settings.providers;
    let messaging_limiter = provider_limiter("messaging", &providers.messaging, &redis_pool)?;
    let email_limiter = provider_limiter("email", &providers.email, &redis_pool)?;

    let registry = QueueRegistry::from_settings(&settings.queues)?;
    let mut builder = QueueManager::builder(registry, store)
        .config(QueueManagerConfig::new(&settings.queues, &settings.shutdown))
        .processor(Arc::new(BulkMessageProcessor::new(
            Arc::new(HttpMessageSender::new(&providers.messaging)?),
            messaging_limiter,
        )))
        .processor(Arc::new(ContactImportProcessor::new(contacts)))
        .processor(Arc::new(TemplateProcessingProcessor::new(templates)))
        .processor(Arc::new(EmailNotificationProcessor::new(
            Arc::new(HttpEmailSender::new(&providers.email)?),
            email_limiter,
            providers.email.batch_size,
        )));
    if let Some(pool) = &redis_pool {
        builder = builder.redis_pool(pool.clone());
    }
    let manager = Arc::new(builder.build());
    manager.initialize().await?;

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    let mut graceful = GracefulShutdown::new(manager.clone(), shutdown_tx);
    if let Some(pool) = &postgres_pool {
        graceful = graceful.with_postgres(pool.clone());
    }

    let app = create_app(AppState::new(settings.clone(), manager.clone(), redis_pool.clone()));
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await
    });

    let reason = wait_for_signal().await;
    let result = graceful.execute(reason).await;

    // The manager released the Redis pool through its job store
    server.await??;

    tracing::info!(
        success = result.success,
        stragglers = result.stragglers,
        "Server shutdown complete"
    );
    Ok(())
}

fn provider_limiter(
    name: &str,
    config: &ProviderConfig,
    redis_pool: &Option<Arc<RedisPool>>,
) -> Result<Arc<dyn RateLimiter>> {
    let limit = config
        .rate_limit()
        .ok_or_else(|| anyhow!("providers.{}.rate_per_second must be greater than zero", name))?;
    Ok(create_rate_limiter(
        &format!("provider:{}", name),
        limit,
        redis_pool.clone(),
    ))
}
