use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use steadyrun_durable::persistence::{
    InMemoryWorkflowEventStore, PostgresWorkflowEventStore, WorkflowEventStore,
};
use steadyrun_worker::telemetry::init_tracing;
use steadyrun_worker::{DurableWorker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    let config = WorkerConfig::from_env();
    init_tracing(&config);

    tracing::info!(
        environment = %config.environment,
        task_queue = %config.task_queue,
        "steadyrun-worker starting..."
    );

    match config.database_url.clone() {
        Some(database_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.max_concurrent_activities as u32 + 5)
                .connect(&database_url)
                .await
                .context("Failed to connect to database")?;
            let store = PostgresWorkflowEventStore::new(pool);
            store.migrate().await.context("Failed to run migrations")?;
            tracing::info!("Using PostgreSQL store");
            run(DurableWorker::new(config, store)).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store (state is lost on exit)");
            run(DurableWorker::new(config, InMemoryWorkflowEventStore::new())).await
        }
    }
}

async fn run<S: WorkflowEventStore>(worker: DurableWorker<S>) -> Result<()> {
    worker.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    worker.shutdown().await?;
    tracing::info!("Worker shutdown complete");
    Ok(())
}
