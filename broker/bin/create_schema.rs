use anyhow::Result;
use broker::{app_config::AppBaseConfig, db::DB};
use clap::Parser;
use sqlx::{Executor, PgPool};
use tracing::info;

async fn create_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create ENUM type
    pool.execute(sqlx::query(
        r#"
        DO $$ BEGIN
            IF NOT EXISTS (SELECT 1 FROM pg_type WHERE typname = 'proving_job_status') THEN
                CREATE TYPE proving_job_status AS ENUM (
                    'in_queue',
                    'in_progress',
                    'fulfilled',
                    'rejected'
                );
            END IF;
        END $$;
    "#,
    ))
    .await?;

    pool.execute(sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS proving_jobs (
            id TEXT PRIMARY KEY,
            request_type TEXT NOT NULL,
            inputs_uri TEXT NOT NULL,
            epoch_number BIGINT NOT NULL,
            status proving_job_status NOT NULL,
            output_uri TEXT,
            error TEXT,
            retries INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL,
            settled_at TIMESTAMPTZ
        )
    "#,
    ))
    .await?;

    // Create indexes
    pool.execute(sqlx::query(
        r#"
        DO $$ BEGIN
            CREATE INDEX IF NOT EXISTS idx_proving_jobs_epoch_number ON proving_jobs (epoch_number);
            CREATE INDEX IF NOT EXISTS idx_proving_jobs_status ON proving_jobs (status);
        END $$;
    "#,
    ))
    .await?;

    pool.execute(sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS proof_artifacts (
            key TEXT PRIMARY KEY,
            payload BYTEA NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )
    "#,
    ))
    .await?;

    info!("Schema created successfully for database");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    broker::app_config::init_console_subscriber();
    let config = AppBaseConfig::parse();
    let db = DB::new(config.db_config()).await?;
    match create_schema(&db.pool).await {
        Ok(_) => {
            info!("Database schema setup completed successfully.");
            Ok(())
        }
        Err(e) => {
            tracing::error!("Error setting up database schema: {}", e);
            Err(e.into())
        }
    }
}
