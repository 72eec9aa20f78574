use super::{
    schema::{self, Job},
    JobRecord, ProvingJobDatabase,
};
use anyhow::Result;
use async_trait::async_trait;
use broker_api::types::{ProvingJob, ProvingJobId, ProvingJobStatus};
use chrono::Utc;
use sqlx::PgPool;

/// Ledger backed by the `proving_jobs` table.
#[derive(Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }
}

fn to_i64(epoch_number: u64) -> Result<i64> {
    i64::try_from(epoch_number)
        .map_err(|_| anyhow::anyhow!("epoch {} does not fit in BIGINT", epoch_number))
}

#[async_trait]
impl ProvingJobDatabase for PostgresDatabase {
    async fn create_job(&self, job: &ProvingJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO proving_jobs (
                id, request_type, inputs_uri, epoch_number,
                status, retries, created_at
            ) VALUES (
                $1, $2, $3, $4, $5, 0, $6
            )
            ON CONFLICT (id) DO NOTHING
        "#,
        )
        .bind(job.id.as_str())
        .bind(job.request_type.as_str())
        .bind(job.inputs_uri.as_str())
        .bind(to_i64(job.epoch_number)?)
        .bind(schema::JobStatus::InQueue)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_job_status(&self, id: &ProvingJobId) -> Result<ProvingJobStatus> {
        let row: Option<(schema::JobStatus, Option<String>, Option<String>)> = sqlx::query_as(
            r#"
            SELECT status, output_uri, error
            FROM proving_jobs
            WHERE id = $1
        "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some((status, output_uri, error)) => schema::row_status(status, output_uri, error),
            None => ProvingJobStatus::NotFound,
        })
    }

    async fn update_job_status(&self, id: &ProvingJobId, status: &ProvingJobStatus) -> Result<()> {
        let (new_status, output_uri, error) = schema::status_columns(status)?;
        let settled_at = status.is_settled().then(Utc::now);
        sqlx::query(
            r#"
            UPDATE proving_jobs
            SET
                status = $2,
                output_uri = $3,
                error = $4,
                settled_at = $5
            WHERE id = $1
        "#,
        )
        .bind(id.as_str())
        .bind(new_status)
        .bind(&output_uri)
        .bind(&error)
        .bind(settled_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn increment_retry_count(&self, id: &ProvingJobId) -> Result<u32> {
        let retries: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE proving_jobs
            SET retries = retries + 1
            WHERE id = $1
            RETURNING retries
        "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match retries {
            Some(retries) => Ok(u32::try_from(retries)?),
            None => anyhow::bail!("job {} not found", id),
        }
    }

    async fn delete_jobs_older_than(&self, epoch_number: u64) -> Result<Vec<ProvingJobId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            DELETE FROM proving_jobs
            WHERE epoch_number < $1
            RETURNING id
        "#,
        )
        .bind(to_i64(epoch_number)?)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(ProvingJobId).collect())
    }

    async fn delete_job(&self, id: &ProvingJobId) -> Result<()> {
        sqlx::query("DELETE FROM proving_jobs WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_all_jobs(&self) -> Result<Vec<JobRecord>> {
        let rows: Vec<Job> = sqlx::query_as(
            r#"
            SELECT
                id, request_type, inputs_uri, epoch_number,
                status, output_uri, error, retries, created_at, settled_at
            FROM proving_jobs
            ORDER BY epoch_number, created_at
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }
}
