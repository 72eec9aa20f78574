pub mod memory;
pub mod postgres;
pub mod schema;

use anyhow::Result;
use async_trait::async_trait;
use broker_api::types::{ProvingJob, ProvingJobId, ProvingJobStatus};
use sqlx::postgres::{PgPool, PgPoolOptions};

pub use memory::InMemoryDatabase;
pub use postgres::PostgresDatabase;

#[derive(Clone)]
pub struct DBConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
}

impl DBConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.dbname
        )
    }
}

#[derive(Clone)]
pub struct DB {
    pub pool: PgPool,
}

impl DB {
    pub async fn new(config: DBConfig) -> Result<Self> {
        let connection_string = config.connection_string();
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&connection_string)
            .await?;
        Ok(Self { pool })
    }
}

/// A job as persisted in the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub job: ProvingJob,
    pub status: ProvingJobStatus,
    pub retries: u32,
}

/// Durable record of every job the broker knows about.
///
/// All writes are awaited by the broker before the change becomes visible to
/// producers or agents, so an implementation only has to be durable, not
/// transactional across calls.
#[async_trait]
pub trait ProvingJobDatabase: Send + Sync {
    /// Inserts the job as `in-queue` with zero retries. Inserting an id that
    /// already exists leaves the stored record untouched.
    async fn create_job(&self, job: &ProvingJob) -> Result<()>;

    async fn get_job_status(&self, id: &ProvingJobId) -> Result<ProvingJobStatus>;

    async fn update_job_status(&self, id: &ProvingJobId, status: &ProvingJobStatus) -> Result<()>;

    /// Returns the new retry count.
    async fn increment_retry_count(&self, id: &ProvingJobId) -> Result<u32>;

    /// Deletes every job with an epoch strictly below `epoch_number`.
    async fn delete_jobs_older_than(&self, epoch_number: u64) -> Result<Vec<ProvingJobId>>;

    async fn delete_job(&self, id: &ProvingJobId) -> Result<()>;

    async fn get_all_jobs(&self) -> Result<Vec<JobRecord>>;
}
