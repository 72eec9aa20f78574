use super::JobRecord;
use anyhow::Context;
use broker_api::types::{
    ProofUri, ProvingJob, ProvingJobId, ProvingJobStatus, ProvingRequestType,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, Type};

// Custom type for JobStatus to map to PostgreSQL ENUM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "proving_job_status", rename_all = "snake_case")]
pub enum JobStatus {
    InQueue,
    InProgress,
    Fulfilled,
    Rejected,
}

// proving_jobs table representation
#[derive(Debug, FromRow, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub request_type: String,
    pub inputs_uri: String,
    pub epoch_number: i64,
    pub status: JobStatus,
    pub output_uri: Option<String>,
    pub error: Option<String>,
    pub retries: i32,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

// proof_artifacts table representation
#[derive(Debug, FromRow, Serialize, Deserialize)]
pub struct ProofArtifact {
    pub key: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Splits a status into the column values stored for it.
pub fn status_columns(
    status: &ProvingJobStatus,
) -> anyhow::Result<(JobStatus, Option<String>, Option<String>)> {
    match status {
        ProvingJobStatus::NotFound => anyhow::bail!("not-found is not a storable job status"),
        ProvingJobStatus::InQueue => Ok((JobStatus::InQueue, None, None)),
        ProvingJobStatus::InProgress => Ok((JobStatus::InProgress, None, None)),
        ProvingJobStatus::Fulfilled { value } => {
            Ok((JobStatus::Fulfilled, Some(value.0.clone()), None))
        }
        ProvingJobStatus::Rejected { reason } => {
            Ok((JobStatus::Rejected, None, Some(reason.clone())))
        }
    }
}

pub fn row_status(
    status: JobStatus,
    output_uri: Option<String>,
    error: Option<String>,
) -> ProvingJobStatus {
    match status {
        JobStatus::InQueue => ProvingJobStatus::InQueue,
        JobStatus::InProgress => ProvingJobStatus::InProgress,
        JobStatus::Fulfilled => ProvingJobStatus::Fulfilled {
            value: ProofUri(output_uri.unwrap_or_default()),
        },
        JobStatus::Rejected => ProvingJobStatus::Rejected {
            reason: error.unwrap_or_default(),
        },
    }
}

impl TryFrom<Job> for JobRecord {
    type Error = anyhow::Error;

    fn try_from(row: Job) -> anyhow::Result<Self> {
        let request_type = row
            .request_type
            .parse::<ProvingRequestType>()
            .with_context(|| format!("job {} has a bad request type", row.id))?;
        let epoch_number = u64::try_from(row.epoch_number)
            .with_context(|| format!("job {} has a negative epoch", row.id))?;
        Ok(JobRecord {
            status: row_status(row.status, row.output_uri, row.error),
            job: ProvingJob {
                id: ProvingJobId(row.id),
                request_type,
                inputs_uri: ProofUri(row.inputs_uri),
                epoch_number,
            },
            retries: u32::try_from(row.retries).unwrap_or(0),
        })
    }
}
