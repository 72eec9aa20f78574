use crate::types::{
    JobProgressResponse, ProvingJob, ProvingJobAssignment, ProvingJobId, ProvingJobSettledResult,
    ProvingJobStatus, ProvingRequestType,
};
use async_trait::async_trait;

/// The side of the broker used by whoever needs proofs.
#[async_trait]
pub trait ProvingJobProducer: Send + Sync {
    /// Returns the status the job had before this call. Re-enqueueing an
    /// identical job is a no-op.
    async fn enqueue_proving_job(&self, job: ProvingJob) -> anyhow::Result<ProvingJobStatus>;

    async fn get_proving_job_status(&self, id: &ProvingJobId) -> anyhow::Result<ProvingJobStatus>;

    async fn wait_for_job_to_settle(
        &self,
        id: &ProvingJobId,
    ) -> anyhow::Result<ProvingJobSettledResult>;

    async fn remove_and_cancel_proving_job(&self, id: &ProvingJobId) -> anyhow::Result<()>;

    async fn get_completed_jobs(&self, ids: &[ProvingJobId]) -> anyhow::Result<Vec<ProvingJobId>>;
}

/// The side of the broker used by proving agents.
#[async_trait]
pub trait ProvingJobConsumer: Send + Sync {
    /// Hands out the next queued job among `allow_list`, or any type when the
    /// list is empty.
    async fn get_proving_job(
        &self,
        allow_list: &[ProvingRequestType],
    ) -> anyhow::Result<Option<ProvingJobAssignment>>;

    /// `started_at` is the claim time the job was handed out with. When two
    /// agents hold the same job the earlier claim keeps it.
    async fn report_job_progress(
        &self,
        id: &ProvingJobId,
        started_at: u64,
        allow_list: &[ProvingRequestType],
    ) -> anyhow::Result<JobProgressResponse>;

    async fn report_job_completion(
        &self,
        id: &ProvingJobId,
        request_type: ProvingRequestType,
        result: ProvingJobSettledResult,
    ) -> anyhow::Result<()>;
}
