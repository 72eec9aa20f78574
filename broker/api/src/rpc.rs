use super::types::{
    JobProgressResponse, ProvingJob, ProvingJobAssignment, ProvingJobId, ProvingJobSettledResult,
    ProvingJobStatus, ProvingRequestType,
};
use jsonrpsee::{proc_macros::rpc, types::ErrorObjectOwned};

#[rpc(server, client)]
pub trait ProvingBrokerApi {
    #[method(name = "enqueueProvingJob")]
    async fn enqueue_proving_job(&self, job: ProvingJob)
        -> Result<ProvingJobStatus, ErrorObjectOwned>;

    #[method(name = "getProvingJobStatus")]
    async fn get_proving_job_status(
        &self,
        id: ProvingJobId,
    ) -> Result<ProvingJobStatus, ErrorObjectOwned>;

    #[method(name = "waitForJobToSettle")]
    async fn wait_for_job_to_settle(
        &self,
        id: ProvingJobId,
    ) -> Result<ProvingJobSettledResult, ErrorObjectOwned>;

    #[method(name = "removeAndCancelProvingJob")]
    async fn remove_and_cancel_proving_job(&self, id: ProvingJobId)
        -> Result<(), ErrorObjectOwned>;

    #[method(name = "getCompletedJobs")]
    async fn get_completed_jobs(
        &self,
        ids: Vec<ProvingJobId>,
    ) -> Result<Vec<ProvingJobId>, ErrorObjectOwned>;

    #[method(name = "getProvingJob")]
    async fn get_proving_job(
        &self,
        allow_list: Vec<ProvingRequestType>,
    ) -> Result<Option<ProvingJobAssignment>, ErrorObjectOwned>;

    #[method(name = "reportProvingJobProgress")]
    async fn report_proving_job_progress(
        &self,
        id: ProvingJobId,
        started_at: u64,
        allow_list: Vec<ProvingRequestType>,
    ) -> Result<JobProgressResponse, ErrorObjectOwned>;

    #[method(name = "reportProvingJobCompletion")]
    async fn report_proving_job_completion(
        &self,
        id: ProvingJobId,
        request_type: ProvingRequestType,
        result: ProvingJobSettledResult,
    ) -> Result<(), ErrorObjectOwned>;

    #[method(name = "healthCheck")]
    async fn health_check(&self) -> Result<(), ErrorObjectOwned>;
}
