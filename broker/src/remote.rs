use async_trait::async_trait;
use broker_api::{
    rpc::ProvingBrokerApiClient,
    types::{
        JobProgressResponse, ProvingJob, ProvingJobAssignment, ProvingJobId,
        ProvingJobSettledResult, ProvingJobStatus, ProvingRequestType,
    },
    ProvingJobConsumer, ProvingJobProducer,
};
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use std::time::Duration;
use url::Url;

const DEFAULT_SETTLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A broker running in another process, reached over JSON-RPC.
#[derive(Clone)]
pub struct RemoteBroker {
    client: HttpClient,
    settle_poll_interval: Duration,
}

impl RemoteBroker {
    pub fn new(broker_url: Url, request_timeout: u64) -> anyhow::Result<Self> {
        let client = HttpClientBuilder::default()
            .request_timeout(Duration::from_secs(request_timeout))
            .build(broker_url)?;
        Ok(Self {
            client,
            settle_poll_interval: DEFAULT_SETTLE_POLL_INTERVAL,
        })
    }

    pub fn with_settle_poll_interval(mut self, interval: Duration) -> Self {
        self.settle_poll_interval = interval;
        self
    }

    pub async fn health_check(&self) -> anyhow::Result<()> {
        ProvingBrokerApiClient::health_check(&self.client)
            .await
            .map_err(|e| anyhow::anyhow!("Broker health_check request failed: {:#}", e))
    }
}

#[async_trait]
impl ProvingJobProducer for RemoteBroker {
    async fn enqueue_proving_job(&self, job: ProvingJob) -> anyhow::Result<ProvingJobStatus> {
        ProvingBrokerApiClient::enqueue_proving_job(&self.client, job)
            .await
            .map_err(|e| anyhow::anyhow!("Broker enqueue_proving_job request failed: {:#}", e))
    }

    async fn get_proving_job_status(&self, id: &ProvingJobId) -> anyhow::Result<ProvingJobStatus> {
        ProvingBrokerApiClient::get_proving_job_status(&self.client, id.clone())
            .await
            .map_err(|e| anyhow::anyhow!("Broker get_proving_job_status request failed: {:#}", e))
    }

    /// Polls the job status instead of holding a request open, so long proofs
    /// do not run into the request timeout.
    async fn wait_for_job_to_settle(
        &self,
        id: &ProvingJobId,
    ) -> anyhow::Result<ProvingJobSettledResult> {
        loop {
            let status = self.get_proving_job_status(id).await?;
            if let ProvingJobStatus::NotFound = status {
                anyhow::bail!("Proving job not found: {}", id);
            }
            if let Some(result) = status.settled() {
                return Ok(result);
            }
            tokio::time::sleep(self.settle_poll_interval).await;
        }
    }

    async fn remove_and_cancel_proving_job(&self, id: &ProvingJobId) -> anyhow::Result<()> {
        ProvingBrokerApiClient::remove_and_cancel_proving_job(&self.client, id.clone())
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Broker remove_and_cancel_proving_job request failed: {:#}",
                    e
                )
            })
    }

    async fn get_completed_jobs(&self, ids: &[ProvingJobId]) -> anyhow::Result<Vec<ProvingJobId>> {
        ProvingBrokerApiClient::get_completed_jobs(&self.client, ids.to_vec())
            .await
            .map_err(|e| anyhow::anyhow!("Broker get_completed_jobs request failed: {:#}", e))
    }
}

#[async_trait]
impl ProvingJobConsumer for RemoteBroker {
    async fn get_proving_job(
        &self,
        allow_list: &[ProvingRequestType],
    ) -> anyhow::Result<Option<ProvingJobAssignment>> {
        ProvingBrokerApiClient::get_proving_job(&self.client, allow_list.to_vec())
            .await
            .map_err(|e| anyhow::anyhow!("Broker get_proving_job request failed: {:#}", e))
    }

    async fn report_job_progress(
        &self,
        id: &ProvingJobId,
        started_at: u64,
        allow_list: &[ProvingRequestType],
    ) -> anyhow::Result<JobProgressResponse> {
        ProvingBrokerApiClient::report_proving_job_progress(
            &self.client,
            id.clone(),
            started_at,
            allow_list.to_vec(),
        )
        .await
        .map_err(|e| anyhow::anyhow!("Broker report_proving_job_progress request failed: {:#}", e))
    }

    async fn report_job_completion(
        &self,
        id: &ProvingJobId,
        request_type: ProvingRequestType,
        result: ProvingJobSettledResult,
    ) -> anyhow::Result<()> {
        ProvingBrokerApiClient::report_proving_job_completion(
            &self.client,
            id.clone(),
            request_type,
            result,
        )
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Broker report_proving_job_completion request failed: {:#}",
                e
            )
        })
    }
}
