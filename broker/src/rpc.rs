use crate::broker::{BrokerError, ProvingBroker};
use broker_api::{
    rpc::ProvingBrokerApiServer,
    types::{
        JobProgressResponse, ProvingJob, ProvingJobAssignment, ProvingJobId,
        ProvingJobSettledResult, ProvingJobStatus, ProvingRequestType,
    },
};
use jsonrpsee::{
    core::async_trait,
    server::{Server, ServerHandle},
    types::{ErrorObject, ErrorObjectOwned},
};
use std::net::SocketAddr;
use tracing::{debug, error, info};

fn rpc_error(err: BrokerError) -> ErrorObjectOwned {
    ErrorObject::owned(-32001, err.to_string(), None::<()>)
}

pub struct ProvingBrokerRpc {
    broker: ProvingBroker,
}

impl ProvingBrokerRpc {
    pub fn new(broker: ProvingBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl ProvingBrokerApiServer for ProvingBrokerRpc {
    async fn enqueue_proving_job(
        &self,
        job: ProvingJob,
    ) -> Result<ProvingJobStatus, ErrorObjectOwned> {
        debug!("Enqueue request for proving job {}", job.id);
        self.broker.enqueue_proving_job(job).await.map_err(|err| {
            error!("Failed to enqueue proving job: {}", err);
            rpc_error(err)
        })
    }

    async fn get_proving_job_status(
        &self,
        id: ProvingJobId,
    ) -> Result<ProvingJobStatus, ErrorObjectOwned> {
        Ok(self.broker.get_proving_job_status(&id).await)
    }

    async fn wait_for_job_to_settle(
        &self,
        id: ProvingJobId,
    ) -> Result<ProvingJobSettledResult, ErrorObjectOwned> {
        self.broker
            .wait_for_job_to_settle(&id)
            .await
            .map_err(rpc_error)
    }

    async fn remove_and_cancel_proving_job(
        &self,
        id: ProvingJobId,
    ) -> Result<(), ErrorObjectOwned> {
        self.broker
            .remove_and_cancel_proving_job(&id)
            .await
            .map_err(rpc_error)
    }

    async fn get_completed_jobs(
        &self,
        ids: Vec<ProvingJobId>,
    ) -> Result<Vec<ProvingJobId>, ErrorObjectOwned> {
        Ok(self.broker.get_completed_jobs(&ids).await)
    }

    async fn get_proving_job(
        &self,
        allow_list: Vec<ProvingRequestType>,
    ) -> Result<Option<ProvingJobAssignment>, ErrorObjectOwned> {
        self.broker
            .get_proving_job(&allow_list)
            .await
            .map_err(rpc_error)
    }

    async fn report_proving_job_progress(
        &self,
        id: ProvingJobId,
        started_at: u64,
        allow_list: Vec<ProvingRequestType>,
    ) -> Result<JobProgressResponse, ErrorObjectOwned> {
        self.broker
            .report_job_progress(&id, started_at, &allow_list)
            .await
            .map_err(rpc_error)
    }

    async fn report_proving_job_completion(
        &self,
        id: ProvingJobId,
        request_type: ProvingRequestType,
        result: ProvingJobSettledResult,
    ) -> Result<(), ErrorObjectOwned> {
        self.broker
            .report_job_completion(&id, request_type, result)
            .await
            .map_err(rpc_error)
    }

    async fn health_check(&self) -> Result<(), ErrorObjectOwned> {
        Ok(())
    }
}

/// Serves `broker` over JSON-RPC on `addr` until the handle is stopped.
pub async fn start_rpc_server(
    broker: ProvingBroker,
    addr: SocketAddr,
) -> anyhow::Result<(SocketAddr, ServerHandle)> {
    let server = Server::builder().build(addr).await?;
    let server_addr = server.local_addr()?;
    info!("JSON-RPC server started at {}", server_addr);
    let handle = server.start(ProvingBrokerRpc::new(broker).into_rpc());
    Ok((server_addr, handle))
}
