use crate::prover::ServerCircuitProver;
use broker_api::types::{ProvingJobId, ProvingJobInputs, ProvingJobResult, ProvingRequestType};
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvingJobControllerStatus {
    Idle,
    Proving,
    Done,
    Aborted,
}

/// Called once with the outcome of a job that was not aborted.
pub type ProvingJobCompletionCallback = Box<
    dyn FnOnce(
            ProvingJobId,
            ProvingRequestType,
            Result<ProvingJobResult, String>,
        ) -> BoxFuture<'static, anyhow::Result<()>>
        + Send
        + Sync,
>;

/// Runs a single job on the prover and reports its outcome, unless aborted
/// first.
pub struct ProvingJobController {
    job_id: ProvingJobId,
    epoch_number: u64,
    started_at: u64,
    inputs: Option<ProvingJobInputs>,
    request_type: ProvingRequestType,
    prover: Arc<dyn ServerCircuitProver>,
    on_complete: Option<ProvingJobCompletionCallback>,
    status: Arc<Mutex<ProvingJobControllerStatus>>,
    abort: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ProvingJobController {
    pub fn new(
        job_id: ProvingJobId,
        inputs: ProvingJobInputs,
        epoch_number: u64,
        started_at: u64,
        prover: Arc<dyn ServerCircuitProver>,
        on_complete: ProvingJobCompletionCallback,
    ) -> Self {
        Self {
            job_id,
            epoch_number,
            started_at,
            request_type: inputs.request_type(),
            inputs: Some(inputs),
            prover,
            on_complete: Some(on_complete),
            status: Arc::new(Mutex::new(ProvingJobControllerStatus::Idle)),
            abort: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn job_id(&self) -> &ProvingJobId {
        &self.job_id
    }

    pub fn request_type(&self) -> ProvingRequestType {
        self.request_type
    }

    pub fn epoch_number(&self) -> u64 {
        self.epoch_number
    }

    /// Claim time the broker handed the job out with.
    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    pub fn status(&self) -> ProvingJobControllerStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn start(&mut self) {
        let (Some(inputs), Some(on_complete)) = (self.inputs.take(), self.on_complete.take())
        else {
            warn!(
                "Proving job controller for {} was already started",
                self.job_id
            );
            return;
        };
        {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            if *status != ProvingJobControllerStatus::Idle {
                warn!(
                    "Not starting proving job {} in state {:?}",
                    self.job_id, *status
                );
                return;
            }
            *status = ProvingJobControllerStatus::Proving;
        }

        info!(
            "Starting proving job id={} type={} epochNumber={}",
            self.job_id, self.request_type, self.epoch_number
        );
        let job_id = self.job_id.clone();
        let request_type = self.request_type;
        let prover = self.prover.clone();
        let status = self.status.clone();
        let abort = self.abort.clone();

        self.handle = Some(tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = generate_proof(prover.as_ref(), inputs) => outcome,
                _ = abort.cancelled() => {
                    debug!("Proving job {} aborted while proving", job_id);
                    return;
                }
            };

            {
                let mut status = status.lock().unwrap_or_else(|e| e.into_inner());
                if *status == ProvingJobControllerStatus::Aborted {
                    return;
                }
                *status = ProvingJobControllerStatus::Done;
            }

            let outcome = outcome.map_err(|err| format!("{:#}", err));
            if let Err(err) = outcome.as_ref() {
                warn!("Proving job {} failed: {}", job_id, err);
            }
            if let Err(err) = on_complete(job_id.clone(), request_type, outcome).await {
                warn!("Failed to report outcome of proving job {}: {:#}", job_id, err);
            }
        }));
    }

    /// Stops the job. Its outcome, if it ever arrives, is discarded.
    pub fn abort(&self) {
        {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            match *status {
                ProvingJobControllerStatus::Idle | ProvingJobControllerStatus::Proving => {
                    *status = ProvingJobControllerStatus::Aborted;
                }
                ProvingJobControllerStatus::Done | ProvingJobControllerStatus::Aborted => return,
            }
        }
        info!("Aborting proving job {}", self.job_id);
        self.abort.cancel();
    }

    /// Waits for the proving task, including the completion callback.
    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                if !err.is_cancelled() {
                    warn!("Proving task for {} panicked: {}", self.job_id, err);
                }
            }
        }
    }
}

async fn generate_proof(
    prover: &dyn ServerCircuitProver,
    inputs: ProvingJobInputs,
) -> anyhow::Result<ProvingJobResult> {
    Ok(match inputs {
        ProvingJobInputs::PublicVm(inputs) => {
            ProvingJobResult::PublicVm(prover.get_avm_proof(inputs).await?)
        }
        ProvingJobInputs::BaseParity(inputs) => {
            ProvingJobResult::BaseParity(prover.get_base_parity_proof(inputs).await?)
        }
        ProvingJobInputs::RootParity(inputs) => {
            ProvingJobResult::RootParity(prover.get_root_parity_proof(inputs).await?)
        }
        ProvingJobInputs::PrivateBaseRollup(inputs) => ProvingJobResult::PrivateBaseRollup(
            prover.get_private_base_rollup_proof(inputs).await?,
        ),
        ProvingJobInputs::PublicBaseRollup(inputs) => ProvingJobResult::PublicBaseRollup(
            prover.get_public_base_rollup_proof(inputs).await?,
        ),
        ProvingJobInputs::MergeRollup(inputs) => {
            ProvingJobResult::MergeRollup(prover.get_merge_rollup_proof(inputs).await?)
        }
        ProvingJobInputs::BlockRootRollup(inputs) => ProvingJobResult::BlockRootRollup(
            prover.get_block_root_rollup_proof(inputs).await?,
        ),
        ProvingJobInputs::SingleTxBlockRootRollup(inputs) => {
            ProvingJobResult::SingleTxBlockRootRollup(
                prover.get_single_tx_block_root_rollup_proof(inputs).await?,
            )
        }
        ProvingJobInputs::EmptyBlockRootRollup(inputs) => ProvingJobResult::EmptyBlockRootRollup(
            prover.get_empty_block_root_rollup_proof(inputs).await?,
        ),
        ProvingJobInputs::BlockMergeRollup(inputs) => ProvingJobResult::BlockMergeRollup(
            prover.get_block_merge_rollup_proof(inputs).await?,
        ),
        ProvingJobInputs::RootRollup(inputs) => {
            ProvingJobResult::RootRollup(prover.get_root_rollup_proof(inputs).await?)
        }
        ProvingJobInputs::TubeProof(inputs) => {
            ProvingJobResult::TubeProof(prover.get_tube_proof(inputs).await?)
        }
    })
}
