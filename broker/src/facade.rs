use crate::{broker::ABORTED, deferred::Deferred, proof_store::ProofStore};
use broker_api::{
    circuits::*,
    types::{
        make_proving_job_id, ProofUri, ProvingJob, ProvingJobId, ProvingJobInputs,
        ProvingJobResult, ProvingJobSettledResult, ProvingJobStatus, ProvingRequestType,
    },
    ProvingJobProducer,
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FacadeError {
    #[error("failed to fingerprint proving inputs: {0}")]
    Fingerprint(String),
    #[error("failed to submit proving job {id}: {reason}")]
    Submission { id: ProvingJobId, reason: String },
    #[error("{0}")]
    Rejected(String),
    #[error("failed to retrieve result of proving job {id}: {reason}")]
    Retrieval { id: ProvingJobId, reason: String },
    #[error("Unexpected proof type: {actual}. Expected: {expected}")]
    UnexpectedProofType {
        expected: ProvingRequestType,
        actual: ProvingRequestType,
    },
    #[error("Aborted")]
    Aborted,
    #[error("Broker facade stopped")]
    Stopped,
}

type JobOutcome = Result<ProvingJobResult, FacadeError>;

struct FacadeJob {
    generation: u64,
    deferred: Arc<Deferred<JobOutcome>>,
    waiters: usize,
    driver: DriverHandle,
}

/// Lets callers stop the task that submits a job and waits on it.
#[derive(Clone, Default)]
struct DriverHandle {
    token: CancellationToken,
    // set when the job should also be removed from the broker
    abandoned: Arc<AtomicBool>,
}

impl DriverHandle {
    fn stop(&self) {
        self.token.cancel();
    }

    fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FacadeState {
    jobs: HashMap<ProvingJobId, FacadeJob>,
    next_generation: u64,
    stopped: bool,
}

struct FacadeInner {
    broker: Arc<dyn ProvingJobProducer>,
    proof_store: Arc<dyn ProofStore>,
    failed_proof_store: Option<Arc<dyn ProofStore>>,
    state: Mutex<FacadeState>,
}

/// Typed proving front end over a broker.
///
/// Identical requests share one broker submission. The job is cancelled at the
/// broker only once every caller waiting on it has given up.
#[derive(Clone)]
pub struct BrokerCircuitProverFacade {
    inner: Arc<FacadeInner>,
}

impl BrokerCircuitProverFacade {
    pub fn new(
        broker: Arc<dyn ProvingJobProducer>,
        proof_store: Arc<dyn ProofStore>,
        failed_proof_store: Option<Arc<dyn ProofStore>>,
    ) -> Self {
        Self {
            inner: Arc::new(FacadeInner {
                broker,
                proof_store,
                failed_proof_store,
                state: Mutex::new(FacadeState::default()),
            }),
        }
    }

    /// Number of distinct jobs this facade is waiting on.
    pub fn outstanding_jobs(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    /// Fails every outstanding request. Jobs already at the broker are left alone.
    pub fn stop(&self) {
        let jobs = {
            let mut state = self.inner.lock();
            state.stopped = true;
            std::mem::take(&mut state.jobs)
        };
        info!("Stopping broker facade with {} outstanding jobs", jobs.len());
        for (_, job) in jobs {
            job.driver.stop();
            job.deferred.resolve(Err(FacadeError::Stopped));
        }
    }

    /// Proves `inputs` under the id derived from their fingerprint.
    pub async fn prove(
        &self,
        inputs: ProvingJobInputs,
        signal: Option<CancellationToken>,
        epoch_number: Option<u64>,
    ) -> JobOutcome {
        let epoch_number = epoch_number.unwrap_or(0);
        let hash = inputs
            .fingerprint()
            .map_err(|e| FacadeError::Fingerprint(e.to_string()))?;
        let id = make_proving_job_id(epoch_number, inputs.request_type(), &hash);
        self.prove_with_id(id, inputs, signal, epoch_number).await
    }

    pub async fn prove_with_id(
        &self,
        id: ProvingJobId,
        inputs: ProvingJobInputs,
        signal: Option<CancellationToken>,
        epoch_number: u64,
    ) -> JobOutcome {
        let (wait, generation, driver) = {
            let mut state = self.inner.lock();
            if state.stopped {
                return Err(FacadeError::Stopped);
            }
            match state.jobs.get_mut(&id) {
                Some(job) => {
                    job.waiters += 1;
                    debug!(
                        "Job already found in facade id={} type={}",
                        id,
                        inputs.request_type()
                    );
                    (job.deferred.wait(), job.generation, None)
                }
                None => {
                    let generation = state.next_generation;
                    state.next_generation += 1;
                    let deferred = Arc::new(Deferred::new());
                    let driver = DriverHandle::default();
                    state.jobs.insert(
                        id.clone(),
                        FacadeJob {
                            generation,
                            deferred: deferred.clone(),
                            waiters: 1,
                            driver: driver.clone(),
                        },
                    );
                    (deferred.wait(), generation, Some((deferred, driver)))
                }
            }
        };

        if let Some((deferred, driver)) = driver {
            let inner = self.inner.clone();
            let id = id.clone();
            tokio::spawn(async move {
                if let Some(outcome) = inner.run_job(&id, &inputs, epoch_number, &driver).await {
                    inner.finish(&id, generation);
                    deferred.resolve(outcome);
                }
            });
        }

        let signal = signal.unwrap_or_default();
        tokio::select! {
            outcome = wait => outcome.unwrap_or(Err(FacadeError::Stopped)),
            _ = signal.cancelled() => {
                self.inner.leave(&id, generation);
                Err(FacadeError::Aborted)
            }
        }
    }

    pub async fn get_avm_proof(
        &self,
        inputs: AvmCircuitInputs,
        signal: Option<CancellationToken>,
        epoch_number: Option<u64>,
    ) -> Result<ProofAndVerificationKey, FacadeError> {
        match self
            .prove(ProvingJobInputs::PublicVm(inputs), signal, epoch_number)
            .await?
        {
            ProvingJobResult::PublicVm(proof) => Ok(proof),
            other => Err(unexpected(ProvingRequestType::PublicVm, &other)),
        }
    }

    pub async fn get_base_parity_proof(
        &self,
        inputs: BaseParityInputs,
        signal: Option<CancellationToken>,
        epoch_number: Option<u64>,
    ) -> Result<ParityProof, FacadeError> {
        match self
            .prove(ProvingJobInputs::BaseParity(inputs), signal, epoch_number)
            .await?
        {
            ProvingJobResult::BaseParity(proof) => Ok(proof),
            other => Err(unexpected(ProvingRequestType::BaseParity, &other)),
        }
    }

    pub async fn get_root_parity_proof(
        &self,
        inputs: RootParityInputs,
        signal: Option<CancellationToken>,
        epoch_number: Option<u64>,
    ) -> Result<ParityProof, FacadeError> {
        match self
            .prove(ProvingJobInputs::RootParity(inputs), signal, epoch_number)
            .await?
        {
            ProvingJobResult::RootParity(proof) => Ok(proof),
            other => Err(unexpected(ProvingRequestType::RootParity, &other)),
        }
    }

    pub async fn get_private_base_rollup_proof(
        &self,
        inputs: PrivateBaseRollupInputs,
        signal: Option<CancellationToken>,
        epoch_number: Option<u64>,
    ) -> Result<BaseOrMergeRollupProof, FacadeError> {
        match self
            .prove(
                ProvingJobInputs::PrivateBaseRollup(inputs),
                signal,
                epoch_number,
            )
            .await?
        {
            ProvingJobResult::PrivateBaseRollup(proof) => Ok(proof),
            other => Err(unexpected(ProvingRequestType::PrivateBaseRollup, &other)),
        }
    }

    pub async fn get_public_base_rollup_proof(
        &self,
        inputs: PublicBaseRollupInputs,
        signal: Option<CancellationToken>,
        epoch_number: Option<u64>,
    ) -> Result<BaseOrMergeRollupProof, FacadeError> {
        match self
            .prove(
                ProvingJobInputs::PublicBaseRollup(inputs),
                signal,
                epoch_number,
            )
            .await?
        {
            ProvingJobResult::PublicBaseRollup(proof) => Ok(proof),
            other => Err(unexpected(ProvingRequestType::PublicBaseRollup, &other)),
        }
    }

    pub async fn get_merge_rollup_proof(
        &self,
        inputs: MergeRollupInputs,
        signal: Option<CancellationToken>,
        epoch_number: Option<u64>,
    ) -> Result<BaseOrMergeRollupProof, FacadeError> {
        match self
            .prove(ProvingJobInputs::MergeRollup(inputs), signal, epoch_number)
            .await?
        {
            ProvingJobResult::MergeRollup(proof) => Ok(proof),
            other => Err(unexpected(ProvingRequestType::MergeRollup, &other)),
        }
    }

    pub async fn get_block_root_rollup_proof(
        &self,
        inputs: BlockRootRollupInputs,
        signal: Option<CancellationToken>,
        epoch_number: Option<u64>,
    ) -> Result<BlockRootOrBlockMergeProof, FacadeError> {
        match self
            .prove(
                ProvingJobInputs::BlockRootRollup(inputs),
                signal,
                epoch_number,
            )
            .await?
        {
            ProvingJobResult::BlockRootRollup(proof) => Ok(proof),
            other => Err(unexpected(ProvingRequestType::BlockRootRollup, &other)),
        }
    }

    pub async fn get_single_tx_block_root_rollup_proof(
        &self,
        inputs: SingleTxBlockRootRollupInputs,
        signal: Option<CancellationToken>,
        epoch_number: Option<u64>,
    ) -> Result<BlockRootOrBlockMergeProof, FacadeError> {
        match self
            .prove(
                ProvingJobInputs::SingleTxBlockRootRollup(inputs),
                signal,
                epoch_number,
            )
            .await?
        {
            ProvingJobResult::SingleTxBlockRootRollup(proof) => Ok(proof),
            other => Err(unexpected(
                ProvingRequestType::SingleTxBlockRootRollup,
                &other,
            )),
        }
    }

    pub async fn get_empty_block_root_rollup_proof(
        &self,
        inputs: EmptyBlockRootRollupInputs,
        signal: Option<CancellationToken>,
        epoch_number: Option<u64>,
    ) -> Result<BlockRootOrBlockMergeProof, FacadeError> {
        match self
            .prove(
                ProvingJobInputs::EmptyBlockRootRollup(inputs),
                signal,
                epoch_number,
            )
            .await?
        {
            ProvingJobResult::EmptyBlockRootRollup(proof) => Ok(proof),
            other => Err(unexpected(ProvingRequestType::EmptyBlockRootRollup, &other)),
        }
    }

    pub async fn get_block_merge_rollup_proof(
        &self,
        inputs: BlockMergeRollupInputs,
        signal: Option<CancellationToken>,
        epoch_number: Option<u64>,
    ) -> Result<BlockRootOrBlockMergeProof, FacadeError> {
        match self
            .prove(
                ProvingJobInputs::BlockMergeRollup(inputs),
                signal,
                epoch_number,
            )
            .await?
        {
            ProvingJobResult::BlockMergeRollup(proof) => Ok(proof),
            other => Err(unexpected(ProvingRequestType::BlockMergeRollup, &other)),
        }
    }

    pub async fn get_root_rollup_proof(
        &self,
        inputs: RootRollupInputs,
        signal: Option<CancellationToken>,
        epoch_number: Option<u64>,
    ) -> Result<RootRollupProof, FacadeError> {
        match self
            .prove(ProvingJobInputs::RootRollup(inputs), signal, epoch_number)
            .await?
        {
            ProvingJobResult::RootRollup(proof) => Ok(proof),
            other => Err(unexpected(ProvingRequestType::RootRollup, &other)),
        }
    }

    pub async fn get_tube_proof(
        &self,
        inputs: TubeInputs,
        signal: Option<CancellationToken>,
        epoch_number: Option<u64>,
    ) -> Result<ProofAndVerificationKey, FacadeError> {
        match self
            .prove(ProvingJobInputs::TubeProof(inputs), signal, epoch_number)
            .await?
        {
            ProvingJobResult::TubeProof(proof) => Ok(proof),
            other => Err(unexpected(ProvingRequestType::TubeProof, &other)),
        }
    }
}

fn unexpected(expected: ProvingRequestType, actual: &ProvingJobResult) -> FacadeError {
    FacadeError::UnexpectedProofType {
        expected,
        actual: actual.request_type(),
    }
}

impl FacadeInner {
    fn lock(&self) -> MutexGuard<'_, FacadeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drops the cache entry once the job has an outcome, unless a newer
    /// request already replaced it.
    fn finish(&self, id: &ProvingJobId, generation: u64) {
        let mut state = self.lock();
        if state.jobs.get(id).map(|job| job.generation) == Some(generation) {
            state.jobs.remove(id);
        }
    }

    /// A caller gave up waiting. The last one out cancels the job.
    fn leave(&self, id: &ProvingJobId, generation: u64) {
        let job = {
            let mut state = self.lock();
            let Some(job) = state.jobs.get_mut(id) else {
                return;
            };
            if job.generation != generation {
                return;
            }
            job.waiters = job.waiters.saturating_sub(1);
            if job.waiters > 0 {
                debug!("Caller left proving job {}, {} still waiting", id, job.waiters);
                return;
            }
            state.jobs.remove(id)
        };
        let Some(job) = job else {
            return;
        };

        job.deferred.resolve(Err(FacadeError::Aborted));
        info!("All callers left proving job {}, cancelling it", id);
        job.driver.abandon();
    }

    /// Submits the job and waits for its outcome. Returns `None` when the
    /// driver was stopped; an abandoned job is then removed from the broker.
    ///
    /// Input save and enqueue always run to completion.
    async fn run_job(
        &self,
        id: &ProvingJobId,
        inputs: &ProvingJobInputs,
        epoch_number: u64,
        driver: &DriverHandle,
    ) -> Option<JobOutcome> {
        let submitted = self.submit(id, inputs, epoch_number).await;
        if driver.token.is_cancelled() {
            self.cancel_at_broker(id, driver).await;
            return None;
        }
        if let Err(err) = submitted {
            return Some(Err(err));
        }

        let outcome = tokio::select! {
            outcome = self.settle(id, inputs) => outcome,
            _ = driver.token.cancelled() => {
                self.cancel_at_broker(id, driver).await;
                return None;
            }
        };
        Some(outcome)
    }

    async fn cancel_at_broker(&self, id: &ProvingJobId, driver: &DriverHandle) {
        if !driver.is_abandoned() {
            return;
        }
        if let Err(err) = self.broker.remove_and_cancel_proving_job(id).await {
            warn!("Error cancelling proving job {}: {:#}", id, err);
        }
    }

    async fn submit(
        &self,
        id: &ProvingJobId,
        inputs: &ProvingJobInputs,
        epoch_number: u64,
    ) -> Result<(), FacadeError> {
        let request_type = inputs.request_type();
        let submission = |reason: String| FacadeError::Submission {
            id: id.clone(),
            reason,
        };

        let inputs_uri = self
            .proof_store
            .save_proof_input(id, inputs)
            .await
            .map_err(|e| submission(e.to_string()))?;
        let status = self
            .broker
            .enqueue_proving_job(ProvingJob {
                id: id.clone(),
                request_type,
                inputs_uri: inputs_uri.clone(),
                epoch_number,
            })
            .await
            .map_err(|e| submission(format!("{:#}", e)))?;

        match status {
            ProvingJobStatus::NotFound => {
                info!(
                    "Job enqueued with broker id={} type={} epochNumber={} inputsUri={}",
                    id,
                    request_type,
                    epoch_number,
                    inputs_uri.truncated()
                )
            }
            ProvingJobStatus::InQueue | ProvingJobStatus::InProgress => debug!(
                "Job already in queue or in progress when sent to broker id={} type={}",
                id, request_type
            ),
            ProvingJobStatus::Fulfilled { .. } | ProvingJobStatus::Rejected { .. } => debug!(
                "Job already completed when sent to broker id={} type={}",
                id, request_type
            ),
        }
        Ok(())
    }

    async fn settle(&self, id: &ProvingJobId, inputs: &ProvingJobInputs) -> JobOutcome {
        let request_type = inputs.request_type();
        let settled = self
            .broker
            .wait_for_job_to_settle(id)
            .await
            .map_err(|e| FacadeError::Retrieval {
                id: id.clone(),
                reason: format!("{:#}", e),
            })?;

        match settled {
            ProvingJobSettledResult::Fulfilled { value } => {
                let output = self.load_output(id, &value).await?;
                if output.request_type() != request_type {
                    return Err(unexpected(request_type, &output));
                }
                info!("Resolved proving job id={} type={}", id, request_type);
                Ok(output)
            }
            ProvingJobSettledResult::Rejected { reason } => {
                error!(
                    "Resolving proving job with error id={} type={}: {}",
                    id, request_type, reason
                );
                if reason != ABORTED {
                    self.backup_failed_proof_inputs(id, inputs).await;
                }
                Err(FacadeError::Rejected(reason))
            }
        }
    }

    async fn load_output(&self, id: &ProvingJobId, uri: &ProofUri) -> JobOutcome {
        self.proof_store
            .get_proof_output(uri)
            .await
            .map_err(|e| FacadeError::Retrieval {
                id: id.clone(),
                reason: e.to_string(),
            })
    }

    async fn backup_failed_proof_inputs(&self, id: &ProvingJobId, inputs: &ProvingJobInputs) {
        let Some(store) = &self.failed_proof_store else {
            return;
        };
        match store.save_proof_input(id, inputs).await {
            Ok(uri) => info!(
                "Stored proof inputs for failed job id={} type={} at {}",
                id,
                inputs.request_type(),
                uri.truncated()
            ),
            Err(err) => error!(
                "Error backing up proof inputs for failed job id={}: {}",
                id, err
            ),
        }
    }
}
