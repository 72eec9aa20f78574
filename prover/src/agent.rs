use crate::{
    controller::{ProvingJobController, ProvingJobControllerStatus},
    prover::ServerCircuitProver,
};
use broker::proof_store::ProofStore;
use broker_api::{
    types::{
        JobProgressResponse, ProvingJob, ProvingJobAssignment, ProvingJobSettledResult,
        ProvingRequestType,
    },
    ProvingJobConsumer,
};
use futures::FutureExt;
use std::{sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ProvingAgentConfig {
    /// Job types this agent accepts, every type when empty
    pub allow_list: Vec<ProvingRequestType>,
    pub poll_interval: Duration,
}

impl Default for ProvingAgentConfig {
    fn default() -> Self {
        Self {
            allow_list: Vec::new(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Pulls jobs from a broker one at a time and proves them.
///
/// While a job is running the agent heartbeats it on every poll. The broker
/// may answer with `Abort`, possibly handing over a different job.
pub struct ProvingAgent {
    broker: Arc<dyn ProvingJobConsumer>,
    proof_store: Arc<dyn ProofStore>,
    prover: Arc<dyn ServerCircuitProver>,
    config: ProvingAgentConfig,
    current: Option<ProvingJobController>,
}

impl ProvingAgent {
    pub fn new(
        broker: Arc<dyn ProvingJobConsumer>,
        proof_store: Arc<dyn ProofStore>,
        prover: Arc<dyn ServerCircuitProver>,
        config: ProvingAgentConfig,
    ) -> Self {
        Self {
            broker,
            proof_store,
            prover,
            config,
            current: None,
        }
    }

    /// Runs until `shutdown` is cancelled. Broker errors are logged and the
    /// next poll tries again.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(err) = self.poll().await {
                error!("Proving agent poll failed: {:#}", err);
            }
        }
        if let Some(controller) = self.current.take() {
            controller.abort();
        }
        debug!("Proving agent stopped");
    }

    /// One iteration: heartbeat the running job, or fetch a new one when idle.
    pub async fn poll(&mut self) -> anyhow::Result<()> {
        let running = self
            .current
            .as_ref()
            .filter(|c| c.status() == ProvingJobControllerStatus::Proving)
            .map(|c| (c.job_id().clone(), c.started_at()));

        let Some((job_id, started_at)) = running else {
            self.current = None;
            let assignment = self.broker.get_proving_job(&self.config.allow_list).await?;
            if let Some(assignment) = assignment {
                self.start_job(assignment).await?;
            }
            return Ok(());
        };

        match self
            .broker
            .report_job_progress(&job_id, started_at, &self.config.allow_list)
            .await?
        {
            JobProgressResponse::KeepWorking => {}
            JobProgressResponse::Abort { next_job } => {
                if let Some(controller) = self.current.take() {
                    info!("Broker asked to abort proving job {}", job_id);
                    controller.abort();
                }
                if let Some(assignment) = next_job {
                    self.start_job(assignment).await?;
                }
            }
        }
        Ok(())
    }

    async fn start_job(&mut self, assignment: ProvingJobAssignment) -> anyhow::Result<()> {
        let ProvingJobAssignment { job, time } = assignment;
        let inputs = match self.proof_store.get_proof_input(&job.inputs_uri).await {
            Ok(inputs) if inputs.request_type() == job.request_type => inputs,
            Ok(inputs) => {
                let reason = format!(
                    "Proof inputs at {} are for {}, expected {}",
                    job.inputs_uri.truncated(),
                    inputs.request_type(),
                    job.request_type
                );
                return self.reject(&job, reason).await;
            }
            Err(err) => {
                let reason = format!(
                    "Failed to load proof inputs from {}: {}",
                    job.inputs_uri.truncated(),
                    err
                );
                return self.reject(&job, reason).await;
            }
        };

        let broker = self.broker.clone();
        let proof_store = self.proof_store.clone();
        let mut controller = ProvingJobController::new(
            job.id.clone(),
            inputs,
            job.epoch_number,
            time,
            self.prover.clone(),
            Box::new(move |id, request_type, outcome| {
                async move {
                    let result = match outcome {
                        Ok(output) => ProvingJobSettledResult::Fulfilled {
                            value: proof_store.save_proof_output(&id, &output).await?,
                        },
                        Err(reason) => ProvingJobSettledResult::Rejected { reason },
                    };
                    broker.report_job_completion(&id, request_type, result).await
                }
                .boxed()
            }),
        );
        controller.start();
        self.current = Some(controller);
        Ok(())
    }

    async fn reject(&self, job: &ProvingJob, reason: String) -> anyhow::Result<()> {
        warn!("Rejecting proving job {}: {}", job.id, reason);
        self.broker
            .report_job_completion(
                &job.id,
                job.request_type,
                ProvingJobSettledResult::Rejected { reason },
            )
            .await
    }
}

/// Starts `count` independent agents sharing one broker, proof store and prover.
pub fn spawn_agents(
    count: usize,
    broker: Arc<dyn ProvingJobConsumer>,
    proof_store: Arc<dyn ProofStore>,
    prover: Arc<dyn ServerCircuitProver>,
    config: ProvingAgentConfig,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    info!(
        "Starting {} proving agents, allow list {:?}",
        count, config.allow_list
    );
    (0..count)
        .map(|_| {
            let agent = ProvingAgent::new(
                broker.clone(),
                proof_store.clone(),
                prover.clone(),
                config.clone(),
            );
            tokio::spawn(agent.run(shutdown.clone()))
        })
        .collect()
}
