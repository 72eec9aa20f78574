use crate::{
    app_config::BrokerConfig,
    db::{JobRecord, ProvingJobDatabase},
    deferred::Deferred,
    instrumentation::ProvingBrokerInstrumentation,
};
use async_trait::async_trait;
use broker_api::{
    types::{
        JobProgressResponse, ProvingJob, ProvingJobAssignment, ProvingJobId,
        ProvingJobSettledResult, ProvingJobStatus, ProvingRequestType,
        PROOF_TYPES_IN_PRIORITY_ORDER,
    },
    ProvingJobConsumer, ProvingJobProducer,
};
use itertools::Itertools;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};
use thiserror::Error;
use tokio::{
    sync::{Mutex, MutexGuard},
    task::{AbortHandle, JoinHandle},
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, instrument, warn};

/// Reason given to waiters of a job that was cancelled or pruned.
pub const ABORTED: &str = "Aborted";
/// Reason recorded for a job that ran out of retries.
pub const TIMED_OUT: &str = "timed out";

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Duplicate proving job ID: {0}")]
    DuplicateJobId(ProvingJobId),
    #[error("Proving job not found: {0}")]
    JobNotFound(ProvingJobId),
    #[error("Proving broker stopped")]
    BrokerStopped,
    #[error("Proving broker already started")]
    AlreadyStarted,
    #[error("Proving job database error: {0:#}")]
    Database(anyhow::Error),
}

type QueueKey = (u64, u64, ProvingJobId);

/// Wall-clock source for claim times, in unix milliseconds.
pub type WallClock = Arc<dyn Fn() -> u64 + Send + Sync>;

pub fn system_clock() -> WallClock {
    Arc::new(|| u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default())
}

struct JobEntry {
    job: ProvingJob,
    retries: u32,
    seq: u64,
    enqueued_at: Instant,
}

impl JobEntry {
    fn queue_key(&self) -> QueueKey {
        (self.job.epoch_number, self.seq, self.job.id.clone())
    }
}

struct InProgress {
    // claim time of the agent that currently owns the job
    claimed_at: u64,
    started_at: Instant,
    last_updated: Instant,
}

#[derive(Default)]
struct BrokerState {
    jobs: HashMap<ProvingJobId, JobEntry>,
    // ordered by epoch, then arrival
    queues: HashMap<ProvingRequestType, BTreeSet<QueueKey>>,
    in_progress: HashMap<ProvingJobId, InProgress>,
    results: HashMap<ProvingJobId, ProvingJobSettledResult>,
    waiters: HashMap<ProvingJobId, Deferred<ProvingJobSettledResult>>,
    // settled since the last get_completed_jobs call
    completed: HashSet<ProvingJobId>,
    epoch_height: u64,
    next_seq: u64,
    last_claim: u64,
}

impl BrokerState {
    fn status_of(&self, id: &ProvingJobId) -> ProvingJobStatus {
        if let Some(result) = self.results.get(id) {
            result.clone().into()
        } else if self.in_progress.contains_key(id) {
            ProvingJobStatus::InProgress
        } else if self.jobs.contains_key(id) {
            ProvingJobStatus::InQueue
        } else {
            ProvingJobStatus::NotFound
        }
    }

    fn push_queue(&mut self, id: &ProvingJobId) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(entry) = self.jobs.get_mut(id) {
            entry.seq = seq;
            entry.enqueued_at = Instant::now();
            let request_type = entry.job.request_type;
            let key = entry.queue_key();
            self.queues.entry(request_type).or_default().insert(key);
        }
    }

    fn remove_from_queue(&mut self, id: &ProvingJobId) -> bool {
        let Some(entry) = self.jobs.get(id) else {
            return false;
        };
        let key = entry.queue_key();
        self.queues
            .get_mut(&entry.job.request_type)
            .map(|queue| queue.remove(&key))
            .unwrap_or(false)
    }

    fn insert_job(&mut self, job: ProvingJob, retries: u32) {
        self.epoch_height = self.epoch_height.max(job.epoch_number);
        self.jobs.insert(
            job.id.clone(),
            JobEntry {
                job,
                retries,
                seq: 0,
                enqueued_at: Instant::now(),
            },
        );
    }

    fn forget(&mut self, id: &ProvingJobId) -> Option<JobEntry> {
        self.remove_from_queue(id);
        self.in_progress.remove(id);
        self.results.remove(id);
        self.completed.remove(id);
        if let Some(waiter) = self.waiters.remove(id) {
            waiter.resolve(ProvingJobSettledResult::Rejected {
                reason: ABORTED.to_string(),
            });
        }
        self.jobs.remove(id)
    }

    fn next_queued(&self, allow_list: &[ProvingRequestType]) -> Option<ProvingJobId> {
        PROOF_TYPES_IN_PRIORITY_ORDER
            .iter()
            .filter(|t| allow_list.is_empty() || allow_list.contains(*t))
            .find_map(|t| self.queues.get(t).and_then(|queue| queue.first()))
            .map(|(_, _, id)| id.clone())
    }

    /// Strictly increasing within one broker, so no two hand-outs tie.
    fn next_claim_time(&mut self, clock: &WallClock) -> u64 {
        let time = clock().max(self.last_claim.saturating_add(1));
        self.last_claim = time;
        time
    }

    fn queue_stats(&self) -> HashMap<ProvingRequestType, (u64, u64)> {
        let mut stats: HashMap<ProvingRequestType, (u64, u64)> = self
            .queues
            .iter()
            .map(|(t, queue)| (*t, (queue.len() as u64, 0)))
            .collect();
        for id in self.in_progress.keys() {
            if let Some(entry) = self.jobs.get(id) {
                stats.entry(entry.job.request_type).or_default().1 += 1;
            }
        }
        stats
    }
}

struct Inner {
    database: Arc<dyn ProvingJobDatabase>,
    config: BrokerConfig,
    state: Mutex<BrokerState>,
    instrumentation: ProvingBrokerInstrumentation,
    stats: Arc<std::sync::Mutex<HashMap<ProvingRequestType, (u64, u64)>>>,
    ticker: std::sync::Mutex<Option<AbortHandle>>,
    clock: WallClock,
}

/// Schedules proving jobs onto agents that pull work by type.
///
/// Every mutation holds the state lock across its ledger write, so a change is
/// visible to producers and agents only once it is durable.
#[derive(Clone)]
pub struct ProvingBroker {
    inner: Arc<Inner>,
}

impl ProvingBroker {
    pub fn new(
        database: Arc<dyn ProvingJobDatabase>,
        config: BrokerConfig,
        instrumentation: ProvingBrokerInstrumentation,
    ) -> Self {
        Self::with_clock(database, config, instrumentation, system_clock())
    }

    pub fn with_clock(
        database: Arc<dyn ProvingJobDatabase>,
        config: BrokerConfig,
        instrumentation: ProvingBrokerInstrumentation,
        clock: WallClock,
    ) -> Self {
        let stats: Arc<std::sync::Mutex<HashMap<ProvingRequestType, (u64, u64)>>> =
            Default::default();

        let queued = stats.clone();
        instrumentation.monitor_queue_depth(move || {
            queued
                .lock()
                .map(|s| s.iter().map(|(t, (q, _))| (*t, *q)).collect())
                .unwrap_or_default()
        });
        let active = stats.clone();
        instrumentation.monitor_active_jobs(move || {
            active
                .lock()
                .map(|s| s.iter().map(|(t, (_, a))| (*t, *a)).collect())
                .unwrap_or_default()
        });

        Self {
            inner: Arc::new(Inner {
                database,
                config,
                state: Mutex::new(BrokerState::default()),
                instrumentation,
                stats,
                ticker: std::sync::Mutex::new(None),
                clock,
            }),
        }
    }

    /// Restores jobs from the ledger and starts the timeout/pruning tick.
    ///
    /// Settled jobs keep their result, everything else goes back into the
    /// queue. The returned handle resolves only if the tick fails.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<JoinHandle<Result<(), BrokerError>>, BrokerError> {
        {
            let ticker = self
                .inner
                .ticker
                .lock()
                .map_err(|_| BrokerError::BrokerStopped)?;
            if ticker.is_some() {
                return Err(BrokerError::AlreadyStarted);
            }
        }

        let records = self
            .inner
            .database
            .get_all_jobs()
            .await
            .map_err(BrokerError::Database)?;
        let restored = records.len();
        {
            let mut state = self.inner.state.lock().await;
            for record in records {
                self.restore(&mut state, record).await?;
            }
            self.publish_stats(&state);
        }
        info!("Restored {} proving jobs from the ledger", restored);

        let broker = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(broker.inner.config.poll_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(err) = broker.cleanup_pass().await {
                    error!("Proving broker tick failed: {}", err);
                    return Err(err);
                }
            }
        });

        if let Ok(mut ticker) = self.inner.ticker.lock() {
            *ticker = Some(handle.abort_handle());
        }
        Ok(handle)
    }

    /// Stops the tick and fails every outstanding waiter.
    pub async fn stop(&self) {
        if let Some(ticker) = self.inner.ticker.lock().ok().and_then(|mut t| t.take()) {
            ticker.abort();
        }
        let mut state = self.inner.state.lock().await;
        let waiters = state.waiters.len();
        state.waiters.clear();
        info!("Proving broker stopped, {} waiters released", waiters);
    }

    async fn restore(&self, state: &mut BrokerState, record: JobRecord) -> Result<(), BrokerError> {
        let JobRecord {
            job,
            status,
            retries,
        } = record;
        if state.jobs.contains_key(&job.id) {
            return Ok(());
        }
        let id = job.id.clone();
        state.insert_job(job, retries);
        match status.settled() {
            Some(result) => {
                state.results.insert(id, result);
            }
            None => {
                if status == ProvingJobStatus::InProgress {
                    self.inner
                        .database
                        .update_job_status(&id, &ProvingJobStatus::InQueue)
                        .await
                        .map_err(BrokerError::Database)?;
                }
                state.push_queue(&id);
            }
        }
        Ok(())
    }

    fn publish_stats(&self, state: &BrokerState) {
        if let Ok(mut stats) = self.inner.stats.lock() {
            *stats = state.queue_stats();
        }
    }

    async fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.state.lock().await
    }

    pub async fn enqueue_proving_job(
        &self,
        job: ProvingJob,
    ) -> Result<ProvingJobStatus, BrokerError> {
        let mut state = self.lock().await;
        if let Some(entry) = state.jobs.get(&job.id) {
            if entry.job != job {
                return Err(BrokerError::DuplicateJobId(job.id));
            }
            debug!("Proving job {} already known", job.id);
            return Ok(state.status_of(&job.id));
        }

        self.inner
            .database
            .create_job(&job)
            .await
            .map_err(BrokerError::Database)?;

        info!(
            id = %job.id,
            r#type = %job.request_type,
            epoch = job.epoch_number,
            "Enqueued new proving job"
        );
        let id = job.id.clone();
        state.insert_job(job, 0);
        state.push_queue(&id);
        self.publish_stats(&state);
        Ok(ProvingJobStatus::NotFound)
    }

    pub async fn get_proving_job_status(&self, id: &ProvingJobId) -> ProvingJobStatus {
        self.lock().await.status_of(id)
    }

    pub async fn wait_for_job_to_settle(
        &self,
        id: &ProvingJobId,
    ) -> Result<ProvingJobSettledResult, BrokerError> {
        let wait = {
            let mut state = self.lock().await;
            if let Some(result) = state.results.get(id) {
                return Ok(result.clone());
            }
            if !state.jobs.contains_key(id) {
                return Err(BrokerError::JobNotFound(id.clone()));
            }
            state.waiters.entry(id.clone()).or_default().wait()
        };
        wait.await.map_err(|_| BrokerError::BrokerStopped)
    }

    pub async fn remove_and_cancel_proving_job(
        &self,
        id: &ProvingJobId,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock().await;
        if !state.jobs.contains_key(id) {
            debug!("Nothing to cancel for unknown proving job {}", id);
            return Ok(());
        }
        self.inner
            .database
            .delete_job(id)
            .await
            .map_err(BrokerError::Database)?;
        state.forget(id);
        self.publish_stats(&state);
        info!("Cancelled proving job {}", id);
        Ok(())
    }

    /// Ids that settled since the previous call, plus any of `ids` that are
    /// already settled.
    pub async fn get_completed_jobs(&self, ids: &[ProvingJobId]) -> Vec<ProvingJobId> {
        let mut state = self.lock().await;
        let known: Vec<ProvingJobId> = ids
            .iter()
            .filter(|id| state.results.contains_key(*id))
            .cloned()
            .collect();
        state
            .completed
            .drain()
            .chain(known)
            .unique()
            .sorted()
            .collect()
    }

    pub async fn get_proving_job(
        &self,
        allow_list: &[ProvingRequestType],
    ) -> Result<Option<ProvingJobAssignment>, BrokerError> {
        let mut state = self.lock().await;
        let job = self.take_next_job(&mut state, allow_list).await?;
        self.publish_stats(&state);
        Ok(job)
    }

    async fn take_next_job(
        &self,
        state: &mut BrokerState,
        allow_list: &[ProvingRequestType],
    ) -> Result<Option<ProvingJobAssignment>, BrokerError> {
        let Some(id) = state.next_queued(allow_list) else {
            return Ok(None);
        };
        self.inner
            .database
            .update_job_status(&id, &ProvingJobStatus::InProgress)
            .await
            .map_err(BrokerError::Database)?;

        state.remove_from_queue(&id);
        let now = Instant::now();
        let time = state.next_claim_time(&self.inner.clock);
        state.in_progress.insert(
            id.clone(),
            InProgress {
                claimed_at: time,
                started_at: now,
                last_updated: now,
            },
        );
        let Some(entry) = state.jobs.get(&id) else {
            return Ok(None);
        };
        self.inner
            .instrumentation
            .record_job_wait(entry.job.request_type, now.duration_since(entry.enqueued_at));
        debug!(
            id = %id,
            r#type = %entry.job.request_type,
            "Assigned proving job to agent"
        );
        Ok(Some(ProvingJobAssignment {
            job: entry.job.clone(),
            time,
        }))
    }

    /// Heartbeat from an agent working on `id` since the claim time
    /// `started_at`.
    ///
    /// Two agents can hold the same job after a restart put it back in the
    /// queue. The one with the earlier claim keeps it, the other one is told
    /// to abort and gets the next job instead.
    pub async fn report_job_progress(
        &self,
        id: &ProvingJobId,
        started_at: u64,
        allow_list: &[ProvingRequestType],
    ) -> Result<JobProgressResponse, BrokerError> {
        let mut state = self.lock().await;

        if !state.jobs.contains_key(id) || state.results.contains_key(id) {
            let next_job = self.take_next_job(&mut state, allow_list).await?;
            self.publish_stats(&state);
            debug!("Agent working on {} must abort", id);
            return Ok(JobProgressResponse::Abort { next_job });
        }

        let now = Instant::now();
        if let Some(progress) = state.in_progress.get_mut(id) {
            if started_at <= progress.claimed_at {
                if started_at < progress.claimed_at {
                    info!(
                        "Agent with earlier claim {} took over proving job {}",
                        started_at, id
                    );
                    progress.claimed_at = started_at;
                }
                progress.last_updated = now;
                return Ok(JobProgressResponse::KeepWorking);
            }

            debug!(
                "Proving job {} is claimed since {}, agent claim {} must abort",
                id, progress.claimed_at, started_at
            );
            let next_job = self.take_next_job(&mut state, allow_list).await?;
            self.publish_stats(&state);
            return Ok(JobProgressResponse::Abort { next_job });
        }

        // Queued again after a restart while the agent kept working on it.
        self.inner
            .database
            .update_job_status(id, &ProvingJobStatus::InProgress)
            .await
            .map_err(BrokerError::Database)?;
        state.remove_from_queue(id);
        state.last_claim = state.last_claim.max(started_at);
        state.in_progress.insert(
            id.clone(),
            InProgress {
                claimed_at: started_at,
                started_at: now,
                last_updated: now,
            },
        );
        self.publish_stats(&state);
        info!("Agent re-claimed proving job {}", id);
        Ok(JobProgressResponse::KeepWorking)
    }

    pub async fn report_job_completion(
        &self,
        id: &ProvingJobId,
        request_type: ProvingRequestType,
        result: ProvingJobSettledResult,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock().await;
        let Some(entry) = state.jobs.get(id) else {
            warn!("Ignoring result for unknown proving job {}", id);
            return Ok(());
        };
        if entry.job.request_type != request_type {
            warn!(
                "Ignoring result for proving job {}: expected type {}, got {}",
                id, entry.job.request_type, request_type
            );
            return Ok(());
        }
        if state.results.contains_key(id) {
            warn!("Ignoring result for already settled proving job {}", id);
            return Ok(());
        }

        self.inner
            .database
            .update_job_status(id, &result.clone().into())
            .await
            .map_err(BrokerError::Database)?;

        match &result {
            ProvingJobSettledResult::Fulfilled { value } => {
                info!("Proving job {} fulfilled: {}", id, value.truncated())
            }
            ProvingJobSettledResult::Rejected { reason } => {
                warn!("Proving job {} rejected: {}", id, reason)
            }
        }
        self.settle(&mut state, id, result);
        self.publish_stats(&state);
        Ok(())
    }

    fn settle(&self, state: &mut BrokerState, id: &ProvingJobId, result: ProvingJobSettledResult) {
        state.remove_from_queue(id);
        let progress = state.in_progress.remove(id);
        if let Some(entry) = state.jobs.get(id) {
            let request_type = entry.job.request_type;
            if let Some(progress) = progress {
                self.inner
                    .instrumentation
                    .record_job_duration(request_type, progress.started_at.elapsed());
            }
            match result {
                ProvingJobSettledResult::Fulfilled { .. } => {
                    self.inner.instrumentation.inc_resolved_jobs(request_type)
                }
                ProvingJobSettledResult::Rejected { .. } => {
                    self.inner.instrumentation.inc_rejected_jobs(request_type)
                }
            }
        }
        state.results.insert(id.clone(), result.clone());
        state.completed.insert(id.clone());
        if let Some(waiter) = state.waiters.remove(id) {
            waiter.resolve(result);
        }
    }

    /// One pass of the tick: take back jobs whose agent went quiet, then drop
    /// epochs that fell out of the retention window.
    async fn cleanup_pass(&self) -> Result<(), BrokerError> {
        let mut state = self.lock().await;
        self.reclaim_timed_out_jobs(&mut state).await?;
        self.prune_old_epochs(&mut state).await?;
        self.publish_stats(&state);
        Ok(())
    }

    async fn reclaim_timed_out_jobs(&self, state: &mut BrokerState) -> Result<(), BrokerError> {
        let now = Instant::now();
        let timeout = self.inner.config.job_timeout();
        let timed_out: Vec<ProvingJobId> = state
            .in_progress
            .iter()
            .filter(|(_, progress)| now.duration_since(progress.last_updated) >= timeout)
            .map(|(id, _)| id.clone())
            .sorted()
            .collect();

        for id in timed_out {
            let Some(entry) = state.jobs.get(&id) else {
                state.in_progress.remove(&id);
                continue;
            };
            let request_type = entry.job.request_type;
            let retries = entry.retries;
            self.inner.instrumentation.inc_timed_out_jobs(request_type);

            if retries < self.inner.config.job_max_retries {
                let retries = self
                    .inner
                    .database
                    .increment_retry_count(&id)
                    .await
                    .map_err(BrokerError::Database)?;
                self.inner
                    .database
                    .update_job_status(&id, &ProvingJobStatus::InQueue)
                    .await
                    .map_err(BrokerError::Database)?;
                state.in_progress.remove(&id);
                if let Some(entry) = state.jobs.get_mut(&id) {
                    entry.retries = retries;
                }
                state.push_queue(&id);
                self.inner.instrumentation.inc_retried_jobs(request_type);
                warn!("Proving job {} timed out, retry {} queued", id, retries);
            } else {
                let result = ProvingJobSettledResult::Rejected {
                    reason: TIMED_OUT.to_string(),
                };
                self.inner
                    .database
                    .update_job_status(&id, &result.clone().into())
                    .await
                    .map_err(BrokerError::Database)?;
                warn!(
                    "Proving job {} timed out after {} retries, giving up",
                    id, retries
                );
                self.settle(state, &id, result);
            }
        }
        Ok(())
    }

    async fn prune_old_epochs(&self, state: &mut BrokerState) -> Result<(), BrokerError> {
        let cutoff = state
            .epoch_height
            .saturating_sub(self.inner.config.max_epochs_to_keep_results_for);
        let stale: Vec<ProvingJobId> = state
            .jobs
            .values()
            .filter(|entry| entry.job.epoch_number < cutoff)
            .map(|entry| entry.job.id.clone())
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        let deleted = self
            .inner
            .database
            .delete_jobs_older_than(cutoff)
            .await
            .map_err(BrokerError::Database)?;
        for id in stale.iter().chain(deleted.iter()).unique() {
            state.forget(id);
        }
        info!(
            "Pruned {} proving jobs older than epoch {}",
            stale.len(),
            cutoff
        );
        Ok(())
    }
}

#[async_trait]
impl ProvingJobProducer for ProvingBroker {
    async fn enqueue_proving_job(&self, job: ProvingJob) -> anyhow::Result<ProvingJobStatus> {
        Ok(ProvingBroker::enqueue_proving_job(self, job).await?)
    }

    async fn get_proving_job_status(&self, id: &ProvingJobId) -> anyhow::Result<ProvingJobStatus> {
        Ok(ProvingBroker::get_proving_job_status(self, id).await)
    }

    async fn wait_for_job_to_settle(
        &self,
        id: &ProvingJobId,
    ) -> anyhow::Result<ProvingJobSettledResult> {
        Ok(ProvingBroker::wait_for_job_to_settle(self, id).await?)
    }

    async fn remove_and_cancel_proving_job(&self, id: &ProvingJobId) -> anyhow::Result<()> {
        Ok(ProvingBroker::remove_and_cancel_proving_job(self, id).await?)
    }

    async fn get_completed_jobs(&self, ids: &[ProvingJobId]) -> anyhow::Result<Vec<ProvingJobId>> {
        Ok(ProvingBroker::get_completed_jobs(self, ids).await)
    }
}

#[async_trait]
impl ProvingJobConsumer for ProvingBroker {
    async fn get_proving_job(
        &self,
        allow_list: &[ProvingRequestType],
    ) -> anyhow::Result<Option<ProvingJobAssignment>> {
        Ok(ProvingBroker::get_proving_job(self, allow_list).await?)
    }

    async fn report_job_progress(
        &self,
        id: &ProvingJobId,
        started_at: u64,
        allow_list: &[ProvingRequestType],
    ) -> anyhow::Result<JobProgressResponse> {
        Ok(ProvingBroker::report_job_progress(self, id, started_at, allow_list).await?)
    }

    async fn report_job_completion(
        &self,
        id: &ProvingJobId,
        request_type: ProvingRequestType,
        result: ProvingJobSettledResult,
    ) -> anyhow::Result<()> {
        Ok(ProvingBroker::report_job_completion(self, id, request_type, result).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db::InMemoryDatabase, instrumentation::{metrics, InMemoryMeter}};
    use broker_api::types::ProofUri;
    use proptest::prelude::*;
    use std::{
        sync::atomic::{AtomicBool, AtomicU64, Ordering},
        time::Duration,
    };

    const JOB_TIMEOUT: Duration = Duration::from_secs(10);
    const POLL_INTERVAL: Duration = Duration::from_millis(2500);

    /// Wraps the in-memory ledger so writes can be made to fail on demand.
    #[derive(Clone, Default)]
    struct FlakyDatabase {
        inner: InMemoryDatabase,
        fail_writes: Arc<AtomicBool>,
    }

    impl FlakyDatabase {
        fn check(&self) -> anyhow::Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                anyhow::bail!("ledger write failed");
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ProvingJobDatabase for FlakyDatabase {
        async fn create_job(&self, job: &ProvingJob) -> anyhow::Result<()> {
            self.check()?;
            self.inner.create_job(job).await
        }

        async fn get_job_status(&self, id: &ProvingJobId) -> anyhow::Result<ProvingJobStatus> {
            self.inner.get_job_status(id).await
        }

        async fn update_job_status(
            &self,
            id: &ProvingJobId,
            status: &ProvingJobStatus,
        ) -> anyhow::Result<()> {
            self.check()?;
            self.inner.update_job_status(id, status).await
        }

        async fn increment_retry_count(&self, id: &ProvingJobId) -> anyhow::Result<u32> {
            self.check()?;
            self.inner.increment_retry_count(id).await
        }

        async fn delete_jobs_older_than(
            &self,
            epoch_number: u64,
        ) -> anyhow::Result<Vec<ProvingJobId>> {
            self.check()?;
            self.inner.delete_jobs_older_than(epoch_number).await
        }

        async fn delete_job(&self, id: &ProvingJobId) -> anyhow::Result<()> {
            self.check()?;
            self.inner.delete_job(id).await
        }

        async fn get_all_jobs(&self) -> anyhow::Result<Vec<JobRecord>> {
            self.inner.get_all_jobs().await
        }
    }

    struct Harness {
        broker: ProvingBroker,
        database: FlakyDatabase,
        meter: Arc<InMemoryMeter>,
        clock: WallClock,
    }

    /// Unix milliseconds that follow the paused tokio clock.
    fn paused_clock() -> WallClock {
        let origin = Instant::now();
        Arc::new(move || 1_700_000_000_000 + origin.elapsed().as_millis() as u64)
    }

    fn config() -> BrokerConfig {
        BrokerConfig {
            job_timeout_ms: JOB_TIMEOUT.as_millis() as u64,
            poll_interval_ms: POLL_INTERVAL.as_millis() as u64,
            job_max_retries: 2,
            max_epochs_to_keep_results_for: 1,
        }
    }

    fn broker_on(database: FlakyDatabase, clock: WallClock) -> Harness {
        let meter = Arc::new(InMemoryMeter::new());
        let broker = ProvingBroker::with_clock(
            Arc::new(database.clone()),
            config(),
            ProvingBrokerInstrumentation::new(meter.clone()),
            clock.clone(),
        );
        Harness {
            broker,
            database,
            meter,
            clock,
        }
    }

    async fn started() -> Harness {
        let harness = broker_on(FlakyDatabase::default(), paused_clock());
        harness.broker.start().await.unwrap();
        harness
    }

    static NEXT_ID: AtomicU64 = AtomicU64::new(0);

    fn make_job(request_type: ProvingRequestType, epoch_number: u64) -> ProvingJob {
        let n = NEXT_ID.fetch_add(1, Ordering::SeqCst);
        ProvingJob {
            id: ProvingJobId(format!("{}:{}:{:064x}", epoch_number, request_type, n)),
            request_type,
            inputs_uri: ProofUri(format!("data:inputs-{}", n)),
            epoch_number,
        }
    }

    fn output() -> ProvingJobSettledResult {
        ProvingJobSettledResult::Fulfilled {
            value: ProofUri("data:output".to_string()),
        }
    }

    fn fulfilled() -> ProvingJobStatus {
        output().into()
    }

    async fn next_job(
        broker: &ProvingBroker,
        allow_list: &[ProvingRequestType],
    ) -> Option<ProvingJob> {
        broker
            .get_proving_job(allow_list)
            .await
            .unwrap()
            .map(|assignment| assignment.job)
    }

    async fn next_id(broker: &ProvingBroker, allow_list: &[ProvingRequestType]) -> ProvingJobId {
        next_job(broker, allow_list).await.expect("a queued job").id
    }

    async fn claim(broker: &ProvingBroker) -> ProvingJobAssignment {
        broker
            .get_proving_job(&[])
            .await
            .unwrap()
            .expect("a queued job")
    }

    #[tokio::test(start_paused = true)]
    async fn enqueues_jobs() {
        let Harness { broker, .. } = started().await;
        let parity = make_job(ProvingRequestType::BaseParity, 1);
        let base = make_job(ProvingRequestType::PrivateBaseRollup, 1);
        assert_eq!(
            broker.enqueue_proving_job(parity.clone()).await.unwrap(),
            ProvingJobStatus::NotFound
        );
        broker.enqueue_proving_job(base.clone()).await.unwrap();
        assert_eq!(
            broker.get_proving_job_status(&parity.id).await,
            ProvingJobStatus::InQueue
        );
        assert_eq!(
            broker.get_proving_job_status(&base.id).await,
            ProvingJobStatus::InQueue
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ignores_duplicate_jobs() {
        let Harness { broker, .. } = started().await;
        let job = make_job(ProvingRequestType::BaseParity, 1);
        broker.enqueue_proving_job(job.clone()).await.unwrap();
        assert_eq!(
            broker.enqueue_proving_job(job.clone()).await.unwrap(),
            ProvingJobStatus::InQueue
        );
        assert_eq!(next_job(&broker, &[]).await, Some(job.clone()));
        assert_eq!(next_job(&broker, &[]).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_reused_ids_with_different_inputs() {
        let Harness { broker, .. } = started().await;
        let job = make_job(ProvingRequestType::BaseParity, 1);
        broker.enqueue_proving_job(job.clone()).await.unwrap();
        let mut other = job.clone();
        other.inputs_uri = ProofUri("data:something-else".to_string());
        let err = broker.enqueue_proving_job(other).await.unwrap_err();
        assert!(matches!(err, BrokerError::DuplicateJobId(_)));
        assert!(err.to_string().contains("Duplicate proving job ID"));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_jobs_are_not_found() {
        let Harness { broker, .. } = started().await;
        let id = ProvingJobId::new("1:BASE_PARITY:missing");
        assert_eq!(
            broker.get_proving_job_status(&id).await,
            ProvingJobStatus::NotFound
        );
        assert!(matches!(
            broker.wait_for_job_to_settle(&id).await,
            Err(BrokerError::JobNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancels_queued_and_running_jobs() {
        let Harness {
            broker, database, ..
        } = started().await;
        let queued = make_job(ProvingRequestType::BaseParity, 1);
        let running = make_job(ProvingRequestType::BaseParity, 1);
        broker.enqueue_proving_job(running.clone()).await.unwrap();
        broker.enqueue_proving_job(queued.clone()).await.unwrap();
        assert_eq!(next_id(&broker, &[]).await, running.id);

        broker.remove_and_cancel_proving_job(&queued.id).await.unwrap();
        broker.remove_and_cancel_proving_job(&running.id).await.unwrap();

        for id in [&queued.id, &running.id] {
            assert_eq!(
                broker.get_proving_job_status(id).await,
                ProvingJobStatus::NotFound
            );
            assert!(database.inner.get_job(id).is_none());
        }
        assert_eq!(next_job(&broker, &[]).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_of_a_cancelled_job_are_aborted() {
        let Harness { broker, .. } = started().await;
        let job = make_job(ProvingRequestType::RootParity, 1);
        broker.enqueue_proving_job(job.clone()).await.unwrap();

        let waiter = {
            let broker = broker.clone();
            let id = job.id.clone();
            tokio::spawn(async move { broker.wait_for_job_to_settle(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        broker.remove_and_cancel_proving_job(&job.id).await.unwrap();

        assert_eq!(
            waiter.await.unwrap().unwrap(),
            ProvingJobSettledResult::Rejected {
                reason: ABORTED.to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn settles_fulfilled_and_rejected_jobs() {
        let Harness { broker, meter, .. } = started().await;
        let ok = make_job(ProvingRequestType::BaseParity, 1);
        let bad = make_job(ProvingRequestType::BaseParity, 2);
        broker.enqueue_proving_job(ok.clone()).await.unwrap();
        broker.enqueue_proving_job(bad.clone()).await.unwrap();

        let waiter = {
            let broker = broker.clone();
            let id = ok.id.clone();
            tokio::spawn(async move { broker.wait_for_job_to_settle(&id).await })
        };

        assert_eq!(next_id(&broker, &[]).await, ok.id);
        tokio::time::sleep(Duration::from_secs(1)).await;
        broker
            .report_job_completion(&ok.id, ok.request_type, output())
            .await
            .unwrap();
        assert_eq!(broker.get_proving_job_status(&ok.id).await, fulfilled());
        assert_eq!(waiter.await.unwrap().unwrap(), output());

        assert_eq!(next_id(&broker, &[]).await, bad.id);
        let rejection = ProvingJobSettledResult::Rejected {
            reason: "test error".to_string(),
        };
        broker
            .report_job_completion(&bad.id, bad.request_type, rejection.clone())
            .await
            .unwrap();
        assert_eq!(
            broker.get_proving_job_status(&bad.id).await,
            ProvingJobStatus::from(rejection.clone())
        );
        assert_eq!(
            broker.wait_for_job_to_settle(&bad.id).await.unwrap(),
            rejection
        );

        let t = ProvingRequestType::BaseParity;
        assert_eq!(meter.counter(metrics::PROVING_QUEUE_RESOLVED_JOBS, t), 1);
        assert_eq!(meter.counter(metrics::PROVING_QUEUE_REJECTED_JOBS, t), 1);
        assert_eq!(
            meter.histogram(metrics::PROVING_QUEUE_JOB_DURATION, t)[0],
            1000
        );
    }

    #[tokio::test(start_paused = true)]
    async fn settled_jobs_stay_settled() {
        let Harness { broker, .. } = started().await;
        let job = make_job(ProvingRequestType::BaseParity, 1);
        broker.enqueue_proving_job(job.clone()).await.unwrap();
        broker
            .report_job_completion(&job.id, job.request_type, output())
            .await
            .unwrap();
        broker
            .report_job_completion(
                &job.id,
                job.request_type,
                ProvingJobSettledResult::Rejected {
                    reason: "late".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(broker.get_proving_job_status(&job.id).await, fulfilled());
        assert_eq!(
            broker.enqueue_proving_job(job.clone()).await.unwrap(),
            fulfilled()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn returns_nothing_when_queue_is_empty() {
        let Harness { broker, .. } = started().await;
        assert_eq!(next_job(&broker, &[ProvingRequestType::BaseParity]).await, None);
        broker
            .enqueue_proving_job(make_job(ProvingRequestType::BaseParity, 1))
            .await
            .unwrap();
        assert_eq!(next_job(&broker, &[ProvingRequestType::RootParity]).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn hands_out_jobs_in_priority_order() {
        let Harness { broker, .. } = started().await;
        let parity = make_job(ProvingRequestType::BaseParity, 1);
        let root_parity = make_job(ProvingRequestType::RootParity, 1);
        let base = make_job(ProvingRequestType::PrivateBaseRollup, 1);
        let block_root = make_job(ProvingRequestType::BlockRootRollup, 1);
        for job in [&parity, &root_parity, &base, &block_root] {
            broker.enqueue_proving_job(job.clone()).await.unwrap();
        }

        assert_eq!(next_id(&broker, &[]).await, block_root.id);
        assert_eq!(next_id(&broker, &[]).await, base.id);
        assert_eq!(next_id(&broker, &[]).await, root_parity.id);
        assert_eq!(next_id(&broker, &[]).await, parity.id);
    }

    #[tokio::test(start_paused = true)]
    async fn respects_the_allow_list() {
        let Harness { broker, .. } = started().await;
        let parity = make_job(ProvingRequestType::BaseParity, 1);
        let base = make_job(ProvingRequestType::PrivateBaseRollup, 1);
        let merge = make_job(ProvingRequestType::MergeRollup, 1);
        for job in [&parity, &base, &merge] {
            broker.enqueue_proving_job(job.clone()).await.unwrap();
        }

        let allow_list = [
            ProvingRequestType::BaseParity,
            ProvingRequestType::PrivateBaseRollup,
        ];
        assert_eq!(next_id(&broker, &allow_list).await, base.id);
        assert_eq!(next_id(&broker, &allow_list).await, parity.id);
        assert_eq!(next_job(&broker, &allow_list).await, None);
        assert_eq!(next_id(&broker, &[]).await, merge.id);
    }

    #[tokio::test(start_paused = true)]
    async fn oldest_epoch_first_then_arrival_order() {
        let Harness { broker, .. } = started().await;
        let late = make_job(ProvingRequestType::BaseParity, 3);
        let early_a = make_job(ProvingRequestType::BaseParity, 2);
        let early_b = make_job(ProvingRequestType::BaseParity, 2);
        for job in [&late, &early_a, &early_b] {
            broker.enqueue_proving_job(job.clone()).await.unwrap();
        }
        assert_eq!(next_id(&broker, &[]).await, early_a.id);
        assert_eq!(next_id(&broker, &[]).await, early_b.id);
        assert_eq!(next_id(&broker, &[]).await, late.id);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_for_cancelled_job_hands_over_next_job() {
        let Harness { broker, .. } = started().await;
        let job = make_job(ProvingRequestType::BaseParity, 1);
        broker.enqueue_proving_job(job.clone()).await.unwrap();
        let assignment = claim(&broker).await;
        assert_eq!(assignment.job, job);
        broker.remove_and_cancel_proving_job(&job.id).await.unwrap();

        let next = make_job(ProvingRequestType::BaseParity, 1);
        broker.enqueue_proving_job(next.clone()).await.unwrap();
        let response = broker
            .report_job_progress(&job.id, assignment.time, &[ProvingRequestType::BaseParity])
            .await
            .unwrap();
        let JobProgressResponse::Abort {
            next_job: Some(handed_over),
        } = response
        else {
            panic!("expected a new job, got {:?}", response);
        };
        assert_eq!(handed_over.job, next);
        assert!(handed_over.time > assignment.time);
        assert_eq!(
            broker.get_proving_job_status(&next.id).await,
            ProvingJobStatus::InProgress
        );
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_silent_agents() {
        let Harness { broker, meter, .. } = started().await;
        let job = make_job(ProvingRequestType::BaseParity, 1);
        broker.enqueue_proving_job(job.clone()).await.unwrap();
        assert_eq!(next_id(&broker, &[]).await, job.id);

        tokio::time::sleep(JOB_TIMEOUT + POLL_INTERVAL).await;

        assert_eq!(
            broker.get_proving_job_status(&job.id).await,
            ProvingJobStatus::InQueue
        );
        let t = ProvingRequestType::BaseParity;
        assert_eq!(meter.counter(metrics::PROVING_QUEUE_TIMED_OUT_JOBS, t), 1);
        assert_eq!(meter.counter(metrics::PROVING_QUEUE_RETRIED_JOBS, t), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_keep_jobs_alive() {
        let Harness { broker, .. } = started().await;
        let job = make_job(ProvingRequestType::BaseParity, 1);
        broker.enqueue_proving_job(job.clone()).await.unwrap();
        let assignment = claim(&broker).await;

        tokio::time::sleep(JOB_TIMEOUT / 2).await;
        assert_eq!(
            broker
                .report_job_progress(&job.id, assignment.time, &[])
                .await
                .unwrap(),
            JobProgressResponse::KeepWorking
        );
        tokio::time::sleep(JOB_TIMEOUT / 2).await;
        assert_eq!(
            broker.get_proving_job_status(&job.id).await,
            ProvingJobStatus::InProgress
        );

        tokio::time::sleep(JOB_TIMEOUT + POLL_INTERVAL).await;
        assert_eq!(
            broker.get_proving_job_status(&job.id).await,
            ProvingJobStatus::InQueue
        );
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let Harness {
            broker,
            database,
            meter,
            ..
        } = started().await;
        let job = make_job(ProvingRequestType::BaseParity, 1);
        broker.enqueue_proving_job(job.clone()).await.unwrap();

        for _ in 0..3 {
            assert_eq!(
                broker.get_proving_job_status(&job.id).await,
                ProvingJobStatus::InQueue
            );
            assert_eq!(next_id(&broker, &[]).await, job.id);
            tokio::time::sleep(JOB_TIMEOUT + POLL_INTERVAL).await;
        }

        let timed_out = ProvingJobStatus::Rejected {
            reason: TIMED_OUT.to_string(),
        };
        assert_eq!(broker.get_proving_job_status(&job.id).await, timed_out);
        let record = database.inner.get_job(&job.id).unwrap();
        assert_eq!(record.retries, 2);
        assert_eq!(record.status, timed_out);

        let t = ProvingRequestType::BaseParity;
        assert_eq!(meter.counter(metrics::PROVING_QUEUE_TIMED_OUT_JOBS, t), 3);
        assert_eq!(meter.counter(metrics::PROVING_QUEUE_RETRIED_JOBS, t), 2);
        assert_eq!(meter.counter(metrics::PROVING_QUEUE_REJECTED_JOBS, t), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tracks_results_of_queued_jobs() {
        let Harness { broker, .. } = started().await;
        let job = make_job(ProvingRequestType::BaseParity, 1);
        broker.enqueue_proving_job(job.clone()).await.unwrap();
        broker
            .report_job_completion(&job.id, job.request_type, output())
            .await
            .unwrap();
        assert_eq!(broker.get_proving_job_status(&job.id).await, fulfilled());
        assert_eq!(next_job(&broker, &[]).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn ignores_reports_for_unknown_jobs() {
        let Harness {
            broker, database, ..
        } = started().await;
        let id = ProvingJobId::new("1:BASE_PARITY:unknown");
        broker
            .report_job_completion(&id, ProvingRequestType::BaseParity, output())
            .await
            .unwrap();
        assert_eq!(
            broker.get_proving_job_status(&id).await,
            ProvingJobStatus::NotFound
        );
        assert!(database.inner.get_job(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn ignores_reports_with_wrong_type() {
        let Harness { broker, .. } = started().await;
        let job = make_job(ProvingRequestType::BaseParity, 1);
        broker.enqueue_proving_job(job.clone()).await.unwrap();
        broker
            .report_job_completion(&job.id, ProvingRequestType::RootParity, output())
            .await
            .unwrap();
        assert_eq!(
            broker.get_proving_job_status(&job.id).await,
            ProvingJobStatus::InQueue
        );
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_retain_job_if_ledger_fails() {
        let Harness {
            broker, database, ..
        } = started().await;
        let job = make_job(ProvingRequestType::BaseParity, 1);
        database.fail_writes.store(true, Ordering::SeqCst);
        assert!(matches!(
            broker.enqueue_proving_job(job.clone()).await,
            Err(BrokerError::Database(_))
        ));
        assert_eq!(
            broker.get_proving_job_status(&job.id).await,
            ProvingJobStatus::NotFound
        );
        assert_eq!(next_job(&broker, &[]).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_retain_result_if_ledger_fails() {
        let Harness {
            broker, database, ..
        } = started().await;
        let job = make_job(ProvingRequestType::BaseParity, 1);
        broker.enqueue_proving_job(job.clone()).await.unwrap();
        assert_eq!(next_id(&broker, &[]).await, job.id);

        database.fail_writes.store(true, Ordering::SeqCst);
        assert!(broker
            .report_job_completion(&job.id, job.request_type, output())
            .await
            .is_err());
        assert_eq!(
            broker.get_proving_job_status(&job.id).await,
            ProvingJobStatus::InProgress
        );
        assert_eq!(
            database.inner.get_job(&job.id).unwrap().status,
            ProvingJobStatus::InProgress
        );
    }

    #[tokio::test(start_paused = true)]
    async fn persists_every_transition() {
        let Harness {
            broker, database, ..
        } = started().await;
        let job = make_job(ProvingRequestType::BaseParity, 1);
        broker.enqueue_proving_job(job.clone()).await.unwrap();
        assert_eq!(
            database.inner.get_job(&job.id).unwrap().status,
            ProvingJobStatus::InQueue
        );
        next_id(&broker, &[]).await;
        assert_eq!(
            database.inner.get_job(&job.id).unwrap().status,
            ProvingJobStatus::InProgress
        );
        broker
            .report_job_completion(&job.id, job.request_type, output())
            .await
            .unwrap();
        assert_eq!(database.inner.get_job(&job.id).unwrap().status, fulfilled());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_requeues_unfinished_jobs_and_keeps_results() {
        let Harness {
            broker,
            database,
            clock,
            ..
        } = started().await;
        let done = make_job(ProvingRequestType::BaseParity, 1);
        let running = make_job(ProvingRequestType::BaseParity, 1);
        let queued = make_job(ProvingRequestType::BaseParity, 2);
        for job in [&done, &running, &queued] {
            broker.enqueue_proving_job(job.clone()).await.unwrap();
        }
        assert_eq!(next_id(&broker, &[]).await, done.id);
        broker
            .report_job_completion(&done.id, done.request_type, output())
            .await
            .unwrap();
        assert_eq!(next_id(&broker, &[]).await, running.id);
        broker.stop().await;

        tokio::time::sleep(Duration::from_secs(10)).await;

        let Harness { broker, .. } = broker_on(database, clock);
        broker.start().await.unwrap();
        assert_eq!(broker.get_proving_job_status(&done.id).await, fulfilled());
        assert_eq!(
            broker.get_proving_job_status(&running.id).await,
            ProvingJobStatus::InQueue
        );
        assert_eq!(
            broker.get_proving_job_status(&queued.id).await,
            ProvingJobStatus::InQueue
        );
        assert_eq!(
            broker.wait_for_job_to_settle(&done.id).await.unwrap(),
            output()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_after_restart_reclaims_the_job() {
        let Harness {
            broker,
            database,
            clock,
            ..
        } = started().await;
        let first = make_job(ProvingRequestType::BaseParity, 1);
        let second = make_job(ProvingRequestType::BaseParity, 2);
        broker.enqueue_proving_job(first.clone()).await.unwrap();
        broker.enqueue_proving_job(second.clone()).await.unwrap();
        let assignment = claim(&broker).await;
        assert_eq!(assignment.job, first);
        broker.stop().await;

        tokio::time::sleep(Duration::from_secs(10)).await;

        let Harness { broker, .. } = broker_on(database, clock);
        broker.start().await.unwrap();
        assert_eq!(
            broker.get_proving_job_status(&first.id).await,
            ProvingJobStatus::InQueue
        );

        assert_eq!(
            broker
                .report_job_progress(&first.id, assignment.time, &[])
                .await
                .unwrap(),
            JobProgressResponse::KeepWorking
        );
        assert_eq!(next_id(&broker, &[]).await, second.id);
        assert_eq!(
            broker.get_proving_job_status(&first.id).await,
            ProvingJobStatus::InProgress
        );
    }

    #[tokio::test(start_paused = true)]
    async fn earlier_claim_wins_when_two_agents_hold_a_job() {
        let Harness {
            broker,
            database,
            clock,
            ..
        } = started().await;
        let first = make_job(ProvingRequestType::BaseParity, 1);
        let second = make_job(ProvingRequestType::BaseParity, 2);
        broker.enqueue_proving_job(first.clone()).await.unwrap();
        broker.enqueue_proving_job(second.clone()).await.unwrap();

        let original = claim(&broker).await;
        assert_eq!(original.job, first);
        tokio::time::sleep(JOB_TIMEOUT / 2).await;
        assert_eq!(
            broker
                .report_job_progress(&first.id, original.time, &[])
                .await
                .unwrap(),
            JobProgressResponse::KeepWorking
        );
        broker.stop().await;

        tokio::time::sleep(Duration::from_secs(10)).await;

        let Harness { broker, .. } = broker_on(database, clock);
        broker.start().await.unwrap();
        assert_eq!(
            broker.get_proving_job_status(&first.id).await,
            ProvingJobStatus::InQueue
        );

        let newcomer = claim(&broker).await;
        assert_eq!(newcomer.job, first);
        assert!(newcomer.time > original.time);
        assert_eq!(
            broker.get_proving_job_status(&first.id).await,
            ProvingJobStatus::InProgress
        );

        // the original agent keeps its job
        assert_eq!(
            broker
                .report_job_progress(&first.id, original.time, &[ProvingRequestType::BaseParity])
                .await
                .unwrap(),
            JobProgressResponse::KeepWorking
        );

        // the newcomer is moved on to the next job
        let response = broker
            .report_job_progress(&first.id, newcomer.time, &[ProvingRequestType::BaseParity])
            .await
            .unwrap();
        let JobProgressResponse::Abort {
            next_job: Some(next),
        } = response
        else {
            panic!("expected a new job, got {:?}", response);
        };
        assert_eq!(next.job, second);
        assert_eq!(
            broker.get_proving_job_status(&first.id).await,
            ProvingJobStatus::InProgress
        );
        assert_eq!(
            broker.get_proving_job_status(&second.id).await,
            ProvingJobStatus::InProgress
        );

        // and the original agent is still the owner afterwards
        assert_eq!(
            broker
                .report_job_progress(&first.id, original.time, &[])
                .await
                .unwrap(),
            JobProgressResponse::KeepWorking
        );
    }

    #[tokio::test(start_paused = true)]
    async fn claim_times_are_strictly_increasing() {
        let meter = Arc::new(InMemoryMeter::new());
        let broker = ProvingBroker::with_clock(
            Arc::new(InMemoryDatabase::new()),
            config(),
            ProvingBrokerInstrumentation::new(meter),
            Arc::new(|| 42),
        );
        broker.start().await.unwrap();
        for _ in 0..3 {
            broker
                .enqueue_proving_job(make_job(ProvingRequestType::BaseParity, 1))
                .await
                .unwrap();
        }
        let times = [
            claim(&broker).await.time,
            claim(&broker).await.time,
            claim(&broker).await.time,
        ];
        assert_eq!(times, [42, 43, 44]);
    }

    #[tokio::test(start_paused = true)]
    async fn prunes_epochs_outside_the_window() {
        let Harness {
            broker, database, ..
        } = started().await;
        let old = make_job(ProvingRequestType::BaseParity, 1);
        let kept = make_job(ProvingRequestType::BaseParity, 2);
        broker.enqueue_proving_job(old.clone()).await.unwrap();
        broker
            .report_job_completion(&old.id, old.request_type, output())
            .await
            .unwrap();
        broker.enqueue_proving_job(kept.clone()).await.unwrap();

        tokio::time::sleep(POLL_INTERVAL * 2).await;
        assert_eq!(broker.get_proving_job_status(&old.id).await, fulfilled());

        let newest = make_job(ProvingRequestType::BaseParity, 3);
        broker.enqueue_proving_job(newest.clone()).await.unwrap();
        tokio::time::sleep(POLL_INTERVAL * 2).await;

        assert_eq!(
            broker.get_proving_job_status(&old.id).await,
            ProvingJobStatus::NotFound
        );
        assert!(database.inner.get_job(&old.id).is_none());
        assert_eq!(
            broker.get_proving_job_status(&kept.id).await,
            ProvingJobStatus::InQueue
        );
    }

    #[tokio::test(start_paused = true)]
    async fn completed_jobs_are_reported_once() {
        let Harness { broker, .. } = started().await;
        let a = make_job(ProvingRequestType::BaseParity, 1);
        let b = make_job(ProvingRequestType::BaseParity, 1);
        broker.enqueue_proving_job(a.clone()).await.unwrap();
        broker.enqueue_proving_job(b.clone()).await.unwrap();
        broker
            .report_job_completion(&a.id, a.request_type, output())
            .await
            .unwrap();

        assert_eq!(broker.get_completed_jobs(&[]).await, vec![a.id.clone()]);
        assert!(broker.get_completed_jobs(&[]).await.is_empty());
        assert_eq!(
            broker
                .get_completed_jobs(&[a.id.clone(), b.id.clone()])
                .await,
            vec![a.id.clone()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_releases_waiters() {
        let Harness { broker, .. } = started().await;
        let job = make_job(ProvingRequestType::BaseParity, 1);
        broker.enqueue_proving_job(job.clone()).await.unwrap();
        let waiter = {
            let broker = broker.clone();
            let id = job.id.clone();
            tokio::spawn(async move { broker.wait_for_job_to_settle(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        broker.stop().await;
        assert!(matches!(
            waiter.await.unwrap(),
            Err(BrokerError::BrokerStopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn ledger_failure_in_tick_is_fatal() {
        let harness = broker_on(FlakyDatabase::default(), paused_clock());
        let handle = harness.broker.start().await.unwrap();
        assert!(matches!(
            harness.broker.start().await,
            Err(BrokerError::AlreadyStarted)
        ));
        let job = make_job(ProvingRequestType::BaseParity, 1);
        harness.broker.enqueue_proving_job(job.clone()).await.unwrap();
        assert_eq!(next_id(&harness.broker, &[]).await, job.id);

        harness.database.fail_writes.store(true, Ordering::SeqCst);
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(BrokerError::Database(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn queue_gauges_follow_the_state() {
        let Harness { broker, meter, .. } = started().await;
        let t = ProvingRequestType::MergeRollup;
        broker.enqueue_proving_job(make_job(t, 1)).await.unwrap();
        broker.enqueue_proving_job(make_job(t, 1)).await.unwrap();
        assert_eq!(meter.gauge(metrics::PROVING_QUEUE_SIZE, t), 2);
        next_id(&broker, &[]).await;
        assert_eq!(meter.gauge(metrics::PROVING_QUEUE_SIZE, t), 1);
        assert_eq!(meter.gauge(metrics::PROVING_QUEUE_ACTIVE_JOBS, t), 1);
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    fn priority_rank(request_type: ProvingRequestType) -> usize {
        PROOF_TYPES_IN_PRIORITY_ORDER
            .iter()
            .position(|t| *t == request_type)
            .unwrap()
    }

    proptest! {
        #[test]
        fn drains_by_priority_then_epoch_then_arrival(
            specs in prop::collection::vec((0usize..12, 0u64..4), 1..24),
        ) {
            let (enqueued, drained) = block_on(async {
                let broker = ProvingBroker::new(
                    Arc::new(InMemoryDatabase::new()),
                    config(),
                    ProvingBrokerInstrumentation::new(Arc::new(InMemoryMeter::new())),
                );
                let mut enqueued = Vec::new();
                for (idx, epoch_number) in &specs {
                    let job = make_job(ProvingRequestType::ALL[*idx], *epoch_number);
                    broker.enqueue_proving_job(job.clone()).await.unwrap();
                    enqueued.push(job);
                }
                let mut drained = Vec::new();
                while let Some(job) = next_job(&broker, &[]).await {
                    drained.push(job);
                }
                (enqueued, drained)
            });

            let mut expected: Vec<(usize, ProvingJob)> = enqueued.into_iter().enumerate().collect();
            expected.sort_by_key(|(arrival, job)| {
                (priority_rank(job.request_type), job.epoch_number, *arrival)
            });
            let expected: Vec<ProvingJob> = expected.into_iter().map(|(_, job)| job).collect();
            prop_assert_eq!(drained, expected);
        }

        #[test]
        fn every_job_is_handed_out_once_across_restarts(
            specs in prop::collection::vec((0usize..12, 0u64..4), 1..16),
            taken_before_restart in 0usize..16,
        ) {
            let (enqueued, mut handed_out) = block_on(async {
                let database = FlakyDatabase::default();
                let Harness { broker, clock, .. } = broker_on(database.clone(), paused_clock());
                let mut enqueued = Vec::new();
                for (idx, epoch_number) in &specs {
                    let job = make_job(ProvingRequestType::ALL[*idx], *epoch_number);
                    broker.enqueue_proving_job(job.clone()).await.unwrap();
                    enqueued.push(job.id);
                }
                let mut handed_out = Vec::new();
                for _ in 0..taken_before_restart {
                    let Some(job) = next_job(&broker, &[]).await else {
                        break;
                    };
                    broker
                        .report_job_completion(&job.id, job.request_type, output())
                        .await
                        .unwrap();
                    handed_out.push(job.id);
                }

                let Harness { broker, .. } = broker_on(database, clock);
                broker.start().await.unwrap();
                while let Some(job) = next_job(&broker, &[]).await {
                    handed_out.push(job.id);
                }
                broker.stop().await;
                (enqueued, handed_out)
            });

            let mut enqueued = enqueued;
            enqueued.sort();
            handed_out.sort();
            prop_assert_eq!(handed_out, enqueued);
        }
    }
}
