use super::{JobRecord, ProvingJobDatabase};
use anyhow::Result;
use async_trait::async_trait;
use broker_api::types::{ProvingJob, ProvingJobId, ProvingJobStatus};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

#[derive(Default)]
struct Ledger {
    // record plus its arrival number
    records: HashMap<ProvingJobId, (u64, JobRecord)>,
    next_seq: u64,
}

/// Ledger kept in process memory. Used by tests and single-process setups.
///
/// Jobs come back from `get_all_jobs` by epoch and then in arrival order, the
/// same order the Postgres ledger restores them in.
#[derive(Clone, Default)]
pub struct InMemoryDatabase {
    ledger: Arc<Mutex<Ledger>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Ledger>> {
        self.ledger
            .lock()
            .map_err(|_| anyhow::anyhow!("in-memory ledger lock poisoned"))
    }

    pub fn get_job(&self, id: &ProvingJobId) -> Option<JobRecord> {
        self.lock().ok()?.records.get(id).map(|(_, record)| record.clone())
    }
}

#[async_trait]
impl ProvingJobDatabase for InMemoryDatabase {
    async fn create_job(&self, job: &ProvingJob) -> Result<()> {
        let mut ledger = self.lock()?;
        if ledger.records.contains_key(&job.id) {
            return Ok(());
        }
        let seq = ledger.next_seq;
        ledger.next_seq += 1;
        ledger.records.insert(
            job.id.clone(),
            (
                seq,
                JobRecord {
                    job: job.clone(),
                    status: ProvingJobStatus::InQueue,
                    retries: 0,
                },
            ),
        );
        Ok(())
    }

    async fn get_job_status(&self, id: &ProvingJobId) -> Result<ProvingJobStatus> {
        Ok(self
            .lock()?
            .records
            .get(id)
            .map(|(_, record)| record.status.clone())
            .unwrap_or(ProvingJobStatus::NotFound))
    }

    async fn update_job_status(&self, id: &ProvingJobId, status: &ProvingJobStatus) -> Result<()> {
        if let Some((_, record)) = self.lock()?.records.get_mut(id) {
            record.status = status.clone();
        }
        Ok(())
    }

    async fn increment_retry_count(&self, id: &ProvingJobId) -> Result<u32> {
        let mut ledger = self.lock()?;
        let (_, record) = ledger
            .records
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("job {} not found", id))?;
        record.retries += 1;
        Ok(record.retries)
    }

    async fn delete_jobs_older_than(&self, epoch_number: u64) -> Result<Vec<ProvingJobId>> {
        let mut ledger = self.lock()?;
        let stale: Vec<ProvingJobId> = ledger
            .records
            .values()
            .filter(|(_, record)| record.job.epoch_number < epoch_number)
            .map(|(_, record)| record.job.id.clone())
            .collect();
        for id in &stale {
            ledger.records.remove(id);
        }
        Ok(stale)
    }

    async fn delete_job(&self, id: &ProvingJobId) -> Result<()> {
        self.lock()?.records.remove(id);
        Ok(())
    }

    async fn get_all_jobs(&self) -> Result<Vec<JobRecord>> {
        let ledger = self.lock()?;
        let mut records: Vec<&(u64, JobRecord)> = ledger.records.values().collect();
        records.sort_by_key(|(seq, record)| (record.job.epoch_number, *seq));
        Ok(records
            .into_iter()
            .map(|(_, record)| record.clone())
            .collect())
    }
}
