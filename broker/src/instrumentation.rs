use broker_api::types::ProvingRequestType;
use itertools::Itertools;
use std::{
    collections::HashMap,
    fmt::{self, Display},
    sync::{Arc, Mutex},
    time::Duration,
};

pub mod metrics {
    pub const PROVING_QUEUE_SIZE: &str = "proving_queue.size";
    pub const PROVING_QUEUE_ACTIVE_JOBS: &str = "proving_queue.active_jobs";
    pub const PROVING_QUEUE_RESOLVED_JOBS: &str = "proving_queue.resolved_jobs";
    pub const PROVING_QUEUE_REJECTED_JOBS: &str = "proving_queue.rejected_jobs";
    pub const PROVING_QUEUE_RETRIED_JOBS: &str = "proving_queue.retried_jobs";
    pub const PROVING_QUEUE_TIMED_OUT_JOBS: &str = "proving_queue.timed_out_jobs";
    pub const PROVING_QUEUE_JOB_WAIT: &str = "proving_queue.job_wait_ms";
    pub const PROVING_QUEUE_JOB_DURATION: &str = "proving_queue.job_duration_ms";
}

/// Current value of a gauge, one sample per request type.
pub type GaugeCallback = Box<dyn Fn() -> Vec<(ProvingRequestType, u64)> + Send + Sync>;

/// Sink for broker metrics. Every data point is tagged with its request type.
pub trait Meter: Send + Sync {
    fn inc_counter(&self, name: &'static str, request_type: ProvingRequestType);

    fn record_histogram(&self, name: &'static str, request_type: ProvingRequestType, value: u64);

    fn register_gauge(&self, name: &'static str, callback: GaugeCallback);
}

#[derive(Default)]
struct MeterState {
    counter: HashMap<(&'static str, ProvingRequestType), u64>,
    histogram: HashMap<(&'static str, ProvingRequestType), Vec<u64>>,
}

/// Keeps every data point in memory and renders a summary with `Display`.
#[derive(Default)]
pub struct InMemoryMeter {
    state: Mutex<MeterState>,
    gauges: Mutex<Vec<(&'static str, GaugeCallback)>>,
}

impl InMemoryMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &'static str, request_type: ProvingRequestType) -> u64 {
        self.state
            .lock()
            .map(|s| s.counter.get(&(name, request_type)).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub fn histogram(&self, name: &'static str, request_type: ProvingRequestType) -> Vec<u64> {
        self.state
            .lock()
            .map(|s| {
                s.histogram
                    .get(&(name, request_type))
                    .cloned()
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    pub fn gauge(&self, name: &'static str, request_type: ProvingRequestType) -> u64 {
        let Ok(gauges) = self.gauges.lock() else {
            return 0;
        };
        gauges
            .iter()
            .filter(|(n, _)| *n == name)
            .flat_map(|(_, callback)| callback())
            .filter(|(t, _)| *t == request_type)
            .map(|(_, v)| v)
            .sum()
    }
}

impl Meter for InMemoryMeter {
    fn inc_counter(&self, name: &'static str, request_type: ProvingRequestType) {
        if let Ok(mut state) = self.state.lock() {
            *state.counter.entry((name, request_type)).or_default() += 1;
        }
    }

    fn record_histogram(&self, name: &'static str, request_type: ProvingRequestType, value: u64) {
        if let Ok(mut state) = self.state.lock() {
            state
                .histogram
                .entry((name, request_type))
                .or_default()
                .push(value);
        }
    }

    fn register_gauge(&self, name: &'static str, callback: GaugeCallback) {
        if let Ok(mut gauges) = self.gauges.lock() {
            gauges.push((name, callback));
        }
    }
}

impl Display for InMemoryMeter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Ok(gauges) = self.gauges.lock() {
            gauges.iter().try_for_each(|(name, callback)| {
                callback()
                    .into_iter()
                    .filter(|(_, value)| *value > 0)
                    .try_for_each(|(t, value)| writeln!(f, "{}{{{}}}: {}", name, t, value))
            })?;
        }

        let Ok(state) = self.state.lock() else {
            return Ok(());
        };

        state
            .counter
            .iter()
            .sorted()
            .try_for_each(|((name, t), value)| writeln!(f, "{}{{{}}}: {}", name, t, value))?;

        state
            .histogram
            .iter()
            .sorted_by_key(|(key, _)| *key)
            .try_for_each(|((name, t), hist)| {
                let mean = if !hist.is_empty() {
                    hist.iter().sum::<u64>() / hist.len() as u64
                } else {
                    0
                };

                let median = if !hist.is_empty() {
                    let sorted = hist.iter().sorted().collect::<Vec<_>>();
                    *sorted[sorted.len() / 2]
                } else {
                    0
                };

                let max = hist.iter().max().unwrap_or(&0);
                let min = hist.iter().min().unwrap_or(&0);

                writeln!(
                    f,
                    "{}{{{}}}: mean: {}, median: {}, max: {}, min: {}",
                    name, t, mean, median, max, min
                )
            })?;

        Ok(())
    }
}

/// The broker's view of its meter.
#[derive(Clone)]
pub struct ProvingBrokerInstrumentation {
    meter: Arc<dyn Meter>,
}

impl ProvingBrokerInstrumentation {
    pub fn new(meter: Arc<dyn Meter>) -> Self {
        Self { meter }
    }

    pub fn monitor_queue_depth<F>(&self, f: F)
    where
        F: Fn() -> Vec<(ProvingRequestType, u64)> + Send + Sync + 'static,
    {
        self.meter
            .register_gauge(metrics::PROVING_QUEUE_SIZE, Box::new(f));
    }

    pub fn monitor_active_jobs<F>(&self, f: F)
    where
        F: Fn() -> Vec<(ProvingRequestType, u64)> + Send + Sync + 'static,
    {
        self.meter
            .register_gauge(metrics::PROVING_QUEUE_ACTIVE_JOBS, Box::new(f));
    }

    pub fn inc_resolved_jobs(&self, request_type: ProvingRequestType) {
        self.meter
            .inc_counter(metrics::PROVING_QUEUE_RESOLVED_JOBS, request_type);
    }

    pub fn inc_rejected_jobs(&self, request_type: ProvingRequestType) {
        self.meter
            .inc_counter(metrics::PROVING_QUEUE_REJECTED_JOBS, request_type);
    }

    pub fn inc_retried_jobs(&self, request_type: ProvingRequestType) {
        self.meter
            .inc_counter(metrics::PROVING_QUEUE_RETRIED_JOBS, request_type);
    }

    pub fn inc_timed_out_jobs(&self, request_type: ProvingRequestType) {
        self.meter
            .inc_counter(metrics::PROVING_QUEUE_TIMED_OUT_JOBS, request_type);
    }

    /// Time a job spent in the queue before an agent picked it up.
    pub fn record_job_wait(&self, request_type: ProvingRequestType, wait: Duration) {
        self.meter.record_histogram(
            metrics::PROVING_QUEUE_JOB_WAIT,
            request_type,
            wait.as_millis() as u64,
        );
    }

    /// Time between an agent picking the job up and reporting its result.
    pub fn record_job_duration(&self, request_type: ProvingRequestType, duration: Duration) {
        self.meter.record_histogram(
            metrics::PROVING_QUEUE_JOB_DURATION,
            request_type,
            duration.as_millis() as u64,
        );
    }
}
