use crate::db::DBConfig;
use clap::{Args, Parser, ValueEnum};
use serde::Serialize;
use std::time::Duration;
use time::macros::format_description;
use tracing_subscriber::{
    fmt::{format::FmtSpan, time::UtcTime},
    EnvFilter,
};

/// Where job records and proof artifacts are kept.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DataStoreKind {
    /// Process memory, lost on restart
    Memory,
    Postgres,
}

#[derive(Parser, Debug, Clone, Serialize)]
#[command(author, version, about, long_about = None)]
pub struct AppBaseConfig {
    /// Database host
    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    pub db_host: String,

    /// Database port
    #[arg(long, env = "DB_PORT", default_value = "5432")]
    pub db_port: u16,

    /// Database user
    #[arg(long, env = "DB_USER", default_value = "postgres")]
    pub db_user: String,

    /// Database password
    #[arg(long, env = "DB_PASSWORD", default_value = "postgres")]
    pub db_password: String,

    /// Database name
    #[arg(long, env = "DB_NAME", default_value = "app")]
    pub db_name: String,

    #[arg(long, env = "DATA_STORE", value_enum, default_value = "postgres")]
    pub data_store: DataStoreKind,
}

impl AppBaseConfig {
    /// Get the database configuration
    pub fn db_config(&self) -> DBConfig {
        DBConfig {
            host: self.db_host.clone(),
            port: self.db_port,
            user: self.db_user.clone(),
            password: self.db_password.clone(),
            dbname: self.db_name.clone(),
        }
    }
}

/// Scheduling knobs of the broker.
#[derive(Args, Debug, Clone, Serialize)]
pub struct BrokerConfig {
    /// How long an agent may go without a heartbeat before its job is taken back
    #[arg(long, env = "PROVER_BROKER_JOB_TIMEOUT_MS", default_value = "30000")]
    pub job_timeout_ms: u64,

    #[arg(long, env = "PROVER_BROKER_POLL_INTERVAL_MS", default_value = "100")]
    pub poll_interval_ms: u64,

    #[arg(long, env = "PROVER_BROKER_JOB_MAX_RETRIES", default_value = "3")]
    pub job_max_retries: u32,

    /// Number of past epochs whose results are kept around
    #[arg(
        long,
        env = "PROVER_BROKER_MAX_EPOCHS_TO_KEEP_RESULTS_FOR",
        default_value = "1"
    )]
    pub max_epochs_to_keep_results_for: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            job_timeout_ms: 30_000,
            poll_interval_ms: 100,
            job_max_retries: 3,
            max_epochs_to_keep_results_for: 1,
        }
    }
}

impl BrokerConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

pub fn init_console_subscriber() {
    let timer = UtcTime::new(format_description!(
        "[year]-[month]-[day]T[hour repr:24]:[minute]:[second].[subsecond digits:3]Z"
    ));
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_span_events(FmtSpan::CLOSE)
        .with_timer(timer)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_level(true)
        .with_ansi(true)
        .with_writer(std::io::stdout)
        .init();
}
