use anyhow::Result;
use broker::{app_config::AppBaseConfig, proof_store, proof_store::ProofStore, RemoteBroker};
use broker_api::types::ProvingRequestType;
use clap::Parser;
use prover_agent::{ProvingAgentConfig, SimulatedProver};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use url::Url;

#[derive(Parser, Debug, Clone, Serialize)]
#[command(author, version, about, long_about = None)]
pub struct AppConfig {
    #[clap(flatten)]
    pub base_config: AppBaseConfig,

    #[arg(long, env = "BROKER_PROTOCOL", default_value = "http")]
    pub broker_protocol: String,

    /// Broker host
    #[arg(long, env = "BROKER_HOST", default_value = "localhost")]
    pub broker_host: String,

    /// Broker port (optional, not needed behind a load balancer)
    #[arg(long, env = "BROKER_PORT")]
    pub broker_port: Option<String>,

    #[arg(long, env = "BROKER_TIMEOUT", default_value = "120")]
    pub broker_timeout: u64,

    /// Number of agents proving in parallel
    #[arg(long, env = "PROVER_AGENT_COUNT", default_value = "1")]
    pub agent_count: usize,

    /// Comma separated job types to accept, all types when empty
    #[arg(long, env = "PROVER_AGENT_PROOF_TYPES", value_delimiter = ',')]
    pub proof_types: Vec<ProvingRequestType>,

    #[arg(long, env = "PROVER_AGENT_POLL_INTERVAL_MS", default_value = "100")]
    pub poll_interval_ms: u64,

    /// Artificial delay added to every simulated proof
    #[arg(long, env = "PROVER_TEST_DELAY_MS", default_value = "0")]
    pub prover_delay_ms: u64,
}

impl AppConfig {
    pub fn broker_url(&self) -> Result<Url, url::ParseError> {
        let broker_url = match &self.broker_port {
            Some(port) => format!("{}://{}:{}", self.broker_protocol, self.broker_host, port),
            None => format!("{}://{}", self.broker_protocol, self.broker_host),
        };
        Url::parse(&broker_url)
    }

    pub fn agent_config(&self) -> ProvingAgentConfig {
        ProvingAgentConfig {
            allow_list: self.proof_types.clone(),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

pub struct AppEnv {
    pub broker: RemoteBroker,
    pub proof_store: Arc<dyn ProofStore>,
    pub prover: SimulatedProver,
}

impl AppEnv {
    pub async fn new(app_config: &AppConfig) -> Result<Self> {
        let broker = RemoteBroker::new(app_config.broker_url()?, app_config.broker_timeout)?;
        let proof_store = proof_store::create_proof_store(&app_config.base_config).await?;
        let prover =
            SimulatedProver::new().with_delay(Duration::from_millis(app_config.prover_delay_ms));
        Ok(Self {
            broker,
            proof_store,
            prover,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_agent_options() {
        let config = AppConfig::parse_from([
            "prover-server",
            "--data-store",
            "memory",
            "--broker-host",
            "broker.internal",
            "--broker-port",
            "3030",
            "--agent-count",
            "4",
            "--proof-types",
            "BASE_PARITY,ROOT_PARITY",
        ]);
        assert_eq!(
            config.broker_url().unwrap().as_str(),
            "http://broker.internal:3030/"
        );
        assert_eq!(config.agent_count, 4);
        assert_eq!(
            config.agent_config().allow_list,
            vec![ProvingRequestType::BaseParity, ProvingRequestType::RootParity]
        );
    }

    #[test]
    fn rejects_unknown_proof_type() {
        let result = AppConfig::try_parse_from(["prover-server", "--proof-types", "NOT_A_CIRCUIT"]);
        assert!(result.is_err());
    }

    #[test]
    fn broker_url_without_port() {
        let config = AppConfig::parse_from(["prover-server", "--broker-protocol", "https"]);
        assert_eq!(config.broker_url().unwrap().as_str(), "https://localhost/");
        assert!(config.agent_config().allow_list.is_empty());
    }
}
