use broker::{
    app_config::init_console_subscriber, instrumentation::InMemoryMeter, rpc::start_rpc_server,
};
use clap::Parser;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::{debug, error, info};

mod app_env {
    use anyhow::Result;
    use broker::{
        app_config::{AppBaseConfig, BrokerConfig, DataStoreKind},
        broker::ProvingBroker,
        db::{InMemoryDatabase, PostgresDatabase, ProvingJobDatabase, DB},
        instrumentation::{InMemoryMeter, ProvingBrokerInstrumentation},
    };
    use clap::Parser;
    use serde::Serialize;
    use std::sync::Arc;

    #[derive(Parser, Serialize)]
    pub struct AppConfig {
        #[clap(flatten)]
        pub base_config: AppBaseConfig,

        #[clap(flatten)]
        pub broker_config: BrokerConfig,

        #[arg(long, env = "JSON_RPC_PORT", default_value = "3030")]
        pub json_rpc_port: u16,

        /// Seconds between metric summaries in the log, 0 disables them
        #[arg(long, env = "METRICS_LOG_INTERVAL", default_value = "60")]
        pub metrics_log_interval: u64,
    }

    pub struct AppEnv {
        pub broker: ProvingBroker,
        pub meter: Arc<InMemoryMeter>,
    }

    impl AppEnv {
        pub async fn new(app_config: &AppConfig) -> Result<Self> {
            let database: Arc<dyn ProvingJobDatabase> = match app_config.base_config.data_store {
                DataStoreKind::Memory => Arc::new(InMemoryDatabase::new()),
                DataStoreKind::Postgres => {
                    let db = DB::new(app_config.base_config.db_config()).await?;
                    Arc::new(PostgresDatabase::new(db.pool))
                }
            };
            let meter = Arc::new(InMemoryMeter::new());
            let broker = ProvingBroker::new(
                database,
                app_config.broker_config.clone(),
                ProvingBrokerInstrumentation::new(meter.clone()),
            );
            Ok(Self { broker, meter })
        }
    }
}

use app_env::{AppConfig, AppEnv};

fn log_metrics(meter: Arc<InMemoryMeter>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let summary = meter.to_string();
            if !summary.is_empty() {
                info!("Proving broker metrics:\n{}", summary);
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_console_subscriber();
    let cli = AppConfig::parse();
    debug!("{}", serde_json::to_string_pretty(&cli)?);

    // Define the server address
    let addr = {
        let host = "0.0.0.0";
        let addr = format!("{}:{}", host, cli.json_rpc_port);
        addr.parse::<SocketAddr>()
    }?;

    let app_env = AppEnv::new(&cli).await?;
    let tick = app_env.broker.start().await?;
    if cli.metrics_log_interval > 0 {
        log_metrics(
            app_env.meter.clone(),
            Duration::from_secs(cli.metrics_log_interval),
        );
    }

    let (_, handle) = start_rpc_server(app_env.broker.clone(), addr).await?;

    let result = tokio::select! {
        signal = tokio::signal::ctrl_c() => signal.map_err(anyhow::Error::from),
        tick = tick => {
            let err = match tick {
                Ok(Ok(())) => anyhow::anyhow!("proving broker tick ended"),
                Ok(Err(err)) => err.into(),
                Err(err) => err.into(),
            };
            error!("Proving broker failed: {:#}", err);
            Err(err)
        }
    };

    app_env.broker.stop().await;
    handle.stop()?;
    info!("JSON-RPC server stopped");

    result
}
