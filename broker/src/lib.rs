pub mod app_config;
pub mod broker;
pub mod db;
pub mod deferred;
pub mod facade;
pub mod instrumentation;
pub mod proof_store;
pub mod remote;
pub mod rpc;

pub use broker::{BrokerError, ProvingBroker};
pub use facade::{BrokerCircuitProverFacade, FacadeError};
pub use remote::RemoteBroker;
