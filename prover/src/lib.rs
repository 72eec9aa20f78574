pub mod agent;
pub mod controller;
pub mod prover;

pub use agent::{spawn_agents, ProvingAgent, ProvingAgentConfig};
pub use controller::{ProvingJobController, ProvingJobControllerStatus};
pub use prover::{ServerCircuitProver, SimulatedProver};
