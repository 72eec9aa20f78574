pub mod circuits;
pub mod rpc;
pub mod traits;
pub mod types;

pub use traits::{ProvingJobConsumer, ProvingJobProducer};
