//! Services: the orchestration core proper.

pub mod adapter;
pub mod aggregator;
pub mod context;
pub mod factory;
pub mod limits;
pub mod normalizer;
pub mod orchestrators;
pub mod response;
pub mod transaction;

pub use adapter::ActivityAdapter;
pub use context::{ContextBuilder, NormalizationContext};
pub use factory::OrchestratorFactory;
pub use limits::ConfigLimits;
pub use normalizer::ConfigNormalizer;
pub use orchestrators::{
    CancellationFlag, CreateStateInput, CreatedChild, HandleResponseInput, OrchestratorContext,
    TaskOrchestrator, TaskResponseEnvelope,
};
pub use transaction::TransactionService;
