pub mod orchestrator;
pub mod types;

pub use orchestrator::{setup_orchestrator, Orchestrator, OrchestratorError};
pub use types::{ProvisionStage, ProvisioningReport, SlotOutcome};
