/// Runtime builder for constructing orchestrator instances.
pub mod builder;
/// Admission slot acquisition and the lease heartbeat of the slot holder.
pub mod slot;
/// Runtime supervisor: submission intake, per-job workers and housekeeping.
pub mod supervisor;

pub use builder::OrchestratorRuntimeBuilder;
pub use slot::{acquire_slot, wait_for_head, SlotHold};
pub use supervisor::{
    OrchestratorRuntime, OrchestratorRuntimeConfig, ShutdownToken, SubmissionReceipt,
};
