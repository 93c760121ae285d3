//! The synchronization pipeline: per-tenant orchestration and the job
//! scheduler that drives it.

pub mod orchestrator;
pub mod scheduler;

pub use orchestrator::{Orchestrator, SyncOutcome};
pub use scheduler::SyncScheduler;
