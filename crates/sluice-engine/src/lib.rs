pub mod ledger;
pub mod orchestrator;
pub mod run_log;
pub mod schedule;
pub mod session;

pub use ledger::ExecutionLedger;
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use run_log::RunLogger;
pub use schedule::{topological_order, ReadyQueue};
pub use session::SessionManager;
