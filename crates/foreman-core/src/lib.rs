pub mod bus;
pub mod checkpoint;
pub mod context;
pub mod dispatch;
pub mod ledger;
pub mod memory;
pub mod orchestrator;
pub mod provider;
pub mod router;
pub mod task;

// Re-export key types
pub use bus::{EventKind, TaskEvent};
pub use checkpoint::{MarkerClassifier, UncertaintyClassifier};
pub use dispatch::{RegistryDispatcher, Tool, ToolDispatcher};
pub use ledger::{Ledger, LedgerStore};
pub use memory::MemoryStore;
pub use orchestrator::{Orchestrator, StatusSummary};
pub use provider::{ModelProvider, RigProvider};
pub use router::Router;
pub use task::{Task, TaskStatus, Tier};
