//! Scenario playbook orchestration engine.
//!
//! Executes playbooks (DAGs of typed communication actions) against
//! parameterized scenarios: dependency-ordered scheduling with bounded
//! parallelism, durable suspension on human approvals and external
//! signals, per-step timeouts, cooperative cancellation, and an
//! append-only audit trail for every transition.
//!
//! The crate is the engine only. Action handlers, approval UIs, signal
//! sources and notification delivery are collaborators behind the
//! [`gateway::ActionHandler`] and [`store::RunStore`] contracts.
//!
//! ```no_run
//! use playbook_core::{ActionRegistry, MemoryCatalog, MemoryStore, Orchestrator};
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! # async fn demo() -> playbook_core::EngineResult<()> {
//! let store = Arc::new(MemoryStore::new());
//! let catalog = Arc::new(MemoryCatalog::new());
//! let registry = Arc::new(ActionRegistry::new());
//!
//! let engine = Orchestrator::new(store, catalog, registry);
//! let run_id = engine.start_run("product-recall", "crisis-response-v2", BTreeMap::new()).await?;
//! let snapshot = engine.get_run_status(run_id).await?;
//! # Ok(())
//! # }
//! ```

pub mod audit;
pub mod condition;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod graph;
pub mod store;
pub mod store_memory;
pub mod types;
pub mod yaml;

pub use audit::{ActorType, AuditEntry, AuditEvent, AuditFilter};
pub use condition::{ConditionExpr, ConditionOp, Logic, TimeUnit, TimeWindow};
pub use engine::Orchestrator;
pub use error::{EngineError, EngineResult};
pub use gateway::{ActionError, ActionErrorKind, ActionHandler, ActionRegistry, ActionRequest};
pub use graph::StepGraph;
pub use store::{PlaybookSource, RunStore};
pub use store_memory::{MemoryCatalog, MemoryStore};
pub use types::{
    ActionType, ApprovalDecision, Constraints, Decision, Playbook, RunContext, RunSnapshot,
    RunStatus, Scenario, ScenarioRun, SignalEvent, Step, StepRun, StepStatus, TimeoutPolicy,
};
pub use yaml::{load_playbook, parse_playbook, parse_scenario};
