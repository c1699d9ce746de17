//! The Action Gateway: a capability-indexed dispatch contract.
//!
//! The engine does not implement action handlers; it defines the contract,
//! resolves the strategy table at startup, and invokes it with a stable
//! idempotency key so redelivered dispatches can be deduplicated on either
//! side of the boundary.

use crate::error::{EngineError, EngineResult};
use crate::types::{ActionType, RunContext};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a handler gets. `context` is a read-only snapshot of the
/// run's accumulated outputs at dispatch time.
#[derive(Clone, Debug)]
pub struct ActionRequest {
    pub action_type: ActionType,
    pub payload: Value,
    /// `"{run_id}:{step_id}"`, stable across redelivery. Handlers must
    /// be idempotent under repeated calls with the same key.
    pub idempotency_key: String,
    pub context: RunContext,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionErrorKind {
    /// Worth retrying from outside; the step still fails this attempt.
    Transient,
    /// The payload or context broke the handler's contract.
    ContractViolation,
    /// The action was understood and refused.
    Rejected { code: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionError {
    pub kind: ActionErrorKind,
    pub message: String,
}

impl ActionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ActionErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ActionErrorKind::Rejected { code: code.into() },
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ActionErrorKind::Transient => write!(f, "transient: {}", self.message),
            ActionErrorKind::ContractViolation => {
                write!(f, "contract violation: {}", self.message)
            }
            ActionErrorKind::Rejected { code } => {
                write!(f, "rejected ({code}): {}", self.message)
            }
        }
    }
}

/// One handler per step `action_type`. Implementations live with the
/// surrounding product (outreach delivery, governance checks, ...).
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, request: ActionRequest) -> Result<Value, ActionError>;
}

/// The strategy table: `action_type → handler`, resolved at startup.
/// Unknown types fail closed.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<ActionType, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action_type: ActionType, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(action_type, handler);
    }

    pub fn handler(&self, action_type: ActionType) -> EngineResult<Arc<dyn ActionHandler>> {
        self.handlers
            .get(&action_type)
            .cloned()
            .ok_or(EngineError::UnsupportedAction(action_type))
    }

    /// Startup-time check: control kinds never dispatch, everything else
    /// needs a handler before a run may start.
    pub fn supports(&self, action_type: ActionType) -> bool {
        action_type.is_control() || self.handlers.contains_key(&action_type)
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("action_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
