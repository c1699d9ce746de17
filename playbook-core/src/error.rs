use crate::types::{ActionType, StepStatus};
use thiserror::Error;
use uuid::Uuid;

/// Engine error taxonomy.
///
/// Graph and constraint errors are fatal pre-run and abort `start_run`
/// before any StepRun is persisted. Action execution failures are *not*
/// errors here; they resolve into StepRun state per `skip_on_failure`.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("playbook graph invalid: {0}")]
    GraphInvalid(String),

    #[error("playbook graph contains a cycle: {}", cycle.join(" → "))]
    GraphCyclic { cycle: Vec<String> },

    #[error("unsupported action type '{0}': no handler registered")]
    UnsupportedAction(ActionType),

    #[error("scenario constraint violated: {0}")]
    ConstraintViolation(String),

    #[error("unknown playbook '{0}'")]
    PlaybookNotFound(String),

    #[error("unknown scenario '{0}'")]
    ScenarioNotFound(String),

    #[error("unknown run {0}")]
    RunNotFound(Uuid),

    #[error("unknown step run {0}")]
    StepRunNotFound(Uuid),

    #[error("step '{step_id}' cannot move {from:?} → {to:?}")]
    IllegalTransition {
        step_id: String,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("role '{role}' is not authorized to approve step '{step_id}'")]
    UnauthorizedRole { step_id: String, role: String },

    #[error("run {0} is already terminal")]
    RunTerminal(Uuid),

    #[error("run {0} is temporarily unavailable: version conflicts exhausted retries")]
    RunUnavailable(Uuid),

    #[error("playbook definition malformed: {0}")]
    Malformed(#[from] serde_yaml::Error),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
