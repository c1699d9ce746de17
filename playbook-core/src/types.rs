use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

// ─── Scalar aliases ───────────────────────────────────────────

/// Step identifier within a playbook (unique per playbook).
pub type StepId = String;

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Accumulated run outputs, keyed by step id (plus scenario parameters
/// seeded at run start). The only mutable shared state across a run's
/// concurrently-executing steps; writes are step-scoped so concurrent
/// steps never touch the same key.
pub type RunContext = BTreeMap<String, Value>;

pub fn now_ms() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before UNIX epoch")
        .as_millis() as i64
}

// ─── Action types ─────────────────────────────────────────────

/// The closed capability set. Unknown types fail closed at validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Outreach,
    CrisisResponse,
    Governance,
    ReportGeneration,
    MediaAlert,
    ReputationAction,
    CompetitiveAnalysis,
    StakeholderNotify,
    ContentPublish,
    Escalation,
    ApprovalGate,
    Wait,
    Conditional,
    Custom,
}

impl ActionType {
    /// Control-only kinds complete without an Action Gateway dispatch;
    /// their work *is* the gate/wait/branch they represent.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            ActionType::ApprovalGate | ActionType::Wait | ActionType::Conditional
        )
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_owned))
            .unwrap_or_else(|| format!("{self:?}"));
        write!(f, "{s}")
    }
}

// ─── Playbook (immutable template) ────────────────────────────

/// What happens when an approval or signal wait times out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Safe default: the step fails (run impact per `skip_on_failure`).
    #[default]
    Fail,
    /// Declared fallback: the step is skipped and downstream proceeds.
    Skip,
}

/// One unit of work in a playbook.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub action_type: ActionType,
    #[serde(default)]
    pub action_payload: Value,
    #[serde(default)]
    pub requires_approval: bool,
    #[serde(default)]
    pub approval_roles: Vec<String>,
    #[serde(default)]
    pub wait_for_signals: bool,
    /// Filter applied to inbound signal payloads while parked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_conditions: Option<crate::condition::ConditionExpr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_duration_minutes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u64>,
    #[serde(default)]
    pub on_timeout: TimeoutPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition_expression: Option<crate::condition::ConditionExpr>,
    #[serde(default)]
    pub skip_on_failure: bool,
    #[serde(default)]
    pub depends_on_steps: Vec<StepId>,
    /// Feeds the scenario budget-ceiling screen at run start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<f64>,
}

/// Immutable template: a DAG of steps. The engine only reads validated
/// snapshots; authoring/storage live in an external collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Playbook {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: u32,
    pub steps: Vec<Step>,
}

impl Playbook {
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// SHA-256 over the canonical JSON form, pinned on each run so a
    /// replayed run can detect a drifting template.
    pub fn content_hash(&self) -> [u8; 32] {
        let json = serde_json::to_string(self).expect("playbook serializes");
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        hasher.finalize().into()
    }
}

// ─── Scenario ─────────────────────────────────────────────────

/// Run-wide ceilings and screens, enforced at run start and by the
/// orchestrator's worker pool.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel_steps: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_ceiling: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_ceiling_minutes: Option<u64>,
    #[serde(default)]
    pub required_approval_roles: Vec<String>,
    #[serde(default)]
    pub excluded_action_types: Vec<ActionType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_tolerance: Option<String>,
}

pub const DEFAULT_MAX_PARALLEL_STEPS: usize = 4;

impl Constraints {
    pub fn parallelism(&self) -> usize {
        self.max_parallel_steps
            .unwrap_or(DEFAULT_MAX_PARALLEL_STEPS)
            .max(1)
    }
}

/// A parameterized situation bound to a playbook at run time.
/// Immutable per run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub constraints: Constraints,
}

// ─── ScenarioRun ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Initializing,
    Running,
    Paused,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// One live execution of a scenario+playbook pair. Mutated only by the
/// orchestrator; every write goes through a compare-and-swap on `version`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScenarioRun {
    pub id: Uuid,
    pub scenario_id: String,
    pub playbook_id: String,
    /// SHA-256 of the playbook snapshot this run executes against.
    pub playbook_hash: [u8; 32],
    pub status: RunStatus,
    pub started_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub context: RunContext,
    /// Optimistic-concurrency counter, the only field that needs CAS.
    pub version: u64,
    /// Absolute deadline derived from `Constraints::time_ceiling_minutes`.
    pub deadline_ms: Option<Timestamp>,
}

// ─── StepRun ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    /// Durable suspension: parked on a human decision.
    AwaitingApproval,
    Approved,
    /// Durable suspension: parked on an external signal.
    AwaitingSignal,
    Executing,
    Executed,
    Skipped,
    Failed,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Executed | StepStatus::Skipped | StepStatus::Failed | StepStatus::Cancelled
        )
    }

    /// Terminal in the success sense: satisfies downstream readiness.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, StepStatus::Executed | StepStatus::Skipped)
    }

    /// The legal transition relation. Everything else is rejected.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        use StepStatus::*;
        match (*self, next) {
            (Pending, Ready) => true,
            (Ready, AwaitingApproval | AwaitingSignal | Executing | Skipped) => true,
            (AwaitingApproval, Approved | Failed | Skipped) => true,
            (Approved, AwaitingSignal | Executing | Executed) => true,
            (AwaitingSignal, Executing | Failed | Skipped) => true,
            (Executing, Executed | Failed) => true,
            // skip_on_failure conversion happens at the same commit as the
            // failure itself, so Failed never needs an outgoing edge.
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Per-step execution record within a run. Owned exclusively by the
/// orchestrator; collaborators report outcomes through it, never mutate it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRun {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: StepId,
    pub status: StepStatus,
    pub dispatched_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Stable across redelivery: `"{run_id}:{step_id}"`.
    pub idempotency_key: String,
    /// Absolute deadline while parked awaiting approval/signal.
    /// `None` while parked means "wait indefinitely" (flagged in audit).
    pub wait_deadline_ms: Option<Timestamp>,
}

impl StepRun {
    pub fn new(run_id: Uuid, step_id: &str) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            step_id: step_id.to_string(),
            status: StepStatus::Pending,
            dispatched_at: None,
            completed_at: None,
            result: None,
            error: None,
            idempotency_key: format!("{run_id}:{step_id}"),
            wait_deadline_ms: None,
        }
    }
}

// ─── Approval & signal inputs ─────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
}

/// A human decision, created by the external approval collaborator and
/// consumed exactly once to resume one waiting step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub decided_by: String,
    /// Role the decider acted under; must be listed in the step's
    /// `approval_roles` when that list is non-empty.
    pub role: String,
    pub decision: Decision,
    #[serde(default)]
    pub notes: Option<String>,
    pub decided_at: Timestamp,
}

/// An externally-sourced event; one event may resume many waiters.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignalEvent {
    pub signal_type: String,
    #[serde(default)]
    pub payload: Value,
    pub occurred_at: Timestamp,
}

impl SignalEvent {
    /// The view signal conditions are evaluated against: the payload's
    /// fields plus the event type under `"signal_type"`.
    pub fn match_context(&self) -> RunContext {
        let mut ctx = RunContext::new();
        if let Value::Object(map) = &self.payload {
            for (k, v) in map {
                ctx.insert(k.clone(), v.clone());
            }
        }
        ctx.insert(
            "signal_type".to_string(),
            Value::String(self.signal_type.clone()),
        );
        ctx
    }
}

// ─── Snapshot view ────────────────────────────────────────────

/// Consistent point-in-time view returned by `get_run_status`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: ScenarioRun,
    pub step_runs: Vec<StepRun>,
}
