//! Append-only audit trail: the sole source of truth for "what happened
//! and when", consumed by operators and compliance alike. Entries are
//! never mutated or deleted.

use crate::types::{ActionType, Decision, StepId, Timestamp, TimeoutPolicy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    User,
    System,
}

/// The closed event vocabulary. Every state transition, decision and
/// external dispatch lands here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    RunStarted {
        scenario_id: String,
        playbook_id: String,
        step_count: usize,
    },
    StepReady,
    ConditionEvaluated {
        outcome: bool,
    },
    StepSkipped {
        reason: String,
    },
    ApprovalRequested {
        roles: Vec<String>,
        deadline_ms: Option<Timestamp>,
    },
    ApprovalDecided {
        decided_by: String,
        role: String,
        decision: Decision,
    },
    ApprovalTimedOut {
        policy: TimeoutPolicy,
    },
    SignalSubscribed {
        deadline_ms: Option<Timestamp>,
    },
    SignalMatched {
        signal_type: String,
    },
    SignalTimedOut {
        policy: TimeoutPolicy,
    },
    /// A suspension was parked with no deadline at all; intentional
    /// long-waits and misconfiguration look identical without this.
    IndefiniteWaitFlagged,
    StepDispatched {
        action_type: ActionType,
        idempotency_key: String,
    },
    /// Redelivered dispatch answered from the dedupe cache, so no second
    /// side effect occurred.
    DispatchDeduplicated {
        idempotency_key: String,
    },
    StepCompleted,
    StepFailed {
        error: String,
    },
    StepCancelled,
    /// Cancellation arrived while the step was executing; the external
    /// side effect may already have happened. The outcome is uncertain,
    /// not clean.
    CancellationDuringExecution,
    /// A dispatch finished after its run went terminal; the result was
    /// discarded.
    LateResultIgnored {
        step_id: StepId,
    },
    RunCompleted,
    RunFailed {
        reason: String,
    },
    RunCancelled {
        reason: String,
    },
    RunPaused,
    RunResumed,
}

impl AuditEvent {
    /// Stable label for filtering.
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::RunStarted { .. } => "run_started",
            AuditEvent::StepReady => "step_ready",
            AuditEvent::ConditionEvaluated { .. } => "condition_evaluated",
            AuditEvent::StepSkipped { .. } => "step_skipped",
            AuditEvent::ApprovalRequested { .. } => "approval_requested",
            AuditEvent::ApprovalDecided { .. } => "approval_decided",
            AuditEvent::ApprovalTimedOut { .. } => "approval_timed_out",
            AuditEvent::SignalSubscribed { .. } => "signal_subscribed",
            AuditEvent::SignalMatched { .. } => "signal_matched",
            AuditEvent::SignalTimedOut { .. } => "signal_timed_out",
            AuditEvent::IndefiniteWaitFlagged => "indefinite_wait_flagged",
            AuditEvent::StepDispatched { .. } => "step_dispatched",
            AuditEvent::DispatchDeduplicated { .. } => "dispatch_deduplicated",
            AuditEvent::StepCompleted => "step_completed",
            AuditEvent::StepFailed { .. } => "step_failed",
            AuditEvent::StepCancelled => "step_cancelled",
            AuditEvent::CancellationDuringExecution => "cancellation_during_execution",
            AuditEvent::LateResultIgnored { .. } => "late_result_ignored",
            AuditEvent::RunCompleted => "run_completed",
            AuditEvent::RunFailed { .. } => "run_failed",
            AuditEvent::RunCancelled { .. } => "run_cancelled",
            AuditEvent::RunPaused => "run_paused",
            AuditEvent::RunResumed => "run_resumed",
        }
    }
}

/// One appended record, keyed by run and (optionally) step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_run_id: Option<Uuid>,
    pub actor: ActorType,
    pub event: AuditEvent,
    /// Human-readable explanation alongside the structured event.
    pub details: String,
    pub created_at: Timestamp,
}

impl AuditEntry {
    pub fn system(run_id: Uuid, step_run_id: Option<Uuid>, event: AuditEvent, details: impl Into<String>) -> Self {
        Self::new(run_id, step_run_id, ActorType::System, event, details)
    }

    pub fn user(run_id: Uuid, step_run_id: Option<Uuid>, event: AuditEvent, details: impl Into<String>) -> Self {
        Self::new(run_id, step_run_id, ActorType::User, event, details)
    }

    fn new(
        run_id: Uuid,
        step_run_id: Option<Uuid>,
        actor: ActorType,
        event: AuditEvent,
        details: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            run_id,
            step_run_id,
            actor,
            event,
            details: details.into(),
            created_at: crate::types::now_ms(),
        }
    }
}

/// Filters for `list_audit`. Empty filter returns everything for the run.
#[derive(Clone, Debug, Default)]
pub struct AuditFilter {
    pub step_run_id: Option<Uuid>,
    pub kind: Option<&'static str>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        if let Some(id) = self.step_run_id {
            if entry.step_run_id != Some(id) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if entry.event.kind() != kind {
                return false;
            }
        }
        true
    }
}
