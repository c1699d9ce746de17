//! The Run Orchestrator.
//!
//! One logical coordinator per run: computes the ready frontier from the
//! validated step graph, dispatches ready steps concurrently up to the
//! scenario's parallelism ceiling, applies results, and persists every
//! transition through the audit log. Suspension (`awaiting_approval`,
//! `awaiting_signal`) is a durable status, not an in-memory task: after
//! a restart, resumption is driven entirely by new input (an approval
//! decision, a signal event, or the timeout pump).
//!
//! Run-level transitions serialize through a compare-and-swap on the
//! run's `version`; the loser reloads and retries, which is what makes
//! horizontal orchestrator replicas safe without a distributed lock.

use crate::audit::{AuditEntry, AuditEvent, AuditFilter};
use crate::error::{EngineError, EngineResult};
use crate::gateway::{ActionError, ActionRegistry, ActionRequest};
use crate::graph::StepGraph;
use crate::store::{PlaybookSource, RunStore};
use crate::types::*;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// CAS attempts before a transient `RunUnavailable` surfaces.
const CAS_RETRY_LIMIT: u32 = 8;

pub struct Orchestrator {
    store: Arc<dyn RunStore>,
    catalog: Arc<dyn PlaybookSource>,
    registry: Arc<ActionRegistry>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn RunStore>,
        catalog: Arc<dyn PlaybookSource>,
        registry: Arc<ActionRegistry>,
    ) -> Self {
        Self {
            store,
            catalog,
            registry,
        }
    }

    // ── Exposed operations ────────────────────────────────────

    /// Bind a scenario to a playbook and start a run.
    ///
    /// Graph validation, handler resolution and constraint screening all
    /// happen here; a failure aborts before any StepRun is persisted, so
    /// no partial runs ever exist.
    pub async fn start_run(
        &self,
        scenario_id: &str,
        playbook_id: &str,
        override_parameters: RunContext,
    ) -> EngineResult<Uuid> {
        let playbook = self
            .catalog
            .get_playbook(playbook_id)
            .await?
            .ok_or_else(|| EngineError::PlaybookNotFound(playbook_id.to_string()))?;
        let scenario = self
            .catalog
            .get_scenario(scenario_id)
            .await?
            .ok_or_else(|| EngineError::ScenarioNotFound(scenario_id.to_string()))?;

        StepGraph::build(&playbook)?;
        for step in &playbook.steps {
            if !self.registry.supports(step.action_type) {
                return Err(EngineError::UnsupportedAction(step.action_type));
            }
        }
        screen_constraints(&playbook, &scenario.constraints)?;

        let now = now_ms();
        let mut context = scenario.parameters.clone();
        context.extend(override_parameters);

        let run = ScenarioRun {
            id: Uuid::now_v7(),
            scenario_id: scenario.id.clone(),
            playbook_id: playbook.id.clone(),
            playbook_hash: playbook.content_hash(),
            status: RunStatus::Initializing,
            started_at: now,
            completed_at: None,
            context,
            version: 1,
            deadline_ms: scenario
                .constraints
                .time_ceiling_minutes
                .map(|m| now + minutes_ms(m)),
        };
        self.store.save_run(&run).await?;
        for step in &playbook.steps {
            self.store
                .save_step_run(&StepRun::new(run.id, &step.id))
                .await?;
        }
        self.record(AuditEntry::system(
            run.id,
            None,
            AuditEvent::RunStarted {
                scenario_id: scenario.id.clone(),
                playbook_id: playbook.id.clone(),
                step_count: playbook.steps.len(),
            },
            format!(
                "run started: scenario '{}' bound to playbook '{}'",
                scenario.id, playbook.id
            ),
        ))
        .await?;

        info!(run_id = %run.id, playbook = %playbook.id, "run started");
        self.commit_run(run.id, |r| r.status = RunStatus::Running)
            .await?;
        self.drive(run.id).await?;
        Ok(run.id)
    }

    /// Consistent point-in-time view of a run and its steps.
    pub async fn get_run_status(&self, run_id: Uuid) -> EngineResult<RunSnapshot> {
        let run = self.load_run(run_id).await?;
        let step_runs = self.store.load_step_runs(run_id).await?;
        Ok(RunSnapshot { run, step_runs })
    }

    pub async fn list_audit(
        &self,
        run_id: Uuid,
        filter: &AuditFilter,
    ) -> EngineResult<Vec<AuditEntry>> {
        Ok(self.store.read_audit(run_id, filter).await?)
    }

    /// Consume a human decision for a step parked in `awaiting_approval`.
    ///
    /// Decisions arriving for steps that are not parked (e.g. approving a
    /// step before its dependencies completed) are rejected, never
    /// executed out of order.
    pub async fn submit_approval(
        &self,
        step_run_id: Uuid,
        decision: ApprovalDecision,
    ) -> EngineResult<()> {
        let mut step_run = self
            .store
            .load_step_run(step_run_id)
            .await?
            .ok_or(EngineError::StepRunNotFound(step_run_id))?;
        if step_run.status != StepStatus::AwaitingApproval {
            return Err(EngineError::IllegalTransition {
                step_id: step_run.step_id.clone(),
                from: step_run.status,
                to: StepStatus::Approved,
            });
        }

        let run = self.load_run(step_run.run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::RunTerminal(run.id));
        }
        let (playbook, _) = self.playbook_for(&run).await?;
        let step = playbook
            .step(&step_run.step_id)
            .ok_or_else(|| EngineError::GraphInvalid(format!(
                "step '{}' missing from playbook snapshot",
                step_run.step_id
            )))?
            .clone();

        if !step.approval_roles.is_empty() && !step.approval_roles.contains(&decision.role) {
            return Err(EngineError::UnauthorizedRole {
                step_id: step.id.clone(),
                role: decision.role.clone(),
            });
        }

        self.record(AuditEntry::user(
            run.id,
            Some(step_run.id),
            AuditEvent::ApprovalDecided {
                decided_by: decision.decided_by.clone(),
                role: decision.role.clone(),
                decision: decision.decision,
            },
            format!(
                "step '{}' {} by {}",
                step.id,
                match decision.decision {
                    Decision::Approved => "approved",
                    Decision::Rejected => "rejected",
                },
                decision.decided_by
            ),
        ))
        .await?;

        match decision.decision {
            Decision::Approved => {
                // The drive loop routes the approved step from here:
                // signal waits park there, everything else dispatches.
                // Parking in one place keeps the durable state
                // reconstructible even if this call dies after the save.
                step_run.wait_deadline_ms = None;
                self.transition_step(&mut step_run, StepStatus::Approved)
                    .await?;
            }
            Decision::Rejected => {
                self.fail_step(
                    run.id,
                    &step,
                    &mut step_run,
                    "approval rejected".to_string(),
                )
                .await?;
            }
        }

        self.drive(run.id).await
    }

    /// Fan an external signal out to every matching waiter, across runs.
    /// Returns how many steps it resumed. Unmatched events are a no-op.
    pub async fn ingest_signal(&self, event: SignalEvent) -> EngineResult<usize> {
        let match_ctx = event.match_context();
        let mut affected: BTreeSet<Uuid> = BTreeSet::new();
        let mut resumed = 0usize;

        for step_run in self.store.find_signal_waiters().await? {
            let Some(run) = self.store.load_run(step_run.run_id).await? else {
                warn!(step = %step_run.step_id, "signal waiter belongs to unknown run");
                continue;
            };
            if run.status.is_terminal() || run.status == RunStatus::Paused {
                continue;
            }
            let (playbook, _) = self.playbook_for(&run).await?;
            let Some(step) = playbook.step(&step_run.step_id).cloned() else {
                continue;
            };
            // Pure timer waits park in the same durable status but only
            // the clock may resume them.
            if !step.wait_for_signals {
                continue;
            }
            let matched = match &step.signal_conditions {
                Some(expr) => expr.evaluate(&match_ctx, now_ms()),
                None => true,
            };
            if !matched {
                continue;
            }

            self.record(AuditEntry::system(
                run.id,
                Some(step_run.id),
                AuditEvent::SignalMatched {
                    signal_type: event.signal_type.clone(),
                },
                format!(
                    "signal '{}' matched step '{}', resuming",
                    event.signal_type, step.id
                ),
            ))
            .await?;

            let mut extra = RunContext::new();
            extra.insert("signal".to_string(), event.payload.clone());
            let parallelism = self.parallelism_for(&run).await?;
            self.dispatch_steps(&run, &playbook, parallelism, vec![step_run], extra)
                .await?;
            resumed += 1;
            affected.insert(run.id);
        }

        for run_id in affected {
            self.drive(run_id).await?;
        }
        Ok(resumed)
    }

    /// Fire every elapsed wait deadline and run-level time ceiling.
    ///
    /// This is the deployment's clock tick; tests drive it with synthetic
    /// time. Waits parked without a deadline never appear here.
    pub async fn expire_timeouts(&self, now: Timestamp) -> EngineResult<usize> {
        let mut affected: BTreeSet<Uuid> = BTreeSet::new();
        let mut fired = 0usize;

        for mut step_run in self.store.find_expired_waits(now).await? {
            let Some(run) = self.store.load_run(step_run.run_id).await? else {
                continue;
            };
            if run.status.is_terminal() || run.status == RunStatus::Paused {
                continue;
            }
            let (playbook, _) = self.playbook_for(&run).await?;
            let Some(step) = playbook.step(&step_run.step_id).cloned() else {
                continue;
            };

            match step_run.status {
                StepStatus::AwaitingApproval => {
                    self.record(AuditEntry::system(
                        run.id,
                        Some(step_run.id),
                        AuditEvent::ApprovalTimedOut {
                            policy: step.on_timeout,
                        },
                        format!("step '{}': no approval decision before deadline", step.id),
                    ))
                    .await?;
                    self.apply_timeout_policy(&run, &step, &mut step_run, "approval timed out")
                        .await?;
                }
                StepStatus::AwaitingSignal if step.wait_for_signals => {
                    self.record(AuditEntry::system(
                        run.id,
                        Some(step_run.id),
                        AuditEvent::SignalTimedOut {
                            policy: step.on_timeout,
                        },
                        format!("step '{}': no matching signal before deadline", step.id),
                    ))
                    .await?;
                    self.apply_timeout_policy(&run, &step, &mut step_run, "signal wait timed out")
                        .await?;
                }
                StepStatus::AwaitingSignal => {
                    // A plain timer elapsing is the wait *succeeding*.
                    let parallelism = self.parallelism_for(&run).await?;
                    self.dispatch_steps(
                        &run,
                        &playbook,
                        parallelism,
                        vec![step_run],
                        RunContext::new(),
                    )
                    .await?;
                }
                other => {
                    warn!(step = %step_run.step_id, status = ?other, "expired wait in unexpected status");
                    continue;
                }
            }
            fired += 1;
            affected.insert(run.id);
        }

        for run in self.store.find_expired_runs(now).await? {
            self.cancel_run(run.id, "time ceiling exceeded").await?;
            fired += 1;
            affected.remove(&run.id);
        }

        for run_id in affected {
            self.drive(run_id).await?;
        }
        Ok(fired)
    }

    /// Cancel a run, propagating cooperatively to every non-terminal step.
    ///
    /// Steps already dispatched may have produced their external side
    /// effect; that uncertainty is recorded in the audit trail rather
    /// than reported as a clean stop.
    pub async fn cancel_run(&self, run_id: Uuid, reason: &str) -> EngineResult<()> {
        let run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::RunTerminal(run_id));
        }

        self.commit_run(run_id, |r| {
            r.status = RunStatus::Cancelled;
            r.completed_at = Some(now_ms());
        })
        .await?;
        self.record(AuditEntry::user(
            run_id,
            None,
            AuditEvent::RunCancelled {
                reason: reason.to_string(),
            },
            format!("run cancelled: {reason}"),
        ))
        .await?;
        info!(run_id = %run_id, reason, "run cancelled");

        for mut step_run in self.store.load_step_runs(run_id).await? {
            if step_run.status.is_terminal() {
                continue;
            }
            if step_run.status == StepStatus::Executing {
                self.record(AuditEntry::system(
                    run_id,
                    Some(step_run.id),
                    AuditEvent::CancellationDuringExecution,
                    format!(
                        "step '{}': cancellation requested during execution; external side effect may have occurred",
                        step_run.step_id
                    ),
                ))
                .await?;
            }
            self.transition_step(&mut step_run, StepStatus::Cancelled)
                .await?;
            self.record(AuditEntry::system(
                run_id,
                Some(step_run.id),
                AuditEvent::StepCancelled,
                format!("step '{}' cancelled", step_run.step_id),
            ))
            .await?;
        }
        Ok(())
    }

    /// Freeze dispatching. Parked approvals/signals stay parked.
    pub async fn pause_run(&self, run_id: Uuid) -> EngineResult<()> {
        let run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::RunTerminal(run_id));
        }
        if run.status == RunStatus::Paused {
            return Ok(());
        }
        self.commit_run(run_id, |r| r.status = RunStatus::Paused)
            .await?;
        self.record(AuditEntry::user(run_id, None, AuditEvent::RunPaused, "run paused"))
            .await?;
        Ok(())
    }

    pub async fn resume_run(&self, run_id: Uuid) -> EngineResult<()> {
        let run = self.load_run(run_id).await?;
        if run.status != RunStatus::Paused {
            return if run.status.is_terminal() {
                Err(EngineError::RunTerminal(run_id))
            } else {
                Ok(())
            };
        }
        self.commit_run(run_id, |r| r.status = RunStatus::Running)
            .await?;
        self.record(AuditEntry::user(run_id, None, AuditEvent::RunResumed, "run resumed"))
            .await?;
        self.drive(run_id).await
    }

    // ── The orchestration loop ────────────────────────────────

    /// Advance a run until quiescent: every step terminal, parked, or
    /// blocked on a parked ancestor. Each pass promotes the ready
    /// frontier, routes it (skip / park / dispatch), and re-evaluates.
    pub async fn drive(&self, run_id: Uuid) -> EngineResult<()> {
        loop {
            let run = self.load_run(run_id).await?;
            if run.status.is_terminal() || run.status == RunStatus::Paused {
                return Ok(());
            }
            let (playbook, graph) = self.playbook_for(&run).await?;
            let parallelism = self.parallelism_for(&run).await?;
            let step_runs = self.store.load_step_runs(run_id).await?;

            // A fatal step failure stops new work. Whatever was in flight
            // alongside it has already drained by the time the failed
            // status is visible here; nothing further reaches the gateway.
            if step_runs.iter().any(|s| s.status == StepStatus::Failed) {
                return self.finalize_quiescent(run_id).await;
            }

            let mut progressed = false;

            // Promote pending steps whose dependencies are all terminal
            // in the success sense.
            let mut frontier: Vec<StepRun> = Vec::new();
            for step_run in &step_runs {
                match step_run.status {
                    StepStatus::Pending => {
                        let ready = graph.predecessors(&step_run.step_id).iter().all(|dep| {
                            step_runs
                                .iter()
                                .find(|s| &s.step_id == dep)
                                .is_some_and(|s| s.status.satisfies_dependency())
                        });
                        if ready {
                            let mut promoted = step_run.clone();
                            self.transition_step(&mut promoted, StepStatus::Ready).await?;
                            self.record(AuditEntry::system(
                                run_id,
                                Some(promoted.id),
                                AuditEvent::StepReady,
                                format!("step '{}' ready: all dependencies terminal", promoted.step_id),
                            ))
                            .await?;
                            progressed = true;
                            frontier.push(promoted);
                        }
                    }
                    StepStatus::Ready | StepStatus::Approved => frontier.push(step_run.clone()),
                    _ => {}
                }
            }

            // Route the frontier.
            let mut batch: Vec<StepRun> = Vec::new();
            for mut step_run in frontier {
                let Some(step) = playbook.step(&step_run.step_id).cloned() else {
                    warn!(step = %step_run.step_id, "step missing from playbook snapshot");
                    continue;
                };

                if step_run.status == StepStatus::Ready {
                    if let Some(expr) = &step.condition_expression {
                        let outcome = expr.evaluate(&run.context, now_ms());
                        self.record(AuditEntry::system(
                            run_id,
                            Some(step_run.id),
                            AuditEvent::ConditionEvaluated { outcome },
                            format!("step '{}' condition evaluated to {outcome}", step.id),
                        ))
                        .await?;
                        if !outcome {
                            self.transition_step(&mut step_run, StepStatus::Skipped).await?;
                            self.record(AuditEntry::system(
                                run_id,
                                Some(step_run.id),
                                AuditEvent::StepSkipped {
                                    reason: "condition not met".to_string(),
                                },
                                format!("step '{}' skipped: condition not met", step.id),
                            ))
                            .await?;
                            progressed = true;
                            continue;
                        }
                    }

                    if step.requires_approval {
                        self.park_for_approval(&run, &step, &mut step_run).await?;
                        progressed = true;
                        continue;
                    }
                }

                // Signal and timer waits park from Ready and Approved
                // alike, so an approved step recovered from storage still
                // waits instead of dispatching straight to the gateway.
                if step.wait_for_signals || step.wait_duration_minutes.is_some() {
                    self.park_for_signal(&run, &step, &mut step_run).await?;
                    progressed = true;
                    continue;
                }

                // Nothing left to wait for: dispatch.
                batch.push(step_run);
            }

            if !batch.is_empty() {
                self.dispatch_steps(&run, &playbook, parallelism, batch, RunContext::new())
                    .await?;
                progressed = true;
            }

            if !progressed {
                return self.finalize_quiescent(run_id).await;
            }
        }
    }

    /// Decide the run-level status once no step can make progress.
    async fn finalize_quiescent(&self, run_id: Uuid) -> EngineResult<()> {
        let run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Ok(());
        }
        let step_runs = self.store.load_step_runs(run_id).await?;
        let any_failed = step_runs.iter().any(|s| s.status == StepStatus::Failed);
        let all_settled = step_runs.iter().all(|s| s.status.is_terminal());

        if any_failed {
            // Drain: whatever can never become ready is cancelled so the
            // snapshot is unambiguous.
            let reason = step_runs
                .iter()
                .find(|s| s.status == StepStatus::Failed)
                .map(|s| {
                    format!(
                        "step '{}' failed: {}",
                        s.step_id,
                        s.error.as_deref().unwrap_or("unknown error")
                    )
                })
                .unwrap_or_else(|| "step failure".to_string());
            for mut step_run in step_runs {
                if !step_run.status.is_terminal() {
                    self.transition_step(&mut step_run, StepStatus::Cancelled).await?;
                    self.record(AuditEntry::system(
                        run_id,
                        Some(step_run.id),
                        AuditEvent::StepCancelled,
                        format!("step '{}' cancelled: run failed", step_run.step_id),
                    ))
                    .await?;
                }
            }
            self.commit_run(run_id, |r| {
                r.status = RunStatus::Failed;
                r.completed_at = Some(now_ms());
            })
            .await?;
            self.record(AuditEntry::system(
                run_id,
                None,
                AuditEvent::RunFailed {
                    reason: reason.clone(),
                },
                reason.clone(),
            ))
            .await?;
            info!(run_id = %run_id, reason = %reason, "run failed");
            return Ok(());
        }

        if all_settled {
            self.commit_run(run_id, |r| {
                r.status = RunStatus::Completed;
                r.completed_at = Some(now_ms());
            })
            .await?;
            self.record(AuditEntry::system(
                run_id,
                None,
                AuditEvent::RunCompleted,
                "all steps terminal, run completed",
            ))
            .await?;
            info!(run_id = %run_id, "run completed");
            return Ok(());
        }

        // Parked waiters remain. Surface approval waits at run level.
        let desired = if step_runs
            .iter()
            .any(|s| s.status == StepStatus::AwaitingApproval)
        {
            RunStatus::AwaitingApproval
        } else {
            RunStatus::Running
        };
        if run.status != desired {
            self.commit_run(run_id, move |r| r.status = desired).await?;
        }
        Ok(())
    }

    // ── Dispatch ──────────────────────────────────────────────

    /// Execute a batch of mutually-independent steps concurrently,
    /// bounded by the scenario's parallelism ceiling, and apply results.
    async fn dispatch_steps(
        &self,
        run: &ScenarioRun,
        playbook: &Playbook,
        parallelism: usize,
        batch: Vec<StepRun>,
        extra_context: RunContext,
    ) -> EngineResult<usize> {
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let mut inflight: JoinSet<(Uuid, bool, Result<Value, ActionError>)> = JoinSet::new();
        let mut applied = 0usize;

        for mut step_run in batch {
            let Some(step) = playbook.step(&step_run.step_id).cloned() else {
                warn!(step = %step_run.step_id, "step missing from playbook snapshot");
                continue;
            };

            step_run.dispatched_at = Some(now_ms());
            step_run.wait_deadline_ms = None;
            self.transition_step(&mut step_run, StepStatus::Executing).await?;
            self.record(AuditEntry::system(
                run.id,
                Some(step_run.id),
                AuditEvent::StepDispatched {
                    action_type: step.action_type,
                    idempotency_key: step_run.idempotency_key.clone(),
                },
                format!("step '{}' dispatched ({})", step.id, step.action_type),
            ))
            .await?;

            if step.action_type.is_control() {
                // The gate/wait/branch this step represents has already
                // resolved; nothing to hand to the gateway.
                self.apply_step_success(run.id, step_run.id, None).await?;
                applied += 1;
                continue;
            }

            // Crash-and-retry redelivery: answer from the dedupe cache
            // instead of producing a second side effect.
            if let Some(cached) = self.store.dedupe_get(&step_run.idempotency_key).await? {
                self.record(AuditEntry::system(
                    run.id,
                    Some(step_run.id),
                    AuditEvent::DispatchDeduplicated {
                        idempotency_key: step_run.idempotency_key.clone(),
                    },
                    format!("step '{}': redelivery answered from dedupe cache", step.id),
                ))
                .await?;
                self.apply_step_success(run.id, step_run.id, Some(cached)).await?;
                applied += 1;
                continue;
            }

            let handler = self.registry.handler(step.action_type)?;
            let mut context = run.context.clone();
            context.extend(extra_context.clone());
            let request = ActionRequest {
                action_type: step.action_type,
                payload: step.action_payload.clone(),
                idempotency_key: step_run.idempotency_key.clone(),
                context,
            };
            let permit_source = Arc::clone(&semaphore);
            let step_run_id = step_run.id;
            let skip_on_failure = step.skip_on_failure;
            inflight.spawn(async move {
                let _permit = match permit_source.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            step_run_id,
                            skip_on_failure,
                            Err(ActionError::transient("dispatch pool shut down")),
                        )
                    }
                };
                (step_run_id, skip_on_failure, handler.execute(request).await)
            });
        }

        while let Some(joined) = inflight.join_next().await {
            let (step_run_id, skip_on_failure, outcome) = joined
                .map_err(|e| EngineError::Storage(anyhow::anyhow!("dispatch task failed: {e}")))?;
            match outcome {
                Ok(result) => {
                    self.apply_step_success(run.id, step_run_id, Some(result)).await?;
                }
                Err(err) => {
                    self.apply_step_failure(run.id, step_run_id, skip_on_failure, err)
                        .await?;
                }
            }
            applied += 1;
        }
        Ok(applied)
    }

    /// Land a successful result. Tolerates late arrivals: if the step is
    /// no longer executing (run cancelled underneath us), the result is
    /// discarded and the discard recorded.
    async fn apply_step_success(
        &self,
        run_id: Uuid,
        step_run_id: Uuid,
        result: Option<Value>,
    ) -> EngineResult<()> {
        let mut step_run = self
            .store
            .load_step_run(step_run_id)
            .await?
            .ok_or(EngineError::StepRunNotFound(step_run_id))?;
        let run = self.load_run(run_id).await?;
        if step_run.status != StepStatus::Executing || run.status.is_terminal() {
            self.record(AuditEntry::system(
                run_id,
                Some(step_run_id),
                AuditEvent::LateResultIgnored {
                    step_id: step_run.step_id.clone(),
                },
                format!("step '{}': result arrived after run settled, discarded", step_run.step_id),
            ))
            .await?;
            return Ok(());
        }

        if let Some(value) = &result {
            self.store
                .dedupe_put(&step_run.idempotency_key, value)
                .await?;
        }
        step_run.result = result.clone();
        self.transition_step(&mut step_run, StepStatus::Executed).await?;
        self.record(AuditEntry::system(
            run_id,
            Some(step_run.id),
            AuditEvent::StepCompleted,
            format!("step '{}' executed", step_run.step_id),
        ))
        .await?;

        if let Some(value) = result {
            let step_id = step_run.step_id.clone();
            self.commit_run(run_id, move |r| {
                r.context.insert(step_id.clone(), value.clone());
            })
            .await?;
        }
        Ok(())
    }

    async fn apply_step_failure(
        &self,
        run_id: Uuid,
        step_run_id: Uuid,
        skip_on_failure: bool,
        err: ActionError,
    ) -> EngineResult<()> {
        let mut step_run = self
            .store
            .load_step_run(step_run_id)
            .await?
            .ok_or(EngineError::StepRunNotFound(step_run_id))?;
        let run = self.load_run(run_id).await?;
        if step_run.status != StepStatus::Executing || run.status.is_terminal() {
            self.record(AuditEntry::system(
                run_id,
                Some(step_run_id),
                AuditEvent::LateResultIgnored {
                    step_id: step_run.step_id.clone(),
                },
                format!("step '{}': failure arrived after run settled, discarded", step_run.step_id),
            ))
            .await?;
            return Ok(());
        }

        self.fail_step_raw(run_id, skip_on_failure, &mut step_run, err.to_string())
            .await
    }

    // ── Suspension & failure helpers ──────────────────────────

    async fn park_for_approval(
        &self,
        run: &ScenarioRun,
        step: &crate::types::Step,
        step_run: &mut StepRun,
    ) -> EngineResult<()> {
        let deadline = step.timeout_minutes.map(|m| now_ms() + minutes_ms(m));
        step_run.wait_deadline_ms = deadline;
        self.transition_step(step_run, StepStatus::AwaitingApproval).await?;
        // Notification-worthy: the delivery mechanics live outside.
        self.record(AuditEntry::system(
            run.id,
            Some(step_run.id),
            AuditEvent::ApprovalRequested {
                roles: step.approval_roles.clone(),
                deadline_ms: deadline,
            },
            format!(
                "step '{}' awaiting approval from roles [{}]",
                step.id,
                step.approval_roles.join(", ")
            ),
        ))
        .await?;
        if deadline.is_none() {
            self.record(AuditEntry::system(
                run.id,
                Some(step_run.id),
                AuditEvent::IndefiniteWaitFlagged,
                format!("step '{}' waits for approval with no timeout configured", step.id),
            ))
            .await?;
        }
        Ok(())
    }

    async fn park_for_signal(
        &self,
        run: &ScenarioRun,
        step: &crate::types::Step,
        step_run: &mut StepRun,
    ) -> EngineResult<()> {
        let deadline = step
            .wait_duration_minutes
            .or(step.timeout_minutes)
            .map(|m| now_ms() + minutes_ms(m));
        step_run.wait_deadline_ms = deadline;
        self.transition_step(step_run, StepStatus::AwaitingSignal).await?;
        self.record(AuditEntry::system(
            run.id,
            Some(step_run.id),
            AuditEvent::SignalSubscribed {
                deadline_ms: deadline,
            },
            if step.wait_for_signals {
                format!("step '{}' awaiting external signal", step.id)
            } else {
                format!("step '{}' waiting out its timer", step.id)
            },
        ))
        .await?;
        if deadline.is_none() {
            self.record(AuditEntry::system(
                run.id,
                Some(step_run.id),
                AuditEvent::IndefiniteWaitFlagged,
                format!("step '{}' waits for a signal with no timeout configured", step.id),
            ))
            .await?;
        }
        Ok(())
    }

    async fn apply_timeout_policy(
        &self,
        run: &ScenarioRun,
        step: &crate::types::Step,
        step_run: &mut StepRun,
        what: &str,
    ) -> EngineResult<()> {
        match step.on_timeout {
            TimeoutPolicy::Fail => {
                self.fail_step(run.id, step, step_run, what.to_string()).await
            }
            TimeoutPolicy::Skip => {
                self.transition_step(step_run, StepStatus::Skipped).await?;
                self.record(AuditEntry::system(
                    run.id,
                    Some(step_run.id),
                    AuditEvent::StepSkipped {
                        reason: format!("{what} (declared fallback)"),
                    },
                    format!("step '{}' skipped: {what}, fallback declared", step.id),
                ))
                .await
            }
        }
    }

    async fn fail_step(
        &self,
        run_id: Uuid,
        step: &crate::types::Step,
        step_run: &mut StepRun,
        error: String,
    ) -> EngineResult<()> {
        self.fail_step_raw(run_id, step.skip_on_failure, step_run, error).await
    }

    async fn fail_step_raw(
        &self,
        run_id: Uuid,
        skip_on_failure: bool,
        step_run: &mut StepRun,
        error: String,
    ) -> EngineResult<()> {
        step_run.error = Some(error.clone());
        self.transition_step(step_run, StepStatus::Failed).await?;
        self.record(AuditEntry::system(
            run_id,
            Some(step_run.id),
            AuditEvent::StepFailed {
                error: error.clone(),
            },
            format!("step '{}' failed: {error}", step_run.step_id),
        ))
        .await?;

        if skip_on_failure {
            // Conversion, not a transition: the failure stays recorded in
            // `error`, but downstream readiness treats the step as skipped.
            step_run.status = StepStatus::Skipped;
            self.store.save_step_run(step_run).await?;
            self.record(AuditEntry::system(
                run_id,
                Some(step_run.id),
                AuditEvent::StepSkipped {
                    reason: "skip_on_failure".to_string(),
                },
                format!(
                    "step '{}' converted to skipped: failure is non-blocking",
                    step_run.step_id
                ),
            ))
            .await?;
        }
        Ok(())
    }

    // ── Plumbing ──────────────────────────────────────────────

    async fn load_run(&self, run_id: Uuid) -> EngineResult<ScenarioRun> {
        self.store
            .load_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    async fn playbook_for(&self, run: &ScenarioRun) -> EngineResult<(Playbook, StepGraph)> {
        let playbook = self
            .catalog
            .get_playbook(&run.playbook_id)
            .await?
            .ok_or_else(|| EngineError::PlaybookNotFound(run.playbook_id.clone()))?;
        let graph = StepGraph::build(&playbook)?;
        Ok((playbook, graph))
    }

    async fn parallelism_for(&self, run: &ScenarioRun) -> EngineResult<usize> {
        Ok(self
            .catalog
            .get_scenario(&run.scenario_id)
            .await?
            .map(|s| s.constraints.parallelism())
            .unwrap_or(DEFAULT_MAX_PARALLEL_STEPS))
    }

    /// Optimistically commit a run mutation, retrying the recomputation
    /// on version conflict.
    async fn commit_run<F>(&self, run_id: Uuid, mutate: F) -> EngineResult<ScenarioRun>
    where
        F: Fn(&mut ScenarioRun),
    {
        for attempt in 0..CAS_RETRY_LIMIT {
            let mut run = self.load_run(run_id).await?;
            let expected = run.version;
            mutate(&mut run);
            run.version = expected + 1;
            if self.store.cas_run(&run, expected).await? {
                return Ok(run);
            }
            debug!(run_id = %run_id, attempt, "run version conflict, retrying");
        }
        Err(EngineError::RunUnavailable(run_id))
    }

    /// Mutate a step's status through the legal transition relation.
    async fn transition_step(&self, step_run: &mut StepRun, to: StepStatus) -> EngineResult<()> {
        if !step_run.status.can_transition_to(to) {
            return Err(EngineError::IllegalTransition {
                step_id: step_run.step_id.clone(),
                from: step_run.status,
                to,
            });
        }
        debug!(step = %step_run.step_id, from = ?step_run.status, to = ?to, "step transition");
        step_run.status = to;
        if to.is_terminal() {
            step_run.completed_at = Some(now_ms());
        }
        Ok(self.store.save_step_run(step_run).await?)
    }

    async fn record(&self, entry: AuditEntry) -> EngineResult<()> {
        self.store.append_audit(&entry).await?;
        Ok(())
    }
}

fn minutes_ms(minutes: u64) -> i64 {
    (minutes as i64).saturating_mul(60_000)
}

/// Pre-run constraint screen; fails `start_run` before anything persists.
fn screen_constraints(
    playbook: &Playbook,
    constraints: &Constraints,
) -> EngineResult<()> {
    for step in &playbook.steps {
        if constraints.excluded_action_types.contains(&step.action_type) {
            return Err(EngineError::ConstraintViolation(format!(
                "step '{}' uses excluded action type '{}'",
                step.id, step.action_type
            )));
        }
        if step.requires_approval && !constraints.required_approval_roles.is_empty() {
            let satisfied = step
                .approval_roles
                .iter()
                .any(|r| constraints.required_approval_roles.contains(r));
            if !satisfied {
                return Err(EngineError::ConstraintViolation(format!(
                    "step '{}' approval roles do not include any required role",
                    step.id
                )));
            }
        }
    }
    if let Some(ceiling) = constraints.budget_ceiling {
        let total: f64 = playbook.steps.iter().filter_map(|s| s.estimated_cost).sum();
        if total > ceiling {
            return Err(EngineError::ConstraintViolation(format!(
                "estimated playbook cost {total:.2} exceeds budget ceiling {ceiling:.2}"
            )));
        }
    }
    Ok(())
}
