use crate::audit::{AuditEntry, AuditFilter};
use crate::types::{Playbook, Scenario, ScenarioRun, StepRun, Timestamp};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

/// Persistence trait for all run state.
///
/// The orchestrator operates exclusively through this trait, enabling
/// pluggable backends (MemoryStore for tests and POC deployments, a
/// relational store in production). Suspension is durable: a waiting
/// step is a row here, not a live task; resumption after a process
/// restart is reconstructed from storage alone.
#[async_trait]
pub trait RunStore: Send + Sync {
    // ── Runs ──

    async fn save_run(&self, run: &ScenarioRun) -> Result<()>;
    async fn load_run(&self, run_id: Uuid) -> Result<Option<ScenarioRun>>;

    /// Compare-and-swap on the run's `version`. Writes `run` only if the
    /// stored version equals `expected_version`; returns whether the
    /// write happened. This is the single serialization point that makes
    /// horizontal orchestrator replicas safe without a distributed lock.
    async fn cas_run(&self, run: &ScenarioRun, expected_version: u64) -> Result<bool>;

    // ── Step runs ──

    async fn save_step_run(&self, step_run: &StepRun) -> Result<()>;
    async fn load_step_run(&self, step_run_id: Uuid) -> Result<Option<StepRun>>;
    async fn load_step_runs(&self, run_id: Uuid) -> Result<Vec<StepRun>>;

    // ── Waiter queries ──

    /// All steps parked in `awaiting_signal`, across every run.
    async fn find_signal_waiters(&self) -> Result<Vec<StepRun>>;

    /// All parked steps (approval or signal) whose deadline elapsed.
    async fn find_expired_waits(&self, now_ms: Timestamp) -> Result<Vec<StepRun>>;

    /// Non-terminal runs whose run-level deadline elapsed.
    async fn find_expired_runs(&self, now_ms: Timestamp) -> Result<Vec<ScenarioRun>>;

    // ── Dedupe cache (idempotent redispatch) ──

    async fn dedupe_get(&self, key: &str) -> Result<Option<Value>>;
    async fn dedupe_put(&self, key: &str, result: &Value) -> Result<()>;

    // ── Audit log (append-only) ──

    /// Append an entry and return its sequence number.
    async fn append_audit(&self, entry: &AuditEntry) -> Result<u64>;
    async fn read_audit(&self, run_id: Uuid, filter: &AuditFilter) -> Result<Vec<AuditEntry>>;
}

/// The external playbook/scenario store, contracts only. Definitions
/// are assumed immutable for the lifetime of a run.
#[async_trait]
pub trait PlaybookSource: Send + Sync {
    async fn get_playbook(&self, id: &str) -> Result<Option<Playbook>>;
    async fn get_scenario(&self, id: &str) -> Result<Option<Scenario>>;
}
