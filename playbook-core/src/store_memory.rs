//! In-memory reference backend. Short critical sections under a std
//! mutex; the CAS check and write happen under the same lock.

use crate::audit::{AuditEntry, AuditFilter};
use crate::store::{PlaybookSource, RunStore};
use crate::types::{Playbook, Scenario, ScenarioRun, StepRun, StepStatus, Timestamp};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    runs: HashMap<Uuid, ScenarioRun>,
    step_runs: HashMap<Uuid, StepRun>,
    dedupe: HashMap<String, Value>,
    audit: Vec<AuditEntry>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn save_run(&self, run: &ScenarioRun) -> Result<()> {
        self.inner.lock().unwrap().runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<ScenarioRun>> {
        Ok(self.inner.lock().unwrap().runs.get(&run_id).cloned())
    }

    async fn cas_run(&self, run: &ScenarioRun, expected_version: u64) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        match inner.runs.get(&run.id) {
            Some(current) if current.version == expected_version => {
                inner.runs.insert(run.id, run.clone());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn save_step_run(&self, step_run: &StepRun) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .step_runs
            .insert(step_run.id, step_run.clone());
        Ok(())
    }

    async fn load_step_run(&self, step_run_id: Uuid) -> Result<Option<StepRun>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .step_runs
            .get(&step_run_id)
            .cloned())
    }

    async fn load_step_runs(&self, run_id: Uuid) -> Result<Vec<StepRun>> {
        let mut steps: Vec<StepRun> = self
            .inner
            .lock()
            .unwrap()
            .step_runs
            .values()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        steps.sort_by(|a, b| a.step_id.cmp(&b.step_id));
        Ok(steps)
    }

    async fn find_signal_waiters(&self) -> Result<Vec<StepRun>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .step_runs
            .values()
            .filter(|s| s.status == StepStatus::AwaitingSignal)
            .cloned()
            .collect())
    }

    async fn find_expired_waits(&self, now_ms: Timestamp) -> Result<Vec<StepRun>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .step_runs
            .values()
            .filter(|s| {
                matches!(
                    s.status,
                    StepStatus::AwaitingApproval | StepStatus::AwaitingSignal
                ) && s.wait_deadline_ms.is_some_and(|d| d <= now_ms)
            })
            .cloned()
            .collect())
    }

    async fn find_expired_runs(&self, now_ms: Timestamp) -> Result<Vec<ScenarioRun>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .runs
            .values()
            .filter(|r| {
                !r.status.is_terminal() && r.deadline_ms.is_some_and(|d| d <= now_ms)
            })
            .cloned()
            .collect())
    }

    async fn dedupe_get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.inner.lock().unwrap().dedupe.get(key).cloned())
    }

    async fn dedupe_put(&self, key: &str, result: &Value) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .dedupe
            .insert(key.to_string(), result.clone());
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        inner.audit.push(entry.clone());
        Ok(inner.audit.len() as u64)
    }

    async fn read_audit(&self, run_id: Uuid, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .audit
            .iter()
            .filter(|e| e.run_id == run_id && filter.matches(e))
            .cloned()
            .collect())
    }
}

/// In-memory playbook/scenario catalog; stands in for the external
/// definition store in tests and POC deployments.
#[derive(Default)]
pub struct MemoryCatalog {
    playbooks: Mutex<HashMap<String, Playbook>>,
    scenarios: Mutex<HashMap<String, Scenario>>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_playbook(&self, playbook: Playbook) {
        self.playbooks
            .lock()
            .unwrap()
            .insert(playbook.id.clone(), playbook);
    }

    pub fn insert_scenario(&self, scenario: Scenario) {
        self.scenarios
            .lock()
            .unwrap()
            .insert(scenario.id.clone(), scenario);
    }
}

#[async_trait]
impl PlaybookSource for MemoryCatalog {
    async fn get_playbook(&self, id: &str) -> Result<Option<Playbook>> {
        Ok(self.playbooks.lock().unwrap().get(id).cloned())
    }

    async fn get_scenario(&self, id: &str) -> Result<Option<Scenario>> {
        Ok(self.scenarios.lock().unwrap().get(id).cloned())
    }
}
