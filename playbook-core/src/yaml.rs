//! YAML authoring surface for playbooks and scenarios.
//!
//! Parse-only: `parse_playbook` gets a definition into memory, and
//! `load_playbook` additionally runs graph validation so callers get one
//! entry point that either yields an executable template or says exactly
//! why not. Keeping the two apart lets tooling report parse errors and
//! semantic errors separately.

use crate::error::EngineResult;
use crate::graph::StepGraph;
use crate::types::{Playbook, Scenario};

pub fn parse_playbook(yaml: &str) -> EngineResult<Playbook> {
    Ok(serde_yaml::from_str(yaml)?)
}

pub fn parse_scenario(yaml: &str) -> EngineResult<Scenario> {
    Ok(serde_yaml::from_str(yaml)?)
}

/// Parse and validate in one go.
pub fn load_playbook(yaml: &str) -> EngineResult<Playbook> {
    let playbook = parse_playbook(yaml)?;
    StepGraph::build(&playbook)?;
    Ok(playbook)
}
