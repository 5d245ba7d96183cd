//! Static workflow definitions and their phase partitions.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::CoreError;

/// Label used when a workflow declares no phases.
pub const DEFAULT_PHASE_LABEL: &str = "workflow";

/// A labeled, contiguous group of agents executed by one engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    /// Display label (e.g. "planning").
    pub label: String,

    /// Opaque identifier of the execution engine for this phase.
    #[serde(default)]
    pub engine: String,

    /// Agents of this phase, in execution order.
    pub agents: Vec<String>,
}

impl Phase {
    /// Create a new Phase.
    pub fn new(
        label: impl Into<String>,
        engine: impl Into<String>,
        agents: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            label: label.into(),
            engine: engine.into(),
            agents: agents.into_iter().map(Into::into).collect(),
        }
    }
}

/// A phase projected onto a concrete agent sequence.
///
/// `start..end` indexes into the sequence the range was projected onto.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseRange {
    pub label: String,
    pub engine: String,
    pub start: usize,
    pub end: usize,
}

impl PhaseRange {
    /// Returns true if the sequence position falls inside this range.
    pub fn contains(&self, index: usize) -> bool {
        (self.start..self.end).contains(&index)
    }

    /// Number of agents in the range.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns true if the range holds no agents.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// On-disk shape of a workflow definition.
#[derive(Debug, Default, Deserialize)]
struct WorkflowFile {
    #[serde(default)]
    agents: Vec<String>,
    #[serde(default)]
    phases: Vec<Phase>,
}

/// Ordered agent sequence, optionally partitioned into phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WorkflowFile")]
pub struct WorkflowDefinition {
    agents: Vec<String>,
    phases: Vec<Phase>,
}

impl WorkflowDefinition {
    /// Create a workflow without phases.
    pub fn new(agents: impl IntoIterator<Item = impl Into<String>>) -> Result<Self, CoreError> {
        let agents: Vec<String> = agents.into_iter().map(Into::into).collect();
        check_unique(&agents)?;
        Ok(Self {
            agents,
            phases: Vec::new(),
        })
    }

    /// Create a workflow whose sequence is the concatenation of its phases.
    pub fn phased(phases: Vec<Phase>) -> Result<Self, CoreError> {
        if let Some(empty) = phases.iter().find(|p| p.agents.is_empty()) {
            return Err(CoreError::EmptyPhase(empty.label.clone()));
        }
        let agents: Vec<String> = phases.iter().flat_map(|p| p.agents.clone()).collect();
        check_unique(&agents)?;
        Ok(Self { agents, phases })
    }

    /// Create a workflow from an explicit sequence and a partition of it.
    pub fn with_phases(
        agents: impl IntoIterator<Item = impl Into<String>>,
        phases: Vec<Phase>,
    ) -> Result<Self, CoreError> {
        let agents: Vec<String> = agents.into_iter().map(Into::into).collect();
        let workflow = Self::phased(phases)?;
        if workflow.agents != agents {
            return Err(CoreError::InvalidPartition(format!(
                "phases cover [{}] but the sequence is [{}]",
                workflow.agents.join(", "),
                agents.join(", ")
            )));
        }
        Ok(workflow)
    }

    /// The full agent sequence.
    pub fn agents(&self) -> &[String] {
        &self.agents
    }

    /// Declared phases (empty if the workflow is not partitioned).
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Map this definition's phases onto `sequence`.
    ///
    /// The result always partitions `sequence` exactly. Agents the
    /// definition does not know join the preceding phase, or the first
    /// phase when nothing precedes them.
    pub fn project(&self, sequence: &[String]) -> Vec<PhaseRange> {
        let lookup: HashMap<&str, usize> = self
            .phases
            .iter()
            .enumerate()
            .flat_map(|(idx, phase)| phase.agents.iter().map(move |a| (a.as_str(), idx)))
            .collect();

        let mut ranges: Vec<(usize, PhaseRange)> = Vec::new();
        let mut previous: Option<usize> = None;

        for (pos, agent) in sequence.iter().enumerate() {
            let idx = lookup
                .get(agent.as_str())
                .copied()
                .or(previous)
                .unwrap_or(0);
            previous = Some(idx);

            if let Some((_, range)) = ranges.last_mut().filter(|(last, _)| *last == idx) {
                range.end = pos + 1;
                continue;
            }

            let (label, engine) = match self.phases.get(idx) {
                Some(phase) => (phase.label.clone(), phase.engine.clone()),
                None => (DEFAULT_PHASE_LABEL.to_string(), String::new()),
            };
            ranges.push((
                idx,
                PhaseRange {
                    label,
                    engine,
                    start: pos,
                    end: pos + 1,
                },
            ));
        }

        ranges.into_iter().map(|(_, range)| range).collect()
    }
}

impl TryFrom<WorkflowFile> for WorkflowDefinition {
    type Error = CoreError;

    fn try_from(file: WorkflowFile) -> Result<Self, Self::Error> {
        match (file.agents.is_empty(), file.phases.is_empty()) {
            (_, true) => Self::new(file.agents),
            (true, false) => Self::phased(file.phases),
            (false, false) => Self::with_phases(file.agents, file.phases),
        }
    }
}

fn check_unique(agents: &[String]) -> Result<(), CoreError> {
    let mut seen = HashSet::new();
    for agent in agents {
        if !seen.insert(agent.as_str()) {
            return Err(CoreError::DuplicateAgent(agent.clone()));
        }
    }
    Ok(())
}
