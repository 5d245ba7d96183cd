//! Workflow progress computation.
//!
//! [`compute`] is a pure function of its inputs; [`ProgressSnapshot`] keeps
//! the per-run state that feeds it (sequence, cumulative completions and
//! the agent currently executing).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::{IntentKind, MonitorSnapshot, WorkflowDefinition};

/// Agent currently executing, or a sentinel while none is known yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CurrentAgent {
    /// Run submitted, first agent not reported yet.
    Starting,
    /// Run resumed, next agent not reported yet.
    Resuming,
    /// A named agent of the sequence.
    Named(String),
}

impl CurrentAgent {
    /// Interpret the raw value reported by the system of record.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => Self::Starting,
            Some(s) if s.eq_ignore_ascii_case("starting") => Self::Starting,
            Some(s) if s.eq_ignore_ascii_case("resuming") => Self::Resuming,
            Some(s) => Self::Named(s.to_string()),
        }
    }

    /// The agent name, if this is not a sentinel.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Named(name) => Some(name),
            Self::Starting | Self::Resuming => None,
        }
    }
}

impl fmt::Display for CurrentAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => f.write_str("starting"),
            Self::Resuming => f.write_str("resuming"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

impl From<String> for CurrentAgent {
    fn from(s: String) -> Self {
        Self::parse(Some(&s))
    }
}

impl From<CurrentAgent> for String {
    fn from(agent: CurrentAgent) -> Self {
        agent.to_string()
    }
}

/// Position of the run within the workflow's phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhasePosition {
    pub label: String,
    pub engine: String,
    /// 1-based index of the phase.
    pub index: usize,
    /// Number of phases in the projected sequence.
    pub count: usize,
    /// Completed agents inside this phase.
    pub completed: usize,
    /// Agents inside this phase.
    pub total: usize,
    pub percentage: u8,
}

/// Result of a progress computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub percentage: u8,
    pub phase: Option<PhasePosition>,
}

impl Progress {
    fn empty() -> Self {
        Self {
            percentage: 0,
            phase: None,
        }
    }
}

fn ratio(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((done as f64 * 100.0 / total as f64).round()).clamp(0.0, 100.0) as u8
}

/// Compute completion percentage and phase position.
///
/// The backend percentage, when present, is never underrepresented: the
/// larger of the two values wins. A rerun that has not reported any
/// completion yet is always at 0.
pub fn compute(
    workflow: &WorkflowDefinition,
    full_sequence: &[String],
    completed: &BTreeSet<String>,
    current: &CurrentAgent,
    intent_kind: IntentKind,
    backend_pct: Option<u8>,
) -> Progress {
    if full_sequence.is_empty() {
        return Progress::empty();
    }

    let is_done: Vec<bool> = full_sequence
        .iter()
        .map(|agent| completed.contains(agent))
        .collect();
    let done = is_done.iter().filter(|d| **d).count();

    let percentage = if intent_kind == IntentKind::Rerun && done == 0 {
        0
    } else {
        let local = ratio(done, full_sequence.len());
        backend_pct.map_or(local, |pct| local.max(pct.min(100)))
    };

    let ranges = workflow.project(full_sequence);
    let current_pos = current
        .name()
        .and_then(|name| full_sequence.iter().position(|a| a == name));
    let first_incomplete = is_done.iter().position(|d| !d);

    let selected = current_pos
        .or(first_incomplete)
        .and_then(|pos| ranges.iter().position(|r| r.contains(pos)));

    let phase = match selected {
        Some(idx) => {
            let range = &ranges[idx];
            let completed_in = is_done[range.start..range.end].iter().filter(|d| **d).count();
            Some(PhasePosition {
                label: range.label.clone(),
                engine: range.engine.clone(),
                index: idx + 1,
                count: ranges.len(),
                completed: completed_in,
                total: range.len(),
                percentage: ratio(completed_in, range.len()),
            })
        }
        // Everything is complete: report the last phase as finished.
        None => ranges.last().map(|range| PhasePosition {
            label: range.label.clone(),
            engine: range.engine.clone(),
            index: ranges.len(),
            count: ranges.len(),
            completed: range.len(),
            total: range.len(),
            percentage: 100,
        }),
    };

    Progress { percentage, phase }
}

/// Per-run progress state.
///
/// Invariant: `completed` is always a subset of `full_sequence`, and it only
/// grows until the next rerun.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    full_sequence: Vec<String>,
    completed: BTreeSet<String>,
    current: CurrentAgent,
    run_kind: IntentKind,
    /// Completions carried over from the run a rerun replaced. Reports that
    /// contain all of them are stale until one does not, or the new run is
    /// confirmed.
    #[serde(skip)]
    rerun_baseline: Option<BTreeSet<String>>,
}

impl ProgressSnapshot {
    /// Initialize a freshly submitted run.
    pub fn start(full_sequence: Vec<String>) -> Self {
        Self {
            full_sequence,
            completed: BTreeSet::new(),
            current: CurrentAgent::Starting,
            run_kind: IntentKind::Submit,
            rerun_baseline: None,
        }
    }

    /// Start over from the beginning, optionally with a different sequence.
    pub fn rerun(&mut self, sequence: Option<Vec<String>>) {
        let previous = std::mem::take(&mut self.completed);
        if let Some(sequence) = sequence {
            self.full_sequence = sequence;
        }
        self.current = CurrentAgent::Starting;
        self.run_kind = IntentKind::Rerun;
        self.rerun_baseline = (!previous.is_empty()).then_some(previous);
    }

    /// The system of record has started the run a rerun asked for, so its
    /// reports describe the new run even when they repeat old completions.
    pub fn confirm_run(&mut self) {
        self.rerun_baseline = None;
    }

    /// Continue from the current agent, keeping the completion history.
    pub fn resume(&mut self) {
        self.current = CurrentAgent::Resuming;
        self.run_kind = IntentKind::Resume;
    }

    /// Fold a monitor refresh into the snapshot.
    ///
    /// Applying the same refresh twice leaves the snapshot unchanged.
    pub fn observe(&mut self, snapshot: &MonitorSnapshot) {
        let fresh_rerun = self.run_kind == IntentKind::Rerun && self.completed.is_empty();
        if !snapshot.workflow_sequence.is_empty() && (self.full_sequence.is_empty() || fresh_rerun)
        {
            self.full_sequence = snapshot.workflow_sequence.clone();
        }

        let reported: BTreeSet<String> = snapshot
            .completed_agents
            .iter()
            .filter(|agent| self.full_sequence.contains(agent))
            .cloned()
            .collect();

        let stale = self
            .rerun_baseline
            .as_ref()
            .is_some_and(|baseline| reported.is_superset(baseline));
        if !stale {
            self.rerun_baseline = None;
            self.completed.extend(reported);
        }

        let current = CurrentAgent::parse(snapshot.current_agent.as_deref());
        // Keep the sentinel until the system of record names a real agent.
        if current.name().is_some() || self.current.name().is_some() {
            self.current = current;
        }
    }

    /// Compute progress for this run.
    pub fn progress(&self, workflow: &WorkflowDefinition, backend_pct: Option<u8>) -> Progress {
        // A stale report means the backend percentage is stale as well.
        let backend_pct = backend_pct.filter(|_| self.rerun_baseline.is_none());
        compute(
            workflow,
            &self.full_sequence,
            &self.completed,
            &self.current,
            self.run_kind,
            backend_pct,
        )
    }

    pub fn full_sequence(&self) -> &[String] {
        &self.full_sequence
    }

    pub fn completed(&self) -> &BTreeSet<String> {
        &self.completed
    }

    pub fn current(&self) -> &CurrentAgent {
        &self.current
    }

    pub fn run_kind(&self) -> IntentKind {
        self.run_kind
    }
}
