//! Admission control for execution intents.
//!
//! One [`IntentCoordinator`] exists per monitored task. It turns explicit
//! triggers and detected log signals into at most one dispatch at a time,
//! and absorbs repeated triggers for a debounce interval after each
//! completed dispatch.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use flowrun_core::{Detection, ExecutionIntent, IntentKind, LogSignal};

/// Default minimum gap between accepted dispatches.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(10);

/// Externally visible coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Idle,
    Dispatching,
    CoolingDown,
}

/// Why a trigger or signal was not dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Another dispatch for this task has not finished.
    InFlight,
    /// The previous dispatch finished less than the debounce interval ago.
    Debounce { remaining: Duration },
    /// The recovery marker was already acted upon.
    StaleSignal,
    /// The signal does not call for any action.
    NotActionable,
}

/// What the caller should do with a trigger or signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Dispatch(ExecutionIntent),
    /// Cancel (best effort), then dispatch `resume`.
    Recover { resume: ExecutionIntent },
    Drop(DropReason),
}

/// How a run-starting dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acknowledged,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Dispatching(IntentKind),
    CoolingDown { until: Instant },
}

/// Per-task state machine over {Idle, Dispatching, CoolingDown}.
#[derive(Debug, Clone)]
pub struct IntentCoordinator {
    debounce: Duration,
    phase: Phase,
    last_recovery_seq: Option<u64>,
}

impl IntentCoordinator {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            phase: Phase::Idle,
            last_recovery_seq: None,
        }
    }

    /// Current state as of `now`.
    pub fn state(&self, now: Instant) -> CoordinatorState {
        match self.phase {
            Phase::Idle => CoordinatorState::Idle,
            Phase::Dispatching(_) => CoordinatorState::Dispatching,
            Phase::CoolingDown { until } if now >= until => CoordinatorState::Idle,
            Phase::CoolingDown { .. } => CoordinatorState::CoolingDown,
        }
    }

    /// Kind of the run-starting intent in flight, if any.
    pub fn in_flight(&self) -> Option<IntentKind> {
        match self.phase {
            Phase::Dispatching(kind) => Some(kind),
            _ => None,
        }
    }

    /// Single admission gate: rejects while a dispatch is in flight or the
    /// last one finished less than the debounce interval ago.
    fn gate(&mut self, now: Instant) -> Option<DropReason> {
        match self.phase {
            Phase::Idle => None,
            Phase::Dispatching(_) => Some(DropReason::InFlight),
            Phase::CoolingDown { until } if now >= until => {
                self.phase = Phase::Idle;
                None
            }
            Phase::CoolingDown { until } => Some(DropReason::Debounce {
                remaining: until - now,
            }),
        }
    }

    /// Handle an explicit trigger.
    ///
    /// Cancel is always admitted and leaves the run state untouched.
    pub fn on_trigger(&mut self, intent: ExecutionIntent, now: Instant) -> Decision {
        if intent.kind() == IntentKind::Cancel {
            return Decision::Dispatch(intent);
        }
        if let Some(reason) = self.gate(now) {
            return Decision::Drop(reason);
        }
        self.phase = Phase::Dispatching(intent.kind());
        Decision::Dispatch(intent)
    }

    /// Handle the newest log detection.
    ///
    /// Only [`LogSignal::QuotaExhaustedRotated`] from a line not seen before
    /// leads to a recovery. The line is consumed even when the gate rejects
    /// it, so a later refresh does not replay it over a fresher dispatch.
    pub fn on_signal(
        &mut self,
        detection: &Detection,
        workflow_ref: Option<String>,
        now: Instant,
    ) -> Decision {
        if detection.signal != LogSignal::QuotaExhaustedRotated {
            return Decision::Drop(DropReason::NotActionable);
        }
        let Some(seq) = detection.seq else {
            return Decision::Drop(DropReason::NotActionable);
        };
        if self.last_recovery_seq.is_some_and(|last| seq <= last) {
            return Decision::Drop(DropReason::StaleSignal);
        }
        self.last_recovery_seq = Some(seq);

        if let Some(reason) = self.gate(now) {
            return Decision::Drop(reason);
        }
        self.phase = Phase::Dispatching(IntentKind::Resume);
        Decision::Recover {
            resume: ExecutionIntent::resume(workflow_ref),
        }
    }

    /// Record the end of a run-starting dispatch.
    ///
    /// Either outcome starts the cool-down: the debounce counts from the
    /// last completed dispatch, delivered or not. Cancel completions are
    /// ignored.
    pub fn finish(&mut self, kind: IntentKind, outcome: Outcome, now: Instant) {
        if kind == IntentKind::Cancel || !matches!(self.phase, Phase::Dispatching(_)) {
            return;
        }
        if outcome == Outcome::Failed {
            debug!(kind = %kind, "Dispatch failed, cooling down before the next one");
        }
        self.phase = Phase::CoolingDown {
            until: now + self.debounce,
        };
    }
}

impl Default for IntentCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}
