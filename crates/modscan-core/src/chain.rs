// SPDX-License-Identifier: MIT OR Apache-2.0
//! Chain definitions (C5) and chain-run state (part of C6's contract).

use crate::artifact::Fingerprint;
use crate::result::ModuleResult;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One step in a [`Chain`]: which module to run, in what order, with what
/// parameters.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ChainStep {
    /// Module to invoke for this step.
    pub module_id: String,
    /// 1-based position within the chain, normalized on write.
    pub order: u32,
    /// Opaque parameters forwarded to the module via the task payload.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// When `true`, a failure of this step records an error and the chain
    /// advances to the next step. When `false` (default), failure aborts
    /// the chain run.
    ///
    /// The spec's open question ("is soft-fail first class?") is resolved
    /// in favor of an explicit per-step flag — see `DESIGN.md`.
    #[serde(default)]
    pub soft_fail: bool,
    /// Per-step timeout override. `None` uses the module's configured
    /// default `step_timeout`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

/// A named, ordered sequence of module steps.
///
/// Mutated only by explicit CRUD; never during execution — an in-flight
/// [`ChainRun`] holds its own immutable [`ChainRun::chain_snapshot`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Chain {
    /// Unique chain name.
    pub name: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// Ordered steps. `order` values are `1..=steps.len()` after
    /// normalization.
    pub steps: Vec<ChainStep>,
}

/// Outcome recorded for one completed (or terminated) step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// The step's module returned `status: success`.
    Completed,
    /// The step was never enqueued because an earlier hard failure aborted
    /// the run.
    Skipped,
    /// The step's module returned `status: error`, or eligibility failed.
    Failed,
    /// The step's deadline elapsed with no result.
    TimedOut,
    /// The chain run was cancelled while this step was outstanding.
    Cancelled,
}

/// Per-step outcome record kept in the chain run and surfaced in reports
/// (spec §7 "user-visible failures").
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepRecord {
    /// Index into the chain snapshot's `steps`.
    pub step_index: usize,
    /// Module this step targeted.
    pub module_id: String,
    /// Task id correlated with this step, if one was enqueued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    /// Final outcome of the step.
    pub outcome: StepOutcome,
    /// Worker-supplied error message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// When this step's outcome was recorded.
    pub recorded_at: DateTime<Utc>,
}

/// Overall state of a [`ChainRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChainRunState {
    /// Created, not yet started.
    Pending,
    /// Actively driving steps.
    Running,
    /// Suspended (reserved for future use; not reachable via any operation
    /// specified in spec §4.6).
    Paused,
    /// All steps ran to completion (or were soft-skipped).
    Completed,
    /// A hard step failure (or up-front eligibility failure) terminated the
    /// run.
    Failed,
    /// Cancelled by operator request.
    Cancelled,
}

impl ChainRunState {
    /// Whether this state is terminal (no further steps will run).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChainRunState::Completed | ChainRunState::Failed | ChainRunState::Cancelled
        )
    }
}

/// One execution instance of a [`Chain`] against one artifact.
///
/// Exactly one non-terminal `ChainRun` may exist per `(chain, fingerprint)`
/// at a time (spec §3 invariant) — enforced by the executor, not this type.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ChainRun {
    /// Unique run identifier.
    pub chain_run_id: Uuid,
    /// Name of the originating chain, or `None` for a bare single-module run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_name: Option<String>,
    /// Immutable snapshot of the chain taken at start time.
    pub chain_snapshot: Chain,
    /// Artifact this run targets.
    pub fingerprint: Fingerprint,
    /// Index of the step currently executing (or about to execute).
    ///
    /// Monotonically non-decreasing until a terminal state is reached
    /// (spec invariant P3).
    pub cursor: usize,
    /// `task_id` of the task currently outstanding for `steps[cursor]`, if
    /// one has been enqueued and not yet resolved.
    ///
    /// Persisted alongside every other field so a restart can reconcile an
    /// in-flight step: re-await the same `task_id` with a fresh deadline,
    /// or declare it `failed:lost`, per spec §4.6.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_task_id: Option<Uuid>,
    /// Current run state.
    pub state: ChainRunState,
    /// When the run was created.
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal state, if it has.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Per-step outcomes recorded so far, in step order.
    #[serde(default)]
    pub steps: Vec<StepRecord>,
}

impl ChainRun {
    /// Results collected so far, keyed implicitly by step order — used by
    /// the report store to merge into the artifact's report.
    #[must_use]
    pub fn completed_module_ids(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::Completed)
            .map(|s| s.module_id.as_str())
            .collect()
    }
}

/// A snapshot of a `ChainRun` plus the [`ModuleResult`]s it produced, as
/// stored in a [`crate::artifact::Artifact`]'s report (C2).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ChainRunSnapshot {
    /// The run's current (or final) state.
    pub run: ChainRun,
    /// Results keyed by module id, for steps that produced one.
    pub results: std::collections::BTreeMap<String, ModuleResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ChainRunState::Completed.is_terminal());
        assert!(ChainRunState::Failed.is_terminal());
        assert!(ChainRunState::Cancelled.is_terminal());
        assert!(!ChainRunState::Running.is_terminal());
        assert!(!ChainRunState::Pending.is_terminal());
    }

    #[test]
    fn soft_fail_defaults_to_hard() {
        let json = r#"{"module_id":"a","order":1}"#;
        let step: ChainStep = serde_json::from_str(json).unwrap();
        assert!(!step.soft_fail);
    }
}
