// SPDX-License-Identifier: MIT OR Apache-2.0
//! Queued task payloads and lifecycle state (C3/C6 shared contract).

use crate::artifact::{FileType, Fingerprint};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a single queued task, as tracked by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Enqueued, not yet popped by a worker.
    Queued,
    /// Popped by a worker; awaiting a result.
    InFlight,
    /// A matching result arrived with `status: success`.
    Completed,
    /// A matching result arrived with `status: error`.
    Failed,
    /// The step's deadline elapsed before any matching result arrived.
    TimedOut,
    /// The owning chain run was cancelled while this task was outstanding.
    Cancelled,
}

impl TaskState {
    /// Whether this state is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::TimedOut | TaskState::Cancelled
        )
    }
}

impl Default for TaskState {
    fn default() -> Self {
        TaskState::Queued
    }
}

/// A unit of work enqueued for exactly one module.
///
/// Published to the module's queue verbatim as the task payload; the
/// `task_id` is echoed back in the corresponding [`crate::result::ModuleResult`]
/// publication so the executor can reject stale results (spec's at-least-once
/// delivery open question — see `DESIGN.md`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Task {
    /// Unique task identifier, used for result correlation.
    pub task_id: Uuid,
    /// Wire-contract version.
    pub contract_version: String,
    /// Target module.
    pub module_id: String,
    /// Artifact this task analyzes.
    pub fingerprint: Fingerprint,
    /// Detected type of the artifact, so a worker polling the queue
    /// directly can dispatch without a separate store round trip.
    pub file_type: FileType,
    /// Owning chain run, or `None` for a bare single-module run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_run_id: Option<Uuid>,
    /// Index of the originating step within the chain run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    /// Opaque parameters forwarded from the chain step (or run request).
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// Path (relative to the store root) to the artifact's extracted tree,
    /// so internal modules can read files without a store round trip.
    pub extracted_root: String,
    /// When this task was enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Absolute deadline; a result arriving after this instant is treated
    /// as a timeout regardless of wall-clock queue delay.
    pub deadline: DateTime<Utc>,
    /// Current lifecycle state, tracked by the executor (not serialized as
    /// part of the payload given to workers — queue consumers only ever see
    /// `Queued`/`InFlight` implicitly).
    #[serde(skip)]
    pub state: TaskState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::TimedOut.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::InFlight.is_terminal());
    }

    #[test]
    fn task_state_skipped_on_serialization() {
        let task = Task {
            task_id: Uuid::nil(),
            contract_version: "modscan/v1".into(),
            module_id: "permissions".into(),
            fingerprint: Fingerprint::of(b"x"),
            file_type: FileType::Apk,
            chain_run_id: None,
            step_index: None,
            parameters: serde_json::Value::Null,
            extracted_root: "fp/x".into(),
            enqueued_at: Utc::now(),
            deadline: Utc::now(),
            state: TaskState::Queued,
        };
        let json = serde_json::to_value(&task).unwrap();
        assert!(json.get("state").is_none());
    }
}
