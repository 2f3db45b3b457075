// SPDX-License-Identifier: MIT OR Apache-2.0
//! Findings, severities, and the module result envelope.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A finding severity.
///
/// Opaque newtype over a `String`: the orchestrator never interprets these
/// values, ranks them, or filters on them — it stores and forwards whatever
/// a module reports. Modules are free to use `"info"`/`"low"`/`"critical"`
/// or any vocabulary of their own.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Severity(String);

impl Severity {
    /// Wrap an arbitrary severity string.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The wrapped string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Severity {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Severity {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Where a finding was located within the analyzed artifact.
///
/// Every field is optional: a module reporting a manifest-level issue has
/// no byte offset, and one reporting a binary pattern match may have no
/// file path at all.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct FindingLocation {
    /// Path within the artifact's extracted tree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// Line number, if applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Byte offset, if applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

/// One finding reported by a module.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Finding {
    /// Short machine-stable identifier for this class of finding, scoped to
    /// the reporting module.
    pub rule_id: String,
    /// Human-readable title.
    pub title: String,
    /// Longer free-text description.
    #[serde(default)]
    pub description: String,
    /// Severity, as reported by the module (opaque, see [`Severity`]).
    pub severity: Severity,
    /// Location within the artifact, if known.
    #[serde(default)]
    pub location: FindingLocation,
    /// Arbitrary module-specific structured detail.
    #[serde(default)]
    pub extra: serde_json::Value,
}

/// Top-level status of a module's run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ModuleResultStatus {
    /// The module completed its analysis without error.
    Success,
    /// The module encountered an error and produced no usable findings.
    Error,
}

/// Aggregate counts a module may optionally report alongside its findings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Summary {
    /// Total number of findings in this result.
    #[serde(default)]
    pub finding_count: u32,
    /// Free-form counts keyed by severity string, if the module chooses to
    /// report them.
    #[serde(default)]
    pub by_severity: std::collections::BTreeMap<String, u32>,
}

/// The envelope a module publishes back through the queue plane (C3) on
/// completion of a task.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ModuleResult {
    /// Wire-contract version this result was produced under.
    pub contract_version: String,
    /// Module that produced this result.
    pub module_id: String,
    /// Module version that produced this result.
    pub module_version: String,
    /// Task this result completes, echoed back from the originating
    /// [`crate::task::Task`] for correlation (spec's at-least-once delivery
    /// property: a stale/duplicate result is rejected by comparing this
    /// against the step's outstanding task id).
    pub task_id: Uuid,
    /// When the orchestrator finalized this result into the report, stamped
    /// by the executor rather than trusted from the worker's clock.
    pub completed_at: DateTime<Utc>,
    /// Overall status.
    pub status: ModuleResultStatus,
    /// Error message, set when `status` is [`ModuleResultStatus::Error`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Findings reported, if `status` is `success`.
    #[serde(default)]
    pub findings: Vec<Finding>,
    /// Optional aggregate summary.
    #[serde(default)]
    pub summary: Summary,
}

impl ModuleResult {
    /// Build a well-formed error result for `task_id`, stamping the current
    /// contract version and the current instant as `completed_at`.
    #[must_use]
    pub fn error(
        module_id: impl Into<String>,
        module_version: impl Into<String>,
        task_id: Uuid,
        message: impl Into<String>,
    ) -> Self {
        Self {
            contract_version: crate::CONTRACT_VERSION.to_string(),
            module_id: module_id.into(),
            module_version: module_version.into(),
            task_id,
            completed_at: Utc::now(),
            status: ModuleResultStatus::Error,
            error_message: Some(message.into()),
            findings: Vec::new(),
            summary: Summary::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_is_opaque_roundtrip() {
        let s: Severity = "critical".into();
        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, "\"critical\"");
        let back: Severity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn unrecognized_severity_strings_are_accepted() {
        let s: Severity = "banana".into();
        assert_eq!(s.as_str(), "banana");
    }

    #[test]
    fn error_result_has_no_findings() {
        let task_id = Uuid::new_v4();
        let r = ModuleResult::error("permissions", "1.0.0", task_id, "boom");
        assert_eq!(r.status, ModuleResultStatus::Error);
        assert_eq!(r.task_id, task_id);
        assert!(r.findings.is_empty());
        assert_eq!(r.error_message.as_deref(), Some("boom"));
    }
}
