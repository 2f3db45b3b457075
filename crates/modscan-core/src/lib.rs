// SPDX-License-Identifier: MIT OR Apache-2.0
//! modscan-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The stable data model shared by every crate in the orchestrator.
//!
//! If you only take one dependency from this workspace, take this one.

/// Artifact identity and metadata.
pub mod artifact;
/// Chain definitions and chain-run state.
pub mod chain;
/// Module descriptors and registry-facing types.
pub mod module;
/// Findings, severities, and module results.
pub mod result;
/// Queued task payloads and lifecycle state.
pub mod task;
/// Validation helpers shared across the crates that mutate these types.
pub mod validate;

pub use artifact::{Artifact, FileType, Fingerprint};
pub use chain::{Chain, ChainRun, ChainRunState, ChainStep, StepOutcome, StepRecord};
pub use module::{ContainerState, ModuleDescriptor, ModuleKind};
pub use result::{Finding, FindingLocation, ModuleResult, ModuleResultStatus, Severity, Summary};
pub use task::{Task, TaskState};

/// Current wire-contract version embedded in task payloads and results.
///
/// # Examples
///
/// ```
/// assert_eq!(modscan_core::CONTRACT_VERSION, "modscan/v1");
/// ```
pub const CONTRACT_VERSION: &str = "modscan/v1";

/// Per-file-type auto-run rule kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AutoRunRuleKind {
    /// Do nothing on ingest.
    None,
    /// Start a single-step chain run for one module.
    Module,
    /// Start a named chain.
    Chain,
}

/// A single auto-run rule: what to do when an artifact of a given file type
/// is ingested.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
pub struct AutoRunRule {
    /// What kind of action to take.
    pub kind: AutoRunRuleKind,
    /// Module id (for `Module`) or chain name (for `Chain`). Unused for `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
}

impl AutoRunRule {
    /// The rule that performs no action on ingest.
    #[must_use]
    pub fn none() -> Self {
        Self {
            kind: AutoRunRuleKind::None,
            target_id: None,
        }
    }
}

impl Default for AutoRunRule {
    fn default() -> Self {
        Self::none()
    }
}

/// Process-wide auto-run configuration: one rule per known file type.
///
/// Read on every ingestion by the dispatcher (C7); mutated atomically by the
/// settings endpoint. See [`crate::validate`] for the snapshot discipline
/// this type is designed around.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, schemars::JsonSchema)]
pub struct AutoRunConfig {
    /// Rule applied to ingested APKs.
    pub apk: AutoRunRule,
    /// Rule applied to ingested IPAs.
    pub ipa: AutoRunRule,
    /// Rule applied to ingested plain zip archives.
    pub zip: AutoRunRule,
}

impl AutoRunConfig {
    /// Look up the rule for a given file type. Source archives never
    /// auto-run (the spec's dispatcher table has no `source` row).
    #[must_use]
    pub fn rule_for(&self, file_type: FileType) -> AutoRunRule {
        match file_type {
            FileType::Apk => self.apk.clone(),
            FileType::Ipa => self.ipa.clone(),
            FileType::Zip => self.zip.clone(),
            FileType::Source => AutoRunRule::none(),
        }
    }
}
