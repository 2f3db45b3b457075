// SPDX-License-Identifier: MIT OR Apache-2.0
//! Module descriptors: the catalog entries the registry (C4) manages.

use crate::artifact::FileType;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Whether a module runs as an owned container or as an externally hosted
/// service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    /// Runs as a container the registry owns the lifecycle of.
    Internal,
    /// Runs as an externally hosted service registered over HTTP.
    External,
}

/// Internal container lifecycle state (spec §4.4).
///
/// ```text
/// absent ──build──▶ building ──ok──▶ stopped ──start──▶ running
///    ▲                │ err            │                    │
///    │                ▼                │ start (on-demand)  │
///    └───────── failed ◀───────────────┘                    │
///                                      ▲────── stop ────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    /// No image has been built yet.
    Absent,
    /// An image build is in progress.
    Building,
    /// Built but not started.
    Stopped,
    /// Running and accepting tasks.
    Running,
    /// Build or start failed after exhausting retries; requires operator
    /// `rebuild`.
    Failed,
}

impl ContainerState {
    /// Whether `next` is a legal transition from `self`.
    ///
    /// Mirrors the state diagram in spec §4.4: `rebuild` is modeled as the
    /// caller performing `stop` → `build` → `start` in sequence, not as a
    /// single edge.
    #[must_use]
    pub fn can_transition_to(self, next: ContainerState) -> bool {
        use ContainerState::{Absent, Building, Failed, Running, Stopped};
        matches!(
            (self, next),
            (Absent, Building)
                | (Building, Stopped)
                | (Building, Failed)
                | (Stopped, Running)
                | (Running, Stopped)
                | (Failed, Building)
        )
    }
}

/// Kind-specific fields for an internal (container-backed) module.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct InternalSpec {
    /// Container image reference to build/run.
    pub image_ref: String,
    /// Current lifecycle state.
    pub container_state: ContainerState,
    /// Whether this module should be started automatically at bootstrap.
    pub autostart: bool,
}

/// Kind-specific fields for an externally hosted module.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ExternalSpec {
    /// Base URL the adapter uses for task notification and file pulls.
    pub base_url: String,
    /// Health-check URL polled by the registry's background probe.
    pub healthcheck_url: String,
    /// Timestamp of the most recent successful health check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Kind-specific fields, discriminated by [`ModuleKind`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModuleSpec {
    /// See [`InternalSpec`].
    Internal(InternalSpec),
    /// See [`ExternalSpec`].
    External(ExternalSpec),
}

/// Catalog entry for one analysis module.
///
/// `(kind, id)` is unique (spec §3 invariant); `active`, `healthy`, and
/// `container_state` (nested in [`ModuleSpec::Internal`]) are the only
/// mutable fields — everything else is fixed at discovery/registration time.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ModuleDescriptor {
    /// Stable identifier, unique per [`ModuleKind`].
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Module version string.
    pub version: String,
    /// Author/maintainer string.
    pub author: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// File types this module accepts.
    pub input_formats: BTreeSet<FileType>,
    /// Whether the module is enabled for task dispatch.
    pub active: bool,
    /// Whether the module is currently considered healthy.
    pub healthy: bool,
    /// Kind-specific fields.
    pub spec: ModuleSpec,
}

impl ModuleDescriptor {
    /// Whether this module may currently receive tasks: `active ∧ healthy`
    /// (spec §3 invariant — the *only* two fields gating eligibility besides
    /// `input_formats`, checked separately by the caller).
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.active && self.healthy
    }

    /// Whether this module's kind is [`ModuleKind::Internal`].
    #[must_use]
    pub fn kind(&self) -> ModuleKind {
        match self.spec {
            ModuleSpec::Internal(_) => ModuleKind::Internal,
            ModuleSpec::External(_) => ModuleKind::External,
        }
    }

    /// Whether `file_type` is among this module's declared input formats.
    #[must_use]
    pub fn accepts(&self, file_type: FileType) -> bool {
        self.input_formats.contains(&file_type)
    }
}
