// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Dispatcher (C7) — spec §4.7.
//!
//! Resolves the auto-run rule for a freshly ingested artifact and launches a
//! [`modscan_executor::ChainRunHandle`] for it, or does nothing if the rule
//! is `none`. Also serves as the single entry point for explicit,
//! user-initiated runs, which bypass rule lookup and name a chain or module
//! directly.

use modscan_core::{AutoRunConfig, AutoRunRuleKind, FileType, Fingerprint};
use modscan_error::ModscanError;
use modscan_executor::{ChainExecutor, ChainRunHandle, ChainRunRequest, ChainTarget};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Atomically-swappable holder for the process-wide [`AutoRunConfig`].
///
/// Readers (every ingestion) never block on a writer (the settings
/// endpoint) for longer than a clone of the current snapshot.
#[derive(Clone, Default)]
pub struct AutoRunSettings {
    inner: Arc<RwLock<AutoRunConfig>>,
}

impl AutoRunSettings {
    #[must_use]
    pub fn new(config: AutoRunConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Snapshot the current configuration.
    pub async fn snapshot(&self) -> AutoRunConfig {
        self.inner.read().await.clone()
    }

    /// Replace the configuration wholesale. Mutation is atomic with respect
    /// to any in-flight `snapshot` call — readers see either the old or the
    /// new value, never a partial one.
    pub async fn replace(&self, config: AutoRunConfig) {
        *self.inner.write().await = config;
    }
}

/// Identifies what an explicit, user-initiated run should target.
#[derive(Debug, Clone)]
pub enum RunTarget {
    Chain(String),
    Module(String),
}

/// Dispatches chain runs, either automatically on ingest or explicitly on
/// operator request. A thin delegation layer over [`ChainExecutor::start`];
/// it owns no execution state of its own.
#[derive(Clone)]
pub struct Dispatcher {
    executor: ChainExecutor,
    settings: AutoRunSettings,
}

impl Dispatcher {
    #[must_use]
    pub fn new(executor: ChainExecutor, settings: AutoRunSettings) -> Self {
        Self { executor, settings }
    }

    /// Called after a successful ingest (C1 dedup-by-fingerprint has already
    /// run). Reads the current [`AutoRunConfig`], selects the rule for
    /// `file_type`, and starts a run if the rule says to.
    ///
    /// Returns `Ok(None)` for `kind: none` — this is not an error, just "no
    /// auto-run configured for this file type".
    pub async fn on_ingest(
        &self,
        fingerprint: Fingerprint,
        extracted_root: String,
        file_type: FileType,
    ) -> Result<Option<ChainRunHandle>, ModscanError> {
        let config = self.settings.snapshot().await;
        let rule = config.rule_for(file_type);

        let target = match rule.kind {
            AutoRunRuleKind::None => {
                tracing::debug!(?file_type, "no auto-run rule configured, skipping");
                return Ok(None);
            }
            AutoRunRuleKind::Module => {
                let module_id = rule.target_id.ok_or_else(|| {
                    ModscanError::new(
                        modscan_error::ErrorKind::InvalidInput,
                        "auto-run rule kind is module but target_id is unset",
                    )
                })?;
                ChainTarget::Module(module_id)
            }
            AutoRunRuleKind::Chain => {
                let chain_name = rule.target_id.ok_or_else(|| {
                    ModscanError::new(
                        modscan_error::ErrorKind::InvalidInput,
                        "auto-run rule kind is chain but target_id is unset",
                    )
                })?;
                ChainTarget::Chain(chain_name)
            }
        };

        let handle = self
            .executor
            .start(ChainRunRequest {
                target,
                fingerprint,
                extracted_root,
                file_type,
            })
            .await?;
        Ok(Some(handle))
    }

    /// Starts a run named explicitly by an operator, bypassing the auto-run
    /// rule table entirely. Shares the same single-step-synthesis behavior
    /// as `on_ingest` for a bare module id.
    pub async fn run_explicit(
        &self,
        target: RunTarget,
        fingerprint: Fingerprint,
        extracted_root: String,
        file_type: FileType,
    ) -> Result<ChainRunHandle, ModscanError> {
        let target = match target {
            RunTarget::Chain(name) => ChainTarget::Chain(name),
            RunTarget::Module(id) => ChainTarget::Module(id),
        };
        self.executor
            .start(ChainRunRequest {
                target,
                fingerprint,
                extracted_root,
                file_type,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modscan_chains::InMemoryChainStore;
    use modscan_core::{AutoRunRule, ModuleResultStatus};
    use modscan_queue::{MemoryQueuePlane, QueuePlane, ResultEnvelope};
    use modscan_registry::{MockContainerDriver, ModuleRegistry};
    use modscan_report::ReportStore;
    use std::sync::Arc;
    use std::time::Duration;

    async fn write_manifest(dir: &std::path::Path, module_id: &str) {
        let module_dir = dir.join(module_id);
        tokio::fs::create_dir_all(&module_dir).await.unwrap();
        tokio::fs::write(
            module_dir.join("module.toml"),
            r#"
            name = "Permissions"
            version = "1.0.0"
            author = "test"
            input_formats = ["apk"]
            "#,
        )
        .await
        .unwrap();
    }

    async fn test_dispatcher(
        modules_dir: &std::path::Path,
        reports_dir: &std::path::Path,
        chains_dir: &std::path::Path,
        fingerprint: Fingerprint,
    ) -> (Dispatcher, Arc<MemoryQueuePlane>) {
        write_manifest(modules_dir, "permissions").await;
        let queue = Arc::new(MemoryQueuePlane::new());
        let registry = ModuleRegistry::new(
            modules_dir.to_path_buf(),
            Arc::new(MockContainerDriver::always_succeeds()),
            3,
            queue.clone(),
        );
        registry.bootstrap().await.unwrap();
        let chains = Arc::new(InMemoryChainStore::default());
        let reports = ReportStore::new(reports_dir.to_path_buf()).await.unwrap();
        reports
            .ensure_report(&modscan_core::Artifact {
                fingerprint,
                original_name: "app.apk".into(),
                aliases: Vec::new(),
                size: 10,
                detected_type: FileType::Apk,
                ingested_at: chrono::Utc::now(),
                extracted_root: format!("{}/tree", fingerprint.to_hex()),
            })
            .await
            .unwrap();

        let executor = ChainExecutor::new(
            queue.clone(),
            registry,
            chains,
            reports,
            30,
            60,
        );
        let settings = AutoRunSettings::new(AutoRunConfig::default());
        let _ = chains_dir;
        (Dispatcher::new(executor, settings), queue)
    }

    #[tokio::test]
    async fn on_ingest_with_none_rule_does_nothing() {
        let modules = tempfile::tempdir().unwrap();
        let reports = tempfile::tempdir().unwrap();
        let chains = tempfile::tempdir().unwrap();
        let fingerprint = Fingerprint::parse(&"a".repeat(64)).unwrap();
        let (dispatcher, _queue) =
            test_dispatcher(modules.path(), reports.path(), chains.path(), fingerprint).await;

        let handle = dispatcher
            .on_ingest(fingerprint, "/tmp/extracted".into(), FileType::Apk)
            .await
            .unwrap();
        assert!(handle.is_none());
    }

    #[tokio::test]
    async fn on_ingest_with_module_rule_starts_a_run() {
        let modules = tempfile::tempdir().unwrap();
        let reports = tempfile::tempdir().unwrap();
        let chains = tempfile::tempdir().unwrap();
        let fingerprint = Fingerprint::parse(&"b".repeat(64)).unwrap();
        let (dispatcher, queue) =
            test_dispatcher(modules.path(), reports.path(), chains.path(), fingerprint).await;

        dispatcher
            .settings
            .replace(AutoRunConfig {
                apk: AutoRunRule {
                    kind: AutoRunRuleKind::Module,
                    target_id: Some("permissions".into()),
                },
                ..Default::default()
            })
            .await;

        let handle = dispatcher
            .on_ingest(fingerprint, "/tmp/extracted".into(), FileType::Apk)
            .await
            .unwrap()
            .expect("module rule should start a run");

        let task_id = queue
            .pop("permissions", Duration::from_millis(500))
            .await
            .unwrap()
            .expect("task should be enqueued");
        queue
            .publish_result(
                "permissions",
                fingerprint,
                ResultEnvelope {
                    task_id,
                    result: modscan_core::ModuleResult {
                        contract_version: "modscan/v1".into(),
                        module_id: "permissions".into(),
                        module_version: "1.0.0".into(),
                        task_id,
                        completed_at: chrono::Utc::now(),
                        status: ModuleResultStatus::Success,
                        findings: Vec::new(),
                        summary: modscan_core::Summary::default(),
                        error_message: None,
                    },
                },
            )
            .await
            .unwrap();

        handle.join().await;
    }

    #[tokio::test]
    async fn run_explicit_bypasses_auto_run_rules() {
        let modules = tempfile::tempdir().unwrap();
        let reports = tempfile::tempdir().unwrap();
        let chains = tempfile::tempdir().unwrap();
        let fingerprint = Fingerprint::parse(&"c".repeat(64)).unwrap();
        let (dispatcher, queue) =
            test_dispatcher(modules.path(), reports.path(), chains.path(), fingerprint).await;

        let handle = dispatcher
            .run_explicit(
                RunTarget::Module("permissions".into()),
                fingerprint,
                "/tmp/extracted".into(),
                FileType::Apk,
            )
            .await
            .unwrap();

        let task_id = queue
            .pop("permissions", Duration::from_millis(500))
            .await
            .unwrap()
            .expect("task should be enqueued");
        queue
            .publish_result(
                "permissions",
                fingerprint,
                ResultEnvelope {
                    task_id,
                    result: modscan_core::ModuleResult {
                        contract_version: "modscan/v1".into(),
                        module_id: "permissions".into(),
                        module_version: "1.0.0".into(),
                        task_id,
                        completed_at: chrono::Utc::now(),
                        status: ModuleResultStatus::Success,
                        findings: Vec::new(),
                        summary: modscan_core::Summary::default(),
                        error_message: None,
                    },
                },
            )
            .await
            .unwrap();

        handle.join().await;
    }
}
