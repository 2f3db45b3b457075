// SPDX-License-Identifier: MIT OR Apache-2.0
//! modscan-executor
#![warn(missing_docs)]
//!
//! The Chain Executor (C6) — spec §4.6, "the hard part": drives a
//! [`ChainRun`] to termination one step at a time, enforcing eligibility,
//! the hard/soft step failure policy, timeouts, cancellation, and the
//! at-most-one-concurrent-task invariant per `(fingerprint, module_id)`.

/// Cancellation token shared between a run's driving task and its handle.
pub mod cancel;

use cancel::CancellationToken;
use chrono::{Duration as ChronoDuration, Utc};
use modscan_chains::ChainStore;
use modscan_core::chain::{ChainRunSnapshot, StepOutcome, StepRecord};
use modscan_core::{Chain, ChainRun, ChainRunState, ChainStep, FileType, Fingerprint, Task, TaskState};
use modscan_error::{ErrorKind, ModscanError};
use modscan_external::{TaskNotification, TaskNotificationData};
use modscan_queue::{QueuePlane, ResultEnvelope};
use modscan_registry::ModuleRegistry;
use modscan_report::ReportStore;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// What a [`ChainRunRequest`] should execute: a named, stored chain, or a
/// bare module id synthesized into a single-step chain.
#[derive(Debug, Clone)]
pub enum ChainTarget {
    /// Run a chain previously created via `modscan-chains`.
    Chain(String),
    /// Run a single module, as if it were a one-step chain.
    Module(String),
}

/// Everything the executor needs to start driving a run.
#[derive(Debug, Clone)]
pub struct ChainRunRequest {
    /// What to run.
    pub target: ChainTarget,
    /// Artifact the run targets.
    pub fingerprint: Fingerprint,
    /// Path (relative to the store root) to the artifact's extracted tree.
    pub extracted_root: String,
    /// The artifact's detected type, used for up-front eligibility checks.
    pub file_type: FileType,
}

/// A handle to a started (possibly already-terminal) [`ChainRun`].
///
/// Dropping the handle does not cancel the run — call [`Self::cancel`]
/// explicitly. The driving task keeps running and keeps writing to the
/// report store regardless of whether the handle is held.
pub struct ChainRunHandle {
    chain_run_id: Uuid,
    cancel_token: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl ChainRunHandle {
    /// The run this handle controls.
    #[must_use]
    pub fn chain_run_id(&self) -> Uuid {
        self.chain_run_id
    }

    /// Request cancellation. The currently awaited task (if any) is
    /// abandoned — its eventual result is still written to the report
    /// store but does not advance the run. Workers are not forcibly
    /// stopped.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Wait for the run's driving task to finish (terminal state reached).
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

/// `(fingerprint, module_id)` pair with a non-final task outstanding.
type OutstandingKey = (Fingerprint, String);

/// Drives [`ChainRun`]s to termination.
///
/// Cheaply [`Clone`]able; every clone shares the same outstanding-task
/// registry, so the at-most-one-concurrent-task invariant holds across
/// concurrently started runs, not just within one.
#[derive(Clone)]
pub struct ChainExecutor {
    queue: Arc<dyn QueuePlane>,
    registry: ModuleRegistry,
    chains: Arc<dyn ChainStore>,
    reports: ReportStore,
    default_step_timeout_secs: u64,
    lost_task_grace_secs: u64,
    outstanding: Arc<Mutex<HashSet<OutstandingKey>>>,
    http_client: reqwest::Client,
}

impl ChainExecutor {
    /// Build an executor over the given queue plane, module registry,
    /// chain store, and report store.
    #[must_use]
    pub fn new(
        queue: Arc<dyn QueuePlane>,
        registry: ModuleRegistry,
        chains: Arc<dyn ChainStore>,
        reports: ReportStore,
        default_step_timeout_secs: u64,
        lost_task_grace_secs: u64,
    ) -> Self {
        Self {
            queue,
            registry,
            chains,
            reports,
            default_step_timeout_secs,
            lost_task_grace_secs,
            outstanding: Arc::new(Mutex::new(HashSet::new())),
            http_client: reqwest::Client::new(),
        }
    }

    /// Resolve `request.target` into a chain snapshot (fetching a named
    /// chain, or synthesizing a single-step one for a bare module id) and
    /// start driving it. Returns immediately; the run may already be
    /// terminal by the time this returns if up-front eligibility fails.
    pub async fn start(&self, request: ChainRunRequest) -> Result<ChainRunHandle, ModscanError> {
        let (chain_name, chain) = match &request.target {
            ChainTarget::Chain(name) => (Some(name.clone()), self.chains.get_chain(name).await?),
            ChainTarget::Module(module_id) => (
                None,
                Chain {
                    name: format!("adhoc:{module_id}"),
                    description: String::new(),
                    steps: vec![ChainStep {
                        module_id: module_id.clone(),
                        order: 1,
                        parameters: serde_json::Value::Null,
                        soft_fail: false,
                        timeout_secs: None,
                    }],
                },
            ),
        };

        let chain_run_id = Uuid::new_v4();
        let run = ChainRun {
            chain_run_id,
            chain_name,
            chain_snapshot: chain,
            fingerprint: request.fingerprint,
            cursor: 0,
            pending_task_id: None,
            state: ChainRunState::Pending,
            started_at: Utc::now(),
            finished_at: None,
            steps: Vec::new(),
        };

        let cancel_token = CancellationToken::new();
        let handle_token = cancel_token.clone();
        let executor = self.clone();
        let extracted_root = request.extracted_root;
        let file_type = request.file_type;

        let join = tokio::spawn(async move {
            executor.drive(run, extracted_root, file_type, cancel_token).await;
        });

        Ok(ChainRunHandle {
            chain_run_id,
            cancel_token: handle_token,
            join,
        })
    }

    /// Request cancellation of a run this executor does not hold a live
    /// [`ChainRunHandle`] for — e.g. after a process restart. Looks up the
    /// persisted run and, if still non-terminal, marks it cancelled; the
    /// in-flight task (if any) is simply abandoned, matching the live-handle
    /// path.
    pub async fn cancel_persisted(&self, fingerprint: Fingerprint, chain_run_id: Uuid) -> Result<(), ModscanError> {
        let mut report = self.reports.get_report(fingerprint).await?;
        let snapshot = report
            .chain_runs
            .get_mut(&chain_run_id)
            .ok_or_else(|| ModscanError::new(ErrorKind::NotFound, "chain run not found"))?;
        if snapshot.run.state.is_terminal() {
            return Ok(());
        }
        snapshot.run.state = ChainRunState::Cancelled;
        snapshot.run.finished_at = Some(Utc::now());
        snapshot.run.pending_task_id = None;
        self.reports
            .put_chain_run_state(fingerprint, chain_run_id, snapshot.clone())
            .await
    }

    /// Reconcile every non-terminal chain run found in the report store's
    /// first `page_size` artifacts against the live queue plane.
    ///
    /// Called once at daemon startup. Any run found `running` with a
    /// `pending_task_id` is re-awaited for `lost_task_grace_secs`; if still
    /// no matching result arrives, the step (and therefore the run, per the
    /// ordinary hard/soft policy) is finalized as `failed:lost`.
    pub async fn reconcile_on_startup(&self, page_size: usize) -> Result<u32, ModscanError> {
        let mut reconciled = 0u32;
        let mut page = 0usize;
        loop {
            let fingerprints = self.reports.list_artifacts(page, page_size).await?;
            if fingerprints.is_empty() {
                break;
            }
            for fingerprint in fingerprints {
                let report = self.reports.get_report(fingerprint).await?;
                let stuck: Vec<Uuid> = report
                    .chain_runs
                    .iter()
                    .filter(|(_, s)| s.run.state == ChainRunState::Running)
                    .map(|(id, _)| *id)
                    .collect();
                for chain_run_id in stuck {
                    self.reconcile_one(fingerprint, chain_run_id).await?;
                    reconciled += 1;
                }
            }
            page += 1;
        }
        Ok(reconciled)
    }

    async fn reconcile_one(&self, fingerprint: Fingerprint, chain_run_id: Uuid) -> Result<(), ModscanError> {
        let report = self.reports.get_report(fingerprint).await?;
        let Some(snapshot) = report.chain_runs.get(&chain_run_id) else {
            return Ok(());
        };
        let run = snapshot.run.clone();
        let results = snapshot.results.clone();
        let extracted_root = report.artifact_meta.extracted_root.clone();
        let file_type = report.artifact_meta.detected_type;

        let Some(task_id) = run.pending_task_id else {
            // Running with nothing outstanding means the driving task died
            // between persisting `cursor` and enqueuing the task. Resume
            // from `cursor` as if starting fresh from that step.
            let cancel_token = CancellationToken::new();
            self.drive_from(run, results, extracted_root, file_type, cancel_token).await;
            return Ok(());
        };

        let step = &run.chain_snapshot.steps[run.cursor];
        let grace_deadline = Utc::now() + ChronoDuration::seconds(self.lost_task_grace_secs as i64);
        let result = self
            .queue
            .await_result(&step.module_id, fingerprint, task_id, grace_deadline)
            .await?;

        let mut run = run;
        let mut results = results;
        match result {
            Some(module_result) => {
                self.finish_step(&mut run, &mut results, task_id, module_result).await?;
            }
            None => {
                self.record_step_failure(&mut run, Some(task_id), StepOutcome::Failed, "task lost across restart");
            }
        }

        if !run.state.is_terminal() {
            // The reconciled step resolved cleanly; advance past it before
            // handing the run back to the ordinary step loop, exactly as
            // the loop's own post-match bookkeeping would.
            run.cursor += 1;
            run.pending_task_id = None;
        }
        self.persist(&run, &results).await?;

        if !run.state.is_terminal() {
            let cancel_token = CancellationToken::new();
            self.drive_from(run, results, extracted_root, file_type, cancel_token).await;
        }
        Ok(())
    }

    async fn drive(&self, run: ChainRun, extracted_root: String, file_type: FileType, cancel_token: CancellationToken) {
        self.drive_from(run, BTreeMap::new(), extracted_root, file_type, cancel_token).await;
    }

    async fn drive_from(
        &self,
        mut run: ChainRun,
        mut results: BTreeMap<String, modscan_core::ModuleResult>,
        extracted_root: String,
        file_type: FileType,
        cancel_token: CancellationToken,
    ) {
        if run.state == ChainRunState::Pending {
            if let Some((failing_index, message)) = self.validate_eligibility(&run, file_type).await {
                self.fail_up_front(&mut run, failing_index, &message);
                let _ = self.persist(&run, &results).await;
                return;
            }
            run.state = ChainRunState::Running;
            if self.persist(&run, &results).await.is_err() {
                return;
            }
        }

        while run.cursor < run.chain_snapshot.steps.len() {
            if cancel_token.is_cancelled() {
                run.state = ChainRunState::Cancelled;
                run.finished_at = Some(Utc::now());
                run.pending_task_id = None;
                let _ = self.persist(&run, &results).await;
                return;
            }

            let step = run.chain_snapshot.steps[run.cursor].clone();
            let task_id = Uuid::new_v4();
            let key = (run.fingerprint, step.module_id.clone());

            {
                let mut guard = self.outstanding.lock().await;
                if !guard.insert(key.clone()) {
                    drop(guard);
                    self.record_step_failure(
                        &mut run,
                        None,
                        StepOutcome::Failed,
                        "module already has a non-final task outstanding for this artifact",
                    );
                    if !step.soft_fail {
                        run.finished_at = Some(Utc::now());
                        let _ = self.persist(&run, &results).await;
                        return;
                    }
                    run.cursor += 1;
                    if self.persist(&run, &results).await.is_err() {
                        return;
                    }
                    continue;
                }
            }

            let timeout_secs = step.timeout_secs.unwrap_or(self.default_step_timeout_secs);
            let deadline = Utc::now() + ChronoDuration::seconds(timeout_secs as i64);
            let task = Task {
                task_id,
                contract_version: modscan_core::CONTRACT_VERSION.to_string(),
                module_id: step.module_id.clone(),
                fingerprint: run.fingerprint,
                file_type,
                chain_run_id: Some(run.chain_run_id),
                step_index: Some(run.cursor),
                parameters: step.parameters.clone(),
                extracted_root: extracted_root.clone(),
                enqueued_at: Utc::now(),
                deadline,
                state: TaskState::Queued,
            };

            if let Err(e) = self.queue.enqueue(&task).await {
                self.outstanding.lock().await.remove(&key);
                self.record_step_failure(&mut run, Some(task_id), StepOutcome::Failed, &e.message);
                run.finished_at = Some(Utc::now());
                let _ = self.persist(&run, &results).await;
                return;
            }

            self.notify_if_external(&task).await;

            run.pending_task_id = Some(task_id);
            if self.persist(&run, &results).await.is_err() {
                self.outstanding.lock().await.remove(&key);
                return;
            }

            let awaited = cancel_token
                .race(self.queue.await_result(&step.module_id, run.fingerprint, task_id, deadline))
                .await;

            self.outstanding.lock().await.remove(&key);

            let Some(awaited) = awaited else {
                run.state = ChainRunState::Cancelled;
                run.finished_at = Some(Utc::now());
                run.pending_task_id = None;
                let _ = self.persist(&run, &results).await;
                return;
            };

            match awaited {
                Ok(Some(module_result)) => {
                    if self.finish_step(&mut run, &mut results, task_id, module_result).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {
                    self.record_step_failure(&mut run, Some(task_id), StepOutcome::TimedOut, "step timed out");
                    if !step.soft_fail {
                        run.finished_at = Some(Utc::now());
                    }
                }
                Err(e) => {
                    self.record_step_failure(&mut run, Some(task_id), StepOutcome::Failed, &e.message);
                    if !step.soft_fail {
                        run.finished_at = Some(Utc::now());
                    }
                }
            }

            if run.state.is_terminal() {
                let _ = self.persist(&run, &results).await;
                return;
            }

            run.cursor += 1;
            run.pending_task_id = None;
            if self.persist(&run, &results).await.is_err() {
                return;
            }
        }

        run.state = ChainRunState::Completed;
        run.finished_at = Some(Utc::now());
        run.pending_task_id = None;
        let _ = self.persist(&run, &results).await;
    }

    /// Best-effort outbound notification for a task just enqueued for an
    /// external module (spec §4.8). Internal modules poll the queue
    /// directly and need no notification; a lookup failure here (module
    /// deregistered between eligibility check and enqueue) is swallowed the
    /// same way a failed HTTP call is.
    async fn notify_if_external(&self, task: &Task) {
        let Ok(descriptor) = self.registry.select(&task.module_id, task.file_type).await else {
            return;
        };
        let modscan_core::module::ModuleSpec::External(spec) = &descriptor.spec else {
            return;
        };
        let notification = TaskNotification {
            task_id: task.task_id,
            file_hash: task.fingerprint.to_hex(),
            chain_task_id: task.chain_run_id,
            step_index: task.step_index,
            data: TaskNotificationData {
                folder_path: task.extracted_root.clone(),
                file_type: task.file_type,
                parameters: if task.parameters.is_null() {
                    None
                } else {
                    Some(task.parameters.clone())
                },
            },
        };
        modscan_external::notify(&self.http_client, &spec.base_url, &notification).await;
    }

    async fn finish_step(
        &self,
        run: &mut ChainRun,
        results: &mut BTreeMap<String, modscan_core::ModuleResult>,
        task_id: Uuid,
        mut module_result: modscan_core::ModuleResult,
    ) -> Result<(), ModscanError> {
        module_result.task_id = task_id;
        module_result.completed_at = Utc::now();
        let step = &run.chain_snapshot.steps[run.cursor];
        match module_result.status {
            modscan_core::ModuleResultStatus::Success => {
                if let Err(e) = self
                    .reports
                    .put_module_result(run.fingerprint, &step.module_id, module_result.clone())
                    .await
                {
                    tracing::warn!(error = %e, module_id = %step.module_id, "failed to persist module result");
                }
                results.insert(step.module_id.clone(), module_result);
                run.steps.push(StepRecord {
                    step_index: run.cursor,
                    module_id: step.module_id.clone(),
                    task_id: Some(task_id),
                    outcome: StepOutcome::Completed,
                    error_message: None,
                    recorded_at: Utc::now(),
                });
            }
            modscan_core::ModuleResultStatus::Error => {
                let message = module_result.error_message.clone().unwrap_or_default();
                let soft_fail = step.soft_fail;
                self.record_step_failure(run, Some(task_id), StepOutcome::Failed, &message);
                if !soft_fail {
                    run.finished_at = Some(Utc::now());
                }
            }
        }
        Ok(())
    }

    fn record_step_failure(&self, run: &mut ChainRun, task_id: Option<Uuid>, outcome: StepOutcome, message: &str) {
        let step = &run.chain_snapshot.steps[run.cursor];
        let soft_fail = step.soft_fail;
        run.steps.push(StepRecord {
            step_index: run.cursor,
            module_id: step.module_id.clone(),
            task_id,
            outcome,
            error_message: Some(message.to_string()),
            recorded_at: Utc::now(),
        });
        if !soft_fail {
            run.state = ChainRunState::Failed;
        }
    }

    async fn validate_eligibility(&self, run: &ChainRun, file_type: FileType) -> Option<(usize, String)> {
        for (i, step) in run.chain_snapshot.steps.iter().enumerate() {
            if let Err(e) = self.registry.select(&step.module_id, file_type).await {
                return Some((i, e.message));
            }
        }
        None
    }

    fn fail_up_front(&self, run: &mut ChainRun, failing_index: usize, message: &str) {
        let now = Utc::now();
        for (i, step) in run.chain_snapshot.steps.iter().enumerate() {
            let outcome = if i == failing_index {
                StepOutcome::Failed
            } else {
                StepOutcome::Skipped
            };
            run.steps.push(StepRecord {
                step_index: i,
                module_id: step.module_id.clone(),
                task_id: None,
                outcome,
                error_message: if i == failing_index { Some(message.to_string()) } else { None },
                recorded_at: now,
            });
        }
        run.state = ChainRunState::Failed;
        run.finished_at = Some(now);
    }

    async fn persist(
        &self,
        run: &ChainRun,
        results: &BTreeMap<String, modscan_core::ModuleResult>,
    ) -> Result<(), ModscanError> {
        let snapshot = ChainRunSnapshot {
            run: run.clone(),
            results: results.clone(),
        };
        self.reports.put_chain_run_state(run.fingerprint, run.chain_run_id, snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modscan_chains::InMemoryChainStore;
    use modscan_core::ModuleResult;
    use modscan_queue::MemoryQueuePlane;
    use modscan_registry::MockContainerDriver;
    use std::collections::HashSet as StdHashSet;
    use std::io::Write as _;

    async fn test_registry(module_id: &str, input_formats: &[FileType]) -> (tempfile::TempDir, ModuleRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let module_dir = dir.path().join(module_id);
        std::fs::create_dir_all(&module_dir).unwrap();
        let formats: Vec<String> = input_formats.iter().map(|f| format!("\"{}\"", f.as_str())).collect();
        let mut f = std::fs::File::create(module_dir.join("module.toml")).unwrap();
        writeln!(
            f,
            "name = \"{module_id}\"\nversion = \"1.0.0\"\nauthor = \"test\"\ninput_formats = [{}]",
            formats.join(", ")
        )
        .unwrap();
        let registry = ModuleRegistry::new(
            dir.path().to_path_buf(),
            Arc::new(MockContainerDriver::always_succeeds()),
            3,
            Arc::new(MemoryQueuePlane::new()),
        );
        registry.bootstrap().await.unwrap();
        (dir, registry)
    }

    async fn test_executor(module_id: &str, input_formats: &[FileType]) -> (tempfile::TempDir, tempfile::TempDir, ChainExecutor) {
        let (modules_dir, registry) = test_registry(module_id, input_formats).await;
        let report_dir = tempfile::tempdir().unwrap();
        let reports = ReportStore::new(report_dir.path()).await.unwrap();
        let chains = Arc::new(InMemoryChainStore::new());
        let queue = Arc::new(MemoryQueuePlane::new());
        let executor = ChainExecutor::new(queue, registry, chains, reports, 1, 1);
        (modules_dir, report_dir, executor)
    }

    async fn seed_report(executor: &ChainExecutor, fingerprint: Fingerprint) {
        let artifact = modscan_core::Artifact {
            fingerprint,
            original_name: "app.apk".into(),
            aliases: Vec::new(),
            size: 10,
            detected_type: FileType::Apk,
            ingested_at: Utc::now(),
            extracted_root: format!("{}/tree", fingerprint.to_hex()),
        };
        executor.reports.ensure_report(&artifact).await.unwrap();
    }

    #[tokio::test]
    async fn single_module_run_completes_on_success() {
        let (_mdir, _rdir, executor) = test_executor("permissions", &[FileType::Apk]).await;
        let fp = Fingerprint::of(b"app-one");
        seed_report(&executor, fp).await;

        let handle = executor
            .start(ChainRunRequest {
                target: ChainTarget::Module("permissions".into()),
                fingerprint: fp,
                extracted_root: "tree".into(),
                file_type: FileType::Apk,
            })
            .await
            .unwrap();
        let chain_run_id = handle.chain_run_id();

        // drive the worker side: pop the task, publish a success result.
        let popped = executor
            .queue
            .pop("permissions", StdDuration::from_millis(200))
            .await
            .unwrap()
            .expect("task should have been enqueued");
        let task = executor.queue.fetch_task(popped).await.unwrap().unwrap();
        executor
            .queue
            .publish_result(
                "permissions",
                fp,
                ResultEnvelope {
                    task_id: task.task_id,
                    result: ModuleResult {
                        contract_version: "modscan/v1".into(),
                        module_id: "permissions".into(),
                        module_version: "1.0.0".into(),
                        task_id: task.task_id,
                        completed_at: Utc::now(),
                        status: modscan_core::ModuleResultStatus::Success,
                        error_message: None,
                        findings: Vec::new(),
                        summary: modscan_core::Summary::default(),
                    },
                },
            )
            .await
            .unwrap();

        handle.join().await;

        let report = executor.reports.get_report(fp).await.unwrap();
        let snapshot = &report.chain_runs[&chain_run_id];
        assert_eq!(snapshot.run.state, ChainRunState::Completed);
        assert!(report.modules.contains_key("permissions"));
    }

    #[tokio::test]
    async fn ineligible_module_fails_before_enqueue() {
        let (_mdir, _rdir, executor) = test_executor("permissions", &[FileType::Ipa]).await;
        let fp = Fingerprint::of(b"app-two");
        seed_report(&executor, fp).await;

        let handle = executor
            .start(ChainRunRequest {
                target: ChainTarget::Module("permissions".into()),
                fingerprint: fp,
                extracted_root: "tree".into(),
                file_type: FileType::Apk,
            })
            .await
            .unwrap();
        let chain_run_id = handle.chain_run_id();
        handle.join().await;

        let report = executor.reports.get_report(fp).await.unwrap();
        let snapshot = &report.chain_runs[&chain_run_id];
        assert_eq!(snapshot.run.state, ChainRunState::Failed);
        assert_eq!(snapshot.run.steps.len(), 1);
        assert_eq!(snapshot.run.steps[0].outcome, StepOutcome::Failed);
    }

    #[tokio::test]
    async fn soft_fail_step_advances_to_next_step() {
        let (_mdir, _rdir, executor) = test_executor("permissions", &[FileType::Apk]).await;
        let fp = Fingerprint::of(b"app-three");
        seed_report(&executor, fp).await;

        let chain = Chain {
            name: "soft".into(),
            description: String::new(),
            steps: vec![
                ChainStep {
                    module_id: "permissions".into(),
                    order: 1,
                    parameters: serde_json::Value::Null,
                    soft_fail: true,
                    timeout_secs: Some(1),
                },
                ChainStep {
                    module_id: "permissions".into(),
                    order: 2,
                    parameters: serde_json::Value::Null,
                    soft_fail: false,
                    timeout_secs: Some(1),
                },
            ],
        };
        let known: StdHashSet<String> = ["permissions".to_string()].into_iter().collect();
        executor.chains.put_chain(chain, &known).await.unwrap();

        let handle = executor
            .start(ChainRunRequest {
                target: ChainTarget::Chain("soft".into()),
                fingerprint: fp,
                extracted_root: "tree".into(),
                file_type: FileType::Apk,
            })
            .await
            .unwrap();
        let chain_run_id = handle.chain_run_id();

        // First step: let it time out (soft_fail = true), nothing published.
        // Second step: publish success so the run completes.
        let first_task_id = executor
            .queue
            .pop("permissions", StdDuration::from_millis(200))
            .await
            .unwrap()
            .expect("first task enqueued");
        let _ = first_task_id;

        let second_task_id = loop {
            if let Some(id) = executor.queue.pop("permissions", StdDuration::from_millis(2500)).await.unwrap() {
                break id;
            }
        };
        let second_task = executor.queue.fetch_task(second_task_id).await.unwrap().unwrap();
        executor
            .queue
            .publish_result(
                "permissions",
                fp,
                ResultEnvelope {
                    task_id: second_task.task_id,
                    result: ModuleResult {
                        contract_version: "modscan/v1".into(),
                        module_id: "permissions".into(),
                        module_version: "1.0.0".into(),
                        task_id: second_task.task_id,
                        completed_at: Utc::now(),
                        status: modscan_core::ModuleResultStatus::Success,
                        error_message: None,
                        findings: Vec::new(),
                        summary: modscan_core::Summary::default(),
                    },
                },
            )
            .await
            .unwrap();

        handle.join().await;

        let report = executor.reports.get_report(fp).await.unwrap();
        let snapshot = &report.chain_runs[&chain_run_id];
        assert_eq!(snapshot.run.state, ChainRunState::Completed);
        assert_eq!(snapshot.run.steps.len(), 2);
        assert_eq!(snapshot.run.steps[0].outcome, StepOutcome::TimedOut);
        assert_eq!(snapshot.run.steps[1].outcome, StepOutcome::Completed);
    }

    #[tokio::test]
    async fn cancel_stops_the_run_without_advancing() {
        let (_mdir, _rdir, executor) = test_executor("permissions", &[FileType::Apk]).await;
        let fp = Fingerprint::of(b"app-four");
        seed_report(&executor, fp).await;

        let handle = executor
            .start(ChainRunRequest {
                target: ChainTarget::Module("permissions".into()),
                fingerprint: fp,
                extracted_root: "tree".into(),
                file_type: FileType::Apk,
            })
            .await
            .unwrap();
        let chain_run_id = handle.chain_run_id();

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        handle.cancel();
        handle.join().await;

        let report = executor.reports.get_report(fp).await.unwrap();
        let snapshot = &report.chain_runs[&chain_run_id];
        assert_eq!(snapshot.run.state, ChainRunState::Cancelled);
    }
}
