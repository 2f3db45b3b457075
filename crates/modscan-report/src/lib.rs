// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-fingerprint report storage (C2): one JSON file per artifact holding
//! every module result and chain-run snapshot produced against it.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use modscan_core::chain::ChainRunSnapshot;
use modscan_core::{Artifact, Fingerprint, ModuleResult};
use modscan_error::{ErrorKind, ModscanError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A fingerprint's accumulated analysis state: artifact metadata, the
/// latest result per module, and every chain run ever started against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    /// Metadata for the artifact this report belongs to.
    pub artifact_meta: Artifact,
    /// Latest result per module id. Overwritten (never merged) on re-run.
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleResult>,
    /// Every chain run started against this artifact, keyed by
    /// `chain_run_id`.
    #[serde(default)]
    pub chain_runs: BTreeMap<Uuid, ChainRunSnapshot>,
}

/// File-backed store of [`Report`]s, one JSON file per fingerprint.
///
/// Every write is a whole-file atomic replace (write to `.tmp`, rename) —
/// there is no partial update path. Enforcing a single writer per
/// `(fingerprint, module_id)` at any instant is the executor's
/// responsibility; this store only guarantees that whatever it persists
/// is never a torn file.
#[derive(Debug, Clone)]
pub struct ReportStore {
    root: PathBuf,
}

impl ReportStore {
    /// Open a report store rooted at `root`, creating the directory if
    /// needed.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, ModscanError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            ModscanError::new(ErrorKind::Internal, "failed to create report store root").with_source(e)
        })?;
        Ok(Self { root })
    }

    fn path_for(&self, fingerprint: Fingerprint) -> PathBuf {
        self.root.join(format!("{}.json", fingerprint.to_hex()))
    }

    /// Create an empty report for `artifact` if one does not already
    /// exist. Idempotent: called once per ingestion.
    pub async fn ensure_report(&self, artifact: &Artifact) -> Result<(), ModscanError> {
        let path = self.path_for(artifact.fingerprint);
        if path.exists() {
            return Ok(());
        }
        let report = Report {
            artifact_meta: artifact.clone(),
            modules: BTreeMap::new(),
            chain_runs: BTreeMap::new(),
        };
        self.write(&path, &report).await
    }

    /// Fetch the report for `fingerprint`.
    pub async fn get_report(&self, fingerprint: Fingerprint) -> Result<Report, ModscanError> {
        self.read(&self.path_for(fingerprint)).await
    }

    /// Record (replacing any prior value) the latest result for
    /// `module_id` against `fingerprint`.
    pub async fn put_module_result(
        &self,
        fingerprint: Fingerprint,
        module_id: &str,
        result: ModuleResult,
    ) -> Result<(), ModscanError> {
        let path = self.path_for(fingerprint);
        let mut report = self.read(&path).await?;
        report.modules.insert(module_id.to_string(), result);
        self.write(&path, &report).await
    }

    /// Record (replacing any prior value for the same `chain_run_id`) a
    /// chain run's current snapshot against `fingerprint`.
    pub async fn put_chain_run_state(
        &self,
        fingerprint: Fingerprint,
        chain_run_id: Uuid,
        snapshot: ChainRunSnapshot,
    ) -> Result<(), ModscanError> {
        let path = self.path_for(fingerprint);
        let mut report = self.read(&path).await?;
        report.chain_runs.insert(chain_run_id, snapshot);
        self.write(&path, &report).await
    }

    /// List artifact fingerprints known to this store, one page at a time.
    ///
    /// `page` is 0-based; `size` is the page length. Fingerprints are
    /// returned in lexicographic (hex) order, which is stable across calls
    /// as long as no artifact is evicted mid-pagination.
    pub async fn list_artifacts(&self, page: usize, size: usize) -> Result<Vec<Fingerprint>, ModscanError> {
        let mut entries = tokio::fs::read_dir(&self.root).await.map_err(|e| {
            ModscanError::new(ErrorKind::Internal, "failed to read report store directory").with_source(e)
        })?;

        let mut hexes = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            ModscanError::new(ErrorKind::Internal, "failed to iterate report store directory").with_source(e)
        })? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    hexes.push(stem.to_string());
                }
            }
        }
        hexes.sort();

        Ok(hexes
            .into_iter()
            .skip(page * size)
            .take(size)
            .filter_map(|h| Fingerprint::parse(&h).ok())
            .collect())
    }

    async fn read(&self, path: &Path) -> Result<Report, ModscanError> {
        if !path.exists() {
            return Err(ModscanError::new(ErrorKind::NotFound, "no report for this fingerprint"));
        }
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            ModscanError::new(ErrorKind::Internal, "failed to read report").with_source(e)
        })?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ModscanError::new(ErrorKind::Internal, "corrupt report file").with_source(e))
    }

    async fn write(&self, path: &Path, report: &Report) -> Result<(), ModscanError> {
        let json = serde_json::to_vec_pretty(report)
            .map_err(|e| ModscanError::new(ErrorKind::Internal, "failed to serialize report").with_source(e))?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(|e| {
            ModscanError::new(ErrorKind::Internal, "failed to stage report").with_source(e)
        })?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            ModscanError::new(ErrorKind::Internal, "failed to finalize report").with_source(e)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use modscan_core::FileType;

    fn artifact(fingerprint: Fingerprint) -> Artifact {
        Artifact {
            fingerprint,
            original_name: "app.apk".into(),
            aliases: Vec::new(),
            size: 1024,
            detected_type: FileType::Apk,
            ingested_at: Utc::now(),
            extracted_root: format!("{}/tree", fingerprint.to_hex()),
        }
    }

    #[tokio::test]
    async fn ensure_report_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path()).await.unwrap();
        let fp = Fingerprint::of(b"one");
        let artifact = artifact(fp);

        store.ensure_report(&artifact).await.unwrap();
        store
            .put_module_result(fp, "permissions", ModuleResult::error("permissions", "1.0.0", Uuid::new_v4(), "boom"))
            .await
            .unwrap();
        store.ensure_report(&artifact).await.unwrap();

        let report = store.get_report(fp).await.unwrap();
        assert!(report.modules.contains_key("permissions"));
    }

    #[tokio::test]
    async fn put_module_result_overwrites_prior_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path()).await.unwrap();
        let fp = Fingerprint::of(b"two");
        store.ensure_report(&artifact(fp)).await.unwrap();

        store
            .put_module_result(fp, "permissions", ModuleResult::error("permissions", "1.0.0", Uuid::new_v4(), "first"))
            .await
            .unwrap();
        store
            .put_module_result(fp, "permissions", ModuleResult::error("permissions", "1.0.0", Uuid::new_v4(), "second"))
            .await
            .unwrap();

        let report = store.get_report(fp).await.unwrap();
        assert_eq!(report.modules.len(), 1);
        assert_eq!(
            report.modules["permissions"].error_message.as_deref(),
            Some("second")
        );
    }

    #[tokio::test]
    async fn get_report_on_unknown_fingerprint_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path()).await.unwrap();
        let err = store.get_report(Fingerprint::of(b"never")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn list_artifacts_paginates_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = ReportStore::new(dir.path()).await.unwrap();
        for i in 0..5u8 {
            store.ensure_report(&artifact(Fingerprint::of(&[i]))).await.unwrap();
        }

        let page0 = store.list_artifacts(0, 2).await.unwrap();
        let page1 = store.list_artifacts(1, 2).await.unwrap();
        assert_eq!(page0.len(), 2);
        assert_eq!(page1.len(), 2);
        assert_ne!(page0, page1);
    }
}
