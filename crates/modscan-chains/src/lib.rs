// SPDX-License-Identifier: MIT OR Apache-2.0
//! modscan-chains
#![warn(missing_docs)]
//!
//! The Chain Definition Store (C5): CRUD over named, ordered module
//! sequences, persisted independently of any in-flight [`ChainRun`](modscan_core::ChainRun)
//! (a run holds its own snapshot, so deleting a chain it references is
//! always legal).

use modscan_core::validate::{normalize_step_order, validate_chain};
use modscan_core::Chain;
use modscan_error::{ErrorKind, ModscanError};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// CRUD operations over named chain definitions.
///
/// `put_chain` is given a snapshot of currently known module ids (internal
/// and external) so it can validate step references without depending on
/// `modscan-registry` directly — the registry snapshot is the caller's
/// responsibility to gather, keeping this crate free of a circular
/// dependency.
#[async_trait::async_trait]
pub trait ChainStore: Send + Sync {
    /// Create or replace a chain by name. Validates name non-empty, steps
    /// non-empty, every step's `module_id` present in `known_module_ids`,
    /// and normalizes step `order` to a dense `1..N` sequence before
    /// persisting.
    async fn put_chain(&self, chain: Chain, known_module_ids: &HashSet<String>) -> Result<(), ModscanError>;
    /// Fetch a chain by name.
    async fn get_chain(&self, name: &str) -> Result<Chain, ModscanError>;
    /// Delete a chain by name. Always legal, even if an in-flight
    /// `ChainRun` references it — the run holds its own snapshot.
    async fn delete_chain(&self, name: &str) -> Result<(), ModscanError>;
    /// List every known chain, ordered by name.
    async fn list_chains(&self) -> Result<Vec<Chain>, ModscanError>;
}

fn validate_module_refs(chain: &Chain, known_module_ids: &HashSet<String>) -> Result<(), ModscanError> {
    for step in &chain.steps {
        if !known_module_ids.contains(&step.module_id) {
            return Err(
                ModscanError::new(ErrorKind::InvalidInput, "chain step references unknown module")
                    .with_context("chain_name", &chain.name)
                    .with_context("module_id", &step.module_id),
            );
        }
    }
    Ok(())
}

/// In-memory chain store, backing unit tests and embedded (single-process)
/// deployments that don't need chain definitions to survive a restart.
#[derive(Clone, Default)]
pub struct InMemoryChainStore {
    chains: Arc<RwLock<BTreeMap<String, Chain>>>,
}

impl InMemoryChainStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ChainStore for InMemoryChainStore {
    async fn put_chain(&self, mut chain: Chain, known_module_ids: &HashSet<String>) -> Result<(), ModscanError> {
        validate_chain(&chain).map_err(|e| {
            ModscanError::new(ErrorKind::InvalidInput, e.to_string()).with_context("chain_name", &chain.name)
        })?;
        validate_module_refs(&chain, known_module_ids)?;
        normalize_step_order(&mut chain.steps);

        let mut guard = self.chains.write().await;
        guard.insert(chain.name.clone(), chain);
        Ok(())
    }

    async fn get_chain(&self, name: &str) -> Result<Chain, ModscanError> {
        self.chains
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(name))
    }

    async fn delete_chain(&self, name: &str) -> Result<(), ModscanError> {
        self.chains
            .write()
            .await
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(name))
    }

    async fn list_chains(&self) -> Result<Vec<Chain>, ModscanError> {
        Ok(self.chains.read().await.values().cloned().collect())
    }
}

/// File-backed chain store: one JSON file per chain under `root`, written
/// with the tmp-then-rename discipline used throughout the store/report
/// crates so a crash mid-write never leaves a half-written definition.
#[derive(Clone)]
pub struct FileChainStore {
    root: PathBuf,
}

impl FileChainStore {
    /// Open (creating if absent) a file-backed store rooted at `root`.
    pub fn new(root: PathBuf) -> Result<Self, ModscanError> {
        std::fs::create_dir_all(&root)
            .map_err(|e| ModscanError::new(ErrorKind::Internal, "failed to create chain store root").with_source(e))?;
        Ok(Self { root })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize(name)))
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

fn not_found(name: &str) -> ModscanError {
    ModscanError::new(ErrorKind::NotFound, "chain not found").with_context("chain_name", name)
}

#[async_trait::async_trait]
impl ChainStore for FileChainStore {
    async fn put_chain(&self, mut chain: Chain, known_module_ids: &HashSet<String>) -> Result<(), ModscanError> {
        validate_chain(&chain).map_err(|e| {
            ModscanError::new(ErrorKind::InvalidInput, e.to_string()).with_context("chain_name", &chain.name)
        })?;
        validate_module_refs(&chain, known_module_ids)?;
        normalize_step_order(&mut chain.steps);

        let path = self.path_for(&chain.name);
        let tmp_path = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(&chain)
            .map_err(|e| ModscanError::new(ErrorKind::Internal, "failed to serialize chain").with_source(e))?;
        tokio::fs::write(&tmp_path, &body)
            .await
            .map_err(|e| ModscanError::new(ErrorKind::Internal, "failed to write chain").with_source(e))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| ModscanError::new(ErrorKind::Internal, "failed to persist chain").with_source(e))?;
        Ok(())
    }

    async fn get_chain(&self, name: &str) -> Result<Chain, ModscanError> {
        let path = self.path_for(name);
        let body = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                not_found(name)
            } else {
                ModscanError::new(ErrorKind::Internal, "failed to read chain").with_source(e)
            }
        })?;
        serde_json::from_slice(&body)
            .map_err(|e| ModscanError::new(ErrorKind::Internal, "failed to parse chain").with_source(e))
    }

    async fn delete_chain(&self, name: &str) -> Result<(), ModscanError> {
        let path = self.path_for(name);
        tokio::fs::remove_file(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                not_found(name)
            } else {
                ModscanError::new(ErrorKind::Internal, "failed to delete chain").with_source(e)
            }
        })
    }

    async fn list_chains(&self) -> Result<Vec<Chain>, ModscanError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| ModscanError::new(ErrorKind::Internal, "failed to list chains").with_source(e))?;
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ModscanError::new(ErrorKind::Internal, "failed to iterate chains").with_source(e))?
        {
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();

        let mut chains = Vec::with_capacity(names.len());
        for stem in names {
            // file_stem of "foo.json" round-trips to the sanitized name, not
            // necessarily the original; chains are looked up by their own
            // `name` field inside the file, which is authoritative.
            let path = self.root.join(format!("{stem}.json"));
            let body = tokio::fs::read(&path)
                .await
                .map_err(|e| ModscanError::new(ErrorKind::Internal, "failed to read chain").with_source(e))?;
            let chain: Chain = serde_json::from_slice(&body)
                .map_err(|e| ModscanError::new(ErrorKind::Internal, "failed to parse chain").with_source(e))?;
            chains.push(chain);
        }
        Ok(chains)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modscan_core::ChainStep;

    fn chain(name: &str, module_ids: &[&str]) -> Chain {
        Chain {
            name: name.to_string(),
            description: String::new(),
            steps: module_ids
                .iter()
                .enumerate()
                .map(|(i, id)| ChainStep {
                    module_id: (*id).to_string(),
                    order: (i as u32) + 1,
                    parameters: serde_json::Value::Null,
                    soft_fail: false,
                    timeout_secs: None,
                })
                .collect(),
        }
    }

    fn known(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn in_memory_put_then_get_roundtrips() {
        let store = InMemoryChainStore::new();
        store.put_chain(chain("full-scan", &["permissions", "strings"]), &known(&["permissions", "strings"])).await.unwrap();

        let fetched = store.get_chain("full-scan").await.unwrap();
        assert_eq!(fetched.steps.len(), 2);
        assert_eq!(fetched.steps[0].order, 1);
        assert_eq!(fetched.steps[1].order, 2);
    }

    #[tokio::test]
    async fn put_rejects_unknown_module_reference() {
        let store = InMemoryChainStore::new();
        let err = store
            .put_chain(chain("full-scan", &["nonexistent"]), &known(&["permissions"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn put_normalizes_out_of_order_steps() {
        let mut c = chain("scan", &["a", "b", "c"]);
        c.steps[0].order = 50;
        c.steps[1].order = 10;
        c.steps[2].order = 99;

        let store = InMemoryChainStore::new();
        store.put_chain(c, &known(&["a", "b", "c"])).await.unwrap();

        let fetched = store.get_chain("scan").await.unwrap();
        let orders: Vec<u32> = fetched.steps.iter().map(|s| s.order).collect();
        assert_eq!(orders, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn delete_is_unconditional() {
        let store = InMemoryChainStore::new();
        store.put_chain(chain("scan", &["a"]), &known(&["a"])).await.unwrap();
        store.delete_chain("scan").await.unwrap();
        assert!(store.get_chain("scan").await.is_err());
    }

    #[tokio::test]
    async fn delete_unknown_chain_is_not_found() {
        let store = InMemoryChainStore::new();
        let err = store.delete_chain("nonexistent").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn list_chains_is_sorted_by_name() {
        let store = InMemoryChainStore::new();
        store.put_chain(chain("zeta", &["a"]), &known(&["a"])).await.unwrap();
        store.put_chain(chain("alpha", &["a"]), &known(&["a"])).await.unwrap();

        let names: Vec<String> = store.list_chains().await.unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[tokio::test]
    async fn file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChainStore::new(dir.path().to_path_buf()).unwrap();
        store.put_chain(chain("scan", &["a"]), &known(&["a"])).await.unwrap();

        let reopened = FileChainStore::new(dir.path().to_path_buf()).unwrap();
        let fetched = reopened.get_chain("scan").await.unwrap();
        assert_eq!(fetched.name, "scan");
    }

    #[tokio::test]
    async fn file_store_get_unknown_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileChainStore::new(dir.path().to_path_buf()).unwrap();
        let err = store.get_chain("nonexistent").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
