// SPDX-License-Identifier: MIT OR Apache-2.0
//! modscan-registry
#![warn(missing_docs)]
//!
//! The module registry (C4): discovers internal modules, owns their
//! container lifecycle, accepts external module registrations, probes
//! health in the background, and answers eligibility queries for the
//! dispatcher and executor.

/// Container build/start/stop seam.
pub mod driver;
/// Directory scanning for internal module manifests.
pub mod discovery;
/// Background health probing.
pub mod health;

use chrono::Utc;
use modscan_core::module::{ExternalSpec, InternalSpec, ModuleSpec};
use modscan_core::{ContainerState, FileType, ModuleDescriptor, ModuleKind};
use modscan_error::{ErrorKind, ModscanError};
use modscan_queue::QueuePlane;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub use driver::{ContainerDriver, MockContainerDriver, ProcessContainerDriver};

/// Key a descriptor is stored under: `(kind, id)` is unique per spec §3.
pub type RegistryKey = (ModuleKind, String);

/// Shared, mutable catalog of known modules plus their container lifecycle.
///
/// Cheaply [`Clone`]able; every clone shares the same underlying state, the
/// same pattern the teacher uses for its `Arc<RwLock<HashMap<...>>>`
/// runtime state.
#[derive(Clone)]
pub struct ModuleRegistry {
    inner: Arc<RwLock<HashMap<RegistryKey, ModuleDescriptor>>>,
    driver: Arc<dyn ContainerDriver>,
    modules_dir: PathBuf,
    n_build_retries: u32,
    http_client: reqwest::Client,
    queue: Arc<dyn QueuePlane>,
}

impl ModuleRegistry {
    /// Build an empty registry. Call [`Self::bootstrap`] to discover and
    /// auto-activate internal modules.
    ///
    /// `queue` backs the health probe's heartbeat ping (spec §4.4) against
    /// internal modules, on top of their container state.
    #[must_use]
    pub fn new(
        modules_dir: PathBuf,
        driver: Arc<dyn ContainerDriver>,
        n_build_retries: u32,
        queue: Arc<dyn QueuePlane>,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
            driver,
            modules_dir,
            n_build_retries,
            http_client: reqwest::Client::new(),
            queue,
        }
    }

    /// Scan the configured modules directory and register every discovered
    /// internal module, building and starting those with `autostart: true`.
    ///
    /// Per-module build/start failures are logged and leave that module in
    /// `Failed` state rather than aborting the whole bootstrap.
    pub async fn bootstrap(&self) -> Result<(), ModscanError> {
        let descriptors = discovery::scan_modules_dir(&self.modules_dir).await?;
        let autostart_ids: Vec<String> = descriptors
            .iter()
            .filter(|d| {
                matches!(&d.spec, ModuleSpec::Internal(InternalSpec { autostart: true, .. }))
            })
            .map(|d| d.id.clone())
            .collect();

        {
            let mut guard = self.inner.write().await;
            for descriptor in descriptors {
                guard.insert((ModuleKind::Internal, descriptor.id.clone()), descriptor);
            }
        }

        for module_id in autostart_ids {
            if let Err(e) = self.build(&module_id).await {
                tracing::warn!(module_id, error = %e, "autostart build failed");
                continue;
            }
            if let Err(e) = self.start(&module_id).await {
                tracing::warn!(module_id, error = %e, "autostart start failed");
            }
        }

        Ok(())
    }

    /// Register an externally hosted module. Externals have no container
    /// lifecycle; they start out unhealthy until the first successful probe.
    pub async fn register_external(
        &self,
        id: String,
        name: String,
        version: String,
        author: String,
        description: String,
        input_formats: impl IntoIterator<Item = FileType>,
        base_url: String,
        healthcheck_url: String,
    ) -> Result<ModuleDescriptor, ModscanError> {
        let key = (ModuleKind::External, id.clone());
        let mut guard = self.inner.write().await;
        if guard.contains_key(&key) {
            return Err(ModscanError::new(ErrorKind::IllegalState, "module already registered")
                .with_context("module_id", &id));
        }
        let descriptor = ModuleDescriptor {
            id,
            name,
            version,
            author,
            description,
            input_formats: input_formats.into_iter().collect(),
            active: true,
            healthy: false,
            spec: ModuleSpec::External(ExternalSpec {
                base_url,
                healthcheck_url,
                last_seen_at: None,
            }),
        };
        guard.insert(key, descriptor.clone());
        Ok(descriptor)
    }

    /// Remove a module from the catalog. For internal modules the caller is
    /// responsible for stopping the container first; deregistration does not
    /// stop a running container.
    pub async fn deregister(&self, kind: ModuleKind, module_id: &str) -> Result<(), ModscanError> {
        let mut guard = self.inner.write().await;
        guard
            .remove(&(kind, module_id.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found(module_id))
    }

    /// Build an internal module's container image, retrying up to
    /// `n_build_retries` times with linear backoff before pinning the
    /// module to [`ContainerState::Failed`].
    pub async fn build(&self, module_id: &str) -> Result<(), ModscanError> {
        self.set_state(module_id, ContainerState::Building).await?;

        let image_ref = self.image_ref(module_id).await?;
        let context_dir = driver::module_context_dir(&self.modules_dir, module_id);

        let mut attempt = 0;
        loop {
            match self.driver.build(&image_ref, &context_dir).await {
                Ok(()) => {
                    self.set_state(module_id, ContainerState::Stopped).await?;
                    return Ok(());
                }
                Err(e) if attempt < self.n_build_retries => {
                    attempt += 1;
                    tracing::warn!(module_id, attempt, error = %e, "build failed, retrying");
                    tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
                }
                Err(e) => {
                    self.set_state(module_id, ContainerState::Failed).await?;
                    return Err(e.with_context("module_id", module_id));
                }
            }
        }
    }

    /// Start a built internal module's container.
    pub async fn start(&self, module_id: &str) -> Result<(), ModscanError> {
        let image_ref = self.image_ref(module_id).await?;
        match self.driver.start(&image_ref).await {
            Ok(()) => self.set_state(module_id, ContainerState::Running).await,
            Err(e) => {
                self.set_state(module_id, ContainerState::Failed).await?;
                Err(e.with_context("module_id", module_id))
            }
        }
    }

    /// Stop a running internal module's container.
    pub async fn stop(&self, module_id: &str) -> Result<(), ModscanError> {
        let image_ref = self.image_ref(module_id).await?;
        self.driver.stop(&image_ref).await?;
        self.set_state(module_id, ContainerState::Stopped).await
    }

    /// Operator-driven recovery for a module stuck in `Failed`: stop (best
    /// effort), rebuild, and start again. Modeled as caller-driven
    /// sequencing rather than a single state transition, per spec §4.4.
    pub async fn rebuild(&self, module_id: &str) -> Result<(), ModscanError> {
        let image_ref = self.image_ref(module_id).await?;
        let _ = self.driver.stop(&image_ref).await;
        self.build(module_id).await?;
        self.start(module_id).await
    }

    /// Resolve the module eligible to run against `file_type`: known,
    /// active, healthy, and declaring support for that type.
    pub async fn select(&self, module_id: &str, file_type: FileType) -> Result<ModuleDescriptor, ModscanError> {
        let guard = self.inner.read().await;
        let descriptor = guard
            .iter()
            .find(|((_, id), _)| id == module_id)
            .map(|(_, d)| d.clone())
            .ok_or_else(|| not_found(module_id))?;

        if !descriptor.is_eligible() {
            return Err(ModscanError::new(ErrorKind::Unavailable, "module is not active and healthy")
                .with_context("module_id", module_id));
        }
        if !descriptor.accepts(file_type) {
            return Err(
                ModscanError::new(ErrorKind::InvalidInput, "module does not accept this file type")
                    .with_context("module_id", module_id)
                    .with_context("file_type", file_type.as_str()),
            );
        }
        Ok(descriptor)
    }

    /// Snapshot of every known module, for catalog listing endpoints.
    pub async fn list(&self) -> Vec<ModuleDescriptor> {
        self.inner.read().await.values().cloned().collect()
    }

    /// Run one health-probe pass over every external module and update
    /// internal modules' health from their container state.
    pub async fn probe_health_once(&self, tracker: &mut health::HealthTracker) {
        let mut descriptors: Vec<ModuleDescriptor> = self.inner.read().await.values().cloned().collect();
        health::probe_all(&self.http_client, self.queue.as_ref(), tracker, &mut descriptors).await;

        let mut guard = self.inner.write().await;
        for descriptor in descriptors {
            if let Some(existing) = guard.get_mut(&(descriptor.kind(), descriptor.id.clone())) {
                *existing = descriptor;
            }
        }
    }

    /// Spawn the background health-probe loop, returning its join handle.
    /// The loop runs until the returned handle is aborted or dropped.
    #[must_use]
    pub fn spawn_health_probe_task(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut tracker = health::HealthTracker::new();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                registry.probe_health_once(&mut tracker).await;
            }
        })
    }

    async fn image_ref(&self, module_id: &str) -> Result<String, ModscanError> {
        let guard = self.inner.read().await;
        match guard.get(&(ModuleKind::Internal, module_id.to_string())) {
            Some(ModuleDescriptor {
                spec: ModuleSpec::Internal(InternalSpec { image_ref, .. }),
                ..
            }) => Ok(image_ref.clone()),
            Some(_) => Err(ModscanError::new(ErrorKind::InvalidInput, "module is not internal")
                .with_context("module_id", module_id)),
            None => Err(not_found(module_id)),
        }
    }

    async fn set_state(&self, module_id: &str, next: ContainerState) -> Result<(), ModscanError> {
        let mut guard = self.inner.write().await;
        let descriptor = guard
            .get_mut(&(ModuleKind::Internal, module_id.to_string()))
            .ok_or_else(|| not_found(module_id))?;
        let ModuleSpec::Internal(internal) = &mut descriptor.spec else {
            return Err(ModscanError::new(ErrorKind::InvalidInput, "module is not internal")
                .with_context("module_id", module_id));
        };
        if !internal.container_state.can_transition_to(next) {
            return Err(ModscanError::new(ErrorKind::IllegalState, "illegal container state transition")
                .with_context("module_id", module_id)
                .with_context("from", format!("{:?}", internal.container_state))
                .with_context("to", format!("{next:?}")));
        }
        internal.container_state = next;
        descriptor.healthy = health::internal_health(next);
        Ok(())
    }
}

fn not_found(module_id: &str) -> ModscanError {
    ModscanError::new(ErrorKind::NotFound, "module not found").with_context("module_id", module_id)
}
