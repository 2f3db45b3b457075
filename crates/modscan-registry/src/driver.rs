// SPDX-License-Identifier: MIT OR Apache-2.0
//! The container lifecycle is modeled behind a trait so the registry's
//! state machine is testable without a real container runtime — the same
//! seam the teacher repo uses to abstract a sidecar process behind a
//! `Backend` trait.

use async_trait::async_trait;
use modscan_error::{ErrorKind, ModscanError};
use std::path::{Path, PathBuf};
use std::process::Stdio;

/// Builds, starts, and stops a single container image.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Build `image_ref` from the module's directory.
    async fn build(&self, image_ref: &str, context_dir: &Path) -> Result<(), ModscanError>;
    /// Start a container from `image_ref`.
    async fn start(&self, image_ref: &str) -> Result<(), ModscanError>;
    /// Stop the running container for `image_ref`.
    async fn stop(&self, image_ref: &str) -> Result<(), ModscanError>;
}

/// Shells out to the `docker` CLI.
#[derive(Debug, Clone, Default)]
pub struct ProcessContainerDriver;

impl ProcessContainerDriver {
    async fn run(&self, args: &[&str]) -> Result<(), ModscanError> {
        let output = tokio::process::Command::new("docker")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                ModscanError::new(ErrorKind::Unavailable, "failed to spawn docker").with_source(e)
            })?;
        if output.status.success() {
            return Ok(());
        }
        Err(
            ModscanError::new(ErrorKind::Internal, "docker command failed")
                .with_context("args", args.join(" "))
                .with_context("stderr", String::from_utf8_lossy(&output.stderr).to_string()),
        )
    }
}

#[async_trait]
impl ContainerDriver for ProcessContainerDriver {
    async fn build(&self, image_ref: &str, context_dir: &Path) -> Result<(), ModscanError> {
        self.run(&["build", "-t", image_ref, &context_dir.display().to_string()])
            .await
    }

    async fn start(&self, image_ref: &str) -> Result<(), ModscanError> {
        self.run(&["run", "-d", "--rm", "--name", image_ref, image_ref]).await
    }

    async fn stop(&self, image_ref: &str) -> Result<(), ModscanError> {
        self.run(&["stop", image_ref]).await
    }
}

/// In-memory driver for registry unit tests.
///
/// Each operation can be scripted to fail a fixed number of times before
/// succeeding, so callers can exercise the retry/backoff path
/// deterministically.
pub struct MockContainerDriver {
    build_failures_remaining: tokio::sync::Mutex<u32>,
}

impl MockContainerDriver {
    /// Always succeeds.
    #[must_use]
    pub fn always_succeeds() -> Self {
        Self {
            build_failures_remaining: tokio::sync::Mutex::new(0),
        }
    }

    /// Fails `build` exactly `n` times, then succeeds.
    #[must_use]
    pub fn fail_build_n_times(n: u32) -> Self {
        Self {
            build_failures_remaining: tokio::sync::Mutex::new(n),
        }
    }
}

#[async_trait]
impl ContainerDriver for MockContainerDriver {
    async fn build(&self, _image_ref: &str, _context_dir: &Path) -> Result<(), ModscanError> {
        let mut remaining = self.build_failures_remaining.lock().await;
        if *remaining > 0 {
            *remaining -= 1;
            return Err(ModscanError::new(ErrorKind::Internal, "scripted build failure"));
        }
        Ok(())
    }

    async fn start(&self, _image_ref: &str) -> Result<(), ModscanError> {
        Ok(())
    }

    async fn stop(&self, _image_ref: &str) -> Result<(), ModscanError> {
        Ok(())
    }
}

/// Default module directory → image reference convention used by
/// discovery: `modscan-module-<id>:<version>`.
#[must_use]
pub fn default_image_ref(module_id: &str, version: &str) -> String {
    format!("modscan-module-{module_id}:{version}")
}

/// Resolve a module's on-disk directory, for use as the build context.
#[must_use]
pub fn module_context_dir(modules_dir: &Path, module_id: &str) -> PathBuf {
    modules_dir.join(module_id)
}
