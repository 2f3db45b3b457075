// SPDX-License-Identifier: MIT OR Apache-2.0
//! Startup discovery of internal modules from a configured directory.

use crate::driver::default_image_ref;
use modscan_core::module::{ContainerState, InternalSpec};
use modscan_core::{FileType, ModuleDescriptor};
use modscan_core::module::ModuleSpec;
use modscan_error::{ErrorKind, ModscanError};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;

/// On-disk module manifest: one `module.toml` per module subdirectory.
#[derive(Debug, Clone, Deserialize)]
struct ModuleManifest {
    name: String,
    version: String,
    #[serde(default)]
    description: String,
    author: String,
    #[serde(default = "default_input_formats")]
    input_formats: Vec<FileType>,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_input_formats() -> Vec<FileType> {
    FileType::all().to_vec()
}

fn default_active() -> bool {
    true
}

/// Scan `modules_dir`, returning one [`ModuleDescriptor`] per subdirectory
/// that contains a valid `module.toml`.
///
/// Subdirectories without a manifest are skipped with a warning rather than
/// failing the whole scan — one malformed module should not block
/// bootstrap of the rest.
pub async fn scan_modules_dir(modules_dir: &Path) -> Result<Vec<ModuleDescriptor>, ModscanError> {
    let mut descriptors = Vec::new();

    let mut entries = match tokio::fs::read_dir(modules_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(dir = %modules_dir.display(), "modules directory does not exist, no internal modules discovered");
            return Ok(descriptors);
        }
        Err(e) => {
            return Err(ModscanError::new(ErrorKind::Internal, "failed to read modules directory").with_source(e));
        }
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ModscanError::new(ErrorKind::Internal, "failed to iterate modules directory").with_source(e))?
    {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let module_id = path.file_name().unwrap_or_default().to_string_lossy().to_string();
        let manifest_path = path.join("module.toml");
        let manifest_bytes = match tokio::fs::read_to_string(&manifest_path).await {
            Ok(content) => content,
            Err(_) => {
                tracing::warn!(module_id, "no module.toml found, skipping");
                continue;
            }
        };

        let manifest: ModuleManifest = match toml::from_str(&manifest_bytes) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(module_id, error = %e, "malformed module.toml, skipping");
                continue;
            }
        };

        let image_ref = default_image_ref(&module_id, &manifest.version);
        descriptors.push(ModuleDescriptor {
            id: module_id,
            name: manifest.name,
            version: manifest.version,
            author: manifest.author,
            description: manifest.description,
            input_formats: manifest.input_formats.into_iter().collect::<BTreeSet<_>>(),
            active: manifest.active,
            healthy: false,
            spec: ModuleSpec::Internal(InternalSpec {
                image_ref,
                container_state: ContainerState::Absent,
                autostart: manifest.active,
            }),
        });
    }

    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    async fn write_manifest(dir: &Path, module_id: &str, body: &str) {
        let module_dir = dir.join(module_id);
        tokio::fs::create_dir_all(&module_dir).await.unwrap();
        let mut f = std::fs::File::create(module_dir.join("module.toml")).unwrap();
        f.write_all(body.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn discovers_well_formed_module() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "permissions",
            r#"
            name = "Permissions Scanner"
            version = "1.0.0"
            author = "modscan"
            input_formats = ["apk"]
            "#,
        )
        .await;

        let descriptors = scan_modules_dir(dir.path()).await.unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].id, "permissions");
        assert!(descriptors[0].active);
        assert!(descriptors[0].accepts(FileType::Apk));
    }

    #[tokio::test]
    async fn skips_directory_without_manifest() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("empty")).await.unwrap();

        let descriptors = scan_modules_dir(dir.path()).await.unwrap();
        assert!(descriptors.is_empty());
    }

    #[tokio::test]
    async fn skips_malformed_manifest() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "broken", "this = [is not valid").await;

        let descriptors = scan_modules_dir(dir.path()).await.unwrap();
        assert!(descriptors.is_empty());
    }

    #[tokio::test]
    async fn missing_modules_dir_returns_empty() {
        let descriptors = scan_modules_dir(Path::new("/does/not/exist")).await.unwrap();
        assert!(descriptors.is_empty());
    }

    #[tokio::test]
    async fn active_false_disables_autostart() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            "disabled",
            r#"
            name = "Disabled"
            version = "1.0.0"
            author = "modscan"
            active = false
            "#,
        )
        .await;

        let descriptors = scan_modules_dir(dir.path()).await.unwrap();
        assert!(!descriptors[0].active);
    }
}
