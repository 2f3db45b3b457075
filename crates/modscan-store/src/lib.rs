// SPDX-License-Identifier: MIT OR Apache-2.0
//! Content-addressed artifact storage (C1).
//!
//! Every uploaded APK/IPA/zip/source archive is identified solely by the
//! SHA-256 of its raw bytes. Two byte-identical uploads always collapse to
//! one [`Artifact`] record; the extracted tree is read-only once written.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::Utc;
use modscan_core::{Artifact, FileType, Fingerprint};
use modscan_error::{ErrorKind, ModscanError};
use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Content-addressed artifact store rooted at a single directory.
///
/// Layout: `<root>/<fingerprint>/raw`, `<root>/<fingerprint>/tree/`,
/// `<root>/<fingerprint>/metadata.json`.
#[derive(Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    index: Arc<RwLock<HashMap<Fingerprint, Artifact>>>,
}

impl ArtifactStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    ///
    /// Does not eagerly scan `root` for existing artifacts; entries are
    /// loaded from disk lazily on first [`ArtifactStore::open`] or
    /// [`ArtifactStore::ingest`] of a given fingerprint.
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self, ModscanError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            ModscanError::new(ErrorKind::Internal, "failed to create store root")
                .with_context("root", root.display().to_string())
                .with_source(e)
        })?;
        Ok(Self {
            root,
            index: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    fn artifact_dir(&self, fp: Fingerprint) -> PathBuf {
        self.root.join(fp.to_hex())
    }

    /// Ingest raw bytes, returning the resulting (possibly pre-existing)
    /// [`Artifact`].
    ///
    /// Streams the hash computation and write-out so that two
    /// byte-identical uploads under different names collapse to one
    /// record: the first-seen `original_name` is retained and later names
    /// are recorded as aliases.
    pub async fn ingest(&self, bytes: &[u8], original_name: &str) -> Result<Artifact, ModscanError> {
        let fingerprint = Fingerprint::of(bytes);

        if let Some(existing) = self.record_alias_if_known(fingerprint, original_name).await? {
            return Ok(existing);
        }

        let dir = self.artifact_dir(fingerprint);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            ModscanError::new(ErrorKind::Internal, "failed to create artifact directory").with_source(e)
        })?;

        let detected_type = detect_file_type(bytes).ok_or_else(|| {
            ModscanError::new(ErrorKind::InvalidInput, "unrecognized artifact format")
                .with_context("original_name", original_name)
        })?;

        write_raw_atomically(&dir, bytes).await?;

        let tree_dir = dir.join("tree");
        extract_into(bytes, detected_type, &tree_dir).await?;

        let artifact = Artifact {
            fingerprint,
            original_name: original_name.to_string(),
            aliases: Vec::new(),
            size: bytes.len() as u64,
            detected_type,
            ingested_at: Utc::now(),
            extracted_root: relative_to_root(&self.root, &tree_dir),
        };

        write_metadata(&dir, &artifact).await?;

        let mut index = self.index.write().await;
        index.insert(fingerprint, artifact.clone());
        info!(fingerprint = %fingerprint, file_type = %detected_type, "ingested new artifact");
        Ok(artifact)
    }

    /// If `fingerprint` is already known (in memory or on disk), record
    /// `original_name` as an alias (when distinct from the first-seen
    /// name) and return the updated record. Otherwise returns `Ok(None)`.
    async fn record_alias_if_known(
        &self,
        fingerprint: Fingerprint,
        original_name: &str,
    ) -> Result<Option<Artifact>, ModscanError> {
        {
            let index = self.index.read().await;
            if let Some(existing) = index.get(&fingerprint) {
                return Ok(Some(existing.clone()));
            }
        }

        let dir = self.artifact_dir(fingerprint);
        let metadata_path = dir.join("metadata.json");
        if !metadata_path.exists() {
            return Ok(None);
        }

        let mut artifact = read_metadata(&dir).await?;
        if artifact.original_name != original_name && !artifact.aliases.iter().any(|a| a == original_name) {
            artifact.aliases.push(original_name.to_string());
            write_metadata(&dir, &artifact).await?;
            debug!(fingerprint = %fingerprint, alias = original_name, "recorded duplicate-upload alias");
        }

        let mut index = self.index.write().await;
        index.insert(fingerprint, artifact.clone());
        Ok(Some(artifact))
    }

    /// Look up an artifact by fingerprint.
    pub async fn open(&self, fingerprint: Fingerprint) -> Result<Artifact, ModscanError> {
        {
            let index = self.index.read().await;
            if let Some(artifact) = index.get(&fingerprint) {
                return Ok(artifact.clone());
            }
        }

        let dir = self.artifact_dir(fingerprint);
        if !dir.join("metadata.json").exists() {
            return Err(ModscanError::new(ErrorKind::NotFound, "unknown fingerprint")
                .with_context("fingerprint", fingerprint.to_hex()));
        }
        let artifact = read_metadata(&dir).await?;
        let mut index = self.index.write().await;
        index.insert(fingerprint, artifact.clone());
        Ok(artifact)
    }

    /// Build a tar archive of the artifact's extracted tree.
    ///
    /// When `paths` is `Some`, only those relative paths (and, for
    /// directories, everything beneath them) are included — used by the
    /// external module adapter to provision a worker with a subset of
    /// files. `gzip` selects gzip compression via `flate2`.
    pub async fn tarball(
        &self,
        fingerprint: Fingerprint,
        paths: Option<Vec<String>>,
        gzip: bool,
    ) -> Result<Vec<u8>, ModscanError> {
        let artifact = self.open(fingerprint).await?;
        let tree_dir = self.root.join(&artifact.extracted_root);

        tokio::task::spawn_blocking(move || build_tarball(&tree_dir, paths.as_deref(), gzip))
            .await
            .map_err(|e| ModscanError::new(ErrorKind::Internal, "tarball task panicked").with_source(e))?
    }
}

async fn write_raw_atomically(dir: &Path, bytes: &[u8]) -> Result<(), ModscanError> {
    let final_path = dir.join("raw");
    let tmp_path = dir.join("raw.tmp");
    tokio::fs::write(&tmp_path, bytes).await.map_err(|e| {
        ModscanError::new(ErrorKind::Internal, "failed to stage raw upload").with_source(e)
    })?;
    tokio::fs::rename(&tmp_path, &final_path).await.map_err(|e| {
        ModscanError::new(ErrorKind::Internal, "failed to finalize raw upload").with_source(e)
    })?;
    Ok(())
}

async fn write_metadata(dir: &Path, artifact: &Artifact) -> Result<(), ModscanError> {
    let json = serde_json::to_vec_pretty(artifact)
        .map_err(|e| ModscanError::new(ErrorKind::Internal, "failed to serialize metadata").with_source(e))?;
    let tmp_path = dir.join("metadata.json.tmp");
    let final_path = dir.join("metadata.json");
    tokio::fs::write(&tmp_path, json).await.map_err(|e| {
        ModscanError::new(ErrorKind::Internal, "failed to stage metadata").with_source(e)
    })?;
    tokio::fs::rename(&tmp_path, &final_path).await.map_err(|e| {
        ModscanError::new(ErrorKind::Internal, "failed to finalize metadata").with_source(e)
    })?;
    Ok(())
}

async fn read_metadata(dir: &Path) -> Result<Artifact, ModscanError> {
    let bytes = tokio::fs::read(dir.join("metadata.json")).await.map_err(|e| {
        ModscanError::new(ErrorKind::Internal, "failed to read metadata").with_source(e)
    })?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ModscanError::new(ErrorKind::Internal, "corrupt metadata.json").with_source(e))
}

fn relative_to_root(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}

/// Detect an artifact's [`FileType`] from its raw bytes.
///
/// Zip-family archives (magic `PK\x03\x04`) are distinguished by central
/// directory contents: an `AndroidManifest.xml` entry means `apk`, a
/// `Payload/*.app/Info.plist` entry means `ipa`, anything else zip-shaped is
/// a plain `zip`. Anything that parses as a tar stream is treated as an
/// already-unpacked `source` tree. Returns `None` when neither matches.
#[must_use]
pub fn detect_file_type(bytes: &[u8]) -> Option<FileType> {
    if bytes.starts_with(ZIP_MAGIC) {
        return Some(detect_zip_family(bytes).unwrap_or(FileType::Zip));
    }
    if is_tar(bytes) {
        return Some(FileType::Source);
    }
    None
}

fn detect_zip_family(bytes: &[u8]) -> Option<FileType> {
    let cursor = Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor).ok()?;
    let mut saw_manifest = false;
    let mut saw_info_plist = false;
    for i in 0..archive.len() {
        let entry = archive.by_index(i).ok()?;
        let name = entry.name();
        if name == "AndroidManifest.xml" {
            saw_manifest = true;
        }
        if name.starts_with("Payload/") && name.ends_with(".app/Info.plist") {
            saw_info_plist = true;
        }
    }
    if saw_manifest {
        Some(FileType::Apk)
    } else if saw_info_plist {
        Some(FileType::Ipa)
    } else {
        Some(FileType::Zip)
    }
}

fn is_tar(bytes: &[u8]) -> bool {
    if bytes.len() < 512 {
        return false;
    }
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    archive.entries().is_ok_and(|mut entries| entries.next().is_some())
}

async fn extract_into(bytes: &[u8], file_type: FileType, tree_dir: &Path) -> Result<(), ModscanError> {
    tokio::fs::create_dir_all(tree_dir).await.map_err(|e| {
        ModscanError::new(ErrorKind::Internal, "failed to create extraction directory").with_source(e)
    })?;

    let owned = bytes.to_vec();
    let dir = tree_dir.to_path_buf();
    tokio::task::spawn_blocking(move || match file_type {
        FileType::Apk | FileType::Ipa | FileType::Zip => extract_zip(&owned, &dir),
        FileType::Source => extract_tar(&owned, &dir),
    })
    .await
    .map_err(|e| ModscanError::new(ErrorKind::Internal, "extraction task panicked").with_source(e))?
}

fn extract_zip(bytes: &[u8], dest: &Path) -> Result<(), ModscanError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ModscanError::new(ErrorKind::InvalidInput, "not a valid zip archive").with_source(e))?;
    archive
        .extract(dest)
        .map_err(|e| ModscanError::new(ErrorKind::Internal, "failed to extract zip archive").with_source(e))
}

fn extract_tar(bytes: &[u8], dest: &Path) -> Result<(), ModscanError> {
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    archive
        .unpack(dest)
        .map_err(|e| ModscanError::new(ErrorKind::Internal, "failed to extract tar archive").with_source(e))
}

fn build_tarball(tree_dir: &Path, paths: Option<&[String]>, gzip: bool) -> Result<Vec<u8>, ModscanError> {
    let buf = Vec::new();
    if gzip {
        let encoder = flate2::write::GzEncoder::new(buf, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        append_tree(&mut builder, tree_dir, paths)?;
        let encoder = builder
            .into_inner()
            .map_err(|e| ModscanError::new(ErrorKind::Internal, "failed to finalize tarball").with_source(e))?;
        encoder
            .finish()
            .map_err(|e| ModscanError::new(ErrorKind::Internal, "failed to finish gzip stream").with_source(e))
    } else {
        let mut builder = tar::Builder::new(buf);
        append_tree(&mut builder, tree_dir, paths)?;
        builder
            .into_inner()
            .map_err(|e| ModscanError::new(ErrorKind::Internal, "failed to finalize tarball").with_source(e))
    }
}

fn append_tree<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    tree_dir: &Path,
    paths: Option<&[String]>,
) -> Result<(), ModscanError> {
    for entry in walkdir::WalkDir::new(tree_dir).follow_links(false) {
        let entry = entry.map_err(|e| {
            ModscanError::new(ErrorKind::Internal, "failed to walk extracted tree").with_source(e)
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(tree_dir)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        if let Some(filter) = paths {
            if !filter.iter().any(|p| rel == *p || rel.starts_with(&format!("{p}/"))) {
                continue;
            }
        }
        builder
            .append_path_with_name(entry.path(), &rel)
            .map_err(|e| ModscanError::new(ErrorKind::Internal, "failed to append tar entry").with_source(e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn make_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let cursor = Cursor::new(&mut buf);
            let mut writer = zip::ZipWriter::new(cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, content) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn detects_apk_by_manifest_entry() {
        let zip = make_zip(&[("AndroidManifest.xml", b"<manifest/>"), ("classes.dex", b"dex")]);
        assert_eq!(detect_file_type(&zip), Some(FileType::Apk));
    }

    #[test]
    fn detects_ipa_by_info_plist_entry() {
        let zip = make_zip(&[("Payload/App.app/Info.plist", b"<plist/>")]);
        assert_eq!(detect_file_type(&zip), Some(FileType::Ipa));
    }

    #[test]
    fn plain_zip_without_markers_is_zip() {
        let zip = make_zip(&[("readme.txt", b"hello")]);
        assert_eq!(detect_file_type(&zip), Some(FileType::Zip));
    }

    #[test]
    fn unrecognized_bytes_detect_as_none() {
        assert_eq!(detect_file_type(b"not an archive at all, just text"), None);
    }

    #[tokio::test]
    async fn ingest_is_idempotent_for_identical_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).await.unwrap();
        let zip = make_zip(&[("AndroidManifest.xml", b"<manifest/>")]);

        let first = store.ingest(&zip, "app.apk").await.unwrap();
        let second = store.ingest(&zip, "app-renamed.apk").await.unwrap();

        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(second.original_name, "app.apk");
        assert!(second.aliases.contains(&"app-renamed.apk".to_string()));
    }

    #[tokio::test]
    async fn open_returns_not_found_for_unknown_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).await.unwrap();
        let err = store.open(Fingerprint::of(b"never ingested")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn ingest_rejects_unrecognized_format() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).await.unwrap();
        let err = store.ingest(b"plain text, not an archive", "notes.txt").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn tarball_contains_extracted_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).await.unwrap();
        let zip = make_zip(&[("AndroidManifest.xml", b"<manifest/>"), ("res/values.xml", b"<res/>")]);
        let artifact = store.ingest(&zip, "app.apk").await.unwrap();

        let tar_bytes = store.tarball(artifact.fingerprint, None, false).await.unwrap();
        let mut archive = tar::Archive::new(Cursor::new(tar_bytes));
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|n| n.contains("AndroidManifest.xml")));
        assert!(names.iter().any(|n| n.contains("values.xml")));
    }
}
