//! Zenith archive: timestamped storage for build outputs and failure logs.
//! Plain files under the project (or a caller-chosen root); no index.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zenith_core::project::{stamp_now, unique_path};
use zenith_core::{ArchivedArtifact, BuildError};

mod logs;

pub use logs::{DiagnosticLogs, DEFAULT_LOGS_DIR};

/// Managed archive subdirectory under a project root.
pub const DEFAULT_BUILDS_DIR: &str = "zenith_builds";

/// Extensions `clear` treats as build artifacts.
pub const ARTIFACT_EXTENSIONS: [&str; 4] = ["apk", "aab", "ipa", "app"];

/// An output younger than this is reported as freshly built rather than reused from cache.
pub const FRESH_WINDOW: Duration = Duration::from_secs(120);

/// One entry found by `list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveEntry {
    pub path: PathBuf,
    pub bytes: u64,
    pub modified_ts: i64,
}

fn to_archive_err(e: anyhow::Error) -> BuildError { BuildError::ArchiveIo(format!("{:#}", e)) }

fn is_artifact(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_ascii_lowercase();
            ARTIFACT_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// Archive operations relative to a project root.
#[derive(Debug, Clone)]
pub struct ArtifactArchive {
    builds_dir: String,
}

impl Default for ArtifactArchive {
    fn default() -> Self { Self::new(DEFAULT_BUILDS_DIR) }
}

impl ArtifactArchive {
    pub fn new(builds_dir: impl Into<String>) -> Self { Self { builds_dir: builds_dir.into() } }

    pub fn builds_dir(&self) -> &str { &self.builds_dir }

    /// Where `resolve_output_dir` points, without touching the filesystem.
    pub fn output_dir(&self, project_root: &Path, custom_root: Option<&Path>) -> PathBuf {
        match custom_root.filter(|p| !p.as_os_str().is_empty()) {
            Some(custom) if custom.is_dir() => return custom.to_path_buf(),
            Some(custom) => warn!(custom = %custom.display(), "archive: custom output dir missing; using default"),
            None => {}
        }
        project_root.join(&self.builds_dir)
    }

    /// A custom root wins when it exists; otherwise `<project_root>/<builds_dir>`,
    /// created if missing.
    pub fn resolve_output_dir(&self, project_root: &Path, custom_root: Option<&Path>) -> Result<PathBuf, BuildError> {
        let dir = self.output_dir(project_root, custom_root);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating archive dir {}", dir.display()))
            .map_err(to_archive_err)?;
        Ok(dir)
    }

    /// Copy `source` into the resolved output dir as `<stem>_<timestamp>.<ext>`.
    pub fn archive(&self, source: &Path, project_root: &Path, custom_root: Option<&Path>) -> Result<ArchivedArtifact, BuildError> {
        let started = std::time::Instant::now();
        let root = self.resolve_output_dir(project_root, custom_root)?;
        let res = copy_into(source, &root);
        histogram!("archive_copy_ms", started.elapsed().as_secs_f64() * 1000.0);
        let artifact = res.map_err(to_archive_err)?;
        info!(
            dest = %artifact.final_path.display(),
            fresh = artifact.fresh,
            took_ms = %started.elapsed().as_millis(),
            "archive: artifact saved"
        );
        Ok(artifact)
    }

    /// Delete archived artifacts in `dir`; returns how many were removed.
    /// A missing or empty dir removes nothing and is not an error.
    pub fn clear(&self, dir: &Path) -> Result<usize, BuildError> {
        if !dir.exists() {
            debug!(dir = %dir.display(), "archive: clear on missing dir");
            return Ok(0);
        }
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("reading archive dir {}", dir.display()))
            .map_err(to_archive_err)?;
        let mut removed = 0usize;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !is_artifact(&path) {
                debug!(path = %path.display(), "archive: skipping non-artifact");
                continue;
            }
            // .app bundles are directories
            let res = if path.is_dir() { std::fs::remove_dir_all(&path) } else { std::fs::remove_file(&path) };
            match res {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "archive: delete failed"),
            }
        }
        counter!("archive_cleared_total", removed as u64);
        info!(dir = %dir.display(), removed, "archive: cleared");
        Ok(removed)
    }

    /// Archived artifacts in `dir`, newest first.
    pub fn list(&self, dir: &Path) -> Result<Vec<ArchiveEntry>, BuildError> {
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("reading archive dir {}", dir.display()))
            .map_err(to_archive_err)?;
        let mut out: Vec<ArchiveEntry> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| is_artifact(p))
            .filter_map(|path| {
                let meta = std::fs::metadata(&path).ok()?;
                let modified_ts = meta
                    .modified()
                    .ok()
                    .and_then(|m| m.duration_since(SystemTime::UNIX_EPOCH).ok())
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0);
                Some(ArchiveEntry { path, bytes: meta.len(), modified_ts })
            })
            .collect();
        out.sort_by(|a, b| b.modified_ts.cmp(&a.modified_ts).then_with(|| b.path.cmp(&a.path)));
        Ok(out)
    }
}

fn copy_into(source: &Path, root: &Path) -> Result<ArchivedArtifact> {
    let meta = std::fs::metadata(source).with_context(|| format!("reading build output {}", source.display()))?;
    let fresh = meta
        .modified()
        .ok()
        .map(|m| SystemTime::now().duration_since(m).unwrap_or_default() < FRESH_WINDOW)
        .unwrap_or(false);
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .ok_or_else(|| anyhow!("build output {} has no file name", source.display()))?;
    let ext = source.extension().map(|s| s.to_string_lossy().to_string()).unwrap_or_else(|| "bin".to_string());
    let timestamp = stamp_now();
    let final_path = unique_path(root, &stem, &timestamp, &ext);
    std::fs::copy(source, &final_path)
        .with_context(|| format!("copying {} to {}", source.display(), final_path.display()))?;
    Ok(ArchivedArtifact {
        source_build_output: source.to_path_buf(),
        archive_root: root.to_path_buf(),
        timestamp,
        final_path,
        fresh,
    })
}
