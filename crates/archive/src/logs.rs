use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::info;
use zenith_core::project::{stamp_now, unique_path};
use zenith_core::BuildError;

/// Diagnostic log subdirectory under a project root.
pub const DEFAULT_LOGS_DIR: &str = "zenith_logs";

/// Writes the full captured output of a failed build, one file per failure.
#[derive(Debug, Clone)]
pub struct DiagnosticLogs {
    logs_dir: String,
}

impl Default for DiagnosticLogs {
    fn default() -> Self { Self::new(DEFAULT_LOGS_DIR) }
}

impl DiagnosticLogs {
    pub fn new(logs_dir: impl Into<String>) -> Self { Self { logs_dir: logs_dir.into() } }

    pub fn dir_for(&self, project_root: &Path) -> PathBuf { project_root.join(&self.logs_dir) }

    /// `<project_root>/<logs_dir>/<prefix>_<timestamp>.log`
    pub fn write(&self, project_root: &Path, prefix: &str, content: &str) -> Result<PathBuf, BuildError> {
        let dir = self.dir_for(project_root);
        let path = std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating log dir {}", dir.display()))
            .and_then(|_| {
                let path = unique_path(&dir, prefix, &stamp_now(), "log");
                std::fs::write(&path, content).with_context(|| format!("writing {}", path.display()))?;
                Ok(path)
            })
            .map_err(|e| BuildError::ArchiveIo(format!("{:#}", e)))?;
        info!(path = %path.display(), bytes = content.len(), "logs: diagnostic log written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_full_content_under_project() {
        let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        let root = std::env::temp_dir().join(format!("zenith-logs-{}", nanos));
        std::fs::create_dir_all(&root).unwrap();
        let long = "x".repeat(4096);
        let logs = DiagnosticLogs::default();
        let p = logs.write(&root, "android_build_fail", &long).unwrap();
        assert!(p.starts_with(root.join(DEFAULT_LOGS_DIR)));
        assert!(p.file_name().unwrap().to_string_lossy().starts_with("android_build_fail_"));
        assert_eq!(std::fs::read_to_string(&p).unwrap(), long);
    }
}
