//! Project layout detection and small path helpers.

use std::path::{Path, PathBuf};

use crate::{BuildError, BuildTarget};

/// Subdirectory holding the Gradle project inside an app root.
pub const ANDROID_DIR: &str = "android";
pub const IOS_DIR: &str = "ios";

const ANDROID_MARKERS: [&str; 4] = ["build.gradle", "build.gradle.kts", "settings.gradle", "settings.gradle.kts"];

/// Timestamp format used in archive and log file names.
pub const STAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Returns the first Gradle marker found under `<root>/android`.
pub fn android_marker(root: &Path) -> Option<PathBuf> {
    let android = root.join(ANDROID_DIR);
    ANDROID_MARKERS.iter().map(|m| android.join(m)).find(|p| p.is_file())
}

fn ensure_dir(root: &Path) -> Result<(), BuildError> {
    if root.is_dir() {
        Ok(())
    } else {
        Err(BuildError::ProjectNotFound(format!("{} does not exist or is not a directory", root.display())))
    }
}

/// How far below each root `scan` looks for projects.
pub const SCAN_DEPTH: usize = 3;

/// Roots `scan` visits for a given start path: the path, its parent, and the
/// user's `Documents` folder when those exist.
pub fn scan_roots(start: &Path) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if start.is_dir() {
        roots.push(start.to_path_buf());
        if let Some(parent) = start.parent().filter(|p| !p.as_os_str().is_empty()) {
            roots.push(parent.to_path_buf());
        }
    }
    let home = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE"));
    if let Some(docs) = home.map(|h| PathBuf::from(h).join("Documents")).filter(|d| d.is_dir()) {
        roots.push(docs);
    }
    roots
}

/// App roots with a Gradle project, at most `SCAN_DEPTH` levels under any of
/// `roots`. Sorted, without duplicates; unreadable entries are skipped.
pub fn scan(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut found = std::collections::BTreeSet::new();
    for root in roots {
        let walker = walkdir::WalkDir::new(root).max_depth(SCAN_DEPTH).follow_links(false).into_iter();
        // never descend into a project's own android/ or dependency trees
        let walker = walker.filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            e.depth() == 0 || !(name == ANDROID_DIR || name == "node_modules" || name.starts_with('.'))
        });
        for entry in walker.filter_map(Result::ok) {
            if entry.file_type().is_dir() && android_marker(entry.path()).is_some() {
                found.insert(entry.into_path());
            }
        }
    }
    found.into_iter().collect()
}

/// Validate a local Android build root; returns the Gradle project dir.
pub fn ensure_android_project(root: &Path) -> Result<PathBuf, BuildError> {
    ensure_dir(root)?;
    match android_marker(root) {
        Some(_) => Ok(root.join(ANDROID_DIR)),
        None => Err(BuildError::ProjectNotFound(format!(
            "{} has no {}/build.gradle or {}/settings.gradle",
            root.display(),
            ANDROID_DIR,
            ANDROID_DIR
        ))),
    }
}

/// Validate a root that will be mirrored to a satellite: needs an `ios/` dir or a `package.json`.
pub fn ensure_remote_project(root: &Path) -> Result<(), BuildError> {
    ensure_dir(root)?;
    if root.join(IOS_DIR).is_dir() || root.join("package.json").is_file() {
        Ok(())
    } else {
        Err(BuildError::ProjectNotFound(format!("{} has no {}/ directory or package.json", root.display(), IOS_DIR)))
    }
}

/// Where Gradle leaves the debug output for a target. `None` for remote targets.
pub fn android_output(root: &Path, target: BuildTarget) -> Option<PathBuf> {
    let rel = match target {
        BuildTarget::Apk => "app/build/outputs/apk/debug/app-debug.apk",
        BuildTarget::Aab => "app/build/outputs/bundle/debug/app-debug.aab",
        BuildTarget::Simulator | BuildTarget::Device => return None,
    };
    Some(root.join(ANDROID_DIR).join(rel))
}

/// Convert `C:\Users\me` style paths to `/mnt/c/Users/me` for WSL.
pub fn windows_to_wsl_path(win_path: &str) -> String {
    let mut chars = win_path.chars();
    match (chars.next(), chars.next()) {
        (Some(drive), Some(':')) if drive.is_ascii_alphabetic() => {
            format!("/mnt/{}{}", drive.to_ascii_lowercase(), win_path[2..].replace('\\', "/"))
        }
        _ => win_path.replace('\\', "/"),
    }
}

pub fn stamp_now() -> String {
    chrono::Local::now().format(STAMP_FORMAT).to_string()
}

/// `<dir>/<stem>_<stamp>.<ext>`, with `_2`, `_3`... appended if that name is taken.
pub fn unique_path(dir: &Path, stem: &str, stamp: &str, ext: &str) -> PathBuf {
    let first = dir.join(format!("{}_{}.{}", stem, stamp, ext));
    if !first.exists() {
        return first;
    }
    let mut n = 2u32;
    loop {
        let p = dir.join(format!("{}_{}_{}.{}", stem, stamp, n, ext));
        if !p.exists() {
            return p;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        let p = std::env::temp_dir().join(format!("zenith-core-{}-{}", tag, nanos));
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn path_conversion() {
        assert_eq!(windows_to_wsl_path("C:\\Users\\Game"), "/mnt/c/Users/Game");
        assert_eq!(windows_to_wsl_path("D:/Projects/App"), "/mnt/d/Projects/App");
        assert_eq!(windows_to_wsl_path("E:\\Work\\Dev"), "/mnt/e/Work/Dev");
        assert_eq!(windows_to_wsl_path("/already/unix"), "/already/unix");
    }

    #[test]
    fn android_layout_detection() {
        let root = temp_dir("layout");
        assert!(matches!(ensure_android_project(&root), Err(BuildError::ProjectNotFound(_))));
        std::fs::create_dir_all(root.join("android")).unwrap();
        std::fs::write(root.join("android/settings.gradle.kts"), "").unwrap();
        assert_eq!(ensure_android_project(&root).unwrap(), root.join("android"));
        assert!(matches!(ensure_android_project(&root.join("missing")), Err(BuildError::ProjectNotFound(_))));
    }

    #[test]
    fn scan_finds_projects_within_depth() {
        let root = temp_dir("scan");
        for (dir, marker) in [
            ("shallow", "build.gradle"),
            ("group/nested", "settings.gradle"),
            ("a/b/c/too-deep", "build.gradle"),
            ("node_modules/dep", "build.gradle"),
        ] {
            std::fs::create_dir_all(root.join(dir).join("android")).unwrap();
            std::fs::write(root.join(dir).join("android").join(marker), "").unwrap();
        }
        std::fs::create_dir_all(root.join("not-a-project/android")).unwrap();

        let found = scan(&[root.clone(), root.clone()]);
        assert_eq!(found, vec![root.join("group/nested"), root.join("shallow")]);

        // a project root passed directly is reported itself
        assert_eq!(scan(&[root.join("shallow")]), vec![root.join("shallow")]);
        assert!(scan(&[root.join("missing")]).is_empty());

        let roots = scan_roots(&root.join("shallow"));
        assert_eq!(&roots[..2], &[root.join("shallow"), root.clone()]);
    }

    #[test]
    fn remote_layout_detection() {
        let root = temp_dir("remote");
        assert!(ensure_remote_project(&root).is_err());
        std::fs::write(root.join("package.json"), "{}").unwrap();
        assert!(ensure_remote_project(&root).is_ok());
    }

    #[test]
    fn outputs_by_target() {
        let root = Path::new("/w");
        assert!(android_output(root, BuildTarget::Aab).unwrap().to_string_lossy().contains("bundle"));
        assert!(android_output(root, BuildTarget::Apk).unwrap().ends_with("app-debug.apk"));
        assert!(android_output(root, BuildTarget::Device).is_none());
    }

    #[test]
    fn unique_path_skips_taken_names() {
        let dir = temp_dir("unique");
        let a = unique_path(&dir, "app-debug", "2024-01-01_00-00-00", "apk");
        std::fs::write(&a, b"x").unwrap();
        let b = unique_path(&dir, "app-debug", "2024-01-01_00-00-00", "apk");
        assert_ne!(a, b);
        assert!(b.to_string_lossy().ends_with("_2.apk"));
    }
}
