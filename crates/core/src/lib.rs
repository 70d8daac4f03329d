//! Zenith core types: build requests, the hardware plan, session outcomes
//! and the error taxonomy shared by every crate in the workspace.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod project;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// Lower and upper bound for the build JVM heap.
pub const MIN_HEAP_BYTES: u64 = 4 * GIB;
pub const MAX_HEAP_BYTES: u64 = 16 * GIB;

/// Worker count used when the core count cannot be read.
pub const FALLBACK_WORKERS: usize = 4;

/// Host resources plus the concurrency/memory plan derived from them.
///
/// Computed once per engine session; a fresh plan needs an explicit re-profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub cpu_cores: usize,
    pub total_ram_bytes: u64,
    pub max_workers: usize,
    pub heap_bytes: u64,
}

impl HardwareProfile {
    /// Derive the plan from raw host counts.
    pub fn derive(cpu_cores: usize, total_ram_bytes: u64) -> Self {
        Self {
            cpu_cores,
            total_ram_bytes,
            max_workers: plan_workers(cpu_cores),
            heap_bytes: plan_heap(total_ram_bytes),
        }
    }

    /// Plan used when nothing about the host could be read.
    pub fn conservative() -> Self {
        Self { cpu_cores: 0, total_ram_bytes: 0, max_workers: FALLBACK_WORKERS, heap_bytes: MIN_HEAP_BYTES }
    }

    pub fn heap_mib(&self) -> u64 { self.heap_bytes / MIB }
}

/// `round(cores * 0.9)`, never below one worker.
pub fn plan_workers(cpu_cores: usize) -> usize {
    ((cpu_cores as f64) * 0.9).round().max(1.0) as usize
}

/// Half of RAM, clamped to `[4 GiB, 16 GiB]`.
pub fn plan_heap(total_ram_bytes: u64) -> u64 {
    (total_ram_bytes / 2).clamp(MIN_HEAP_BYTES, MAX_HEAP_BYTES)
}

/// What the toolchain should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildTarget {
    /// Android debug APK (local).
    Apk,
    /// Android app bundle (local).
    Aab,
    /// iOS simulator build (remote).
    Simulator,
    /// iOS device build (remote).
    Device,
}

impl BuildTarget {
    pub fn is_android(self) -> bool { matches!(self, BuildTarget::Apk | BuildTarget::Aab) }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildTarget::Apk => "apk",
            BuildTarget::Aab => "aab",
            BuildTarget::Simulator => "simulator",
            BuildTarget::Device => "device",
        }
    }
}

impl std::fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// Password material. Never printed.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(s: impl Into<String>) -> Self { Self(s.into()) }
    pub fn expose(&self) -> &str { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("Secret(***)") }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Credential {
    Password(Secret),
    KeyFile(PathBuf),
}

/// A network-reachable compute node. Supplied per request, never persisted here.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteTarget {
    /// `host` or `host:port` (port defaults to 22).
    pub host: String,
    pub user: String,
    pub credential: Credential,
    pub remote_project_path: String,
    pub scheme: String,
}

impl RemoteTarget {
    pub fn host_and_port(&self) -> (&str, u16) {
        match self.host.rsplit_once(':') {
            Some((h, p)) => match p.parse::<u16>() {
                Ok(port) => (h, port),
                Err(_) => (self.host.as_str(), 22),
            },
            None => (self.host.as_str(), 22),
        }
    }

    /// `user@host`, as ssh and rsync expect it.
    pub fn login(&self) -> String {
        format!("{}@{}", self.user, self.host_and_port().0)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Local,
    Remote(RemoteTarget),
}

/// A caller's request for one build.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildRequest {
    pub working_dir: PathBuf,
    pub target: BuildTarget,
    #[serde(default)]
    pub turbo: bool,
    #[serde(default)]
    pub custom_output_path: Option<PathBuf>,
    pub platform: Platform,
}

impl BuildRequest {
    pub fn local(working_dir: impl Into<PathBuf>, target: BuildTarget) -> Self {
        Self { working_dir: working_dir.into(), target, turbo: false, custom_output_path: None, platform: Platform::Local }
    }

    pub fn remote(working_dir: impl Into<PathBuf>, target: BuildTarget, remote: RemoteTarget) -> Self {
        Self { working_dir: working_dir.into(), target, turbo: false, custom_output_path: None, platform: Platform::Remote(remote) }
    }

    pub fn with_turbo(mut self, on: bool) -> Self { self.turbo = on; self }

    pub fn with_output(mut self, dir: impl Into<PathBuf>) -> Self { self.custom_output_path = Some(dir.into()); self }

    pub fn is_remote(&self) -> bool { matches!(self.platform, Platform::Remote(_)) }

    /// Target/platform agreement: Android targets build locally, iOS targets on a satellite.
    pub fn check_target(&self) -> Result<(), BuildError> {
        match (&self.platform, self.target.is_android()) {
            (Platform::Local, true) | (Platform::Remote(_), false) => Ok(()),
            (Platform::Local, false) => Err(BuildError::InvalidRequest(format!("target {} requires a remote platform", self.target))),
            (Platform::Remote(_), true) => Err(BuildError::InvalidRequest(format!("target {} builds locally only", self.target))),
        }
    }

    /// Custom output root, ignoring an empty path.
    pub fn custom_root(&self) -> Option<&Path> {
        self.custom_output_path.as_deref().filter(|p| !p.as_os_str().is_empty())
    }
}

/// One line of build output as delivered to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputLine {
    /// Delivery order within the session, starting at 0. Gaps never occur; lines
    /// dropped for a lagging reader are simply not numbered.
    pub seq: u64,
    /// Display text, truncated to the line budget.
    pub text: String,
    /// Running-max completion estimate after this line, in percent.
    pub progress: f32,
}

/// A build output copied into the managed archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedArtifact {
    pub source_build_output: PathBuf,
    pub archive_root: PathBuf,
    pub timestamp: String,
    pub final_path: PathBuf,
    /// False when the toolchain reused a cached output (source older than two minutes).
    pub fresh: bool,
}

/// Error taxonomy for every engine operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum BuildError {
    #[error("profiling: {0}")]
    Profiling(String),
    #[error("already_running: session {0} is active")]
    AlreadyRunning(String),
    #[error("project_not_found: {0}")]
    ProjectNotFound(String),
    #[error("invalid_request: {0}")]
    InvalidRequest(String),
    #[error("process_spawn: {0}")]
    ProcessSpawn(String),
    #[error("toolchain: {0}")]
    Toolchain(String),
    #[error("sync: {0}")]
    Sync(String),
    #[error("remote_execution: {0}")]
    RemoteExecution(String),
    #[error("archive_io: {0}")]
    ArchiveIo(String),
    #[error("cancelled")]
    Cancelled,
}

impl BuildError {
    /// Cancellation is a user decision, not a fault worth logging as one.
    pub fn is_fault(&self) -> bool { !matches!(self, BuildError::Cancelled) }

    /// Short advice for the remote failure domains.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            BuildError::Sync(_) => Some("check host, credentials and network, then re-sync"),
            BuildError::RemoteExecution(_) => Some("sync succeeded; fix the remote build and re-run"),
            BuildError::ProjectNotFound(_) => Some("point the build at a project root"),
            _ => None,
        }
    }
}

pub type BuildResult<T> = Result<T, BuildError>;

/// Terminal state of one build, reported exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BuildOutcome {
    Success {
        artifact: Option<ArchivedArtifact>,
        /// Archiving runs after the toolchain succeeded; its failure does not fail the build.
        archive_error: Option<BuildError>,
    },
    Failure {
        error: BuildError,
        diagnostic_log_path: Option<PathBuf>,
    },
    Cancelled,
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool { matches!(self, BuildOutcome::Success { .. }) }

    pub fn diagnostic_log_path(&self) -> Option<&Path> {
        match self {
            BuildOutcome::Failure { diagnostic_log_path, .. } => diagnostic_log_path.as_deref(),
            _ => None,
        }
    }
}

/// Final report handed to the caller alongside the outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub session_id: Uuid,
    pub outcome: BuildOutcome,
    /// Last progress estimate; frozen on failure, never forced to 0 or 100.
    pub progress: f32,
    pub lines: u64,
    /// Lines not delivered live because the consumer lagged (still in the full capture).
    pub dropped: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    LocalBuild,
    RemoteBuild,
    RemoteReset,
}

/// Coarse lifecycle of the active session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SessionPhase {
    Starting = 0,
    Running = 1,
    Syncing = 2,
    Executing = 3,
    Finishing = 4,
}

impl SessionPhase {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionPhase::Running,
            2 => SessionPhase::Syncing,
            3 => SessionPhase::Executing,
            4 => SessionPhase::Finishing,
            _ => SessionPhase::Starting,
        }
    }
}

/// Read-only view of the in-flight session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub id: Uuid,
    pub kind: SessionKind,
    pub phase: SessionPhase,
    pub started_at: chrono::DateTime<chrono::Local>,
    pub lines: u64,
    pub progress: f32,
}

pub mod prelude {
    pub use super::{
        ArchivedArtifact, BuildError, BuildOutcome, BuildReport, BuildRequest, BuildResult, BuildTarget, Credential,
        HardwareProfile, OutputLine, Platform, RemoteTarget, Secret, SessionKind, SessionPhase, SessionStatus,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_bounds_hold_for_all_inputs() {
        for cores in 0..=256usize {
            assert!(plan_workers(cores) >= 1, "cores={}", cores);
        }
        for ram_gib in [0u64, 1, 2, 4, 7, 8, 9, 16, 31, 32, 33, 64, 512] {
            let heap = plan_heap(ram_gib * GIB);
            assert!((MIN_HEAP_BYTES..=MAX_HEAP_BYTES).contains(&heap), "ram={}GiB heap={}", ram_gib, heap);
        }
        assert_eq!(plan_heap(u64::MAX), MAX_HEAP_BYTES);
    }

    #[test]
    fn eight_cores_sixteen_gib() {
        let hw = HardwareProfile::derive(8, 16 * GIB);
        assert_eq!(hw.max_workers, 7);
        assert_eq!(hw.heap_bytes, 8 * GIB);
        assert_eq!(hw.heap_mib(), 8192);
    }

    #[test]
    fn small_and_large_hosts_clamp() {
        let lo = HardwareProfile::derive(1, 2 * GIB);
        assert_eq!(lo.max_workers, 1);
        assert_eq!(lo.heap_bytes, 4 * GIB);
        let hi = HardwareProfile::derive(32, 256 * GIB);
        assert_eq!(hi.max_workers, 29);
        assert_eq!(hi.heap_bytes, 16 * GIB);
    }

    fn remote() -> RemoteTarget {
        RemoteTarget {
            host: "10.0.0.5:2222".into(),
            user: "ci".into(),
            credential: Credential::Password(Secret::new("hunter2")),
            remote_project_path: "/Users/ci/app".into(),
            scheme: "App".into(),
        }
    }

    #[test]
    fn host_port_parsing() {
        let r = remote();
        assert_eq!(r.host_and_port(), ("10.0.0.5", 2222));
        assert_eq!(r.login(), "ci@10.0.0.5");
        let plain = RemoteTarget { host: "mac.local".into(), ..remote() };
        assert_eq!(plain.host_and_port(), ("mac.local", 22));
    }

    #[test]
    fn secret_is_redacted() {
        let shown = format!("{:?}", remote());
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("Secret(***)"));
    }

    #[test]
    fn target_must_match_platform() {
        assert!(BuildRequest::local("/p", BuildTarget::Apk).check_target().is_ok());
        assert!(BuildRequest::remote("/p", BuildTarget::Simulator, remote()).check_target().is_ok());
        assert!(matches!(BuildRequest::local("/p", BuildTarget::Device).check_target(), Err(BuildError::InvalidRequest(_))));
        assert!(matches!(BuildRequest::remote("/p", BuildTarget::Aab, remote()).check_target(), Err(BuildError::InvalidRequest(_))));
    }

    #[test]
    fn empty_custom_root_is_ignored() {
        let req = BuildRequest::local("/p", BuildTarget::Apk).with_output("");
        assert!(req.custom_root().is_none());
        let req = req.with_output("/out");
        assert_eq!(req.custom_root(), Some(Path::new("/out")));
    }

    #[test]
    fn request_deserializes_from_json() {
        let req: BuildRequest = serde_json::from_value(serde_json::json!({
            "working_dir": "/work/app",
            "target": "simulator",
            "platform": { "remote": {
                "host": "mac", "user": "me",
                "credential": { "key_file": "/home/me/.ssh/id_ed25519" },
                "remote_project_path": "~/app", "scheme": "App"
            }}
        }))
        .unwrap();
        assert!(req.is_remote());
        assert!(!req.turbo);
        assert!(req.check_target().is_ok());
    }

    #[test]
    fn outcome_serializes_with_state_tag() {
        let out = BuildOutcome::Failure { error: BuildError::Sync("unreachable".into()), diagnostic_log_path: None };
        let v = serde_json::to_value(&out).unwrap();
        assert_eq!(v["state"], "failure");
        assert!(BuildError::Sync(String::new()).hint().is_some());
        assert!(!BuildError::Cancelled.is_fault());
    }
}
