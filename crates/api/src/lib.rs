//! Zenith public API: the build orchestration engine frontends depend on.
//!
//! `Engine` owns the cached hardware profile, one session slot, and the local
//! and remote orchestrators that share it. Every session hands back a
//! `SessionHandle`: numbered output lines carrying the running progress
//! estimate, and exactly one terminal value.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;
use zenith_archive::{ArchiveEntry, ArtifactArchive, DiagnosticLogs};
use zenith_core::project;
use zenith_hardware::{profile_with, HostInfo, SystemHost};
use zenith_ops::{GradleToolchain, ProcessSupervisor, RunHandle, RunOutcome, SessionSlot, Toolchain};
use zenith_progress::ProgressTracker;
use zenith_satellite::SatelliteOrchestrator;

pub mod config;

pub use config::EngineConfig;
pub use zenith_core::prelude::*;
pub use zenith_satellite::ResetReport;

/// Live side of one session.
pub struct SessionHandle<T> {
    pub session_id: Uuid,
    pub rx: mpsc::Receiver<OutputLine>,
    /// Resolves once, after the session released the slot.
    pub result: oneshot::Receiver<T>,
}

pub type BuildHandle = SessionHandle<BuildReport>;
pub type ResetHandle = SessionHandle<ResetReport>;

/// Build orchestration surface.
#[async_trait::async_trait]
pub trait ZenithApi: Send + Sync {
    /// Host profile, read once and cached. Never fails: unreadable counts fall back.
    async fn profile(&self) -> BuildResult<HardwareProfile>;

    /// Start a local or remote build. Rejected with `AlreadyRunning` while any session is active.
    async fn request_build(&self, request: BuildRequest) -> BuildResult<BuildHandle>;

    /// Cancel the active session and wait for its teardown. `false` when idle.
    async fn abort(&self) -> BuildResult<bool>;

    async fn status(&self) -> BuildResult<Option<SessionStatus>>;

    /// Directory a build of `project_root` archives into; created if missing.
    async fn archive_locate(&self, project_root: &Path, custom_root: Option<&Path>) -> BuildResult<PathBuf>;

    /// Same directory as `archive_locate`, without creating it.
    async fn archive_dir(&self, project_root: &Path, custom_root: Option<&Path>) -> BuildResult<PathBuf>;

    async fn archive_list(&self, dir: &Path) -> BuildResult<Vec<ArchiveEntry>>;

    /// Remove archived artifacts from `dir`; returns how many were deleted.
    async fn archive_clear(&self, dir: &Path) -> BuildResult<usize>;

    /// Nuclear reset of the satellite's iOS environment. Occupies the session slot.
    async fn remote_reset(&self, target: RemoteTarget) -> BuildResult<ResetHandle>;

    /// Start the toolchain daemon in the background. Fire-and-forget.
    async fn prewarm(&self, working_dir: &Path) -> BuildResult<()>;

    /// Android app roots near `start` (its parent and the user's documents included).
    async fn scan_projects(&self, start: &Path) -> BuildResult<Vec<PathBuf>>;
}

pub struct Engine {
    config: EngineConfig,
    slot: Arc<SessionSlot>,
    host: Arc<dyn HostInfo>,
    profile: ArcSwapOption<HardwareProfile>,
    archive: ArtifactArchive,
    supervisor: ProcessSupervisor,
    satellite: SatelliteOrchestrator,
}

impl Engine {
    /// Engine driving the Gradle wrapper for local builds.
    pub fn new(config: EngineConfig) -> Self {
        let toolchain = GradleToolchain::new(config.launcher, config.android_sdk.clone());
        Self::with_toolchain(config, Arc::new(toolchain))
    }

    pub fn from_env() -> Self { Self::new(EngineConfig::from_env()) }

    pub fn with_toolchain(config: EngineConfig, toolchain: Arc<dyn Toolchain>) -> Self {
        let slot = SessionSlot::new();
        let archive = ArtifactArchive::new(config.builds_dir.clone());
        let logs = DiagnosticLogs::new(config.logs_dir.clone());
        let supervisor = ProcessSupervisor::new(slot.clone(), toolchain)
            .with_archive(archive.clone())
            .with_logs(logs.clone())
            .with_limits(config.queue_cap, config.line_max);
        let mut tools = config.tools.clone();
        tools.managed_dirs = vec![config.builds_dir.clone(), config.logs_dir.clone()];
        let satellite = SatelliteOrchestrator::new(slot.clone(), tools)
            .with_logs(logs)
            .with_limits(config.queue_cap, config.line_max);
        Self {
            config,
            slot,
            host: Arc::new(SystemHost),
            profile: ArcSwapOption::empty(),
            archive,
            supervisor,
            satellite,
        }
    }

    /// Replace the host info source; drops any cached profile.
    pub fn with_host(mut self, host: Arc<dyn HostInfo>) -> Self {
        self.host = host;
        self.profile.store(None);
        self
    }

    pub fn config(&self) -> &EngineConfig { &self.config }

    /// Read the host again and replace the cached profile.
    pub fn reprofile(&self) -> HardwareProfile {
        let hw = profile_with(self.host.as_ref());
        self.profile.store(Some(Arc::new(hw)));
        hw
    }

    fn cached_profile(&self) -> HardwareProfile {
        match self.profile.load_full() {
            Some(hw) => *hw,
            None => self.reprofile(),
        }
    }
}

#[async_trait::async_trait]
impl ZenithApi for Engine {
    async fn profile(&self) -> BuildResult<HardwareProfile> { Ok(self.cached_profile()) }

    async fn request_build(&self, request: BuildRequest) -> BuildResult<BuildHandle> {
        let t0 = Instant::now();
        let run = if request.is_remote() {
            self.satellite.start(&request).await
        } else {
            let hw = self.cached_profile();
            self.supervisor.start(&request, &hw).await
        };
        let run = match run {
            Ok(run) => run,
            Err(e) => {
                warn!(error = %e, build_target = request.target.as_str(), "api: build rejected");
                return Err(e);
            }
        };
        info!(
            session = %run.session.id,
            build_target = request.target.as_str(),
            remote = request.is_remote(),
            turbo = request.turbo,
            took_ms = %t0.elapsed().as_millis(),
            "api: build accepted"
        );
        let session_id = run.session.id;
        Ok(forward(run, self.config.queue_cap, move |done, tracker, counts| {
            let (outcome, dropped) = match done {
                Some(RunOutcome { outcome, dropped }) => (outcome, dropped),
                None => (lost(), 0),
            };
            BuildReport {
                session_id,
                outcome,
                progress: tracker.current(),
                lines: counts.lines,
                dropped: dropped + counts.lagged,
                duration_ms: t0.elapsed().as_millis() as u64,
            }
        }))
    }

    async fn abort(&self) -> BuildResult<bool> {
        let t0 = Instant::now();
        let kind = self.slot.current().map(|s| s.kind);
        let stopped = match kind {
            Some(SessionKind::LocalBuild) => self.supervisor.cancel().await,
            Some(_) => self.satellite.cancel().await,
            None => false,
        };
        info!(stopped, took_ms = %t0.elapsed().as_millis(), "api: abort done");
        Ok(stopped)
    }

    async fn status(&self) -> BuildResult<Option<SessionStatus>> { Ok(self.slot.status()) }

    async fn archive_locate(&self, project_root: &Path, custom_root: Option<&Path>) -> BuildResult<PathBuf> {
        let archive = self.archive.clone();
        let (root, custom) = (project_root.to_path_buf(), custom_root.map(Path::to_path_buf));
        blocking(move || archive.resolve_output_dir(&root, custom.as_deref())).await
    }

    async fn archive_dir(&self, project_root: &Path, custom_root: Option<&Path>) -> BuildResult<PathBuf> {
        Ok(self.archive.output_dir(project_root, custom_root))
    }

    async fn archive_list(&self, dir: &Path) -> BuildResult<Vec<ArchiveEntry>> {
        let archive = self.archive.clone();
        let dir = dir.to_path_buf();
        blocking(move || archive.list(&dir)).await
    }

    async fn archive_clear(&self, dir: &Path) -> BuildResult<usize> {
        let t0 = Instant::now();
        let archive = self.archive.clone();
        let dir = dir.to_path_buf();
        let removed = blocking(move || archive.clear(&dir)).await?;
        info!(removed, took_ms = %t0.elapsed().as_millis(), "api: archive clear ok");
        Ok(removed)
    }

    async fn remote_reset(&self, target: RemoteTarget) -> BuildResult<ResetHandle> {
        let run = self.satellite.reset(&target).await?;
        info!(session = %run.session.id, host = %target.host, "api: reset accepted");
        Ok(forward(run, self.config.queue_cap, |done, _, _| {
            done.unwrap_or_else(|| ResetReport { outcome: lost(), failed_steps: Vec::new() })
        }))
    }

    async fn prewarm(&self, working_dir: &Path) -> BuildResult<()> {
        self.supervisor.prewarm(working_dir);
        Ok(())
    }

    async fn scan_projects(&self, start: &Path) -> BuildResult<Vec<PathBuf>> {
        let t0 = Instant::now();
        let start = start.to_path_buf();
        let found = tokio::task::spawn_blocking(move || project::scan(&project::scan_roots(&start)))
            .await
            .map_err(|e| BuildError::ProjectNotFound(format!("project scan failed: {}", e)))?;
        info!(found = found.len(), took_ms = %t0.elapsed().as_millis(), "api: scan ok");
        Ok(found)
    }
}

struct Counts {
    lines: u64,
    /// Dropped here, on top of what the session's own channel dropped.
    lagged: u64,
}

fn lost() -> BuildOutcome {
    BuildOutcome::Failure { error: BuildError::Toolchain("session ended without a result".into()), diagnostic_log_path: None }
}

async fn blocking<T, F>(f: F) -> BuildResult<T>
where
    F: FnOnce() -> BuildResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| BuildError::ArchiveIo(format!("archive task failed: {}", e)))?
}

/// Number the session's lines, run the progress estimate over them, and build
/// the terminal value once the line stream has closed.
///
/// Never waits on the reader: a full channel drops the line and counts it,
/// so the result resolves even if nobody drains `rx`.
fn forward<T, R, F>(run: RunHandle<T>, cap: usize, finish: F) -> SessionHandle<R>
where
    T: Send + 'static,
    R: Send + 'static,
    F: FnOnce(Option<T>, &ProgressTracker, Counts) -> R + Send + 'static,
{
    let RunHandle { session, mut rx, done } = run;
    let session_id = session.id;
    let (tx, out_rx) = mpsc::channel(cap.max(1));
    let (res_tx, res_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut tracker = ProgressTracker::new();
        let mut seq = 0u64;
        let mut lagged = 0u64;
        while let Some(text) = rx.recv().await {
            let progress = tracker.observe(&text);
            session.publish_progress(progress);
            match tx.try_send(OutputLine { seq, text, progress }) {
                Ok(()) => seq += 1,
                Err(mpsc::error::TrySendError::Full(_)) => lagged += 1,
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        drop(tx);
        let done = done.await.ok();
        let _ = res_tx.send(finish(done, &tracker, Counts { lines: session.lines(), lagged }));
    });
    SessionHandle { session_id, rx: out_rx, result: res_rx }
}
