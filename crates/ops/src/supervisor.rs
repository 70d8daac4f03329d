use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zenith_archive::{ArtifactArchive, DiagnosticLogs};
use zenith_core::project::ensure_android_project;
use zenith_core::{BuildError, BuildOutcome, BuildRequest, HardwareProfile, SessionKind, SessionPhase};

use crate::pump::{pump_bytes_to_lines, LineSink, DEFAULT_LINE_MAX, DEFAULT_QUEUE_CAP};
use crate::session::{ActiveSession, SessionGuard, SessionSlot};
use crate::toolchain::{CommandSpec, Toolchain};
use crate::{RunHandle, RunOutcome};

/// How long pumps may keep draining after the child is gone.
pub const PUMP_GRACE: Duration = Duration::from_secs(2);

/// Log file prefix for failed local builds.
pub const ANDROID_FAIL_PREFIX: &str = "android_build_fail";

/// Spawn `spec` and wire both output streams into one bounded channel.
pub struct Spawned {
    pub child: Child,
    pub sink: Arc<LineSink>,
    pub rx: mpsc::Receiver<String>,
    pub pumps: [JoinHandle<()>; 2],
}

pub fn spawn_piped(spec: &CommandSpec, session: &Arc<ActiveSession>, queue_cap: usize, line_max: usize) -> Result<Spawned, BuildError> {
    let (tx, rx) = mpsc::channel(queue_cap.max(1));
    let sink = Arc::new(LineSink::new(tx, Arc::clone(session), line_max));
    let (child, pumps) = spawn_into(spec, Arc::clone(&sink), session.cancel_token())?;
    Ok(Spawned { child, sink, rx, pumps })
}

/// Spawn `spec` with its output going into an existing sink.
pub fn spawn_into(spec: &CommandSpec, sink: Arc<LineSink>, cancel: CancellationToken) -> Result<(Child, [JoinHandle<()>; 2]), BuildError> {
    let mut child = spec
        .to_command()
        .spawn()
        .map_err(|e| BuildError::ProcessSpawn(format!("{}: {}", spec.program, e)))?;
    let stdout = child.stdout.take().ok_or_else(|| BuildError::ProcessSpawn("stdout not captured".into()))?;
    let stderr = child.stderr.take().ok_or_else(|| BuildError::ProcessSpawn("stderr not captured".into()))?;
    let out = tokio::spawn({
        let (sink, cancel) = (Arc::clone(&sink), cancel.clone());
        async move { pump_bytes_to_lines(ReaderStream::new(stdout), sink, cancel, "stdout").await }
    });
    let err = tokio::spawn({
        let sink = Arc::clone(&sink);
        async move { pump_bytes_to_lines(ReaderStream::new(stderr), sink, cancel, "stderr").await }
    });
    debug!(cmd = %spec.display(), pid = ?child.id(), "ops: spawn ok");
    Ok((child, [out, err]))
}

/// Wait for both pumps, giving up after `PUMP_GRACE` (a grandchild may hold the pipe open).
pub async fn drain(pumps: [JoinHandle<()>; 2]) {
    let aborts: Vec<_> = pumps.iter().map(|h| h.abort_handle()).collect();
    if tokio::time::timeout(PUMP_GRACE, futures::future::join_all(pumps)).await.is_err() {
        warn!("ops: output pumps still open after exit; abandoning");
        aborts.iter().for_each(|a| a.abort());
    }
}

/// Kill `child` and everything it started.
pub async fn kill_tree(child: &mut Child) {
    if let Some(pid) = child.id() {
        if let Err(e) = signal_tree(pid).await {
            warn!(pid, error = %e, "ops: tree kill failed; killing direct child only");
        }
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "ops: child already gone");
    }
}

#[cfg(unix)]
async fn signal_tree(pid: u32) -> std::io::Result<std::process::ExitStatus> {
    // the child leads its own group, so -pid reaches every descendant
    tokio::process::Command::new("kill").args(["-s", "KILL", "--", &format!("-{}", pid)]).status().await
}

#[cfg(windows)]
async fn signal_tree(pid: u32) -> std::io::Result<std::process::ExitStatus> {
    tokio::process::Command::new("taskkill").args(["/PID", &pid.to_string(), "/T", "/F"]).status().await
}

#[cfg(not(any(unix, windows)))]
async fn signal_tree(_pid: u32) -> std::io::Result<std::process::ExitStatus> {
    Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "no process tree kill on this platform"))
}

enum Exit {
    Code(std::io::Result<std::process::ExitStatus>),
    Cancelled,
}

/// Runs local builds, one at a time, through a pluggable toolchain.
#[derive(Clone)]
pub struct ProcessSupervisor {
    slot: Arc<SessionSlot>,
    toolchain: Arc<dyn Toolchain>,
    archive: ArtifactArchive,
    logs: DiagnosticLogs,
    queue_cap: usize,
    line_max: usize,
}

impl ProcessSupervisor {
    pub fn new(slot: Arc<SessionSlot>, toolchain: Arc<dyn Toolchain>) -> Self {
        Self {
            slot,
            toolchain,
            archive: ArtifactArchive::default(),
            logs: DiagnosticLogs::default(),
            queue_cap: DEFAULT_QUEUE_CAP,
            line_max: DEFAULT_LINE_MAX,
        }
    }

    pub fn with_archive(mut self, archive: ArtifactArchive) -> Self {
        self.archive = archive;
        self
    }

    pub fn with_logs(mut self, logs: DiagnosticLogs) -> Self {
        self.logs = logs;
        self
    }

    pub fn with_limits(mut self, queue_cap: usize, line_max: usize) -> Self {
        self.queue_cap = queue_cap;
        self.line_max = line_max;
        self
    }

    pub fn slot(&self) -> &Arc<SessionSlot> { &self.slot }

    /// Claim the slot, validate, spawn. The returned handle streams raw lines and
    /// resolves once with the outcome, after the slot has been released.
    pub async fn start(&self, request: &BuildRequest, profile: &HardwareProfile) -> Result<RunHandle<RunOutcome>, BuildError> {
        let guard = self.slot.claim(SessionKind::LocalBuild)?;
        if request.is_remote() {
            return Err(BuildError::InvalidRequest("remote request sent to the local supervisor".into()));
        }
        request.check_target()?;
        ensure_android_project(&request.working_dir)?;
        let spec = self.toolchain.command(request, profile)?;
        let session = Arc::clone(guard.session());
        let Spawned { child, sink, rx, pumps } = spawn_piped(&spec, &session, self.queue_cap, self.line_max)?;
        session.set_phase(SessionPhase::Running);
        counter!("builds_started_total", 1u64);
        info!(
            session = %session.id,
            build_target = %request.target,
            turbo = request.turbo,
            workers = profile.max_workers,
            heap_mib = profile.heap_mib(),
            "ops: supervisor spawn ok"
        );

        let (done_tx, done_rx) = oneshot::channel();
        let job = Job {
            guard,
            child,
            sink,
            pumps,
            artifact: self.toolchain.artifact(request),
            project_root: request.working_dir.clone(),
            custom_root: request.custom_root().map(Path::to_path_buf),
            archive: self.archive.clone(),
            logs: self.logs.clone(),
        };
        tokio::spawn(async move {
            let outcome = job.run().await;
            let _ = done_tx.send(outcome);
        });
        Ok(RunHandle { session, rx, done: done_rx })
    }

    /// Stop the running build, if any, and wait until its slot is free.
    pub async fn cancel(&self) -> bool { self.slot.cancel().await }

    /// Fire-and-forget daemon warm-up. Errors are logged, never returned.
    pub fn prewarm(&self, working_dir: &Path) {
        let root = match ensure_android_project(working_dir) {
            Ok(_) => working_dir.to_path_buf(),
            Err(e) => {
                debug!(error = %e, "ops: prewarm skipped");
                return;
            }
        };
        let Some(spec) = self.toolchain.prewarm(&root) else { return };
        let mut cmd = spec.to_command();
        cmd.stdout(std::process::Stdio::null()).stderr(std::process::Stdio::null()).kill_on_drop(false);
        match cmd.spawn() {
            Ok(mut child) => {
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(st) => debug!(status = %st, "ops: prewarm finished"),
                        Err(e) => debug!(error = %e, "ops: prewarm wait failed"),
                    }
                });
                info!(cmd = %spec.display(), "ops: prewarm started");
            }
            Err(e) => warn!(error = %e, "ops: prewarm spawn failed"),
        }
    }
}

struct Job {
    guard: SessionGuard,
    child: Child,
    sink: Arc<LineSink>,
    pumps: [JoinHandle<()>; 2],
    artifact: Option<PathBuf>,
    project_root: PathBuf,
    custom_root: Option<PathBuf>,
    archive: ArtifactArchive,
    logs: DiagnosticLogs,
}

impl Job {
    async fn run(self) -> RunOutcome {
        let Job { guard, mut child, sink, pumps, artifact, project_root, custom_root, archive, logs } = self;
        let session = Arc::clone(guard.session());
        let started = Instant::now();
        let cancel = session.cancel_token();
        let exit = tokio::select! {
            st = child.wait() => Exit::Code(st),
            _ = cancel.cancelled() => {
                kill_tree(&mut child).await;
                Exit::Cancelled
            }
        };
        drain(pumps).await;
        session.set_phase(SessionPhase::Finishing);
        let dropped = sink.dropped();

        let outcome = match exit {
            Exit::Cancelled => {
                counter!("builds_cancelled_total", 1u64);
                info!(session = %session.id, "ops: build cancelled");
                BuildOutcome::Cancelled
            }
            Exit::Code(Ok(st)) if st.success() => {
                counter!("builds_succeeded_total", 1u64);
                archive_output(archive, artifact, project_root, custom_root).await
            }
            Exit::Code(res) => {
                counter!("builds_failed_total", 1u64);
                let error = match res {
                    Ok(st) => BuildError::Toolchain(format!("build exited with {}", st)),
                    Err(e) => BuildError::Toolchain(format!("waiting for build failed: {}", e)),
                };
                error!(session = %session.id, error = %error, "ops: build failed");
                let capture = sink.capture();
                let diagnostic_log_path = write_log(logs, project_root, ANDROID_FAIL_PREFIX, capture).await;
                BuildOutcome::Failure { error, diagnostic_log_path }
            }
        };
        histogram!("build_duration_ms", started.elapsed().as_secs_f64() * 1000.0);
        drop(sink);
        guard.finish();
        RunOutcome { outcome, dropped }
    }
}

async fn archive_output(archive: ArtifactArchive, artifact: Option<PathBuf>, project_root: PathBuf, custom_root: Option<PathBuf>) -> BuildOutcome {
    let Some(source) = artifact.filter(|p| p.is_file()) else {
        warn!(root = %project_root.display(), "ops: build succeeded but no output found");
        return BuildOutcome::Success { artifact: None, archive_error: None };
    };
    let res = tokio::task::spawn_blocking(move || archive.archive(&source, &project_root, custom_root.as_deref()))
        .await
        .unwrap_or_else(|e| Err(BuildError::ArchiveIo(format!("archive task: {}", e))));
    match res {
        Ok(a) => BuildOutcome::Success { artifact: Some(a), archive_error: None },
        Err(e) => {
            warn!(error = %e, "ops: archiving failed after a successful build");
            BuildOutcome::Success { artifact: None, archive_error: Some(e) }
        }
    }
}

/// Write the full capture; a log that cannot be written is only a warning.
pub async fn write_log(logs: DiagnosticLogs, project_root: PathBuf, prefix: &'static str, capture: String) -> Option<PathBuf> {
    match tokio::task::spawn_blocking(move || logs.write(&project_root, prefix, &capture)).await {
        Ok(Ok(p)) => Some(p),
        Ok(Err(e)) => {
            warn!(error = %e, "ops: diagnostic log not written");
            None
        }
        Err(e) => {
            warn!(error = %e, "ops: diagnostic log task failed");
            None
        }
    }
}
