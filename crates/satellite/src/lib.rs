//! Zenith satellite: build on a remote machine in two phases.
//!
//! Phase 1 mirrors the project with rsync; phase 2 runs the toolchain over ssh.
//! The phases fail in separate domains (`Sync` vs `RemoteExecution`) and a sync
//! failure never starts phase 2. Completion of phase 2 is read from a sentinel
//! line the wrapper script prints, not from the ssh exit status.
//!
//! Cancel is asymmetric: local transfer/session processes are always killed;
//! the remote `xcodebuild` gets a detached best-effort kill and may outlive the
//! session.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zenith_archive::DiagnosticLogs;
use zenith_core::project::ensure_remote_project;
use zenith_core::{BuildError, BuildOutcome, BuildRequest, BuildTarget, Platform, RemoteTarget, SessionKind, SessionPhase};
use zenith_ops::supervisor::{drain, spawn_into, write_log};
use zenith_ops::{kill_tree, ActiveSession, CommandSpec, LineSink, RunHandle, RunOutcome, SessionGuard, SessionSlot, DEFAULT_LINE_MAX, DEFAULT_QUEUE_CAP};

pub mod script;
pub mod transport;

pub use script::{parse_sentinel, Sentinel, FAIL_MARKER, OK_MARKER};
pub use transport::{check_target, Tools, SYNC_EXCLUDES};

/// Log file prefix for failed remote builds.
pub const IOS_FAIL_PREFIX: &str = "ios_build_fail";

/// Markers only count while the remote script runs; a transfer echoing one is plain output.
fn sentinel_in_phase(session: &ActiveSession, line: &str) -> Option<Sentinel> {
    if session.phase() != SessionPhase::Executing {
        return None;
    }
    parse_sentinel(line)
}

/// After the sentinel, how long ssh gets to close on its own.
const SENTINEL_GRACE: Duration = Duration::from_secs(5);

/// Terminal value of a nuclear reset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResetReport {
    pub outcome: BuildOutcome,
    /// Step numbers (1-based) that reported a failure. Later steps still ran.
    pub failed_steps: Vec<u32>,
}

enum Halt {
    Cancelled,
    Failed(BuildError),
}

enum Executed {
    Marker(Sentinel),
    NoMarker(String),
}

/// Runs remote builds and resets, sharing the single session slot with local builds.
#[derive(Clone)]
pub struct SatelliteOrchestrator {
    slot: Arc<SessionSlot>,
    tools: Tools,
    logs: DiagnosticLogs,
    queue_cap: usize,
    line_max: usize,
}

impl SatelliteOrchestrator {
    pub fn new(slot: Arc<SessionSlot>, tools: Tools) -> Self {
        Self { slot, tools, logs: DiagnosticLogs::default(), queue_cap: DEFAULT_QUEUE_CAP, line_max: DEFAULT_LINE_MAX }
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

    pub fn tools(&self) -> &Tools { &self.tools }

    /// Claim the slot, validate, then sync and execute in the background.
    pub async fn start(&self, request: &BuildRequest) -> Result<RunHandle<RunOutcome>, BuildError> {
        let guard = self.slot.claim(SessionKind::RemoteBuild)?;
        request.check_target()?;
        let Platform::Remote(remote) = &request.platform else {
            return Err(BuildError::InvalidRequest("local request sent to the satellite".into()));
        };
        ensure_remote_project(&request.working_dir)?;

        let session = Arc::clone(guard.session());
        let (tx, rx) = mpsc::channel(self.queue_cap.max(1));
        let (marker_tx, marker_rx) = watch::channel(None);
        let sink = LineSink::new(tx, Arc::clone(&session), self.line_max).with_filter(Box::new({
            let session = Arc::clone(&session);
            move |line| match sentinel_in_phase(&session, line) {
                Some(s) => {
                    marker_tx.send_if_modified(|cur| cur.is_none() && cur.replace(s).is_none());
                    true
                }
                None => false,
            }
        }));
        counter!("builds_started_total", 1u64);
        info!(session = %session.id, host = %remote.host, build_target = %request.target, "satellite: build accepted");

        let job = Job {
            ctx: self.clone(),
            guard,
            sink: Arc::new(sink),
            marker_rx,
            remote: remote.clone(),
            working_dir: request.working_dir.clone(),
        };
        let target = request.target;
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = job.build(target).await;
            let _ = done_tx.send(outcome);
        });
        Ok(RunHandle { session, rx, done: done_rx })
    }

    /// Nuclear reset of the remote toolchain state. Occupies the slot like a build.
    pub async fn reset(&self, remote: &RemoteTarget) -> Result<RunHandle<ResetReport>, BuildError> {
        let guard = self.slot.claim(SessionKind::RemoteReset)?;
        check_target(remote)?;

        let session = Arc::clone(guard.session());
        let (tx, rx) = mpsc::channel(self.queue_cap.max(1));
        let (marker_tx, marker_rx) = watch::channel(None);
        let failed = Arc::new(Mutex::new(Vec::new()));
        let sink = LineSink::new(tx, Arc::clone(&session), self.line_max).with_filter(Box::new({
            let failed = Arc::clone(&failed);
            let session = Arc::clone(&session);
            move |line| {
                if let Some(s) = sentinel_in_phase(&session, line) {
                    marker_tx.send_if_modified(|cur| cur.is_none() && cur.replace(s).is_none());
                    return true;
                }
                if let Some(n) = script::parse_failed_step(line) {
                    failed.lock().unwrap_or_else(PoisonError::into_inner).push(n);
                }
                false
            }
        }));
        info!(session = %session.id, host = %remote.host, "satellite: nuclear reset accepted");

        let job = Job {
            ctx: self.clone(),
            guard,
            sink: Arc::new(sink),
            marker_rx,
            remote: remote.clone(),
            working_dir: PathBuf::new(),
        };
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            let outcome = job.reset().await;
            let failed_steps = std::mem::take(&mut *failed.lock().unwrap_or_else(PoisonError::into_inner));
            if !failed_steps.is_empty() {
                warn!(steps = ?failed_steps, "satellite: reset steps failed");
            }
            let _ = done_tx.send(ResetReport { outcome, failed_steps });
        });
        Ok(RunHandle { session, rx, done: done_rx })
    }

    /// Stop the active session, if any. Returns once local resources are released.
    pub async fn cancel(&self) -> bool { self.slot.cancel().await }

    /// Fire a `pkill` over a fresh session; never awaited by the caller.
    fn remote_kill(&self, remote: &RemoteTarget) {
        let spec = self.tools.ssh(remote, &script::posix(script::REMOTE_KILL));
        let limit = self.tools.connect_timeout + Duration::from_secs(5);
        tokio::spawn(async move {
            let mut cmd = spec.to_command();
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
            let mut child = match cmd.spawn() {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "satellite: remote kill not started");
                    return;
                }
            };
            match tokio::time::timeout(limit, child.wait()).await {
                Ok(Ok(st)) => debug!(status = %st, "satellite: remote kill delivered"),
                Ok(Err(e)) => warn!(error = %e, "satellite: remote kill failed"),
                Err(_) => {
                    let _ = child.kill().await;
                    warn!("satellite: remote kill timed out; remote build may continue");
                }
            }
        });
    }
}

struct Job {
    ctx: SatelliteOrchestrator,
    guard: SessionGuard,
    sink: Arc<LineSink>,
    marker_rx: watch::Receiver<Option<Sentinel>>,
    remote: RemoteTarget,
    working_dir: PathBuf,
}

impl Job {
    fn session(&self) -> Arc<ActiveSession> { Arc::clone(self.guard.session()) }

    async fn build(self, target: BuildTarget) -> RunOutcome {
        let started = Instant::now();
        let session = self.session();
        let cancel = session.cancel_token();

        let result = match self.sync(&session, &cancel).await {
            Err(halt) => Err(halt),
            Ok(()) => {
                session.set_phase(SessionPhase::Executing);
                info!(session = %session.id, "satellite: sync ok; executing");
                let spec = self.ctx.tools.ssh(&self.remote, &script::posix(&script::build_script(&self.remote, target)));
                self.execute(&spec, &session, &cancel).await
            }
        };
        session.set_phase(SessionPhase::Finishing);

        let outcome = match result {
            Ok(Executed::Marker(Sentinel::Ok)) => {
                counter!("builds_succeeded_total", 1u64);
                info!(session = %session.id, took_ms = %started.elapsed().as_millis(), "satellite: build succeeded");
                BuildOutcome::Success { artifact: None, archive_error: None }
            }
            Ok(Executed::Marker(Sentinel::Fail(code))) => {
                self.failure(BuildError::RemoteExecution(format!("remote build failed with code {}", code))).await
            }
            Ok(Executed::NoMarker(status)) => {
                self.failure(BuildError::RemoteExecution(format!("remote session ended without a result marker ({})", status))).await
            }
            Err(Halt::Failed(e)) => self.failure(e).await,
            Err(Halt::Cancelled) => {
                counter!("builds_cancelled_total", 1u64);
                info!(session = %session.id, "satellite: build cancelled");
                BuildOutcome::Cancelled
            }
        };
        histogram!("build_duration_ms", started.elapsed().as_secs_f64() * 1000.0);
        let dropped = self.sink.dropped();
        self.finish();
        RunOutcome { outcome, dropped }
    }

    async fn reset(self) -> BuildOutcome {
        let session = self.session();
        let cancel = session.cancel_token();
        session.set_phase(SessionPhase::Executing);
        let spec = self.ctx.tools.ssh(&self.remote, &script::posix(&script::reset_script(&self.remote)));
        let outcome = match self.execute(&spec, &session, &cancel).await {
            Ok(Executed::Marker(Sentinel::Ok)) => BuildOutcome::Success { artifact: None, archive_error: None },
            Ok(Executed::Marker(Sentinel::Fail(code))) => BuildOutcome::Failure {
                error: BuildError::RemoteExecution(format!("reset script failed with code {}", code)),
                diagnostic_log_path: None,
            },
            Ok(Executed::NoMarker(status)) => BuildOutcome::Failure {
                error: BuildError::RemoteExecution(format!("reset session ended without a result marker ({})", status)),
                diagnostic_log_path: None,
            },
            Err(Halt::Failed(error)) => BuildOutcome::Failure { error, diagnostic_log_path: None },
            Err(Halt::Cancelled) => BuildOutcome::Cancelled,
        };
        info!(session = %session.id, success = outcome.is_success(), "satellite: reset finished");
        self.finish();
        outcome
    }

    async fn sync(&self, session: &ActiveSession, cancel: &CancellationToken) -> Result<(), Halt> {
        session.set_phase(SessionPhase::Syncing);
        check_target(&self.remote).map_err(Halt::Failed)?;
        let tools = &self.ctx.tools;
        let spec = tools.rsync(&self.working_dir, &self.remote);
        info!(session = %session.id, dest = %self.remote.remote_project_path, "satellite: syncing");
        let (mut child, pumps) = spawn_into(&spec, Arc::clone(&self.sink), cancel.clone())
            .map_err(|e| Halt::Failed(BuildError::Sync(format!("cannot start transfer: {}", e))))?;
        let exit = tokio::select! {
            st = child.wait() => Some(st),
            _ = cancel.cancelled() => {
                kill_tree(&mut child).await;
                None
            }
        };
        drain(pumps).await;
        match exit {
            None => Err(Halt::Cancelled),
            Some(Ok(st)) if st.success() => Ok(()),
            Some(Ok(st)) => Err(Halt::Failed(BuildError::Sync(format!("{} exited with {}", tools.rsync, st)))),
            Some(Err(e)) => Err(Halt::Failed(BuildError::Sync(format!("waiting for transfer: {}", e)))),
        }
    }

    /// Run one remote session until its sentinel, its exit, or cancel.
    async fn execute(&self, spec: &CommandSpec, session: &ActiveSession, cancel: &CancellationToken) -> Result<Executed, Halt> {
        let (mut child, pumps) = spawn_into(spec, Arc::clone(&self.sink), cancel.clone())
            .map_err(|e| Halt::Failed(BuildError::RemoteExecution(format!("cannot open remote session: {}", e))))?;
        let mut marker = self.marker_rx.clone();
        let exit: Option<String> = tokio::select! {
            st = child.wait() => Some(describe(st)),
            // the watch guard must not outlive this await or the pump's marker write would block
            Ok(()) = async { marker.wait_for(Option::is_some).await.map(|_| ()) } => {
                match tokio::time::timeout(SENTINEL_GRACE, child.wait()).await {
                    Ok(st) => Some(describe(st)),
                    Err(_) => {
                        debug!(session = %session.id, "satellite: session lingered after marker");
                        kill_tree(&mut child).await;
                        Some("closed after marker".into())
                    }
                }
            }
            _ = cancel.cancelled() => {
                kill_tree(&mut child).await;
                self.ctx.remote_kill(&self.remote);
                None
            }
        };
        drain(pumps).await;
        let Some(status) = exit else { return Err(Halt::Cancelled) };
        let seen = *self.marker_rx.borrow();
        Ok(match seen {
            Some(s) => Executed::Marker(s),
            None => Executed::NoMarker(status),
        })
    }

    async fn failure(&self, error: BuildError) -> BuildOutcome {
        counter!("builds_failed_total", 1u64);
        error!(session = %self.guard.session().id, error = %error, hint = ?error.hint(), "satellite: build failed");
        let mut capture = self.sink.capture();
        capture.push_str(&format!("error: {}\n", error));
        let diagnostic_log_path = write_log(self.ctx.logs.clone(), self.working_dir.clone(), IOS_FAIL_PREFIX, capture).await;
        BuildOutcome::Failure { error, diagnostic_log_path }
    }

    fn finish(self) {
        let Job { guard, sink, .. } = self;
        drop(sink);
        guard.finish();
    }
}

fn describe(st: std::io::Result<ExitStatus>) -> String {
    match st {
        Ok(st) => format!("transport exited with {}", st),
        Err(e) => format!("transport wait failed: {}", e),
    }
}
