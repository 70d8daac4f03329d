#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc::Receiver;
use zenith_core::{BuildError, BuildOutcome, BuildRequest, BuildTarget, Credential, RemoteTarget, Secret};
use zenith_ops::SessionSlot;
use zenith_satellite::{SatelliteOrchestrator, Tools, FAIL_MARKER, OK_MARKER};

/// A fake satellite: `ssh` runs the remote command locally with a fake
/// toolchain on PATH and HOME/TMPDIR sandboxed.
struct Fixture {
    root: PathBuf,
    local: PathBuf,
    remote: PathBuf,
    ssh: PathBuf,
    key: PathBuf,
}

fn script(path: &Path, body: &str) {
    std::fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

impl Fixture {
    fn new(tag: &str, xcodebuild: &str) -> Self {
        let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        let root = std::env::temp_dir().join(format!("zenith-sat-{}-{}", tag, nanos));
        let (local, remote, bin) = (root.join("local"), root.join("remote"), root.join("bin"));
        for d in [local.join("ios"), remote.join("ios/Pods"), bin.clone(), root.join("home"), root.join("tmp")] {
            std::fs::create_dir_all(d).unwrap();
        }
        script(&bin.join("xcodebuild"), xcodebuild);
        script(&bin.join("xcrun"), "exit 1");
        script(&bin.join("pod"), "exit 1");
        // keep the reset from touching real processes on the test host
        script(&bin.join("killall"), "exit 0");
        script(&bin.join("watchman"), "exit 0");
        let ssh = root.join("fake-ssh");
        script(
            &ssh,
            &format!(
                r#"touch '{root}/ssh-invoked'
for a; do last="$a"; done
case "$last" in *pkill*) touch '{root}/remote-kill'; exit 0;; esac
export PATH='{bin}':"$PATH" HOME='{root}/home' TMPDIR='{root}/tmp'
exec sh -c "$last""#,
                root = root.display(),
                bin = bin.display()
            ),
        );
        let key = root.join("id_test");
        std::fs::write(&key, b"not a real key").unwrap();
        Self { root, local, remote, ssh, key }
    }

    fn target(&self) -> RemoteTarget {
        RemoteTarget {
            host: "satellite.test".into(),
            user: "dev".into(),
            credential: Credential::KeyFile(self.key.clone()),
            remote_project_path: self.remote.to_string_lossy().to_string(),
            scheme: "Demo".into(),
        }
    }

    fn orchestrator(&self, rsync: &str) -> SatelliteOrchestrator {
        let tools = Tools { rsync: rsync.into(), ssh: self.ssh.to_string_lossy().to_string(), ..Tools::default() };
        SatelliteOrchestrator::new(SessionSlot::new(), tools)
    }

    fn request(&self, target: BuildTarget) -> BuildRequest { BuildRequest::remote(&self.local, target, self.target()) }

    fn ssh_invoked(&self) -> bool { self.root.join("ssh-invoked").exists() }
}

async fn collect(rx: &mut Receiver<String>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(Some(l)) = tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
        out.push(l);
    }
    out
}

#[tokio::test]
async fn successful_remote_build_hides_markers() {
    let fx = Fixture::new("ok", "echo \"CompileSwift normal arm64 $*\"\necho '** BUILD SUCCEEDED **'");
    let sat = fx.orchestrator("true");
    let mut h = sat.start(&fx.request(BuildTarget::Simulator)).await.unwrap();
    let lines = collect(&mut h.rx).await;
    assert!(lines.iter().any(|l| l.contains("pre-flight passed")), "{:?}", lines);
    assert!(lines.contains(&"** BUILD SUCCEEDED **".to_string()), "{:?}", lines);
    assert!(!lines.iter().any(|l| l.contains(OK_MARKER) || l.contains(FAIL_MARKER)));
    let done = h.done.await.unwrap();
    assert_eq!(done.outcome, BuildOutcome::Success { artifact: None, archive_error: None });
    assert!(!sat.cancel().await);
}

#[tokio::test]
async fn remote_failure_is_execution_error_with_log() {
    let fx = Fixture::new("fail", "echo 'error: no such module'\nexit 65");
    let sat = fx.orchestrator("true");
    let h = sat.start(&fx.request(BuildTarget::Device)).await.unwrap();
    let done = h.done.await.unwrap();
    let log = match &done.outcome {
        BuildOutcome::Failure { error: BuildError::RemoteExecution(msg), diagnostic_log_path: Some(p) } => {
            assert!(msg.contains("65"), "{}", msg);
            p.clone()
        }
        other => panic!("unexpected outcome {:?}", other),
    };
    assert!(log.file_name().unwrap().to_string_lossy().starts_with("ios_build_fail_"));
    assert!(std::fs::read_to_string(&log).unwrap().contains("error: no such module"));
}

#[tokio::test]
async fn sync_failure_never_starts_execution() {
    let fx = Fixture::new("sync", "echo '** BUILD SUCCEEDED **'");
    let sat = fx.orchestrator("false");
    let mut h = sat.start(&fx.request(BuildTarget::Simulator)).await.unwrap();
    let lines = collect(&mut h.rx).await;
    let done = h.done.await.unwrap();
    assert!(matches!(done.outcome, BuildOutcome::Failure { error: BuildError::Sync(_), .. }), "{:?}", done.outcome);
    assert!(!fx.ssh_invoked(), "execution phase must not run after a sync failure");
    assert!(!lines.iter().any(|l| l.contains("pre-flight")));
}

#[tokio::test]
async fn unusable_target_fails_in_sync_phase() {
    let fx = Fixture::new("nohost", "true");
    let sat = fx.orchestrator("true");
    let mut target = fx.target();
    target.host = String::new();
    let h = sat.start(&BuildRequest::remote(&fx.local, BuildTarget::Simulator, target)).await.unwrap();
    let done = h.done.await.unwrap();
    assert!(matches!(done.outcome, BuildOutcome::Failure { error: BuildError::Sync(_), .. }));
    assert!(!fx.ssh_invoked());
}

#[tokio::test]
async fn session_without_marker_is_execution_error() {
    let fx = Fixture::new("nomarker", "true");
    script(&fx.ssh, "echo 'Connection reset by peer' >&2\nexit 255");
    let sat = fx.orchestrator("true");
    let h = sat.start(&fx.request(BuildTarget::Simulator)).await.unwrap();
    match h.done.await.unwrap().outcome {
        BuildOutcome::Failure { error: BuildError::RemoteExecution(msg), .. } => assert!(msg.contains("255"), "{}", msg),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn cancel_during_execution_releases_locally_and_kills_remotely() {
    let fx = Fixture::new("cancel", "echo compiling\nsleep 30");
    let sat = fx.orchestrator("true");
    let mut h = sat.start(&fx.request(BuildTarget::Simulator)).await.unwrap();
    loop {
        match tokio::time::timeout(Duration::from_secs(10), h.rx.recv()).await {
            Ok(Some(l)) if l == "compiling" => break,
            Ok(Some(_)) => continue,
            other => panic!("build never started: {:?}", other),
        }
    }
    let cancelled = tokio::time::timeout(Duration::from_secs(5), sat.cancel()).await.expect("cancel blocked");
    assert!(cancelled);
    assert_eq!(h.done.await.unwrap().outcome, BuildOutcome::Cancelled);

    // remote kill is detached; give it a moment
    let killed = fx.root.join("remote-kill");
    for _ in 0..50 {
        if killed.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(killed.exists(), "remote kill was not attempted");
}

#[tokio::test]
async fn local_and_remote_sessions_exclude_each_other() {
    let fx = Fixture::new("excl", "echo compiling\nsleep 30");
    let sat = fx.orchestrator("true");
    let _h = sat.start(&fx.request(BuildTarget::Simulator)).await.unwrap();
    let err = sat.start(&fx.request(BuildTarget::Simulator)).await.err();
    assert!(matches!(err, Some(BuildError::AlreadyRunning(_))));
    let err = sat.reset(&fx.target()).await.err();
    assert!(matches!(err, Some(BuildError::AlreadyRunning(_))));
    assert!(sat.cancel().await);
}

#[tokio::test]
async fn reset_continues_past_failed_steps() {
    let fx = Fixture::new("reset", "echo cleaned");
    let sat = fx.orchestrator("true");
    let mut h = sat.reset(&fx.target()).await.unwrap();
    let lines = collect(&mut h.rx).await;
    let report = h.done.await.unwrap();
    assert!(report.outcome.is_success(), "{:?}", report.outcome);
    assert_eq!(report.failed_steps, vec![5, 7]);
    assert!(lines.iter().any(|l| l.contains("step 7")), "{:?}", lines);
    assert!(lines.iter().any(|l| l.contains("nuclear reset complete")));
    assert!(!fx.remote.join("ios/Pods").exists(), "pods purge step must have run");
}

#[tokio::test]
async fn password_auth_goes_through_sshpass() {
    let fx = Fixture::new("pw", "true");
    let sat = SatelliteOrchestrator::new(
        SessionSlot::new(),
        Tools { rsync: "true".into(), sshpass: "zenith-no-such-sshpass".into(), ..Tools::default() },
    );
    let mut target = fx.target();
    target.credential = Credential::Password(Secret::new("pw"));
    let h = sat.start(&BuildRequest::remote(&fx.local, BuildTarget::Simulator, target)).await.unwrap();
    // sshpass is missing, so the transfer cannot even start
    match h.done.await.unwrap().outcome {
        BuildOutcome::Failure { error: BuildError::Sync(msg), .. } => assert!(msg.contains("zenith-no-such-sshpass"), "{}", msg),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn cancel_during_sync_never_reaches_the_remote() {
    let fx = Fixture::new("synccancel", "echo '** BUILD SUCCEEDED **'");
    let rsync = fx.root.join("slow-rsync");
    script(&rsync, "echo 'sending incremental file list'\nexec sleep 30");
    let sat = fx.orchestrator(&rsync.to_string_lossy());
    let mut h = sat.start(&fx.request(BuildTarget::Simulator)).await.unwrap();
    loop {
        match tokio::time::timeout(Duration::from_secs(10), h.rx.recv()).await {
            Ok(Some(l)) if l.contains("sending incremental file list") => break,
            Ok(Some(_)) => continue,
            other => panic!("transfer never started: {:?}", other),
        }
    }
    let cancelled = tokio::time::timeout(Duration::from_secs(5), sat.cancel()).await.expect("cancel blocked");
    assert!(cancelled);
    assert_eq!(h.done.await.unwrap().outcome, BuildOutcome::Cancelled);
    assert!(!sat.cancel().await, "slot must be free after a cancelled sync");
    assert!(!fx.ssh_invoked(), "execution phase must not run after a cancelled sync");
}

#[tokio::test]
async fn markers_printed_during_sync_are_plain_output() {
    let fx = Fixture::new("syncmarker", "echo 'error: signing failed'\nexit 65");
    let rsync = fx.root.join("chatty-rsync");
    script(&rsync, &format!("echo '{}'\nexit 0", OK_MARKER));
    let sat = fx.orchestrator(&rsync.to_string_lossy());
    let mut h = sat.start(&fx.request(BuildTarget::Simulator)).await.unwrap();
    let lines = collect(&mut h.rx).await;
    assert!(lines.iter().any(|l| l.contains(OK_MARKER)), "{:?}", lines);
    match h.done.await.unwrap().outcome {
        BuildOutcome::Failure { error: BuildError::RemoteExecution(msg), .. } => assert!(msg.contains("65"), "{}", msg),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn home_relative_remote_path_is_expanded_remotely() {
    let fx = Fixture::new("tilde", "echo '** BUILD SUCCEEDED **'");
    std::fs::create_dir_all(fx.root.join("home/proj/ios/Pods")).unwrap();
    let sat = fx.orchestrator("true");
    let mut target = fx.target();
    target.remote_project_path = "~/proj".into();
    let mut h = sat.start(&BuildRequest::remote(&fx.local, BuildTarget::Simulator, target)).await.unwrap();
    let lines = collect(&mut h.rx).await;
    assert!(lines.contains(&"** BUILD SUCCEEDED **".to_string()), "{:?}", lines);
    assert_eq!(h.done.await.unwrap().outcome, BuildOutcome::Success { artifact: None, archive_error: None });
}
