//! Remote shell scripts and the markers they print.

use zenith_core::{BuildTarget, RemoteTarget};
use zenith_ops::sh_quote;

pub const OK_MARKER: &str = "__ZENITH_BUILD_OK__";
pub const FAIL_MARKER: &str = "__ZENITH_BUILD_FAIL__";

const STEP_FAILED: &str = "!! step ";

/// Terminal marker seen on the remote stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    Ok,
    Fail(i32),
}

/// Parse a sentinel line. Surrounding whitespace is ignored; an unparsable
/// failure code becomes -1.
pub fn parse_sentinel(line: &str) -> Option<Sentinel> {
    let line = line.trim();
    if line == OK_MARKER {
        return Some(Sentinel::Ok);
    }
    let rest = line.strip_prefix(FAIL_MARKER)?;
    if !rest.is_empty() && !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some(Sentinel::Fail(rest.trim().parse().unwrap_or(-1)))
}

/// Step number from a `!! step <n> failed (<label>)` line.
pub fn parse_failed_step(line: &str) -> Option<u32> {
    let rest = line.trim().strip_prefix(STEP_FAILED)?;
    let (n, tail) = rest.split_once(' ')?;
    tail.starts_with("failed").then(|| n.parse().ok()).flatten()
}

/// Shell word for the remote project path. A leading `~` becomes `"$HOME"`
/// so the shell still expands it; the rest stays quoted.
pub fn remote_dir(path: &str) -> String {
    match path.strip_prefix('~') {
        Some("") => "\"$HOME\"".to_string(),
        Some(rest) if rest.starts_with('/') => match rest.trim_start_matches('/') {
            "" => "\"$HOME\"".to_string(),
            tail => format!("\"$HOME\"/{}", sh_quote(tail)),
        },
        _ => sh_quote(path),
    }
}

fn destination(target: BuildTarget) -> &'static str {
    match target {
        BuildTarget::Device => "generic/platform=iOS",
        _ => "platform=iOS Simulator,name=iPhone 15",
    }
}

const PRELUDE: &str = r#"export PATH="/opt/homebrew/bin:/usr/local/bin:$PATH"
export LANG="${LANG:-en_US.UTF-8}"
"#;

/// Wrap `body` so the session always ends with exactly one sentinel line.
fn with_sentinel(body: &str) -> String {
    format!(
        "{prelude}zenith_main() {{\n{body}\n}}\nzenith_main 2>&1\ncode=$?\nif [ \"$code\" -eq 0 ]; then echo {ok}; else echo \"{fail} $code\"; fi\n",
        prelude = PRELUDE,
        body = body,
        ok = OK_MARKER,
        fail = FAIL_MARKER
    )
}

/// Pre-flight, dependency hydration, then xcodebuild.
pub fn build_script(remote: &RemoteTarget, target: BuildTarget) -> String {
    let path = remote_dir(&remote.remote_project_path);
    let scheme = &remote.scheme;
    let body = format!(
        r#"  command -v xcodebuild >/dev/null 2>&1 || {{ echo "pre-flight failed: xcodebuild not found in PATH"; return 127; }}
  echo "pre-flight passed: xcodebuild found"
  cd {path} || return $?
  if [ ! -d node_modules ] && [ -f package.json ]; then
    if [ -f package-lock.json ]; then
      echo ">> hydrating with npm ci"
      npm ci --prefer-offline || return $?
    else
      echo ">> hydrating with npm install"
      npm install || return $?
    fi
  fi
  cd ios || return $?
  if [ ! -d Pods ] && [ -f Podfile ]; then
    echo ">> installing pods"
    pod install || return $?
  fi
  xcodebuild -workspace {workspace} -scheme {scheme} -configuration Debug -destination {dest} \
    COMPILER_INDEX_STORE_ENABLE=NO DEBUG_INFORMATION_FORMAT=dwarf RCT_NO_LAUNCH_PACKAGER=1"#,
        path = path,
        workspace = sh_quote(&format!("{}.xcworkspace", scheme)),
        scheme = sh_quote(scheme),
        dest = sh_quote(destination(target)),
    );
    with_sentinel(&body)
}

/// (label, commands) for each recovery step, in order.
fn reset_steps(path: &str) -> Vec<(&'static str, String)> {
    vec![
        ("kill processes", "killall Xcode xcodebuild CoreSimulatorBridge 2>/dev/null; true".to_string()),
        ("clean project", format!("cd {}/ios && xcodebuild clean", path)),
        ("purge derived data", "rm -rf ~/Library/Developer/Xcode/DerivedData/*".to_string()),
        ("purge pods", format!("rm -rf ~/Library/Caches/CocoaPods && cd {}/ios && rm -rf Pods Podfile.lock", path)),
        ("reset simulators", "xcrun simctl shutdown all; xcrun simctl erase all".to_string()),
        ("purge react native temp", "rm -rf \"${TMPDIR:-/tmp}\"/react-* \"${TMPDIR:-/tmp}\"/metro-*; watchman watch-del-all 2>/dev/null; true".to_string()),
        ("reinstall pods", format!("cd {}/ios && pod install --repo-update", path)),
    ]
}

pub const RESET_STEPS: usize = 7;

/// Every step runs in its own subshell; a failure is reported and the next step runs anyway.
pub fn reset_script(remote: &RemoteTarget) -> String {
    let path = remote_dir(&remote.remote_project_path);
    let mut body = String::from("  echo \">> nuclear reset starting\"\n");
    for (i, (label, cmd)) in reset_steps(&path).into_iter().enumerate() {
        let n = i + 1;
        body.push_str(&format!(
            "  echo \">> step {n}: {label}\"\n  ( {cmd} ) || echo \"{prefix}{n} failed ({label})\"\n",
            n = n,
            label = label,
            cmd = cmd,
            prefix = STEP_FAILED
        ));
    }
    body.push_str("  echo \">> nuclear reset complete\"");
    with_sentinel(&body)
}

/// Run `script` under `/bin/sh` whatever the remote login shell is.
pub fn posix(script: &str) -> String { format!("/bin/sh -c {}", sh_quote(script)) }

/// Best-effort remote teardown after a local cancel.
// the bracket keeps pkill from matching the shell that runs it
pub const REMOTE_KILL: &str = "pkill -f '[x]codebuild'; true";
