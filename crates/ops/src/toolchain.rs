//! What to launch for a local build, and how.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use zenith_core::project::{android_output, windows_to_wsl_path, ANDROID_DIR};
use zenith_core::{BuildError, BuildRequest, BuildTarget, HardwareProfile};

/// A fully resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: Vec::new(), cwd: None, env: Vec::new() }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn args<I, A>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(items.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, k: impl Into<String>, v: impl Into<String>) -> Self {
        self.env.push((k.into(), v.into()));
        self
    }

    /// Program and args for log lines. Environment values are left out.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str)).collect::<Vec<_>>().join(" ")
    }

    /// Piped stdout/stderr, no stdin, killed on drop. On unix the child leads
    /// its own process group so the whole tree can be signalled.
    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);
        cmd
    }
}

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Quote `s` for a POSIX shell.
pub fn sh_quote(s: &str) -> String {
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c)) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// How the wrapper script is started on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launcher {
    Direct,
    /// Through the Windows Subsystem for Linux.
    Wsl,
}

impl Default for Launcher {
    fn default() -> Self { if cfg!(windows) { Launcher::Wsl } else { Launcher::Direct } }
}

impl std::str::FromStr for Launcher {
    type Err = BuildError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "direct" => Ok(Launcher::Direct),
            "wsl" => Ok(Launcher::Wsl),
            other => Err(BuildError::InvalidRequest(format!("unknown launcher: {}", other))),
        }
    }
}

/// Turbo mode, grouped by what each flag buys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurboEffect {
    Parallel,
    Cache,
    Incremental,
    SkipVerification,
}

pub const TURBO_FLAGS: &[(TurboEffect, &[&str])] = &[
    (TurboEffect::Parallel, &["--parallel", "-Dorg.gradle.parallel=true"]),
    (
        TurboEffect::Cache,
        &[
            "--build-cache",
            "--configuration-cache",
            "--configuration-cache-problems=warn",
            "-Dorg.gradle.caching=true",
            "-Dorg.gradle.vfs.watch=true",
        ],
    ),
    (TurboEffect::Incremental, &["-Dkotlin.incremental=true"]),
    (TurboEffect::SkipVerification, &["-x", "lint", "-x", "test"]),
];

const TURBO_JVM_OPTS: &str = "-XX:+UseParallelGC -XX:MaxMetaspaceSize=1g -Dorg.gradle.daemon.idletimeout=10800000";

/// Gradle invocation derived from a request and a hardware plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradleInvocation {
    pub task: &'static str,
    pub max_workers: usize,
    pub heap_bytes: u64,
    pub turbo: bool,
}

impl GradleInvocation {
    pub fn new(target: BuildTarget, profile: &HardwareProfile, turbo: bool) -> Result<Self, BuildError> {
        let task = match target {
            BuildTarget::Apk => "assembleDebug",
            BuildTarget::Aab => "bundleDebug",
            other => return Err(BuildError::InvalidRequest(format!("gradle cannot build target {}", other))),
        };
        Ok(Self { task, max_workers: profile.max_workers.max(1), heap_bytes: profile.heap_bytes, turbo })
    }

    pub fn effects(&self) -> Vec<TurboEffect> {
        if self.turbo { TURBO_FLAGS.iter().map(|(e, _)| *e).collect() } else { Vec::new() }
    }

    pub fn gradle_args(&self) -> Vec<String> {
        let mut out = vec![self.task.to_string(), format!("--max-workers={}", self.max_workers)];
        if self.turbo {
            out.extend(TURBO_FLAGS.iter().flat_map(|(_, flags)| flags.iter().map(|f| f.to_string())));
        }
        out
    }

    /// Value for `GRADLE_OPTS`.
    pub fn gradle_opts(&self) -> String {
        let heap = format!("-Xmx{}m", self.heap_bytes / zenith_core::MIB);
        if self.turbo { format!("{} {}", heap, TURBO_JVM_OPTS) } else { heap }
    }

    pub fn command_spec(&self, launcher: Launcher, android_dir: &Path, sdk: Option<&str>) -> CommandSpec {
        wrapper_command(launcher, android_dir, sdk, &self.gradle_args(), &self.gradle_opts())
    }
}

fn wrapper_command(launcher: Launcher, android_dir: &Path, sdk: Option<&str>, args: &[String], opts: &str) -> CommandSpec {
    match launcher {
        Launcher::Direct => {
            let base = if cfg!(windows) {
                CommandSpec::new("cmd").args(["/C", "gradlew.bat"])
            } else {
                CommandSpec::new("sh").arg("gradlew")
            };
            let mut spec = base.args(args.iter().cloned()).cwd(android_dir).env("GRADLE_OPTS", opts);
            if let Some(sdk) = sdk {
                spec = spec.env("ANDROID_HOME", sdk);
            }
            spec
        }
        Launcher::Wsl => {
            let dir = windows_to_wsl_path(&android_dir.to_string_lossy());
            let mut script = String::new();
            if let Some(sdk) = sdk {
                let sdk = windows_to_wsl_path(sdk);
                script.push_str(&format!(
                    "export ANDROID_HOME={q} && export PATH=\"$PATH:\"{q}/platform-tools && ",
                    q = sh_quote(&sdk)
                ));
            }
            script.push_str(&format!(
                "export GRADLE_OPTS={} && cd {} && chmod +x ./gradlew && ./gradlew {} 2>&1",
                sh_quote(opts),
                sh_quote(&dir),
                args.iter().map(|a| sh_quote(a)).collect::<Vec<_>>().join(" ")
            ));
            CommandSpec::new("wsl").args(["-e", "bash", "-c"]).arg(script).cwd(android_dir)
        }
    }
}

/// Source of the process for a local build.
pub trait Toolchain: Send + Sync {
    fn command(&self, request: &BuildRequest, profile: &HardwareProfile) -> Result<CommandSpec, BuildError>;

    /// Where a successful build leaves its output.
    fn artifact(&self, request: &BuildRequest) -> Option<PathBuf> { android_output(&request.working_dir, request.target) }

    /// Cheap command that starts the toolchain's background daemon, if it has one.
    fn prewarm(&self, _working_dir: &Path) -> Option<CommandSpec> { None }
}

/// The Gradle wrapper under `<project>/android`.
#[derive(Debug, Clone, Default)]
pub struct GradleToolchain {
    pub launcher: Launcher,
    pub android_sdk: Option<String>,
}

impl GradleToolchain {
    pub fn new(launcher: Launcher, android_sdk: Option<String>) -> Self { Self { launcher, android_sdk } }

    /// `ANDROID_HOME`, then `ANDROID_SDK_ROOT`, then the Windows default install location.
    pub fn sdk_from_env() -> Option<String> {
        let from = |k: &str| std::env::var(k).ok().filter(|v| !v.trim().is_empty());
        from("ANDROID_HOME").or_else(|| from("ANDROID_SDK_ROOT")).or_else(|| {
            if cfg!(windows) {
                from("LOCALAPPDATA").map(|base| Path::new(&base).join("Android").join("Sdk").to_string_lossy().to_string())
            } else {
                None
            }
        })
    }
}

/// Wrapper script the launcher runs inside `android/`.
pub fn wrapper_name(launcher: Launcher) -> &'static str {
    match launcher {
        Launcher::Direct if cfg!(windows) => "gradlew.bat",
        _ => "gradlew",
    }
}

impl GradleToolchain {
    fn android_dir(&self, working_dir: &Path) -> Result<PathBuf, BuildError> {
        let android_dir = working_dir.join(ANDROID_DIR);
        let wrapper = android_dir.join(wrapper_name(self.launcher));
        if wrapper.is_file() {
            Ok(android_dir)
        } else {
            Err(BuildError::ProcessSpawn(format!("gradle wrapper not found: {}", wrapper.display())))
        }
    }
}

impl Toolchain for GradleToolchain {
    fn command(&self, request: &BuildRequest, profile: &HardwareProfile) -> Result<CommandSpec, BuildError> {
        let inv = GradleInvocation::new(request.target, profile, request.turbo)?;
        let android_dir = self.android_dir(&request.working_dir)?;
        Ok(inv.command_spec(self.launcher, &android_dir, self.android_sdk.as_deref()))
    }

    fn prewarm(&self, working_dir: &Path) -> Option<CommandSpec> {
        let android_dir = self.android_dir(working_dir).ok()?;
        Some(wrapper_command(self.launcher, &android_dir, self.android_sdk.as_deref(), &["--version".to_string()], ""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zenith_core::GIB;

    fn hw() -> HardwareProfile { HardwareProfile::derive(8, 16 * GIB) }

    #[test]
    fn plain_invocation_has_workers_and_heap_only() {
        let inv = GradleInvocation::new(BuildTarget::Apk, &hw(), false).unwrap();
        assert_eq!(inv.gradle_args(), vec!["assembleDebug", "--max-workers=7"]);
        assert_eq!(inv.gradle_opts(), "-Xmx8192m");
        assert!(inv.effects().is_empty());
    }

    #[test]
    fn turbo_adds_every_effect() {
        let inv = GradleInvocation::new(BuildTarget::Aab, &hw(), true).unwrap();
        let args = inv.gradle_args();
        assert_eq!(args[0], "bundleDebug");
        for flag in ["--parallel", "--build-cache", "--configuration-cache", "-Dkotlin.incremental=true", "lint", "test"] {
            assert!(args.iter().any(|a| a == flag), "missing {}", flag);
        }
        assert_eq!(inv.effects().len(), 4);
        assert!(inv.gradle_opts().starts_with("-Xmx8192m -XX:+UseParallelGC"));
    }

    #[test]
    fn ios_targets_are_not_gradle_tasks() {
        assert!(matches!(GradleInvocation::new(BuildTarget::Device, &hw(), false), Err(BuildError::InvalidRequest(_))));
    }

    #[test]
    fn direct_launcher_runs_wrapper_in_android_dir() {
        let inv = GradleInvocation::new(BuildTarget::Apk, &hw(), false).unwrap();
        let spec = inv.command_spec(Launcher::Direct, Path::new("/work/app/android"), Some("/opt/sdk"));
        assert_eq!(spec.cwd.as_deref(), Some(Path::new("/work/app/android")));
        assert!(spec.env.contains(&("GRADLE_OPTS".into(), "-Xmx8192m".into())));
        assert!(spec.env.contains(&("ANDROID_HOME".into(), "/opt/sdk".into())));
        assert!(spec.args.contains(&"--max-workers=7".to_string()));
    }

    #[test]
    fn wsl_launcher_converts_paths() {
        let inv = GradleInvocation::new(BuildTarget::Apk, &hw(), false).unwrap();
        let spec = inv.command_spec(Launcher::Wsl, Path::new(r"C:\dev\app\android"), Some(r"C:\Users\me\Android\Sdk"));
        assert_eq!(spec.program, "wsl");
        let script = spec.args.last().unwrap();
        assert!(script.contains("cd /mnt/c/dev/app/android"), "{}", script);
        assert!(script.contains("export ANDROID_HOME=/mnt/c/Users/me/Android/Sdk"), "{}", script);
        assert!(script.contains("./gradlew assembleDebug --max-workers=7"), "{}", script);
    }

    #[test]
    fn missing_wrapper_cannot_be_launched() {
        let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        let root = std::env::temp_dir().join(format!("zenith-toolchain-{}", nanos));
        std::fs::create_dir_all(root.join(ANDROID_DIR)).unwrap();
        let tc = GradleToolchain::new(Launcher::Direct, None);
        let req = BuildRequest::local(&root, BuildTarget::Apk);
        assert!(matches!(tc.command(&req, &hw()), Err(BuildError::ProcessSpawn(_))));
        assert!(tc.prewarm(&root).is_none());

        std::fs::write(root.join(ANDROID_DIR).join(wrapper_name(Launcher::Direct)), "").unwrap();
        assert!(tc.command(&req, &hw()).is_ok());
        assert!(tc.prewarm(&root).is_some());
    }

    #[test]
    fn quoting() {
        assert_eq!(sh_quote("plain/path-1"), "plain/path-1");
        assert_eq!(sh_quote("has space"), "'has space'");
        assert_eq!(sh_quote("it's"), r"'it'\''s'");
        assert_eq!(sh_quote(""), "''");
        assert_eq!("wsl".parse::<Launcher>().unwrap(), Launcher::Wsl);
        assert!("bogus".parse::<Launcher>().is_err());
    }
}
