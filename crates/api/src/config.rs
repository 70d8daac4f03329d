//! Engine settings, read from `ZENITH_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;
use zenith_archive::{DEFAULT_BUILDS_DIR, DEFAULT_LOGS_DIR};
use zenith_ops::{GradleToolchain, Launcher, DEFAULT_LINE_MAX, DEFAULT_QUEUE_CAP};
use zenith_satellite::Tools;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Capacity of the live output channel.
    pub queue_cap: usize,
    /// Display lines are cut to this many characters.
    pub line_max: usize,
    pub builds_dir: String,
    pub logs_dir: String,
    pub launcher: Launcher,
    pub android_sdk: Option<String>,
    pub tools: Tools,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_cap: DEFAULT_QUEUE_CAP,
            line_max: DEFAULT_LINE_MAX,
            builds_dir: DEFAULT_BUILDS_DIR.into(),
            logs_dir: DEFAULT_LOGS_DIR.into(),
            launcher: Launcher::default(),
            android_sdk: None,
            tools: Tools::default(),
        }
    }
}

fn var(key: &str) -> Option<String> { std::env::var(key).ok().filter(|v| !v.trim().is_empty()) }

fn parsed<T: FromStr>(key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "config: ignoring unparsable value");
            None
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let launcher = match var("ZENITH_LAUNCHER").map(|s| s.parse::<Launcher>()) {
            Some(Ok(l)) => l,
            Some(Err(e)) => {
                warn!(error = %e, "config: falling back to default launcher");
                d.launcher
            }
            None => d.launcher,
        };
        let tools = Tools {
            rsync: var("ZENITH_RSYNC").unwrap_or(d.tools.rsync),
            ssh: var("ZENITH_SSH").unwrap_or(d.tools.ssh),
            sshpass: var("ZENITH_SSHPASS").unwrap_or(d.tools.sshpass),
            connect_timeout: parsed("ZENITH_SSH_CONNECT_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.tools.connect_timeout),
            sync_timeout: parsed("ZENITH_SYNC_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.tools.sync_timeout),
            managed_dirs: d.tools.managed_dirs,
        };
        Self {
            queue_cap: parsed::<usize>("ZENITH_QUEUE_CAP").filter(|n| *n > 0).unwrap_or(d.queue_cap),
            line_max: parsed::<usize>("ZENITH_LINE_MAX").filter(|n| *n > 0).unwrap_or(d.line_max),
            builds_dir: var("ZENITH_BUILDS_DIR").unwrap_or(d.builds_dir),
            logs_dir: var("ZENITH_LOGS_DIR").unwrap_or(d.logs_dir),
            launcher,
            android_sdk: GradleToolchain::sdk_from_env(),
            tools,
        }
    }
}
