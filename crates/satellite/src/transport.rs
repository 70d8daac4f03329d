//! rsync/ssh command construction. Everything here is pure: it turns a
//! `RemoteTarget` plus tool settings into `CommandSpec`s.

use std::path::Path;
use std::time::Duration;

use zenith_archive::{DEFAULT_BUILDS_DIR, DEFAULT_LOGS_DIR};
use zenith_core::{BuildError, Credential, RemoteTarget};
use zenith_ops::{sh_quote, CommandSpec};

/// Paths never mirrored to the satellite. The remote side hydrates its own
/// dependencies and build products.
pub const SYNC_EXCLUDES: [&str; 7] =
    ["node_modules", ".git", "android", "ios/Pods", "ios/build", "ios/DerivedData", "ios/.xcode.env.local"];

/// External tool names and timeouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tools {
    pub rsync: String,
    pub ssh: String,
    pub sshpass: String,
    pub connect_timeout: Duration,
    /// rsync gives up when the transfer stalls this long.
    pub sync_timeout: Duration,
    /// Project-relative dirs Zenith writes locally (archives, failure logs); never mirrored.
    pub managed_dirs: Vec<String>,
}

impl Default for Tools {
    fn default() -> Self {
        Self {
            rsync: "rsync".into(),
            ssh: "ssh".into(),
            sshpass: "sshpass".into(),
            connect_timeout: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(120),
            managed_dirs: vec![DEFAULT_BUILDS_DIR.into(), DEFAULT_LOGS_DIR.into()],
        }
    }
}

/// Reject targets that cannot possibly connect, before any process starts.
pub fn check_target(target: &RemoteTarget) -> Result<(), BuildError> {
    let (host, _) = target.host_and_port();
    if host.trim().is_empty() {
        return Err(BuildError::Sync("remote host is empty".into()));
    }
    if target.user.trim().is_empty() {
        return Err(BuildError::Sync("remote user is empty".into()));
    }
    if target.remote_project_path.trim().is_empty() {
        return Err(BuildError::Sync("remote project path is empty".into()));
    }
    match &target.credential {
        Credential::KeyFile(p) if !p.is_file() => Err(BuildError::Sync(format!("ssh key file not found: {}", p.display()))),
        Credential::Password(s) if s.is_empty() => Err(BuildError::Sync("remote password is empty".into())),
        _ => Ok(()),
    }
}

impl Tools {
    /// ssh options shared by the transfer and the remote session.
    pub fn ssh_options(&self, target: &RemoteTarget) -> Vec<String> {
        let (_, port) = target.host_and_port();
        let mut opts = vec![
            "-p".to_string(),
            port.to_string(),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-o".into(),
            "UserKnownHostsFile=/dev/null".into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ];
        if let Credential::KeyFile(key) = &target.credential {
            opts.extend(["-o".into(), "BatchMode=yes".into(), "-i".into(), key.to_string_lossy().to_string()]);
        }
        opts
    }

    /// Password auth runs the tool under `sshpass -e`; the secret only travels in `SSHPASS`.
    fn authed(&self, target: &RemoteTarget, program: &str) -> CommandSpec {
        match &target.credential {
            Credential::Password(secret) => {
                CommandSpec::new(&self.sshpass).args(["-e", program]).env("SSHPASS", secret.expose())
            }
            Credential::KeyFile(_) => CommandSpec::new(program),
        }
    }

    /// Differential mirror of `local_root` onto the remote project path.
    pub fn rsync(&self, local_root: &Path, target: &RemoteTarget) -> CommandSpec {
        let rsh = std::iter::once(self.ssh.clone())
            .chain(self.ssh_options(target).iter().map(|o| sh_quote(o)))
            .collect::<Vec<_>>()
            .join(" ");
        let mut src = local_root.to_string_lossy().to_string();
        if !src.ends_with('/') {
            src.push('/');
        }
        let mut spec = self
            .authed(target, &self.rsync)
            .args(["-az", "--delete"])
            .arg(format!("--timeout={}", self.sync_timeout.as_secs().max(1)))
            .args(["-e".to_string(), rsh]);
        for ex in SYNC_EXCLUDES {
            spec = spec.args(["--exclude", ex]);
        }
        // anchored: only the top-level dirs, not same-named dirs deeper in the tree
        for dir in self.managed_dirs.iter().map(|d| d.trim_matches('/')).filter(|d| !d.is_empty()) {
            spec = spec.arg("--exclude").arg(format!("/{}/", dir));
        }
        spec.arg(src).arg(format!("{}:{}", target.login(), target.remote_project_path))
    }

    /// One remote shell session running `script`.
    pub fn ssh(&self, target: &RemoteTarget, script: &str) -> CommandSpec {
        self.authed(target, &self.ssh).args(self.ssh_options(target)).arg(target.login()).arg(script)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zenith_core::Secret;

    fn target(credential: Credential) -> RemoteTarget {
        RemoteTarget {
            host: "mac.local:2222".into(),
            user: "dev".into(),
            credential,
            remote_project_path: "/Users/dev/app".into(),
            scheme: "App".into(),
        }
    }

    #[test]
    fn password_never_reaches_argv() {
        let t = target(Credential::Password(Secret::new("hunter2")));
        let spec = Tools::default().ssh(&t, "true");
        assert_eq!(spec.program, "sshpass");
        assert_eq!(&spec.args[..2], ["-e", "ssh"]);
        assert!(!spec.args.iter().any(|a| a.contains("hunter2")));
        assert_eq!(spec.env, vec![("SSHPASS".to_string(), "hunter2".to_string())]);
        assert!(!format!("{:?}", t).contains("hunter2"));
    }

    #[test]
    fn key_auth_uses_identity_and_port() {
        let t = target(Credential::KeyFile("/keys/id_ed25519".into()));
        let spec = Tools::default().ssh(&t, "echo hi");
        assert_eq!(spec.program, "ssh");
        let joined = spec.args.join(" ");
        assert!(joined.contains("-p 2222"), "{}", joined);
        assert!(joined.contains("-i /keys/id_ed25519"), "{}", joined);
        assert!(joined.contains("ConnectTimeout=30"), "{}", joined);
        assert!(joined.ends_with("dev@mac.local echo hi"), "{}", joined);
    }

    #[test]
    fn rsync_mirrors_contents_with_excludes() {
        let t = target(Credential::KeyFile("/keys/id".into()));
        let spec = Tools::default().rsync(Path::new("/work/app"), &t);
        assert_eq!(spec.program, "rsync");
        assert!(spec.args.contains(&"--delete".to_string()));
        assert!(spec.args.contains(&"--timeout=120".to_string()));
        for ex in SYNC_EXCLUDES {
            assert!(spec.args.iter().any(|a| a == ex), "missing exclude {}", ex);
        }
        let n = spec.args.len();
        assert_eq!(spec.args[n - 2], "/work/app/");
        assert_eq!(spec.args[n - 1], "dev@mac.local:/Users/dev/app");
        assert!(spec.args.contains(&"/zenith_builds/".to_string()));
        assert!(spec.args.contains(&"/zenith_logs/".to_string()));
        let rsh = &spec.args[spec.args.iter().position(|a| a == "-e").unwrap() + 1];
        assert!(rsh.starts_with("ssh -p 2222"), "{}", rsh);
    }

    #[test]
    fn configured_managed_dirs_are_excluded() {
        let t = target(Credential::KeyFile("/keys/id".into()));
        let tools = Tools { managed_dirs: vec!["out/".into(), String::new()], ..Tools::default() };
        let spec = tools.rsync(Path::new("/work/app"), &t);
        assert!(spec.args.contains(&"/out/".to_string()));
        assert!(!spec.args.iter().any(|a| a == "/zenith_builds/" || a == "//"));
    }

    #[test]
    fn unusable_targets_are_sync_errors() {
        let mut t = target(Credential::Password(Secret::new("pw")));
        assert!(check_target(&t).is_ok());
        t.host = String::new();
        assert!(matches!(check_target(&t), Err(BuildError::Sync(_))));
        let t = target(Credential::KeyFile("/definitely/missing/key".into()));
        assert!(matches!(check_target(&t), Err(BuildError::Sync(_))));
        let t = target(Credential::Password(Secret::new("")));
        assert!(matches!(check_target(&t), Err(BuildError::Sync(_))));
    }
}
