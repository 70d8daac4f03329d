use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{info, warn};
use zenith_api::{
    BuildHandle, BuildOutcome, BuildReport, BuildRequest, BuildTarget, Credential, Engine, HardwareProfile, OutputLine,
    RemoteTarget, ResetHandle, ResetReport, Secret, ZenithApi,
};

#[derive(Parser, Debug)]
#[command(name = "zenithctl", version, about = "Zenith build orchestration")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Project root (the directory holding android/ and ios/)
    #[arg(short = 'C', long = "project", global = true, default_value = ".")]
    project: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Target { Apk, Aab, Simulator, Device }

impl From<Target> for BuildTarget {
    fn from(t: Target) -> Self {
        match t {
            Target::Apk => BuildTarget::Apk,
            Target::Aab => BuildTarget::Aab,
            Target::Simulator => BuildTarget::Simulator,
            Target::Device => BuildTarget::Device,
        }
    }
}

/// Satellite connection settings.
#[derive(Args, Debug, Clone)]
struct RemoteArgs {
    /// Satellite host, optionally `host:port`
    #[arg(long = "host", env = "ZENITH_REMOTE_HOST")]
    host: Option<String>,
    #[arg(long = "user", env = "ZENITH_REMOTE_USER")]
    user: Option<String>,
    /// Project path on the satellite
    #[arg(long = "remote-path", env = "ZENITH_REMOTE_PATH")]
    remote_path: Option<String>,
    /// Xcode scheme (the workspace is `<scheme>.xcworkspace`)
    #[arg(long = "scheme", env = "ZENITH_REMOTE_SCHEME", default_value = "App")]
    scheme: String,
    /// Private key for key authentication
    #[arg(long = "key", env = "ZENITH_REMOTE_KEY")]
    key: Option<PathBuf>,
}

impl RemoteArgs {
    fn target(&self) -> Result<RemoteTarget> {
        let host = self.host.clone().ok_or_else(|| anyhow!("--host is required for a satellite session"))?;
        // passwords are never taken from argv
        let password = std::env::var("ZENITH_REMOTE_PASSWORD").ok();
        let credential = match (&self.key, password) {
            (Some(key), _) => Credential::KeyFile(key.clone()),
            (None, Some(pw)) => Credential::Password(Secret::new(pw)),
            (None, None) => bail!("either --key or ZENITH_REMOTE_PASSWORD is required"),
        };
        Ok(RemoteTarget {
            host,
            user: self.user.clone().unwrap_or_default(),
            credential,
            remote_project_path: self.remote_path.clone().unwrap_or_default(),
            scheme: self.scheme.clone(),
        })
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the host hardware plan
    Profile,
    /// Build the project locally, or on the satellite with --host
    Build {
        #[arg(long = "target", value_enum, default_value_t = Target::Apk)]
        target: Target,
        /// Parallel, cached, incremental build that skips lint and tests
        #[arg(long = "turbo")]
        turbo: bool,
        /// Archive into this directory instead of <project>/zenith_builds
        #[arg(long = "out")]
        out: Option<PathBuf>,
        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// Manage archived artifacts
    Archive {
        #[command(subcommand)]
        action: ArchiveAction,
        #[arg(long = "out", global = true)]
        out: Option<PathBuf>,
    },
    /// Wipe and rebuild the satellite's iOS environment
    Reset {
        #[command(flatten)]
        remote: RemoteArgs,
    },
    /// Start the Gradle daemon in the background
    Prewarm,
    /// Find Android app roots around the project path
    Scan,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum ArchiveAction {
    /// Print the archive directory
    Locate,
    Ls,
    Clear,
}

fn init_tracing() {
    let env = std::env::var("ZENITH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries build output
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ZENITH_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid ZENITH_METRICS_ADDR; expected host:port");
        }
    }
}

fn print_profile(hw: &HardwareProfile, output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("cores     {}", hw.cpu_cores);
            println!("ram       {} MiB", hw.total_ram_bytes / (1024 * 1024));
            println!("workers   {}", hw.max_workers);
            println!("heap      {} MiB", hw.heap_mib());
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(hw)?),
    }
    Ok(())
}

fn print_line(line: &OutputLine, output: Output) -> Result<()> {
    match output {
        Output::Human => println!("[{:>3.0}%] {}", line.progress, line.text),
        Output::Json => println!("{}", serde_json::to_string(line)?),
    }
    Ok(())
}

/// Stream the session to stdout. Ctrl-C aborts once; the result is still awaited.
async fn drive<T>(api: &Engine, mut rx: tokio::sync::mpsc::Receiver<OutputLine>, result: tokio::sync::oneshot::Receiver<T>, output: Output) -> Result<T> {
    let mut aborted = false;
    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(l) => print_line(&l, output)?,
                None => break,
            },
            _ = signal::ctrl_c(), if !aborted => {
                aborted = true;
                warn!("interrupt received; aborting session");
                api.abort().await?;
            }
        }
    }
    result.await.map_err(|_| anyhow!("session ended without reporting a result"))
}

fn report_outcome(outcome: &BuildOutcome) -> Result<()> {
    match outcome {
        BuildOutcome::Success { artifact, archive_error } => {
            match artifact {
                Some(a) => eprintln!("build succeeded: {}", a.final_path.display()),
                None => eprintln!("build succeeded"),
            }
            if let Some(e) = archive_error {
                eprintln!("warning: artifact not archived: {}", e);
            }
            Ok(())
        }
        BuildOutcome::Failure { error, diagnostic_log_path } => {
            if let Some(hint) = error.hint() {
                eprintln!("hint: {}", hint);
            }
            if let Some(p) = diagnostic_log_path {
                eprintln!("full log: {}", p.display());
            }
            bail!("build failed: {}", error)
        }
        BuildOutcome::Cancelled => bail!("build cancelled"),
    }
}

async fn run_build(api: &Engine, request: BuildRequest, output: Output) -> Result<()> {
    let BuildHandle { session_id, rx, result } = api.request_build(request).await?;
    info!(session = %session_id, "build started");
    let report: BuildReport = drive(api, rx, result, output).await?;
    if output == Output::Json {
        println!("{}", serde_json::to_string(&report)?);
    }
    if report.dropped > 0 {
        warn!(dropped = report.dropped, "output lines were skipped on the console");
    }
    report_outcome(&report.outcome)
}

async fn run_reset(api: &Engine, target: RemoteTarget, output: Output) -> Result<()> {
    let ResetHandle { session_id, rx, result } = api.remote_reset(target).await?;
    info!(session = %session_id, "reset started");
    let report: ResetReport = drive(api, rx, result, output).await?;
    if output == Output::Json {
        println!("{}", serde_json::to_string(&report)?);
    }
    if !report.failed_steps.is_empty() {
        eprintln!("steps with failures: {:?}", report.failed_steps);
    }
    report_outcome(&report.outcome)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let api = Engine::from_env();

    match cli.command {
        Commands::Profile => print_profile(&api.profile().await?, cli.output)?,
        Commands::Build { target, turbo, out, remote } => {
            let target = BuildTarget::from(target);
            let mut request = if remote.host.is_some() {
                BuildRequest::remote(&cli.project, target, remote.target()?)
            } else {
                BuildRequest::local(&cli.project, target)
            };
            request = request.with_turbo(turbo);
            if let Some(out) = out {
                request = request.with_output(out);
            }
            run_build(&api, request, cli.output).await?
        }
        Commands::Archive { action, out } => {
            // only `locate` may create the managed dir
            let dir = match action {
                ArchiveAction::Locate => api.archive_locate(&cli.project, out.as_deref()).await?,
                ArchiveAction::Ls | ArchiveAction::Clear => api.archive_dir(&cli.project, out.as_deref()).await?,
            };
            match action {
                ArchiveAction::Locate => match cli.output {
                    Output::Human => println!("{}", dir.display()),
                    Output::Json => println!("{}", serde_json::json!({ "dir": dir })),
                },
                ArchiveAction::Ls => {
                    let entries = api.archive_list(&dir).await?;
                    match cli.output {
                        Output::Human => {
                            for e in entries {
                                println!("{}\t{}\t{}", e.modified_ts, e.bytes, e.path.display());
                            }
                        }
                        Output::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
                    }
                }
                ArchiveAction::Clear => {
                    let removed = api.archive_clear(&dir).await?;
                    match cli.output {
                        Output::Human => println!("removed {} artifact(s) from {}", removed, dir.display()),
                        Output::Json => println!("{}", serde_json::json!({ "dir": dir, "removed": removed })),
                    }
                }
            }
        }
        Commands::Reset { remote } => run_reset(&api, remote.target()?, cli.output).await?,
        Commands::Prewarm => api.prewarm(&cli.project).await?,
        Commands::Scan => {
            let found = api.scan_projects(&cli.project).await?;
            match cli.output {
                Output::Human => {
                    for p in &found {
                        println!("{}", p.display());
                    }
                    if found.is_empty() {
                        eprintln!("no Android projects found");
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&found)?),
            }
        }
    }
    Ok(())
}
