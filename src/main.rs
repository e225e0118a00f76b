//! # stackpilot
//! Provisions the local service stack on a Windows workstation: container
//! runtime, prerequisite tools, service containers and the client
//! configuration pointing at them. Installs needing a reboot resume on their
//! own through a scheduled task.
mod observability;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use stackpilot::{
    builder::{
        default_state_dir, runtime::DockerCliBuilder, Builder, Configuration, IntegrationTarget,
        LOG_FILE,
    },
    container::{EnsureReport, Lifecycle},
    detect::{detect, CimInventory, DmiInventory, HypervisorClass},
    driver::{Driver, RunOutcome},
    exec::HostExecutor,
    health::HttpProbe,
    host::WindowsHost,
    manifest::StackManifest,
    progress::{FileProgressStore, InstallMode, ProgressStore},
    resume::{PowerShellScheduler, Registrar},
    stack::{default_containers, default_integration, default_integration_path},
};

use crate::observability::ObservabilityConfig;

/// Manifest picked up next to the executable when `--manifest` isn't given,
/// so resumed runs see the same stack
const DEFAULT_MANIFEST: &str = "stackpilot.toml";

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Opts {
    /// Log filter, e.g. `debug` or `stackpilot=trace` (default: $STACKPILOT_LOG, then `info`)
    #[clap(long, global = true)]
    log_level: Option<String>,

    /// Format of the log file: `text` or `json`
    #[clap(long, global = true)]
    log_format: Option<String>,

    /// Log file, appended to (default: <state-dir>/stackpilot.log)
    #[clap(long, global = true)]
    log_file: Option<PathBuf>,

    /// Directory holding the install progress (default: $STACKPILOT_STATE_DIR, then %ProgramData%\StackPilot)
    #[clap(long, global = true)]
    state_dir: Option<PathBuf>,

    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Subcommand, Debug)]
enum SubCommand {
    /// Run the install, resuming from the persisted stage if any
    Install(InstallArgs),
    /// Show the persisted install stage
    Status,
    /// Forget the persisted stage and remove the resume task
    Reset,
    /// Show the detected hypervisor and the runtime backend it selects
    Detect,
}

#[derive(clap::Args, Debug)]
struct InstallArgs {
    /// Reboot without waiting and resume at boot as SYSTEM
    #[clap(long)]
    unattended: bool,

    /// TOML manifest replacing the built-in stack
    #[clap(long)]
    manifest: Option<PathBuf>,

    /// Directory holding `infrastructure/docker` (default: next to the executable)
    #[clap(long)]
    stack_root: Option<PathBuf>,

    /// Client configuration receiving the service entries
    #[clap(long)]
    integration_config: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let opts = Opts::parse();
    let state_dir = opts.state_dir.clone().unwrap_or_else(default_state_dir);

    observability::init(ObservabilityConfig {
        log_level: opts.log_level.clone(),
        log_file: Some(opts.log_file.clone().unwrap_or_else(|| state_dir.join(LOG_FILE))),
        log_format: opts.log_format.clone(),
    })
    .with_context(|| "failed to initialize logging")?;

    let code = match opts.subcmd {
        SubCommand::Install(ref args) => {
            let logging = logging_arguments(&opts)?;
            install(args, state_dir, logging).await?
        }
        SubCommand::Status => status(&state_dir)?,
        SubCommand::Reset => reset(&state_dir).await?,
        SubCommand::Detect => {
            let class = detect_hypervisor().await;
            println!("hypervisor: {}", class);
            println!("runtime backend: {}", class.backend());
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn detect_hypervisor() -> HypervisorClass {
    if cfg!(windows) {
        detect(&CimInventory::new(HostExecutor)).await
    } else {
        detect(&DmiInventory::default()).await
    }
}

fn load_stack(args: &InstallArgs, entry_point: &Path) -> Result<(Configuration, Option<IntegrationTarget>)> {
    let exe_dir = entry_point
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let manifest = args.manifest.clone().or_else(|| {
        let candidate = exe_dir.join(DEFAULT_MANIFEST);
        candidate.is_file().then_some(candidate)
    });

    let config = Configuration::new(entry_point.to_path_buf());
    let (config, integration) = match manifest {
        Some(path) => {
            tracing::info!("Using manifest {}", path.display());
            let manifest = StackManifest::load(&path)?;
            (config.with_containers(manifest.containers), manifest.integration)
        }
        None => {
            let root = args.stack_root.clone().unwrap_or(exe_dir);
            let containers = default_containers(&root).with_context(|| "invalid built-in stack")?;
            (
                config.with_containers(containers),
                Some(default_integration(default_integration_path())),
            )
        }
    };

    let integration = match (integration, args.integration_config.clone()) {
        (Some(target), Some(path)) => Some(IntegrationTarget { path, ..target }),
        (None, Some(path)) => Some(default_integration(path)),
        (target, None) => target,
    };
    Ok((config, integration))
}

/// The resumed run starts in another working directory, possibly as another
/// account, so every path it is handed must be absolute
fn absolute(path: &Path) -> Result<String> {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .with_context(|| "failed to read the working directory")?
            .join(path)
    };
    Ok(path.display().to_string())
}

/// Logging options of this run, repeated on the resumed one
fn logging_arguments(opts: &Opts) -> Result<Vec<(&'static str, String)>> {
    let mut arguments = Vec::new();
    if let Some(level) = &opts.log_level {
        arguments.push(("--log-level", level.clone()));
    }
    if let Some(format) = &opts.log_format {
        arguments.push(("--log-format", format.clone()));
    }
    if let Some(file) = &opts.log_file {
        arguments.push(("--log-file", absolute(file)?));
    }
    Ok(arguments)
}

async fn install(args: &InstallArgs, state_dir: PathBuf, logging: Vec<(&str, String)>) -> Result<i32> {
    let entry_point = std::env::current_exe().with_context(|| "failed to locate the stackpilot executable")?;
    let (config, integration) = load_stack(args, &entry_point)?;
    let mut config = config
        .with_state_dir(state_dir.clone())
        .with_resume_argument("--state-dir", absolute(&state_dir)?);
    for (flag, value) in logging {
        config = config.with_resume_argument(flag, value);
    }
    if let Some(manifest) = &args.manifest {
        config = config.with_resume_argument("--manifest", absolute(manifest)?);
    }
    if let Some(root) = &args.stack_root {
        config = config.with_resume_argument("--stack-root", absolute(root)?);
    }
    // Resolved now: an unattended resume runs as SYSTEM, whose %APPDATA% is
    // not the invoking user's
    if let Some(target) = integration {
        config = config
            .with_resume_argument("--integration-config", absolute(&target.path)?)
            .with_integration(target);
    }

    let hypervisor = detect_hypervisor().await;
    let docker = DockerCliBuilder::auto(HostExecutor).try_build()?;
    let lifecycle = Lifecycle::new(docker, HttpProbe::default()).with_policy(config.health);

    let driver = Driver::new(
        config,
        WindowsHost::new(HostExecutor),
        lifecycle,
        FileProgressStore::new(state_dir),
        Registrar::new(PowerShellScheduler::new(HostExecutor)),
        hypervisor,
    );

    let outcome = driver.run(InstallMode::from_flag(args.unattended)).await;
    print_outcome(&outcome);
    Ok(outcome.exit_code())
}

fn print_report(report: &EnsureReport) {
    println!("  {:<20} {:?}, health {:?}", report.name, report.action, report.health);
}

fn print_outcome(outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed(summary) => {
            println!("Install complete ({} mode)", summary.mode);
            summary.containers.iter().for_each(print_report);
            if let Some(merge) = &summary.merge {
                if !merge.added.is_empty() {
                    println!("  added client entries: {}", merge.added.join(", "));
                }
                if !merge.kept.is_empty() {
                    println!("  kept existing client entries: {}", merge.kept.join(", "));
                }
            }
            for warning in &summary.warnings {
                println!("  warning: {}", warning);
            }
        }
        RunOutcome::Rebooting { stage, mode } => {
            println!("Rebooting to finish {}; the install resumes in {} mode", stage, mode);
        }
        RunOutcome::Failed(failure) => eprintln!("Install failed: {}", failure),
    }
}

fn status(state_dir: &Path) -> Result<i32> {
    let store = FileProgressStore::new(state_dir);
    match store.load()? {
        Some(stage) => println!("stage: {}\nmode: {}", stage, store.load_mode()?),
        None => println!("not started"),
    }
    Ok(0)
}

async fn reset(state_dir: &Path) -> Result<i32> {
    FileProgressStore::new(state_dir).clear()?;
    if let Err(e) = Registrar::new(PowerShellScheduler::new(HostExecutor)).disarm().await {
        tracing::warn!("Could not remove the resume task: {}", e);
    }
    println!("install state cleared");
    Ok(0)
}
