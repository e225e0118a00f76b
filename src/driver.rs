//! # Install sequence
//!
//! The install is a fixed sequence of [Step]s. Two of them may need the
//! machine to restart: enabling the Hyper-V feature and installing the
//! container runtime. Steps never exit the process themselves, they return a
//! [StepOutcome] and the loop in [Driver::run] decides what happens next:
//!
//! - `SuspendForReboot`: persist the stage and mode, arm the resume task,
//!   schedule the reboot and return [RunOutcome::Rebooting]
//! - `Failed`: return right away, leaving any persisted progress in place so
//!   the next invocation resumes from the same point
//! - `Done`: progress was cleared and the resume task removed
//!
//! A run starting with a persisted stage restores the persisted mode and jumps
//! to the step following that stage.
use std::{fmt, time::Duration};

use tracing::{info, instrument, warn};

use crate::{
    builder::Configuration,
    container::{EnsureReport, Lifecycle},
    detect::HypervisorClass,
    health::{Health, HealthProbe},
    host::Host,
    merge::{entries_to_values, merge, MergeReport},
    progress::{InstallMode, InstallStage, ProgressStore},
    resume::{Registrar, TaskScheduler},
    runtime::{wait_until_live, ContainerRuntime},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    EnsurePackageManager,
    EnableVirtualizationFeature,
    InstallPrerequisites,
    InstallRuntime,
    WaitForRuntime,
    EnsureContainers,
    MergeIntegrationConfig,
    Finish,
}

impl Step {
    pub const SEQUENCE: [Step; 8] = [
        Step::EnsurePackageManager,
        Step::EnableVirtualizationFeature,
        Step::InstallPrerequisites,
        Step::InstallRuntime,
        Step::WaitForRuntime,
        Step::EnsureContainers,
        Step::MergeIntegrationConfig,
        Step::Finish,
    ];

    /// Step an invocation starts from, given the persisted stage
    pub fn resume_after(stage: Option<InstallStage>) -> Step {
        match stage {
            Some(InstallStage::AwaitingVirtualizationFeatureReboot) => Step::InstallPrerequisites,
            Some(InstallStage::AwaitingRuntimeInstallReboot) => Step::WaitForRuntime,
            _ => Step::EnsurePackageManager,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Step::EnsurePackageManager => "Ensure package manager",
            Step::EnableVirtualizationFeature => "Enable virtualization feature",
            Step::InstallPrerequisites => "Install prerequisite tools",
            Step::InstallRuntime => "Install container runtime",
            Step::WaitForRuntime => "Wait for container runtime",
            Step::EnsureContainers => "Provision containers",
            Step::MergeIntegrationConfig => "Publish service endpoints",
            Step::Finish => "Clean up install state",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Unrecoverable failure of a run, with what the operator can do about it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Step which failed, `None` before the sequence started
    pub step: Option<Step>,
    pub reason: String,
    pub hint: String,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.step {
            Some(step) => write!(f, "{} failed: {}", step, self.reason)?,
            None => write!(f, "{}", self.reason)?,
        }
        write!(f, "\nhint: {}", self.hint)
    }
}

/// What a single step asks the loop to do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    SuspendForReboot(InstallStage),
    Done,
    Failed(Failure),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub mode: InstallMode,
    pub resumed_from: Option<InstallStage>,
    pub containers: Vec<EnsureReport>,
    pub merge: Option<MergeReport>,
    /// Degraded parts of the run which didn't prevent completion
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(RunSummary),
    /// Progress was saved and a reboot scheduled
    Rebooting { stage: InstallStage, mode: InstallMode },
    Failed(Failure),
}

impl RunOutcome {
    /// Rebooting exits with 0 as well, only the persisted progress tells it
    /// apart from a completed run
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed(_) | RunOutcome::Rebooting { .. } => 0,
            RunOutcome::Failed(_) => 1,
        }
    }
}

/// Delay before rebooting, longer when someone may be watching
pub fn reboot_delay(mode: InstallMode) -> Duration {
    match mode {
        InstallMode::Unattended => Duration::from_secs(10),
        InstallMode::Interactive => Duration::from_secs(60),
    }
}

#[derive(Debug)]
pub struct Driver<H, R, P, S, T> {
    config: Configuration,
    host: H,
    lifecycle: Lifecycle<R, P>,
    store: S,
    registrar: Registrar<T>,
    hypervisor: HypervisorClass,
}

impl<H, R, P, S, T> Driver<H, R, P, S, T>
where
    H: Host,
    R: ContainerRuntime,
    P: HealthProbe,
    S: ProgressStore,
    T: TaskScheduler,
{
    pub fn new(
        config: Configuration,
        host: H,
        lifecycle: Lifecycle<R, P>,
        store: S,
        registrar: Registrar<T>,
        hypervisor: HypervisorClass,
    ) -> Driver<H, R, P, S, T> {
        Driver {
            config,
            host,
            lifecycle,
            store,
            registrar,
            hypervisor,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn registrar(&self) -> &Registrar<T> {
        &self.registrar
    }

    fn log_hint(&self) -> String {
        format!("the full log is at {}", self.config.log_file().display())
    }

    fn failure(&self, step: Option<Step>, reason: String, hint: &str) -> Failure {
        Failure {
            step,
            reason,
            hint: format!("{}; {}", hint, self.log_hint()),
        }
    }

    /// Run the install from the persisted stage, or from the start with
    /// `requested` mode when nothing was persisted
    #[instrument(skip(self))]
    pub async fn run(&self, requested: InstallMode) -> RunOutcome {
        let persisted = match self.store.load() {
            Ok(stage) => stage.filter(InstallStage::is_reboot_pending),
            Err(e) => {
                return RunOutcome::Failed(self.failure(
                    None,
                    format!("could not read install progress: {}", e),
                    "run `stackpilot reset` to start over",
                ))
            }
        };

        let mode = match persisted {
            Some(stage) => match self.store.load_mode() {
                Ok(mode) => {
                    info!("Resuming after {} in {} mode", stage, mode);
                    if mode != requested {
                        warn!("Ignoring requested {} mode, the install started in {} mode", requested, mode);
                    }
                    mode
                }
                Err(e) => {
                    return RunOutcome::Failed(self.failure(
                        None,
                        format!("could not read install mode: {}", e),
                        "run `stackpilot reset` to start over",
                    ))
                }
            },
            None => {
                info!("Starting install in {} mode", requested);
                requested
            }
        };

        let mut summary = RunSummary {
            mode,
            resumed_from: persisted,
            ..RunSummary::default()
        };

        let start = Step::resume_after(persisted);
        let steps: Vec<Step> = Step::SEQUENCE
            .iter()
            .copied()
            .skip_while(|s| *s != start)
            .collect();
        let total = Step::SEQUENCE.len();

        for step in steps {
            let index = Step::SEQUENCE.iter().position(|s| *s == step).unwrap_or(0) + 1;
            info!("[{}/{}] {}", index, total, step);
            match self.execute(step, &mut summary).await {
                StepOutcome::Continue => info!("[{}/{}] {}: ok", index, total, step),
                StepOutcome::Done => {
                    info!("[{}/{}] {}: ok", index, total, step);
                    return RunOutcome::Completed(summary);
                }
                StepOutcome::SuspendForReboot(stage) => {
                    info!("[{}/{}] {}: reboot required", index, total, step);
                    return self.suspend(stage, mode).await;
                }
                StepOutcome::Failed(failure) => {
                    warn!("[{}/{}] {}: failed", index, total, step);
                    return RunOutcome::Failed(failure);
                }
            }
        }
        RunOutcome::Completed(summary)
    }

    async fn suspend(&self, stage: InstallStage, mode: InstallMode) -> RunOutcome {
        if let Err(e) = self.store.save(stage, mode) {
            return RunOutcome::Failed(self.failure(
                None,
                format!("could not save install progress before rebooting: {}", e),
                &format!("check that {} is writable", self.config.state_dir.display()),
            ));
        }
        if let Err(e) = self
            .registrar
            .arm(&self.config.entry_point, mode, &self.config.resume_arguments)
            .await {
            warn!(
                "Could not register the resume task, run `{} install` after the reboot: {}",
                self.config.entry_point.display(),
                e
            );
        }
        let delay = reboot_delay(mode);
        if let Err(e) = self.host.reboot(delay).await {
            return RunOutcome::Failed(self.failure(
                None,
                format!("could not schedule the reboot: {}", e),
                "restart the computer and run `stackpilot install` again",
            ));
        }
        info!("Rebooting in {}s, the install resumes afterwards", delay.as_secs());
        RunOutcome::Rebooting { stage, mode }
    }

    async fn execute(&self, step: Step, summary: &mut RunSummary) -> StepOutcome {
        match step {
            Step::EnsurePackageManager => match self.host.ensure_package_manager().await {
                Ok(()) => StepOutcome::Continue,
                Err(e) => StepOutcome::Failed(self.failure(
                    Some(step),
                    e.to_string(),
                    "install Chocolatey from https://chocolatey.org/install and run again",
                )),
            },
            Step::EnableVirtualizationFeature => self.enable_virtualization(step).await,
            Step::InstallPrerequisites => match self.host.install_prerequisites().await {
                Ok(()) => StepOutcome::Continue,
                Err(e) => StepOutcome::Failed(self.failure(
                    Some(step),
                    e.to_string(),
                    "check the Chocolatey logs in C:\\ProgramData\\chocolatey\\logs",
                )),
            },
            Step::InstallRuntime => self.install_runtime(step).await,
            Step::WaitForRuntime => self.wait_for_runtime(step).await,
            Step::EnsureContainers => self.ensure_containers(step, summary).await,
            Step::MergeIntegrationConfig => {
                self.merge_integration(summary);
                StepOutcome::Continue
            }
            Step::Finish => {
                if let Err(e) = self.store.clear() {
                    warn!("Could not clear install progress: {}", e);
                    summary.warnings.push(format!("install progress not cleared: {}", e));
                }
                if let Err(e) = self.registrar.disarm().await {
                    warn!("Could not remove the resume task: {}", e);
                    summary.warnings.push(format!("resume task not removed: {}", e));
                }
                StepOutcome::Done
            }
        }
    }

    async fn enable_virtualization(&self, step: Step) -> StepOutcome {
        if !self.hypervisor.needs_virtualization_feature() {
            info!("Not a Hyper-V guest ({}), nothing to enable", self.hypervisor);
            return StepOutcome::Continue;
        }
        match self.host.virtualization_feature_enabled().await {
            Ok(true) => {
                info!("Virtualization feature already enabled");
                StepOutcome::Continue
            }
            Ok(false) => match self.host.enable_virtualization_feature().await {
                Ok(()) => {
                    StepOutcome::SuspendForReboot(InstallStage::AwaitingVirtualizationFeatureReboot)
                }
                Err(e) => StepOutcome::Failed(self.failure(
                    Some(step),
                    e.to_string(),
                    "enable Hyper-V from \"Turn Windows features on or off\" and run again",
                )),
            },
            Err(e) => StepOutcome::Failed(self.failure(
                Some(step),
                e.to_string(),
                "make sure the install runs from an elevated prompt",
            )),
        }
    }

    async fn install_runtime(&self, step: Step) -> StepOutcome {
        match self.host.runtime_installed().await {
            Ok(true) => {
                info!("Container runtime already installed");
                StepOutcome::Continue
            }
            Ok(false) => match self.host.install_runtime(self.hypervisor.backend()).await {
                Ok(()) => StepOutcome::SuspendForReboot(InstallStage::AwaitingRuntimeInstallReboot),
                Err(e) => StepOutcome::Failed(self.failure(
                    Some(step),
                    e.to_string(),
                    "install Docker Desktop from https://www.docker.com/products/docker-desktop and run again",
                )),
            },
            Err(e) => StepOutcome::Failed(self.failure(
                Some(step),
                e.to_string(),
                "check that Docker Desktop can be detected on this machine",
            )),
        }
    }

    async fn wait_for_runtime(&self, step: Step) -> StepOutcome {
        if let Err(e) = self.host.start_runtime().await {
            warn!("Could not launch the container runtime: {}", e);
        }
        let live = wait_until_live(
            self.lifecycle.runtime(),
            self.config.runtime_timeout,
            self.config.runtime_interval,
        )
        .await;
        if live {
            return StepOutcome::Continue;
        }
        let hint = if self.hypervisor.is_virtual() {
            "start Docker Desktop and check `docker info`; inside a virtual machine, nested virtualization must be exposed by the host hypervisor"
        } else {
            "start Docker Desktop and check `docker info`"
        };
        StepOutcome::Failed(self.failure(
            Some(step),
            format!(
                "the container runtime did not come up within {}s",
                self.config.runtime_timeout.as_secs()
            ),
            hint,
        ))
    }

    async fn ensure_containers(&self, step: Step, summary: &mut RunSummary) -> StepOutcome {
        let mut errors = Vec::new();
        for spec in &self.config.containers {
            match self.lifecycle.ensure(spec).await {
                Ok(report) => {
                    if report.health == Health::Degraded {
                        let url = spec
                            .health_url
                            .as_ref()
                            .map(|u| u.to_string())
                            .unwrap_or_default();
                        warn!(
                            "{} is not answering on {} yet, it may still be initializing",
                            spec.name, url
                        );
                        summary
                            .warnings
                            .push(format!("{} did not report healthy on {}", spec.name, url));
                    }
                    summary.containers.push(report);
                }
                Err(e) => {
                    warn!("{}", e);
                    errors.push(e.to_string());
                }
            }
        }
        if errors.is_empty() {
            StepOutcome::Continue
        } else {
            StepOutcome::Failed(self.failure(
                Some(step),
                errors.join("; "),
                "inspect the containers with `docker ps -a` and `docker logs <name>`, then run install again",
            ))
        }
    }

    fn merge_integration(&self, summary: &mut RunSummary) {
        let Some(target) = &self.config.integration else {
            info!("No integration file configured");
            return;
        };
        let result = entries_to_values(&target.entries)
            .and_then(|desired| merge(&target.path, &target.section, &desired));
        match result {
            Ok(report) => {
                for key in &report.kept {
                    info!("Kept existing entry {} in {}", key, target.path.display());
                }
                summary.merge = Some(report);
            }
            Err(e) => {
                warn!("{}", e);
                summary.warnings.push(format!(
                    "integration entries not published to {}: {}",
                    target.path.display(),
                    e
                ));
            }
        }
    }
}
