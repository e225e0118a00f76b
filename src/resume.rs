//! # Resume after reboot
//!
//! Before the host reboots, a scheduled task is registered to run the
//! orchestrator again. Unattended installs resume at boot as the system
//! account, interactive installs at the next logon of the current user. There
//! is never more than one task: arming clears the folder first, disarming
//! removes the folder altogether.
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::{
    exec::{powershell_args, ps_quote, Execute, ExecuteError},
    progress::InstallMode,
};

/// Folder of the task scheduler holding the resume task
pub const TASK_FOLDER: &str = "StackPilot";
/// Name of the resume task inside [TASK_FOLDER]
pub const TASK_NAME: &str = "ResumeInstall";

#[derive(thiserror::Error, Debug)]
pub enum ResumeError {
    #[error("Could not talk to the task scheduler: {0}")]
    Execute(#[from] ExecuteError),
    #[error("Task scheduler operation {0} failed with code {1}: {2}")]
    Scheduler(&'static str, i32, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    AtBoot,
    AtLogon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunAs {
    System,
    CurrentUser,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeTask {
    pub name: String,
    pub program: PathBuf,
    pub arguments: Vec<String>,
    pub trigger: Trigger,
    pub run_as: RunAs,
}

impl ResumeTask {
    /// The task re-invoking `entry_point` for an install running in `mode`
    pub fn for_mode(entry_point: &Path, mode: InstallMode) -> ResumeTask {
        let mut arguments = vec!["install".to_string()];
        let (trigger, run_as) = match mode {
            InstallMode::Unattended => {
                arguments.push("--unattended".to_string());
                (Trigger::AtBoot, RunAs::System)
            }
            InstallMode::Interactive => (Trigger::AtLogon, RunAs::CurrentUser),
        };
        ResumeTask {
            name: TASK_NAME.to_string(),
            program: entry_point.to_path_buf(),
            arguments,
            trigger,
            run_as,
        }
    }

    /// Append the options the first invocation was given, so the resumed run
    /// sees the same files whatever account it runs as
    pub fn with_arguments(mut self, extra: &[String]) -> ResumeTask {
        self.arguments.extend(extra.iter().cloned());
        self
    }
}

/// Operations of the host task scheduler
///
/// Listing or deleting a folder which doesn't exist must succeed.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    async fn create_folder(&self, folder: &str) -> Result<(), ResumeError>;
    async fn list_tasks(&self, folder: &str) -> Result<Vec<String>, ResumeError>;
    async fn delete_task(&self, folder: &str, name: &str) -> Result<(), ResumeError>;
    async fn delete_folder(&self, folder: &str) -> Result<(), ResumeError>;
    async fn register_task(&self, folder: &str, task: &ResumeTask) -> Result<(), ResumeError>;
}

#[async_trait]
impl<T: TaskScheduler + ?Sized> TaskScheduler for &T {
    async fn create_folder(&self, folder: &str) -> Result<(), ResumeError> {
        (**self).create_folder(folder).await
    }
    async fn list_tasks(&self, folder: &str) -> Result<Vec<String>, ResumeError> {
        (**self).list_tasks(folder).await
    }
    async fn delete_task(&self, folder: &str, name: &str) -> Result<(), ResumeError> {
        (**self).delete_task(folder, name).await
    }
    async fn delete_folder(&self, folder: &str) -> Result<(), ResumeError> {
        (**self).delete_folder(folder).await
    }
    async fn register_task(&self, folder: &str, task: &ResumeTask) -> Result<(), ResumeError> {
        (**self).register_task(folder, task).await
    }
}

/// Arms and disarms the resume task
#[derive(Debug)]
pub struct Registrar<S> {
    scheduler: S,
    folder: String,
}

impl<S: TaskScheduler> Registrar<S> {
    pub fn new(scheduler: S) -> Registrar<S> {
        Registrar {
            scheduler,
            folder: TASK_FOLDER.to_string(),
        }
    }

    pub fn with_folder(self, folder: impl Into<String>) -> Registrar<S> {
        Registrar {
            folder: folder.into(),
            ..self
        }
    }

    pub fn scheduler(&self) -> &S {
        &self.scheduler
    }

    /// Register the task resuming the install, replacing any previous one.
    /// `extra` is appended to the `install` command line.
    #[instrument(skip(self, entry_point, extra), fields(folder = %self.folder))]
    pub async fn arm(
        &self,
        entry_point: &Path,
        mode: InstallMode,
        extra: &[String],
    ) -> Result<ResumeTask, ResumeError> {
        let task = ResumeTask::for_mode(entry_point, mode).with_arguments(extra);
        self.scheduler.create_folder(&self.folder).await?;
        for existing in self.scheduler.list_tasks(&self.folder).await? {
            debug!("Removing previous task {}", existing);
            self.scheduler.delete_task(&self.folder, &existing).await?;
        }
        self.scheduler.register_task(&self.folder, &task).await?;
        info!(
            "Resume task armed ({:?} as {:?})",
            task.trigger, task.run_as
        );
        Ok(task)
    }

    /// Remove every task of the folder and the folder itself
    #[instrument(skip(self), fields(folder = %self.folder))]
    pub async fn disarm(&self) -> Result<(), ResumeError> {
        for existing in self.scheduler.list_tasks(&self.folder).await? {
            debug!("Removing task {}", existing);
            self.scheduler.delete_task(&self.folder, &existing).await?;
        }
        self.scheduler.delete_folder(&self.folder).await?;
        debug!("Resume task disarmed");
        Ok(())
    }
}

/// Windows task scheduler driven through PowerShell
#[derive(Debug)]
pub struct PowerShellScheduler<E> {
    executor: E,
}

impl<E: Execute> PowerShellScheduler<E> {
    pub fn new(executor: E) -> PowerShellScheduler<E> {
        PowerShellScheduler { executor }
    }

    async fn script(&self, operation: &'static str, script: &str) -> Result<String, ResumeError> {
        let out = self
            .executor
            .run("powershell", &powershell_args(script))
            .await?;
        if !out.success() {
            return Err(ResumeError::Scheduler(
                operation,
                out.code,
                out.trimmed().to_string(),
            ));
        }
        Ok(out.output)
    }
}

const CONNECT: &str = "$svc = New-Object -ComObject Schedule.Service; $svc.Connect(); $root = $svc.GetFolder('\\');";

fn task_path(folder: &str) -> String {
    format!("\\{}\\", folder)
}

/// Quote for the Windows command line. A trailing backslash would escape the
/// closing quote, so it is doubled.
fn quote_argument(argument: &str) -> String {
    if !argument.contains(' ') {
        return argument.to_string();
    }
    let trailing = argument.len() - argument.trim_end_matches('\\').len();
    format!("\"{}{}\"", argument, "\\".repeat(trailing))
}

pub(crate) fn register_script(folder: &str, task: &ResumeTask) -> String {
    let arguments = task
        .arguments
        .iter()
        .map(|a| quote_argument(a))
        .collect::<Vec<_>>()
        .join(" ");
    let user = "\"$env:USERDOMAIN\\$env:USERNAME\"";
    let trigger = match task.trigger {
        Trigger::AtBoot => "New-ScheduledTaskTrigger -AtStartup".to_string(),
        Trigger::AtLogon => format!("New-ScheduledTaskTrigger -AtLogOn -User {}", user),
    };
    let principal = match task.run_as {
        RunAs::System => {
            "New-ScheduledTaskPrincipal -UserId 'SYSTEM' -LogonType ServiceAccount -RunLevel Highest"
                .to_string()
        }
        RunAs::CurrentUser => format!(
            "New-ScheduledTaskPrincipal -UserId {} -LogonType Interactive -RunLevel Highest",
            user
        ),
    };
    format!(
        "$action = New-ScheduledTaskAction -Execute {program} -Argument {arguments}; \
$trigger = {trigger}; \
$principal = {principal}; \
$settings = New-ScheduledTaskSettingsSet -AllowStartIfOnBatteries -DontStopIfGoingOnBatteries -StartWhenAvailable -ExecutionTimeLimit (New-TimeSpan -Hours 2); \
Register-ScheduledTask -TaskName {name} -TaskPath {path} -Action $action -Trigger $trigger -Principal $principal -Settings $settings -Force | Out-Null",
        program = ps_quote(&task.program.display().to_string()),
        arguments = ps_quote(&arguments),
        trigger = trigger,
        principal = principal,
        name = ps_quote(&task.name),
        path = ps_quote(&task_path(folder)),
    )
}

#[async_trait]
impl<E: Execute> TaskScheduler for PowerShellScheduler<E> {
    async fn create_folder(&self, folder: &str) -> Result<(), ResumeError> {
        let script = format!(
            "{} try {{ $null = $root.GetFolder({f}) }} catch {{ $null = $root.CreateFolder({f}) }}",
            CONNECT,
            f = ps_quote(folder)
        );
        self.script("create-folder", &script).await?;
        Ok(())
    }

    async fn list_tasks(&self, folder: &str) -> Result<Vec<String>, ResumeError> {
        let script = format!(
            "{} try {{ $f = $root.GetFolder({}) }} catch {{ exit 0 }}; $f.GetTasks(1) | ForEach-Object {{ $_.Name }}",
            CONNECT,
            ps_quote(folder)
        );
        let output = self.script("list-tasks", &script).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn delete_task(&self, folder: &str, name: &str) -> Result<(), ResumeError> {
        let script = format!(
            "Unregister-ScheduledTask -TaskPath {} -TaskName {} -Confirm:$false -ErrorAction SilentlyContinue",
            ps_quote(&task_path(folder)),
            ps_quote(name)
        );
        self.script("delete-task", &script).await?;
        Ok(())
    }

    async fn delete_folder(&self, folder: &str) -> Result<(), ResumeError> {
        let script = format!(
            "{} try {{ $null = $root.GetFolder({f}) }} catch {{ exit 0 }}; $root.DeleteFolder({f}, 0)",
            CONNECT,
            f = ps_quote(folder)
        );
        self.script("delete-folder", &script).await?;
        Ok(())
    }

    async fn register_task(&self, folder: &str, task: &ResumeTask) -> Result<(), ResumeError> {
        self.script("register-task", &register_script(folder, task))
            .await?;
        Ok(())
    }
}
