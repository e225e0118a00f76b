//! Host-level operations of the install: package tool, Windows feature,
//! container runtime installation and reboot.
use std::{env::var_os, path::PathBuf, sync::Mutex, time::Duration};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::{
    detect::RuntimeBackend,
    exec::{powershell_args, ps_quote, CommandOutput, Execute, ExecuteError},
};

/// Exit codes of installers meaning success, possibly with a reboot pending
pub const INSTALLER_SUCCESS_CODES: [i32; 3] = [0, 1641, 3010];

pub const VIRTUALIZATION_FEATURE: &str = "Microsoft-Hyper-V-All";
pub const RUNTIME_PACKAGE: &str = "docker-desktop";
pub const DEFAULT_PREREQUISITES: [&str; 3] = ["git", "python", "ffmpeg"];

/// Install root of Chocolatey when neither `%ChocolateyInstall%` nor `%ProgramData%` is set
pub const CHOCOLATEY_DEFAULT_ROOT: &str = "C:\\ProgramData\\chocolatey";

const CHOCOLATEY_BOOTSTRAP: &str = "Set-ExecutionPolicy Bypass -Scope Process -Force; \
[System.Net.ServicePointManager]::SecurityProtocol = [System.Net.ServicePointManager]::SecurityProtocol -bor 3072; \
iex ((New-Object System.Net.WebClient).DownloadString('https://community.chocolatey.org/install.ps1'))";

#[derive(thiserror::Error, Debug)]
pub enum HostError {
    #[error("{0}")]
    Execute(#[from] ExecuteError),
    #[error("{0} failed with code {1}: {2}")]
    Command(String, i32, String),
}

#[async_trait]
pub trait Host: Send + Sync {
    /// Make sure the package tool used for every other install is available
    async fn ensure_package_manager(&self) -> Result<(), HostError>;
    async fn virtualization_feature_enabled(&self) -> Result<bool, HostError>;
    /// Enable the feature, effective after a reboot
    async fn enable_virtualization_feature(&self) -> Result<(), HostError>;
    async fn install_prerequisites(&self) -> Result<(), HostError>;
    async fn runtime_installed(&self) -> Result<bool, HostError>;
    /// Install the container runtime, effective after a reboot
    async fn install_runtime(&self, backend: RuntimeBackend) -> Result<(), HostError>;
    /// Launch the runtime if it doesn't start on its own
    async fn start_runtime(&self) -> Result<(), HostError>;
    /// Schedule a reboot of the machine in `delay`
    async fn reboot(&self, delay: Duration) -> Result<(), HostError>;
}

#[async_trait]
impl<T: Host + ?Sized> Host for &T {
    async fn ensure_package_manager(&self) -> Result<(), HostError> {
        (**self).ensure_package_manager().await
    }
    async fn virtualization_feature_enabled(&self) -> Result<bool, HostError> {
        (**self).virtualization_feature_enabled().await
    }
    async fn enable_virtualization_feature(&self) -> Result<(), HostError> {
        (**self).enable_virtualization_feature().await
    }
    async fn install_prerequisites(&self) -> Result<(), HostError> {
        (**self).install_prerequisites().await
    }
    async fn runtime_installed(&self) -> Result<bool, HostError> {
        (**self).runtime_installed().await
    }
    async fn install_runtime(&self, backend: RuntimeBackend) -> Result<(), HostError> {
        (**self).install_runtime(backend).await
    }
    async fn start_runtime(&self) -> Result<(), HostError> {
        (**self).start_runtime().await
    }
    async fn reboot(&self, delay: Duration) -> Result<(), HostError> {
        (**self).reboot(delay).await
    }
}

/// Where the bootstrap installs `choco.exe`, determined from (top to bottom priority):
///
/// - `%ChocolateyInstall%\bin`
/// - `%ProgramData%\chocolatey\bin`
/// - `C:\ProgramData\chocolatey\bin`
pub fn chocolatey_location() -> PathBuf {
    var_os("ChocolateyInstall")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            var_os("ProgramData")
                .filter(|v| !v.is_empty())
                .map(|d| PathBuf::from(d).join("chocolatey"))
        })
        .unwrap_or_else(|| PathBuf::from(CHOCOLATEY_DEFAULT_ROOT))
        .join("bin")
        .join("choco.exe")
}

/// Windows host using Chocolatey and the built-in PowerShell modules
#[derive(Debug)]
pub struct WindowsHost<E> {
    executor: E,
    prerequisites: Vec<String>,
    runtime_executable: PathBuf,
    /// `choco` as invoked, an absolute path once the bootstrap ran since the
    /// new `PATH` entry isn't visible to this process
    choco: Mutex<PathBuf>,
    chocolatey_location: PathBuf,
}

impl<E: Execute> WindowsHost<E> {
    pub fn new(executor: E) -> WindowsHost<E> {
        WindowsHost {
            executor,
            prerequisites: DEFAULT_PREREQUISITES.iter().map(|p| p.to_string()).collect(),
            runtime_executable: PathBuf::from("C:\\Program Files\\Docker\\Docker\\Docker Desktop.exe"),
            choco: Mutex::new(PathBuf::from("choco")),
            chocolatey_location: chocolatey_location(),
        }
    }

    pub fn with_prerequisites(self, prerequisites: Vec<String>) -> WindowsHost<E> {
        WindowsHost {
            prerequisites,
            ..self
        }
    }

    /// Path of `choco.exe` once installed
    pub fn with_chocolatey_location(self, chocolatey_location: PathBuf) -> WindowsHost<E> {
        WindowsHost {
            chocolatey_location,
            ..self
        }
    }

    fn choco(&self) -> String {
        self.choco
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .display()
            .to_string()
    }

    fn use_choco(&self, program: PathBuf) {
        debug!("Using {}", program.display());
        *self.choco.lock().unwrap_or_else(|e| e.into_inner()) = program;
    }

    async fn choco_version(&self, program: &str) -> bool {
        match self.executor.run(program, &["--version".to_string()]).await {
            Ok(out) if out.success() => {
                debug!("Chocolatey {} found at {}", out.trimmed(), program);
                true
            }
            Ok(out) => {
                debug!("{} --version exited with {}", program, out.code);
                false
            }
            Err(e) => {
                debug!("Chocolatey not found: {}", e);
                false
            }
        }
    }

    async fn powershell(&self, script: &str) -> Result<CommandOutput, HostError> {
        Ok(self.executor.run("powershell", &powershell_args(script)).await?)
    }

    async fn choco_install(&self, package: &str, extra: &[String]) -> Result<(), HostError> {
        let mut args = vec![
            "install".to_string(),
            package.to_string(),
            "--yes".to_string(),
            "--no-progress".to_string(),
        ];
        args.extend(extra.iter().cloned());
        let out = self.executor.run(&self.choco(), &args).await?;
        if !out.accepted(&INSTALLER_SUCCESS_CODES) {
            return Err(HostError::Command(
                format!("choco install {}", package),
                out.code,
                last_lines(&out.output, 5),
            ));
        }
        debug!("{} installed (code {})", package, out.code);
        Ok(())
    }
}

/// Tail of a long installer log, enough to tell what went wrong
fn last_lines(output: &str, count: usize) -> String {
    let lines: Vec<&str> = output.trim().lines().collect();
    lines[lines.len().saturating_sub(count)..].join("\n")
}

#[async_trait]
impl<E: Execute> Host for WindowsHost<E> {
    #[instrument(skip(self))]
    async fn ensure_package_manager(&self) -> Result<(), HostError> {
        if self.choco_version(&self.choco()).await {
            return Ok(());
        }
        let installed = self.chocolatey_location.display().to_string();
        if self.chocolatey_location.is_file() && self.choco_version(&installed).await {
            self.use_choco(self.chocolatey_location.clone());
            return Ok(());
        }
        info!("Installing Chocolatey");
        let out = self.powershell(CHOCOLATEY_BOOTSTRAP).await?;
        if !out.success() {
            return Err(HostError::Command(
                "Chocolatey bootstrap".to_string(),
                out.code,
                last_lines(&out.output, 5),
            ));
        }
        self.use_choco(self.chocolatey_location.clone());
        Ok(())
    }

    async fn virtualization_feature_enabled(&self) -> Result<bool, HostError> {
        let script = format!(
            "(Get-WindowsOptionalFeature -Online -FeatureName {}).State",
            ps_quote(VIRTUALIZATION_FEATURE)
        );
        let out = self.powershell(&script).await?;
        if !out.success() {
            return Err(HostError::Command(
                "Get-WindowsOptionalFeature".to_string(),
                out.code,
                out.trimmed().to_string(),
            ));
        }
        Ok(out.trimmed().eq_ignore_ascii_case("enabled"))
    }

    #[instrument(skip(self))]
    async fn enable_virtualization_feature(&self) -> Result<(), HostError> {
        info!("Enabling {}", VIRTUALIZATION_FEATURE);
        let script = format!(
            "Enable-WindowsOptionalFeature -Online -FeatureName {} -All -NoRestart | Out-Null",
            ps_quote(VIRTUALIZATION_FEATURE)
        );
        let out = self.powershell(&script).await?;
        if !out.accepted(&INSTALLER_SUCCESS_CODES) {
            return Err(HostError::Command(
                "Enable-WindowsOptionalFeature".to_string(),
                out.code,
                out.trimmed().to_string(),
            ));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn install_prerequisites(&self) -> Result<(), HostError> {
        for package in &self.prerequisites {
            info!("Installing {}", package);
            self.choco_install(package, &[]).await?;
        }
        Ok(())
    }

    async fn runtime_installed(&self) -> Result<bool, HostError> {
        if self.runtime_executable.is_file() {
            return Ok(true);
        }
        match self.executor.run("docker", &["--version".to_string()]).await {
            Ok(out) => Ok(out.success()),
            Err(ExecuteError::Spawn(_, _)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    async fn install_runtime(&self, backend: RuntimeBackend) -> Result<(), HostError> {
        info!("Installing {} with the {} backend", RUNTIME_PACKAGE, backend);
        let extra = match backend.installer_argument() {
            Some(argument) => vec![format!("--install-arguments={}", argument)],
            None => Vec::new(),
        };
        self.choco_install(RUNTIME_PACKAGE, &extra).await
    }

    async fn start_runtime(&self) -> Result<(), HostError> {
        if !self.runtime_executable.is_file() {
            warn!(
                "{} not found, relying on the runtime service",
                self.runtime_executable.display()
            );
            return Ok(());
        }
        let script = format!(
            "if (-not (Get-Process -Name 'Docker Desktop' -ErrorAction SilentlyContinue)) {{ Start-Process -FilePath {} }}",
            ps_quote(&self.runtime_executable.display().to_string())
        );
        let out = self.powershell(&script).await?;
        if !out.success() {
            return Err(HostError::Command(
                "Start-Process".to_string(),
                out.code,
                out.trimmed().to_string(),
            ));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reboot(&self, delay: Duration) -> Result<(), HostError> {
        let args = vec![
            "/r".to_string(),
            "/t".to_string(),
            delay.as_secs().to_string(),
            "/c".to_string(),
            "StackPilot restarts the computer to continue the installation".to_string(),
        ];
        let out = self.executor.run("shutdown", &args).await?;
        if !out.success() {
            return Err(HostError::Command(
                "shutdown /r".to_string(),
                out.code,
                out.trimmed().to_string(),
            ));
        }
        info!("Reboot scheduled in {}s", delay.as_secs());
        Ok(())
    }
}
