//! # Install progress that survives reboots
//!
//! Two small text files record where an install stopped to reboot and whether
//! it ran unattended. They are the only channel between the invocation that
//! triggers a reboot and the one that resumes after it.
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Mutex,
};

use tracing::{debug, instrument};

pub const STAGE_FILE: &str = "install-stage";
pub const MODE_FILE: &str = "install-mode";

#[derive(thiserror::Error, Debug)]
pub enum ProgressError {
    #[error("Could not write progress to {0}, reason: {1}")]
    Write(PathBuf, std::io::Error),
    #[error("Could not read progress from {0}, reason: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("Could not remove progress file {0}, reason: {1}")]
    Remove(PathBuf, std::io::Error),
    #[error("Progress file {path} has unexpected content {content:?}")]
    Corrupt { path: PathBuf, content: String },
    #[error("Stage {0} is not a reboot stage and cannot be saved")]
    NotResumable(InstallStage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStage {
    NotStarted,
    AwaitingVirtualizationFeatureReboot,
    AwaitingRuntimeInstallReboot,
    Completed,
}

impl InstallStage {
    /// Only these stages are ever written to disk
    pub fn is_reboot_pending(&self) -> bool {
        matches!(
            self,
            InstallStage::AwaitingVirtualizationFeatureReboot
                | InstallStage::AwaitingRuntimeInstallReboot
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstallStage::NotStarted => "NotStarted",
            InstallStage::AwaitingVirtualizationFeatureReboot => {
                "AwaitingVirtualizationFeatureReboot"
            }
            InstallStage::AwaitingRuntimeInstallReboot => "AwaitingRuntimeInstallReboot",
            InstallStage::Completed => "Completed",
        }
    }
}

impl std::fmt::Display for InstallStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstallStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "NotStarted" => Ok(InstallStage::NotStarted),
            "AwaitingVirtualizationFeatureReboot" => {
                Ok(InstallStage::AwaitingVirtualizationFeatureReboot)
            }
            "AwaitingRuntimeInstallReboot" => Ok(InstallStage::AwaitingRuntimeInstallReboot),
            "Completed" => Ok(InstallStage::Completed),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallMode {
    /// No prompts, resumes at boot as the system account
    Unattended,
    /// Resumes at the next logon of the invoking user
    #[default]
    Interactive,
}

impl InstallMode {
    pub fn from_flag(unattended: bool) -> InstallMode {
        if unattended {
            InstallMode::Unattended
        } else {
            InstallMode::Interactive
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstallMode::Unattended => "unattended",
            InstallMode::Interactive => "interactive",
        }
    }
}

impl std::fmt::Display for InstallMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstallMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "unattended" => Ok(InstallMode::Unattended),
            "interactive" => Ok(InstallMode::Interactive),
            other => Err(other.to_string()),
        }
    }
}

/// Durable record of the reboot stage and install mode
///
/// A single orchestrator runs at a time, implementations do not lock.
pub trait ProgressStore: Send + Sync {
    /// Persist a reboot-pending stage together with the mode to restore
    fn save(&self, stage: InstallStage, mode: InstallMode) -> Result<(), ProgressError>;
    /// Last saved stage, `None` when nothing was saved
    fn load(&self) -> Result<Option<InstallStage>, ProgressError>;
    /// Saved mode, [InstallMode::Interactive] when nothing was saved
    fn load_mode(&self) -> Result<InstallMode, ProgressError>;
    /// Forget everything, succeeds when nothing was saved
    fn clear(&self) -> Result<(), ProgressError>;
}

impl<T: ProgressStore + ?Sized> ProgressStore for &T {
    fn save(&self, stage: InstallStage, mode: InstallMode) -> Result<(), ProgressError> {
        (**self).save(stage, mode)
    }
    fn load(&self) -> Result<Option<InstallStage>, ProgressError> {
        (**self).load()
    }
    fn load_mode(&self) -> Result<InstallMode, ProgressError> {
        (**self).load_mode()
    }
    fn clear(&self) -> Result<(), ProgressError> {
        (**self).clear()
    }
}

/// Keeps progress in two files under a fixed directory
#[derive(Debug, Clone)]
pub struct FileProgressStore {
    dir: PathBuf,
}

impl FileProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> FileProgressStore {
        FileProgressStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stage_path(&self) -> PathBuf {
        self.dir.join(STAGE_FILE)
    }

    fn mode_path(&self) -> PathBuf {
        self.dir.join(MODE_FILE)
    }

    fn read(path: &Path) -> Result<Option<String>, ProgressError> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ProgressError::Read(path.to_path_buf(), e)),
        }
    }

    fn remove(path: &Path) -> Result<(), ProgressError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProgressError::Remove(path.to_path_buf(), e)),
        }
    }
}

impl ProgressStore for FileProgressStore {
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    fn save(&self, stage: InstallStage, mode: InstallMode) -> Result<(), ProgressError> {
        if !stage.is_reboot_pending() {
            return Err(ProgressError::NotResumable(stage));
        }
        fs::create_dir_all(&self.dir).map_err(|e| ProgressError::Write(self.dir.clone(), e))?;
        let stage_path = self.stage_path();
        fs::write(&stage_path, stage.as_str()).map_err(|e| ProgressError::Write(stage_path, e))?;
        let mode_path = self.mode_path();
        fs::write(&mode_path, mode.as_str()).map_err(|e| ProgressError::Write(mode_path, e))?;
        debug!("Saved progress");
        Ok(())
    }

    fn load(&self) -> Result<Option<InstallStage>, ProgressError> {
        let path = self.stage_path();
        match Self::read(&path)? {
            None => Ok(None),
            Some(content) => content
                .parse()
                .map(Some)
                .map_err(|content| ProgressError::Corrupt { path, content }),
        }
    }

    fn load_mode(&self) -> Result<InstallMode, ProgressError> {
        let path = self.mode_path();
        match Self::read(&path)? {
            None => Ok(InstallMode::default()),
            Some(content) => content
                .parse()
                .map_err(|content| ProgressError::Corrupt { path, content }),
        }
    }

    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    fn clear(&self) -> Result<(), ProgressError> {
        Self::remove(&self.stage_path())?;
        Self::remove(&self.mode_path())?;
        debug!("Cleared progress");
        Ok(())
    }
}

/// Progress kept in memory, for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    saved: Mutex<Option<(InstallStage, InstallMode)>>,
}

impl MemoryProgressStore {
    pub fn new() -> MemoryProgressStore {
        MemoryProgressStore::default()
    }

    /// Store pre-populated as if a previous invocation had saved `stage`
    pub fn with_saved(stage: InstallStage, mode: InstallMode) -> MemoryProgressStore {
        MemoryProgressStore {
            saved: Mutex::new(Some((stage, mode))),
        }
    }

    pub fn snapshot(&self) -> Option<(InstallStage, InstallMode)> {
        *self.saved.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ProgressStore for MemoryProgressStore {
    fn save(&self, stage: InstallStage, mode: InstallMode) -> Result<(), ProgressError> {
        if !stage.is_reboot_pending() {
            return Err(ProgressError::NotResumable(stage));
        }
        *self.saved.lock().unwrap_or_else(|e| e.into_inner()) = Some((stage, mode));
        Ok(())
    }

    fn load(&self) -> Result<Option<InstallStage>, ProgressError> {
        Ok(self.snapshot().map(|(stage, _)| stage))
    }

    fn load_mode(&self) -> Result<InstallMode, ProgressError> {
        Ok(self.snapshot().map(|(_, mode)| mode).unwrap_or_default())
    }

    fn clear(&self) -> Result<(), ProgressError> {
        *self.saved.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}
