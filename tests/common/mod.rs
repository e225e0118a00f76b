#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use url::Url;

use stackpilot::{
    container::ContainerSpec,
    detect::RuntimeBackend,
    health::HealthProbe,
    host::{Host, HostError},
    resume::{ResumeError, ResumeTask, TaskScheduler},
    runtime::{ContainerRuntime, RuntimeError},
};

/// In-memory container runtime keeping count of what it was asked to do
#[derive(Debug, Default)]
pub struct FakeRuntime {
    pub state: Mutex<RuntimeState>,
}

#[derive(Debug, Default)]
pub struct RuntimeState {
    /// `is_live` answers `false` this many times before answering `true`
    pub polls_before_live: usize,
    pub never_live: bool,
    pub live_polls: usize,
    /// name -> running
    pub containers: BTreeMap<String, bool>,
    pub images: BTreeSet<String>,
    pub builds: usize,
    pub creates: usize,
    pub starts: usize,
    /// Names whose creation fails
    pub broken: BTreeSet<String>,
}

impl FakeRuntime {
    pub fn new() -> FakeRuntime {
        FakeRuntime::default()
    }

    pub fn never_live() -> FakeRuntime {
        let runtime = FakeRuntime::default();
        runtime.state.lock().unwrap().never_live = true;
        runtime
    }

    pub fn with_stopped(self, name: &str) -> FakeRuntime {
        self.state.lock().unwrap().containers.insert(name.to_string(), false);
        self
    }

    pub fn with_broken(self, name: &str) -> FakeRuntime {
        self.state.lock().unwrap().broken.insert(name.to_string());
        self
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn is_live(&self) -> Result<bool, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.live_polls += 1;
        Ok(!state.never_live && state.live_polls > state.polls_before_live)
    }

    async fn container_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        Ok(self.state.lock().unwrap().containers.contains_key(name))
    }

    async fn container_running(&self, name: &str) -> Result<bool, RuntimeError> {
        Ok(self.state.lock().unwrap().containers.get(name).copied().unwrap_or(false))
    }

    async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError> {
        Ok(self.state.lock().unwrap().images.contains(reference))
    }

    async fn build_image(&self, tag: &str, _context: &Path) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.builds += 1;
        state.images.insert(tag.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec, image: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        if state.broken.contains(&spec.name) {
            return Err(RuntimeError::Command("run".to_string(), 125, "port is already allocated".to_string()));
        }
        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::Command("run".to_string(), 125, "name already in use".to_string()));
        }
        state.creates += 1;
        state.images.insert(image.to_string());
        state.containers.insert(spec.name.clone(), true);
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state.starts += 1;
        state.containers.insert(name.to_string(), true);
        Ok(())
    }
}

#[derive(Debug)]
pub struct FixedProbe(pub bool);

#[async_trait]
impl HealthProbe for FixedProbe {
    async fn probe(&self, _url: &Url) -> bool {
        self.0
    }
}

/// Host recording every operation it was asked for
#[derive(Debug, Default)]
pub struct FakeHost {
    pub feature_enabled: Mutex<bool>,
    pub runtime_installed: Mutex<bool>,
    pub calls: Mutex<Vec<String>>,
    pub reboots: Mutex<Vec<Duration>>,
    pub backends: Mutex<Vec<RuntimeBackend>>,
    pub fail_prerequisites: bool,
}

impl FakeHost {
    pub fn new(feature_enabled: bool, runtime_installed: bool) -> FakeHost {
        FakeHost {
            feature_enabled: Mutex::new(feature_enabled),
            runtime_installed: Mutex::new(runtime_installed),
            ..FakeHost::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl Host for FakeHost {
    async fn ensure_package_manager(&self) -> Result<(), HostError> {
        self.record("ensure_package_manager");
        Ok(())
    }

    async fn virtualization_feature_enabled(&self) -> Result<bool, HostError> {
        self.record("virtualization_feature_enabled");
        Ok(*self.feature_enabled.lock().unwrap())
    }

    async fn enable_virtualization_feature(&self) -> Result<(), HostError> {
        self.record("enable_virtualization_feature");
        *self.feature_enabled.lock().unwrap() = true;
        Ok(())
    }

    async fn install_prerequisites(&self) -> Result<(), HostError> {
        self.record("install_prerequisites");
        if self.fail_prerequisites {
            return Err(HostError::Command("choco install git".to_string(), 1, "network unreachable".to_string()));
        }
        Ok(())
    }

    async fn runtime_installed(&self) -> Result<bool, HostError> {
        self.record("runtime_installed");
        Ok(*self.runtime_installed.lock().unwrap())
    }

    async fn install_runtime(&self, backend: RuntimeBackend) -> Result<(), HostError> {
        self.record("install_runtime");
        self.backends.lock().unwrap().push(backend);
        *self.runtime_installed.lock().unwrap() = true;
        Ok(())
    }

    async fn start_runtime(&self) -> Result<(), HostError> {
        self.record("start_runtime");
        Ok(())
    }

    async fn reboot(&self, delay: Duration) -> Result<(), HostError> {
        self.record("reboot");
        self.reboots.lock().unwrap().push(delay);
        Ok(())
    }
}

/// Task scheduler keeping folders and tasks in memory
#[derive(Debug, Default)]
pub struct FakeScheduler {
    pub folders: Mutex<BTreeMap<String, Vec<ResumeTask>>>,
    pub fail_register: bool,
}

impl FakeScheduler {
    pub fn failing() -> FakeScheduler {
        FakeScheduler {
            fail_register: true,
            ..FakeScheduler::default()
        }
    }

    pub fn tasks(&self) -> Vec<ResumeTask> {
        self.folders.lock().unwrap().values().flatten().cloned().collect()
    }

    pub fn folder_count(&self) -> usize {
        self.folders.lock().unwrap().len()
    }
}

#[async_trait]
impl TaskScheduler for FakeScheduler {
    async fn create_folder(&self, folder: &str) -> Result<(), ResumeError> {
        self.folders.lock().unwrap().entry(folder.to_string()).or_default();
        Ok(())
    }

    async fn list_tasks(&self, folder: &str) -> Result<Vec<String>, ResumeError> {
        Ok(self
            .folders
            .lock()
            .unwrap()
            .get(folder)
            .map(|tasks| tasks.iter().map(|t| t.name.clone()).collect())
            .unwrap_or_default())
    }

    async fn delete_task(&self, folder: &str, name: &str) -> Result<(), ResumeError> {
        if let Some(tasks) = self.folders.lock().unwrap().get_mut(folder) {
            tasks.retain(|t| t.name != name);
        }
        Ok(())
    }

    async fn delete_folder(&self, folder: &str) -> Result<(), ResumeError> {
        self.folders.lock().unwrap().remove(folder);
        Ok(())
    }

    async fn register_task(&self, folder: &str, task: &ResumeTask) -> Result<(), ResumeError> {
        if self.fail_register {
            return Err(ResumeError::Scheduler("Register-ScheduledTask", 1, "Access is denied.".to_string()));
        }
        self.folders
            .lock()
            .unwrap()
            .entry(folder.to_string())
            .or_default()
            .push(task.clone());
        Ok(())
    }
}
