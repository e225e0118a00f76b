//! # Install configuration builders
//!
//! Every piece of the install is described through builders. All fields are
//! optional while building and are validated once you call
//! [`Builder::try_build`], after which the object can be handed to the
//! [Driver](crate::driver::Driver) as is.
//!
//! ## Example
//!
//! ```rust
//! use std::path::PathBuf;
//! use stackpilot::builder::{Builder, Configuration};
//! use stackpilot::builder::container::ContainerSpecBuilder;
//!
//! let crawler = ContainerSpecBuilder::new()
//!     .with_name("crawl4ai".to_string())
//!     .with_image("unclecode/crawl4ai:latest".to_string())
//!     .with_port(11235, 11235)
//!     .with_health_url("http://localhost:11235/health")
//!     .try_build()
//!     .unwrap();
//!
//! let config = Configuration::new(PathBuf::from("stackpilot.exe"))
//!     .with_state_dir(PathBuf::from("./state"))
//!     .with_container(crawler);
//! assert_eq!(config.containers.len(), 1);
//! ```
use std::{
    collections::BTreeMap,
    env::var_os,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{container::ContainerSpec, health::HealthPolicy, merge::ServerEntry};

pub mod container;
pub mod runtime;

/// Overrides the directory holding the install progress and log
pub const STATE_DIR_ENV: &str = "STACKPILOT_STATE_DIR";
/// Section of the integration file holding service entries
pub const DEFAULT_SECTION: &str = "mcpServers";
/// Name of the install log inside the state directory
pub const LOG_FILE: &str = "stackpilot.log";

pub(crate) fn assert_not_none<T>(key: &str, value: &Option<T>) -> Result<(), BuilderError> {
    match value {
        Some(_) => Ok(()),
        None => Err(BuilderError::MissingRequiredField(key.to_string())),
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum BuilderError {
    /// The field is required but was not provided in the builder object
    #[error("Missing required field {0}")]
    MissingRequiredField(String),
    /// The field was provided but its value cannot be used
    #[error("Invalid value for {0}: {1}")]
    InvalidField(String, String),
    /// Happens when using auto methods to detect the docker binary
    #[error("Binary not found: {0}")]
    BinaryNotFound(String),
}

/// Generic trait which all builder components implement
pub trait Builder<T> {
    /// Validate all the fields from the builder object and apply it to the
    /// final object
    fn try_build(self) -> Result<T, BuilderError>;
}

/// Where service endpoints are published for the consuming client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrationTarget {
    pub path: PathBuf,
    pub section: String,
    pub entries: BTreeMap<String, ServerEntry>,
}

impl IntegrationTarget {
    pub fn new(path: PathBuf) -> IntegrationTarget {
        IntegrationTarget {
            path,
            section: DEFAULT_SECTION.to_string(),
            entries: BTreeMap::new(),
        }
    }

    pub fn with_section(mut self, section: String) -> IntegrationTarget {
        self.section = section;
        self
    }

    pub fn with_entry(mut self, key: String, entry: ServerEntry) -> IntegrationTarget {
        self.entries.insert(key, entry);
        self
    }
}

/// Everything an install run needs, apart from the host capabilities
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Program re-invoked by the resume task
    pub entry_point: PathBuf,
    pub state_dir: PathBuf,
    pub containers: Vec<ContainerSpec>,
    pub integration: Option<IntegrationTarget>,
    /// Bound on waiting for the container runtime after install or reboot
    pub runtime_timeout: Duration,
    pub runtime_interval: Duration,
    pub health: HealthPolicy,
    /// Options passed to the resumed `install` on top of the mode flag
    pub resume_arguments: Vec<String>,
}

impl Configuration {
    pub fn new(entry_point: PathBuf) -> Configuration {
        Configuration {
            entry_point,
            state_dir: default_state_dir(),
            containers: Vec::new(),
            integration: None,
            runtime_timeout: Duration::from_secs(180),
            runtime_interval: Duration::from_secs(5),
            health: HealthPolicy::default(),
            resume_arguments: Vec::new(),
        }
    }

    pub fn with_state_dir(mut self, state_dir: PathBuf) -> Configuration {
        self.state_dir = state_dir;
        self
    }

    pub fn with_container(mut self, container: ContainerSpec) -> Configuration {
        self.containers.push(container);
        self
    }

    pub fn with_containers(mut self, containers: Vec<ContainerSpec>) -> Configuration {
        self.containers = containers;
        self
    }

    pub fn with_integration(mut self, integration: IntegrationTarget) -> Configuration {
        self.integration = Some(integration);
        self
    }

    pub fn with_runtime_wait(mut self, timeout: Duration, interval: Duration) -> Configuration {
        self.runtime_timeout = timeout;
        self.runtime_interval = interval;
        self
    }

    pub fn with_health_policy(mut self, health: HealthPolicy) -> Configuration {
        self.health = health;
        self
    }

    /// Hand `flag value` to the resumed run
    pub fn with_resume_argument(mut self, flag: &str, value: String) -> Configuration {
        self.resume_arguments.push(flag.to_string());
        self.resume_arguments.push(value);
        self
    }

    /// Default location of the install log
    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join(LOG_FILE)
    }
}

/// Directory holding the install progress, determined from (top to bottom priority):
///
/// - `STACKPILOT_STATE_DIR` environment variable
/// - `%ProgramData%\StackPilot` on Windows
/// - `/var/lib/stackpilot` elsewhere
pub fn default_state_dir() -> PathBuf {
    if let Some(dir) = var_os(STATE_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    if cfg!(windows) {
        let program_data = var_os("ProgramData")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData"));
        return program_data.join("StackPilot");
    }
    PathBuf::from("/var/lib/stackpilot")
}

/// Resolve `path` against `base` unless it's already absolute
pub(crate) fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
