//! # Idempotent container provisioning
//!
//! A [ContainerSpec] describes a container the stack needs. [Lifecycle::ensure]
//! moves the live state towards it, one step at a time:
//!
//! 1. Absent: build the image when the spec has a build context and no image
//!    carries the container name yet, then create and start the container
//! 2. Present but stopped: start it, never recreate it
//! 3. Running: poll the health endpoint, if any, within [HealthPolicy]
//!
//! The container name is the idempotency key, ensuring the same spec any
//! number of times converges on a single running container.
use std::{collections::BTreeMap, fmt, path::PathBuf};

use tracing::{debug, info, instrument};
use url::Url;

use crate::{
    health::{wait_healthy, Health, HealthPolicy, HealthProbe},
    runtime::{ContainerRuntime, RuntimeError},
};

#[derive(thiserror::Error, Debug)]
pub enum LifecycleError {
    #[error("Could not inspect container {0}: {1}")]
    Inspect(String, RuntimeError),
    #[error("Could not build image for container {0}: {1}")]
    Build(String, RuntimeError),
    #[error("Could not create container {0}: {1}")]
    Create(String, RuntimeError),
    #[error("Could not start container {0}: {1}")]
    Start(String, RuntimeError),
}

/// Where the image of a container comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// Image reference pulled on demand by the runtime
    Image(String),
    /// Directory with a Dockerfile, built into an image named after the container
    Build(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.container)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    /// Named volume, created by the runtime when missing
    pub volume: String,
    /// Mount point inside the container
    pub target: String,
}

impl fmt::Display for VolumeMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.volume, self.target)
    }
}

/// Declarative description of one container of the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub source: ImageSource,
    pub ports: Vec<PortMapping>,
    pub volumes: Vec<VolumeMount>,
    pub env: BTreeMap<String, String>,
    /// Additional flags handed to the runtime as-is
    pub extra_args: Vec<String>,
    pub health_url: Option<Url>,
}

impl ContainerSpec {
    /// Image the container is created from
    pub fn image(&self) -> &str {
        match &self.source {
            ImageSource::Image(reference) => reference,
            ImageSource::Build(_) => &self.name,
        }
    }
}

/// What [Lifecycle::ensure] had to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    Created,
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsureReport {
    pub name: String,
    pub action: Provisioned,
    pub health: Health,
}

/// Makes containers match their [ContainerSpec]
#[derive(Debug)]
pub struct Lifecycle<R, P> {
    runtime: R,
    probe: P,
    policy: HealthPolicy,
}

impl<R: ContainerRuntime, P: HealthProbe> Lifecycle<R, P> {
    pub fn new(runtime: R, probe: P) -> Lifecycle<R, P> {
        Lifecycle {
            runtime,
            probe,
            policy: HealthPolicy::default(),
        }
    }

    pub fn with_policy(self, policy: HealthPolicy) -> Lifecycle<R, P> {
        Lifecycle { policy, ..self }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    #[instrument(skip_all, fields(name = %spec.name))]
    pub async fn ensure(&self, spec: &ContainerSpec) -> Result<EnsureReport, LifecycleError> {
        let name = spec.name.as_str();
        let inspect = |e: RuntimeError| LifecycleError::Inspect(name.to_string(), e);

        let action = if !self.runtime.container_exists(name).await.map_err(inspect)? {
            if let ImageSource::Build(context) = &spec.source {
                if self.runtime.image_exists(spec.image()).await.map_err(inspect)? {
                    debug!("Image {} already built", spec.image());
                } else {
                    self.runtime
                        .build_image(spec.image(), context)
                        .await
                        .map_err(|e| LifecycleError::Build(name.to_string(), e))?;
                }
            }
            info!("Creating container from {}", spec.image());
            self.runtime
                .create_container(spec, spec.image())
                .await
                .map_err(|e| LifecycleError::Create(name.to_string(), e))?;
            Provisioned::Created
        } else if !self.runtime.container_running(name).await.map_err(inspect)? {
            info!("Starting existing container");
            self.runtime
                .start_container(name)
                .await
                .map_err(|e| LifecycleError::Start(name.to_string(), e))?;
            Provisioned::Started
        } else {
            info!("Container already running");
            Provisioned::AlreadyRunning
        };

        let health = match &spec.health_url {
            Some(url) => {
                debug!("Waiting for {} to answer", url);
                wait_healthy(&self.probe, url, self.policy).await
            }
            None => Health::NotChecked,
        };

        Ok(EnsureReport {
            name: name.to_string(),
            action,
            health,
        })
    }
}
