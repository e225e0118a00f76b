//! # Container runtime control interface
//!
//! [ContainerRuntime] is the set of questions and requests
//! the lifecycle manager needs. [DockerCli] answers them with the `docker`
//! command line through an [Execute] implementation.
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

use crate::{
    container::ContainerSpec,
    exec::{Execute, ExecuteError},
};

/// Restart policy applied to every created container
pub const RESTART_POLICY: &str = "unless-stopped";

#[derive(thiserror::Error, Debug)]
pub enum RuntimeError {
    #[error("Could not run the container runtime client: {0}")]
    Execute(#[from] ExecuteError),
    #[error("`docker {0}` failed with code {1}: {2}")]
    Command(String, i32, String),
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the runtime answers requests
    async fn is_live(&self) -> Result<bool, RuntimeError>;
    /// Whether a container named `name` exists, in any state
    async fn container_exists(&self, name: &str) -> Result<bool, RuntimeError>;
    async fn container_running(&self, name: &str) -> Result<bool, RuntimeError>;
    async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError>;
    async fn build_image(&self, tag: &str, context: &Path) -> Result<(), RuntimeError>;
    /// Create and start a container described by `spec` from `image`
    async fn create_container(&self, spec: &ContainerSpec, image: &str) -> Result<(), RuntimeError>;
    async fn start_container(&self, name: &str) -> Result<(), RuntimeError>;
}

#[async_trait]
impl<T: ContainerRuntime + ?Sized> ContainerRuntime for &T {
    async fn is_live(&self) -> Result<bool, RuntimeError> {
        (**self).is_live().await
    }
    async fn container_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        (**self).container_exists(name).await
    }
    async fn container_running(&self, name: &str) -> Result<bool, RuntimeError> {
        (**self).container_running(name).await
    }
    async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError> {
        (**self).image_exists(reference).await
    }
    async fn build_image(&self, tag: &str, context: &Path) -> Result<(), RuntimeError> {
        (**self).build_image(tag, context).await
    }
    async fn create_container(&self, spec: &ContainerSpec, image: &str) -> Result<(), RuntimeError> {
        (**self).create_container(spec, image).await
    }
    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        (**self).start_container(name).await
    }
}

/// Talks to the container runtime through the `docker` client binary
#[derive(Debug)]
pub struct DockerCli<E> {
    executor: E,
    binary: PathBuf,
}

impl<E: Execute> DockerCli<E> {
    pub fn new(executor: E, binary: PathBuf) -> DockerCli<E> {
        DockerCli { executor, binary }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn docker(&self, args: Vec<String>) -> Result<crate::exec::CommandOutput, RuntimeError> {
        let program = self.binary.display().to_string();
        Ok(self.executor.run(&program, &args).await?)
    }

    async fn docker_ok(&self, args: Vec<String>) -> Result<(), RuntimeError> {
        let out = self.docker(args.clone()).await?;
        if !out.success() {
            return Err(RuntimeError::Command(
                args.join(" "),
                out.code,
                out.trimmed().to_string(),
            ));
        }
        Ok(())
    }

    /// `None` when the container doesn't exist, its running flag otherwise
    async fn inspect_running(&self, name: &str) -> Result<Option<bool>, RuntimeError> {
        let out = self
            .docker(vec![
                "container".to_string(),
                "inspect".to_string(),
                "--format".to_string(),
                "{{.State.Running}}".to_string(),
                name.to_string(),
            ])
            .await?;
        if out.success() {
            return Ok(Some(out.trimmed() == "true"));
        }
        if reports_missing(&out.output) {
            return Ok(None);
        }
        Err(RuntimeError::Command(
            "container inspect".to_string(),
            out.code,
            out.trimmed().to_string(),
        ))
    }
}

/// Whether a failed `inspect` says the object doesn't exist, as opposed to
/// the daemon being unreachable or erroring
fn reports_missing(output: &str) -> bool {
    let output = output.to_ascii_lowercase();
    ["no such container", "no such image", "no such object"]
        .iter()
        .any(|m| output.contains(m))
}

/// Arguments of `docker run` creating the container described by `spec`
pub fn run_args(spec: &ContainerSpec, image: &str) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "--detach".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "--restart".to_string(),
        RESTART_POLICY.to_string(),
    ];
    for port in &spec.ports {
        args.push("--publish".to_string());
        args.push(port.to_string());
    }
    for volume in &spec.volumes {
        args.push("--volume".to_string());
        args.push(volume.to_string());
    }
    for (key, value) in &spec.env {
        args.push("--env".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.extend(spec.extra_args.iter().cloned());
    args.push(image.to_string());
    args
}

#[async_trait]
impl<E: Execute> ContainerRuntime for DockerCli<E> {
    async fn is_live(&self) -> Result<bool, RuntimeError> {
        let out = self
            .docker(vec![
                "info".to_string(),
                "--format".to_string(),
                "{{.ServerVersion}}".to_string(),
            ])
            .await?;
        Ok(out.success() && !out.trimmed().is_empty())
    }

    async fn container_exists(&self, name: &str) -> Result<bool, RuntimeError> {
        Ok(self.inspect_running(name).await?.is_some())
    }

    async fn container_running(&self, name: &str) -> Result<bool, RuntimeError> {
        Ok(self.inspect_running(name).await?.unwrap_or(false))
    }

    async fn image_exists(&self, reference: &str) -> Result<bool, RuntimeError> {
        let out = self
            .docker(vec![
                "image".to_string(),
                "inspect".to_string(),
                "--format".to_string(),
                "{{.Id}}".to_string(),
                reference.to_string(),
            ])
            .await?;
        if out.success() {
            return Ok(true);
        }
        if reports_missing(&out.output) {
            return Ok(false);
        }
        Err(RuntimeError::Command(
            "image inspect".to_string(),
            out.code,
            out.trimmed().to_string(),
        ))
    }

    #[instrument(skip(self, context))]
    async fn build_image(&self, tag: &str, context: &Path) -> Result<(), RuntimeError> {
        info!("Building image {} from {}", tag, context.display());
        self.docker_ok(vec![
            "build".to_string(),
            "--tag".to_string(),
            tag.to_string(),
            context.display().to_string(),
        ])
        .await
    }

    #[instrument(skip_all, fields(name = %spec.name))]
    async fn create_container(&self, spec: &ContainerSpec, image: &str) -> Result<(), RuntimeError> {
        debug!("Creating container from {}", image);
        self.docker_ok(run_args(spec, image)).await
    }

    #[instrument(skip(self))]
    async fn start_container(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker_ok(vec!["start".to_string(), name.to_string()])
            .await
    }
}

/// Poll `runtime` until it reports itself live or `timeout` elapses
pub async fn wait_until_live<R: ContainerRuntime + ?Sized>(
    runtime: &R,
    timeout: Duration,
    interval: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match runtime.is_live().await {
            Ok(true) => return true,
            Ok(false) => debug!("Container runtime not live yet"),
            Err(e) => warn!("Could not query the container runtime: {}", e),
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep(interval.min(deadline - now)).await;
    }
}
