use std::{env::var_os, path::PathBuf};

use tracing::warn;

use crate::{
    builder::{assert_not_none, Builder, BuilderError},
    exec::{find_binary_in_path, Execute},
    runtime::DockerCli,
};

/// Direct path to the `docker` client binary
pub const DOCKER_LOCATION_ENV: &str = "STACKPILOT_DOCKER";
/// Where Docker Desktop installs its client on Windows
pub const DOCKER_DESKTOP_CLIENT: &str = "C:\\Program Files\\Docker\\Docker\\resources\\bin\\docker.exe";

#[derive(Debug)]
pub struct DockerCliBuilder<E> {
    executor: Option<E>,
    binary: Option<PathBuf>,
}

impl<E: Execute> Default for DockerCliBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Execute> DockerCliBuilder<E> {
    pub fn new() -> DockerCliBuilder<E> {
        DockerCliBuilder {
            executor: None,
            binary: None,
        }
    }

    /// Tries to determine if variable `STACKPILOT_DOCKER` exists, if it does, it will check if
    /// the binary exists, if it does, it will return the content of the variable.
    fn find_binary_from_env_location() -> Option<PathBuf> {
        if let Some(path) = var_os(DOCKER_LOCATION_ENV) {
            if PathBuf::from(&path).is_file() {
                return Some(PathBuf::from(path));
            }

            warn!(
                "{} is set but the file does not exist: {:?}",
                DOCKER_LOCATION_ENV, path
            );
        }
        None
    }

    fn find_binary_from_desktop_install() -> Option<PathBuf> {
        let full_path = PathBuf::from(DOCKER_DESKTOP_CLIENT);
        match full_path.is_file() {
            true => Some(full_path),
            false => None,
        }
    }

    /// Tries to determine the `docker` binary location from (top to bottom priority):
    ///
    /// - `STACKPILOT_DOCKER` environment variable: direct path to the binary
    /// - `$PATH` environment variable: search for the binary in the directories
    /// - The client shipped with Docker Desktop
    pub fn determine_binary_location() -> Result<PathBuf, BuilderError> {
        Self::find_binary_from_env_location()
            .or_else(|| find_binary_in_path("docker"))
            .or_else(Self::find_binary_from_desktop_install)
            .ok_or_else(|| {
                BuilderError::BinaryNotFound(format!(
                    "docker was not found, set {} to the path of the docker client",
                    DOCKER_LOCATION_ENV
                ))
            })
    }

    /// Builder using the detected binary. A runtime installed during this run
    /// isn't on `$PATH` yet, so it falls back to plain `docker` resolved at
    /// call time.
    pub fn auto(executor: E) -> DockerCliBuilder<E> {
        let binary = Self::determine_binary_location().unwrap_or_else(|_| PathBuf::from("docker"));
        Self::new().with_executor(executor).with_binary(binary)
    }

    pub fn with_executor(mut self, executor: E) -> DockerCliBuilder<E> {
        self.executor = Some(executor);
        self
    }

    pub fn with_binary(mut self, binary: PathBuf) -> DockerCliBuilder<E> {
        self.binary = Some(binary);
        self
    }
}

impl<E: Execute> Builder<DockerCli<E>> for DockerCliBuilder<E> {
    fn try_build(self) -> Result<DockerCli<E>, BuilderError> {
        assert_not_none(stringify!(self.executor), &self.executor)?;
        assert_not_none(stringify!(self.binary), &self.binary)?;
        match (self.executor, self.binary) {
            (Some(executor), Some(binary)) => Ok(DockerCli::new(executor, binary)),
            _ => Err(BuilderError::MissingRequiredField("self.executor".to_string())),
        }
    }
}
