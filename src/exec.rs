//! # Native command invocation
//!
//! Every interaction with the host goes through an [Execute] implementation.
//! A command either could not be started at all, which is an [ExecuteError],
//! or it ran and produced an exit code together with its combined output.
//! Text written on stderr is never interpreted as a failure, callers decide
//! success from [CommandOutput::code] only.
use std::{
    env::{split_paths, var_os},
    path::PathBuf,
    process::Stdio,
};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument, trace};

#[derive(thiserror::Error, Debug)]
pub enum ExecuteError {
    #[error("Could not spawn {0}, reason: {1}")]
    Spawn(String, String),
    #[error("Could not wait for {0} to finish, reason: {1}")]
    Wait(String, String),
}

/// Result of a command which ran to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code of the process, `-1` when it was terminated by a signal
    pub code: i32,
    /// Standard output followed by standard error
    pub output: String,
}

impl CommandOutput {
    pub fn new(code: i32, output: impl Into<String>) -> CommandOutput {
        CommandOutput {
            code,
            output: output.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Tells whether the exit code is one of the given accepted codes
    pub fn accepted(&self, codes: &[i32]) -> bool {
        codes.contains(&self.code)
    }

    /// Output without surrounding whitespace
    pub fn trimmed(&self) -> &str {
        self.output.trim()
    }
}

/// Interface to run a program on the host and collect its outcome
#[async_trait]
pub trait Execute: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, ExecuteError>;
}

#[async_trait]
impl<T: Execute + ?Sized> Execute for &T {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, ExecuteError> {
        (**self).run(program, args).await
    }
}

/// Runs commands directly on the local machine
#[derive(Debug, Default, Clone, Copy)]
pub struct HostExecutor;

#[async_trait]
impl Execute for HostExecutor {
    #[instrument(skip(self, args))]
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, ExecuteError> {
        debug!("{} {}", program, args.join(" "));
        let result = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    ExecuteError::Spawn(program.to_string(), e.to_string())
                }
                _ => ExecuteError::Wait(program.to_string(), e.to_string()),
            })?;

        let mut output = String::from_utf8_lossy(&result.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&result.stderr));
        let code = result.status.code().unwrap_or(-1);
        debug!("{} exited with code {}", program, code);
        trace!("{} output: {}", program, output);
        Ok(CommandOutput { code, output })
    }
}

/// Arguments to run `script` with a non-interactive PowerShell
pub fn powershell_args(script: &str) -> Vec<String> {
    vec![
        "-NoProfile".to_string(),
        "-NonInteractive".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-Command".to_string(),
        script.to_string(),
    ]
}

/// Quote a value so it can be embedded in a PowerShell script as a literal
pub fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Tries to find `name` in one of the directories of the `$PATH` variable
pub fn find_binary_in_path(name: &str) -> Option<PathBuf> {
    let file_name = format!("{}{}", name, std::env::consts::EXE_SUFFIX);
    var_os("PATH").and_then(|paths| {
        split_paths(&paths)
            .map(|d| d.join(&file_name))
            .find(|full_path| full_path.is_file())
    })
}
