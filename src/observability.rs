use std::fs::{create_dir_all, OpenOptions};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Filter directives used when `--log-level` isn't given
pub const LOG_ENV: &str = "STACKPILOT_LOG";

const LOG_FORMAT_TEXT: &str = "text";
const LOG_FORMAT_JSON: &str = "json";
const DEFAULT_LOG_LEVEL: &str = "info";

enum LogFormat {
    Text,
    Json,
}

fn detect_log_format(log_format: Option<&str>) -> Result<LogFormat> {
    match log_format {
        None | Some(LOG_FORMAT_TEXT) => Ok(LogFormat::Text),
        Some(LOG_FORMAT_JSON) => Ok(LogFormat::Json),
        Some(unknown) => bail!("unknown log format: {}", unknown),
    }
}

fn detect_log_filter(input: Option<String>) -> Result<EnvFilter> {
    let directives = input
        .or_else(|| std::env::var(LOG_ENV).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());
    Ok(EnvFilter::try_new(&directives)?)
}

#[derive(Debug, Default)]
pub struct ObservabilityConfig {
    pub log_level: Option<String>,
    /// Written in append mode, the install spans several boots
    pub log_file: Option<PathBuf>,
    /// Format of the log file, the terminal always gets text
    pub log_format: Option<String>,
}

pub fn init(config: ObservabilityConfig) -> Result<()> {
    let filter = detect_log_filter(config.log_level).with_context(|| "failed to parse log level")?;
    let log_format =
        detect_log_format(config.log_format.as_deref()).with_context(|| "failed to detect log format")?;

    let file = match config.log_file.as_ref() {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                create_dir_all(parent)
                    .with_context(|| format!("failed to create log directory {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(file)
        }
        None => None,
    };

    let (text_file, json_file) = match (file, log_format) {
        (None, _) => (None, None),
        (Some(file), LogFormat::Text) => (
            Some(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file)),
            None,
        ),
        (Some(file), LogFormat::Json) => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_span_list(false)
                    .with_writer(file),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .without_time()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(text_file)
        .with(json_file)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to init logger: {}", e))?;

    Ok(())
}
