//! Built-in stack: web crawler, vector store, transcript and transcription
//! services, and the client entries pointing at them.
use std::{env::var_os, path::Path, path::PathBuf};

use crate::{
    builder::{container::ContainerSpecBuilder, Builder, BuilderError, IntegrationTarget},
    container::ContainerSpec,
    merge::ServerEntry,
};

pub const CRAWL4AI_PORT: u16 = 11235;
pub const QDRANT_PORT: u16 = 6333;
pub const YT_DLP_PORT: u16 = 8501;
pub const WHISPER_PORT: u16 = 8502;

/// Placeholder left in the integration file for the operator to fill in
pub const CREDENTIAL_PLACEHOLDER: &str = "<set-your-api-key>";

/// Containers of the stack, build contexts relative to `stack_root`
pub fn default_containers(stack_root: &Path) -> Result<Vec<ContainerSpec>, BuilderError> {
    let docker_dir = stack_root.join("infrastructure").join("docker");
    Ok(vec![
        ContainerSpecBuilder::new()
            .with_name("crawl4ai".to_string())
            .with_image("unclecode/crawl4ai:latest".to_string())
            .with_port(CRAWL4AI_PORT, CRAWL4AI_PORT)
            .with_extra_arg("--shm-size=1g".to_string())
            .with_health_url(&format!("http://localhost:{}/health", CRAWL4AI_PORT))
            .try_build()?,
        ContainerSpecBuilder::new()
            .with_name("qdrant".to_string())
            .with_image("qdrant/qdrant:latest".to_string())
            .with_port(QDRANT_PORT, QDRANT_PORT)
            .with_volume("qdrant-data".to_string(), "/qdrant/storage".to_string())
            .with_health_url(&format!("http://localhost:{}/healthz", QDRANT_PORT))
            .try_build()?,
        ContainerSpecBuilder::new()
            .with_name("yt-dlp-server".to_string())
            .with_build_context(docker_dir.join("yt-dlp"))
            .with_port(YT_DLP_PORT, YT_DLP_PORT)
            .with_health_url(&format!("http://localhost:{}/health", YT_DLP_PORT))
            .try_build()?,
        ContainerSpecBuilder::new()
            .with_name("whisper-server".to_string())
            .with_build_context(docker_dir.join("whisper"))
            .with_port(WHISPER_PORT, WHISPER_PORT)
            .with_volume("whisper-models".to_string(), "/root/.cache".to_string())
            .with_env("WHISPER_MODEL".to_string(), "base".to_string())
            .with_health_url(&format!("http://localhost:{}/health", WHISPER_PORT))
            .try_build()?,
    ])
}

/// Location of the desktop client configuration, `%APPDATA%\Claude\claude_desktop_config.json`
pub fn default_integration_path() -> PathBuf {
    let base = var_os("APPDATA")
        .map(PathBuf::from)
        .or_else(|| var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("Claude").join("claude_desktop_config.json")
}

/// Entries publishing the crawler and the vector store to the client
pub fn default_integration(path: PathBuf) -> IntegrationTarget {
    IntegrationTarget::new(path)
        .with_entry(
            "crawl4ai".to_string(),
            ServerEntry {
                command: Some("npx".to_string()),
                args: vec![
                    "-y".to_string(),
                    "mcp-remote".to_string(),
                    format!("http://localhost:{}/mcp/sse", CRAWL4AI_PORT),
                ],
                ..ServerEntry::default()
            },
        )
        .with_entry(
            "rag-store".to_string(),
            ServerEntry {
                command: Some("uvx".to_string()),
                args: vec!["mcp-server-qdrant".to_string()],
                url: None,
                env: [
                    ("QDRANT_URL", format!("http://localhost:{}", QDRANT_PORT)),
                    ("COLLECTION_NAME", "web-to-rag".to_string()),
                    ("QDRANT_API_KEY", CREDENTIAL_PLACEHOLDER.to_string()),
                ]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            },
        )
}
