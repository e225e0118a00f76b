//! # Stack manifest
//!
//! A TOML file replacing the built-in stack. Relative build contexts and the
//! integration path resolve against the directory of the manifest.
//!
//! ```toml
//! [[container]]
//! name = "qdrant"
//! image = "qdrant/qdrant:latest"
//! ports = ["6333:6333"]
//! volumes = ["qdrant-data:/qdrant/storage"]
//! health_url = "http://localhost:6333/healthz"
//!
//! [integration]
//! path = "claude_desktop_config.json"
//!
//! [integration.entries.rag-store]
//! command = "uvx"
//! args = ["mcp-server-qdrant"]
//! env = { QDRANT_URL = "http://localhost:6333" }
//! ```
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use crate::{
    builder::{
        container::{parse_port, parse_volume, ContainerSpecBuilder},
        resolve, Builder, BuilderError, IntegrationTarget, DEFAULT_SECTION,
    },
    container::ContainerSpec,
    merge::ServerEntry,
};

#[derive(thiserror::Error, Debug)]
pub enum ManifestError {
    #[error("Could not read manifest {0}: {1}")]
    Read(PathBuf, std::io::Error),
    #[error("Could not parse manifest {0}: {1}")]
    Parse(PathBuf, toml::de::Error),
    #[error("Invalid container {0} in manifest: {1}")]
    Container(String, BuilderError),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ContainerEntry {
    name: String,
    image: Option<String>,
    build: Option<PathBuf>,
    #[serde(default)]
    ports: Vec<String>,
    #[serde(default)]
    volumes: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    extra_args: Vec<String>,
    health_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IntegrationEntry {
    path: PathBuf,
    section: Option<String>,
    #[serde(default)]
    entries: BTreeMap<String, ServerEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    #[serde(default, rename = "container")]
    containers: Vec<ContainerEntry>,
    integration: Option<IntegrationEntry>,
}

/// Containers and integration entries declared by a manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackManifest {
    pub containers: Vec<ContainerSpec>,
    pub integration: Option<IntegrationTarget>,
}

impl ContainerEntry {
    fn into_spec(self, base: &Path) -> Result<ContainerSpec, BuilderError> {
        let mut builder = ContainerSpecBuilder::new().with_name(self.name);
        if let Some(image) = self.image {
            builder = builder.with_image(image);
        }
        if let Some(context) = self.build {
            builder = builder.with_build_context(resolve(base, &context));
        }
        for port in &self.ports {
            let mapping = parse_port(port)?;
            builder = builder.with_port(mapping.host, mapping.container);
        }
        for volume in &self.volumes {
            let mount = parse_volume(volume)?;
            builder = builder.with_volume(mount.volume, mount.target);
        }
        for (key, value) in self.env {
            builder = builder.with_env(key, value);
        }
        for arg in self.extra_args {
            builder = builder.with_extra_arg(arg);
        }
        if let Some(url) = &self.health_url {
            builder = builder.with_health_url(url);
        }
        builder.try_build()
    }
}

impl StackManifest {
    /// Parse a manifest, resolving relative paths against `base`
    pub fn parse(content: &str, base: &Path, origin: &Path) -> Result<StackManifest, ManifestError> {
        let raw: RawManifest =
            toml::from_str(content).map_err(|e| ManifestError::Parse(origin.to_path_buf(), e))?;

        let containers = raw
            .containers
            .into_iter()
            .map(|entry| {
                let name = entry.name.clone();
                entry
                    .into_spec(base)
                    .map_err(|e| ManifestError::Container(name, e))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let integration = raw.integration.map(|i| IntegrationTarget {
            path: resolve(base, &i.path),
            section: i.section.unwrap_or_else(|| DEFAULT_SECTION.to_string()),
            entries: i.entries,
        });

        Ok(StackManifest {
            containers,
            integration,
        })
    }

    pub fn load(path: &Path) -> Result<StackManifest, ManifestError> {
        let content =
            fs::read_to_string(path).map_err(|e| ManifestError::Read(path.to_path_buf(), e))?;
        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        StackManifest::parse(&content, &base, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::ImageSource;
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = r#"
[[container]]
name = "qdrant"
image = "qdrant/qdrant:latest"
ports = ["6333:6333"]
volumes = ["qdrant-data:/qdrant/storage"]
health_url = "http://localhost:6333/healthz"

[[container]]
name = "whisper-server"
build = "docker/whisper"
ports = ["8502:8502"]
env = { WHISPER_MODEL = "small" }

[integration]
path = "claude.json"

[integration.entries.rag-store]
command = "uvx"
args = ["mcp-server-qdrant"]
env = { QDRANT_URL = "http://localhost:6333" }
"#;

    #[test]
    fn parse_full_manifest() {
        let manifest = StackManifest::parse(MANIFEST, Path::new("/stack"), Path::new("/stack/stack.toml")).unwrap();
        assert_eq!(manifest.containers.len(), 2);
        assert_eq!(
            manifest.containers[1].source,
            ImageSource::Build(PathBuf::from("/stack/docker/whisper"))
        );
        assert_eq!(manifest.containers[1].env["WHISPER_MODEL"], "small");

        let integration = manifest.integration.unwrap();
        assert_eq!(integration.path, PathBuf::from("/stack/claude.json"));
        assert_eq!(integration.section, "mcpServers");
        assert_eq!(
            integration.entries["rag-store"].command.as_deref(),
            Some("uvx")
        );
    }

    #[test]
    fn invalid_container_is_named() {
        let err = StackManifest::parse(
            "[[container]]\nname = \"broken\"\nimage = \"x\"\nports = [\"80\"]\n",
            Path::new("."),
            Path::new("stack.toml"),
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Container(name, _) if name == "broken"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = StackManifest::parse(
            "[[container]]\nname = \"x\"\nimage = \"x\"\nport = [\"80:80\"]\n",
            Path::new("."),
            Path::new("stack.toml"),
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Parse(_, _)));
    }

    #[test]
    fn load_resolves_against_manifest_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.toml");
        fs::write(&path, MANIFEST).unwrap();
        let manifest = StackManifest::load(&path).unwrap();
        assert_eq!(
            manifest.integration.unwrap().path,
            dir.path().join("claude.json")
        );
    }
}
