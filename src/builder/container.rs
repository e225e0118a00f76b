use std::{collections::BTreeMap, path::PathBuf};

use url::Url;

use crate::{
    builder::{assert_not_none, Builder, BuilderError},
    container::{ContainerSpec, ImageSource, PortMapping, VolumeMount},
};

#[derive(Debug, Default)]
pub struct ContainerSpecBuilder {
    name: Option<String>,
    image: Option<String>,
    build_context: Option<PathBuf>,
    ports: Vec<PortMapping>,
    volumes: Vec<VolumeMount>,
    env: BTreeMap<String, String>,
    extra_args: Vec<String>,
    health_url: Option<String>,
}

impl ContainerSpecBuilder {
    pub fn new() -> ContainerSpecBuilder {
        ContainerSpecBuilder::default()
    }

    pub fn with_name(mut self, name: String) -> ContainerSpecBuilder {
        self.name = Some(name);
        self
    }

    /// Use an existing image reference, pulled by the runtime when missing
    pub fn with_image(mut self, image: String) -> ContainerSpecBuilder {
        self.image = Some(image);
        self
    }

    /// Build the image from a directory holding a Dockerfile
    pub fn with_build_context(mut self, context: PathBuf) -> ContainerSpecBuilder {
        self.build_context = Some(context);
        self
    }

    pub fn with_port(mut self, host: u16, container: u16) -> ContainerSpecBuilder {
        self.ports.push(PortMapping { host, container });
        self
    }

    pub fn with_volume(mut self, volume: String, target: String) -> ContainerSpecBuilder {
        self.volumes.push(VolumeMount { volume, target });
        self
    }

    pub fn with_env(mut self, key: String, value: String) -> ContainerSpecBuilder {
        self.env.insert(key, value);
        self
    }

    pub fn with_extra_arg(mut self, arg: String) -> ContainerSpecBuilder {
        self.extra_args.push(arg);
        self
    }

    pub fn with_health_url(mut self, url: &str) -> ContainerSpecBuilder {
        self.health_url = Some(url.to_string());
        self
    }
}

/// Names accepted by the container runtime: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`
pub(crate) fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Parse a `host:container` port mapping
pub(crate) fn parse_port(mapping: &str) -> Result<PortMapping, BuilderError> {
    let invalid = || BuilderError::InvalidField("ports".to_string(), mapping.to_string());
    let (host, container) = mapping.split_once(':').ok_or_else(invalid)?;
    let host: u16 = host.trim().parse().map_err(|_| invalid())?;
    let container: u16 = container.trim().parse().map_err(|_| invalid())?;
    Ok(PortMapping { host, container })
}

/// Parse a `volume:/target` mount
pub(crate) fn parse_volume(mount: &str) -> Result<VolumeMount, BuilderError> {
    match mount.split_once(':') {
        Some((volume, target)) if !volume.is_empty() && target.starts_with('/') => Ok(VolumeMount {
            volume: volume.to_string(),
            target: target.to_string(),
        }),
        _ => Err(BuilderError::InvalidField(
            "volumes".to_string(),
            mount.to_string(),
        )),
    }
}

impl Builder<ContainerSpec> for ContainerSpecBuilder {
    fn try_build(self) -> Result<ContainerSpec, BuilderError> {
        assert_not_none(stringify!(self.name), &self.name)?;
        let name = self.name.unwrap_or_default();
        if !is_valid_name(&name) {
            return Err(BuilderError::InvalidField("name".to_string(), name));
        }

        let source = match (self.image, self.build_context) {
            (Some(image), None) => ImageSource::Image(image),
            (None, Some(_)) if name.chars().any(|c| c.is_ascii_uppercase()) => {
                // The name doubles as the image tag, which docker wants lowercase
                return Err(BuilderError::InvalidField(
                    "name".to_string(),
                    format!("{} is used as image tag and must be lowercase", name),
                ));
            }
            (None, Some(context)) => ImageSource::Build(context),
            (None, None) => {
                return Err(BuilderError::MissingRequiredField(
                    "self.image or self.build_context".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(BuilderError::InvalidField(
                    "image".to_string(),
                    "an image and a build context are mutually exclusive".to_string(),
                ))
            }
        };

        if let Some(port) = self.ports.iter().find(|p| p.host == 0 || p.container == 0) {
            return Err(BuilderError::InvalidField("ports".to_string(), port.to_string()));
        }

        let health_url = self
            .health_url
            .map(|raw| {
                let url = Url::parse(&raw)
                    .map_err(|e| BuilderError::InvalidField("health_url".to_string(), e.to_string()))?;
                // The health client has no TLS connector
                if url.scheme() != "http" {
                    return Err(BuilderError::InvalidField(
                        "health_url".to_string(),
                        format!("{} must use http", raw),
                    ));
                }
                Ok(url)
            })
            .transpose()?;

        Ok(ContainerSpec {
            name,
            source,
            ports: self.ports,
            volumes: self.volumes,
            env: self.env,
            extra_args: self.extra_args,
            health_url,
        })
    }
}
