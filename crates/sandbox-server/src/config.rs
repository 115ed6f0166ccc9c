use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use sandbox::ResourceLimits;
use sandbox_docker::{DEFAULT_IMAGE, DockerConfig, Privilege};
use serde::{Deserialize, Serialize};

use crate::error::{ServerError, ServerResult};

pub(crate) const DEFAULT_PORT: u16 = 8080;
pub(crate) const DEFAULT_INIT_TIMEOUT_SECS: u64 = 600;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub docker: DockerSection,
    /// Limits for `start_container` calls that omit them.
    pub defaults: LimitsSection,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerSection {
    pub binary: PathBuf,
    pub image: String,
    pub build_context: Option<PathBuf>,
    pub sudo: bool,
    pub init_timeout_secs: u64,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    pub memory_gb: f64,
    pub cpus: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            docker: DockerSection::default(),
            defaults: LimitsSection::default(),
        }
    }
}

impl Default for DockerSection {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("docker"),
            image: DEFAULT_IMAGE.to_string(),
            build_context: None,
            sudo: false,
            init_timeout_secs: DEFAULT_INIT_TIMEOUT_SECS,
        }
    }
}

impl Default for LimitsSection {
    fn default() -> Self {
        let limits = ResourceLimits::default();
        Self {
            memory_gb: limits.memory_gb,
            cpus: limits.cpus,
        }
    }
}

/// Load and validate a server config from a YAML file.
///
/// A relative `docker.build_context` is resolved against the config file's
/// parent directory.
pub async fn load(path: &Path) -> ServerResult<ServerConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ServerError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: ServerConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| ServerError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    validate(&config).await?;
    Ok(config)
}

/// Write `config` as YAML to `path`, creating parent directories.
pub async fn generate(config: &ServerConfig, path: &Path) -> ServerResult<()> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ServerError::Config(format!("create {}: {e}", dir.display())))?;
    }

    let content = serde_yaml_ng::to_string(config)
        .map_err(|e| ServerError::Config(format!("serialize config: {e}")))?;
    tokio::fs::write(path, content)
        .await
        .map_err(|e| ServerError::Config(format!("write {}: {e}", path.display())))?;
    Ok(())
}

async fn validate(config: &ServerConfig) -> ServerResult<()> {
    config
        .sandbox_defaults()
        .validate()
        .map_err(|e| ServerError::Config(format!("defaults: {e}")))?;

    if let Some(context) = &config.docker.build_context {
        let exists = tokio::fs::try_exists(context)
            .await
            .map_err(|e| ServerError::Config(format!("check build_context: {e}")))?;
        if !exists {
            return Err(ServerError::Config(format!(
                "build_context not found: {}",
                context.display()
            )));
        }
    }
    Ok(())
}

impl ServerConfig {
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        if let Some(context) = &mut self.docker.build_context
            && context.is_relative()
        {
            *context = config_dir.join(&*context);
        }
    }

    pub fn docker_config(&self) -> DockerConfig {
        DockerConfig {
            docker_bin: self.docker.binary.clone(),
            image: self.docker.image.clone(),
            build_context: self.docker.build_context.clone(),
            privilege: if self.docker.sudo {
                Privilege::Sudo
            } else {
                Privilege::User
            },
            init_timeout: Duration::from_secs(self.docker.init_timeout_secs),
        }
    }

    pub fn sandbox_defaults(&self) -> ResourceLimits {
        ResourceLimits {
            memory_gb: self.defaults.memory_gb,
            cpus: self.defaults.cpus,
        }
    }
}
