use std::path::PathBuf;
use std::time::Duration;

use crate::command::Privilege;

/// Image used when no other image is configured.
pub const DEFAULT_IMAGE: &str = "bash-sandbox";

/// Default wall-clock limit for a sandbox's init command.
const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Path or name of the docker CLI.
    pub docker_bin: PathBuf,
    /// Image every sandbox container runs.
    pub image: String,
    /// Build context for `image`. When set the image is built with
    /// `docker build`; otherwise it is pulled if not present locally.
    pub build_context: Option<PathBuf>,
    /// Whether docker is invoked through `sudo`.
    pub privilege: Privilege,
    /// Wall-clock limit for the init command run during provisioning.
    pub init_timeout: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_bin: PathBuf::from("docker"),
            image: DEFAULT_IMAGE.to_string(),
            build_context: None,
            privilege: Privilege::User,
            init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }
}
