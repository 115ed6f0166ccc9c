use std::borrow::Cow;

use async_trait::async_trait;
use sandbox::{CommandResult, ContainerRuntime, ExecRequest, SandboxConfig, SandboxError};
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::command::{self, CommandError};
use crate::config::DockerConfig;
use crate::runner::run_with_timeout;

/// Shell every command is run through inside the container.
const SHELL: &str = "/bin/bash";

/// [`ContainerRuntime`] backed by the docker CLI.
///
/// Each sandbox is one long-lived container idling on `sleep infinity`;
/// commands run through `docker exec`.
pub struct DockerRuntime {
    config: DockerConfig,
    image_ready: OnceCell<()>,
}

impl DockerRuntime {
    pub fn new(config: DockerConfig) -> Self {
        Self {
            config,
            image_ready: OnceCell::new(),
        }
    }

    fn docker(&self) -> Cow<'_, str> {
        self.config.docker_bin.to_string_lossy()
    }

    async fn docker_exec(&self, args: &[&str]) -> Result<String, CommandError> {
        command::exec(&self.docker(), args, self.config.privilege).await
    }

    /// Build or pull the sandbox image once per runtime.
    async fn ensure_image(&self) -> Result<(), CommandError> {
        self.image_ready
            .get_or_try_init(|| self.build_or_pull())
            .await
            .map(|_| ())
    }

    async fn build_or_pull(&self) -> Result<(), CommandError> {
        let image = self.config.image.as_str();
        if let Some(context) = &self.config.build_context {
            let context = context.to_string_lossy();
            info!(image, context = %context, "building sandbox image");
            self.docker_exec(&["build", "-t", image, &context]).await?;
            return Ok(());
        }

        let present = command::succeeds(
            &self.docker(),
            &["image", "inspect", image],
            self.config.privilege,
        )
        .await;
        if !present {
            info!(image, "pulling sandbox image");
            self.docker_exec(&["pull", image]).await?;
        }
        Ok(())
    }

    fn exec_command(&self, id: &str, cmd: &str) -> Command {
        let args = exec_args(id, cmd);
        command::build(&self.docker(), &args, self.config.privilege)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn provision(&self, config: &SandboxConfig) -> sandbox::Result<()> {
        config.resources.validate()?;

        self.ensure_image().await.map_err(|e| {
            SandboxError::ProvisioningFailed(format!("ensure image {}: {e}", self.config.image))
        })?;

        let args = run_args(&self.config.image, config);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let container = self
            .docker_exec(&args)
            .await
            .map_err(|e| SandboxError::ProvisioningFailed(e.to_string()))?;
        info!(
            sandbox_id = %config.id,
            container = container.get(..12).unwrap_or(container.as_str()),
            "container started"
        );

        if let Some(init) = &config.init_command {
            let init_cmd = self.exec_command(&config.id, init);
            let result = run_with_timeout(init_cmd, self.config.init_timeout)
                .await
                .map_err(|e| SandboxError::ProvisioningFailed(format!("init command: {e}")))?;
            if !result.success() {
                warn!(
                    sandbox_id = %config.id,
                    exit_code = result.exit_code,
                    "init command failed"
                );
                return Err(SandboxError::ProvisioningFailed(format!(
                    "init command exited with {}\nstdout: {}\nstderr: {}",
                    result.exit_code, result.stdout, result.stderr
                )));
            }
        }

        Ok(())
    }

    async fn exec(&self, id: &str, request: &ExecRequest<'_>) -> sandbox::Result<CommandResult> {
        run_with_timeout(self.exec_command(id, request.cmd), request.timeout).await
    }

    async fn teardown(&self, id: &str) -> sandbox::Result<()> {
        self.docker_exec(&["rm", "-f", id])
            .await
            .map_err(|e| SandboxError::ExecFailed(e.to_string()))?;
        info!(sandbox_id = %id, "container removed");
        Ok(())
    }
}

/// Arguments of the `docker run` that starts an idle sandbox container.
fn run_args(image: &str, config: &SandboxConfig) -> Vec<String> {
    let memory_mb = (config.resources.memory_gb * 1024.0).round() as u64;
    vec![
        "run".into(),
        "-d".into(),
        "--name".into(),
        config.id.clone(),
        "--memory".into(),
        format!("{memory_mb}m"),
        "--cpus".into(),
        config.resources.cpus.to_string(),
        "--tty".into(),
        image.into(),
        SHELL.into(),
        "-c".into(),
        "sleep infinity".into(),
    ]
}

fn exec_args<'a>(id: &'a str, cmd: &'a str) -> [&'a str; 5] {
    ["exec", id, SHELL, "-c", cmd]
}
