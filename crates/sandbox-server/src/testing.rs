use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{CommandResult, ContainerRuntime, ExecRequest, SandboxConfig, SandboxError};

/// In-memory [`ContainerRuntime`] that records every call.
///
/// `exec` understands a few scripted commands: `sleep <secs>` sleeps on the
/// tokio clock (honouring the timeout), `fail` exits 1, `explode` returns an
/// exec error. Anything else echoes the command back on stdout.
#[derive(Default)]
pub(crate) struct FakeRuntime {
    pub provision_delay: Duration,
    pub provision_error: Option<String>,
    pub fail_teardown: bool,
    events: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn with_provision_delay(delay: Duration) -> Self {
        Self {
            provision_delay: delay,
            ..Self::default()
        }
    }

    pub fn failing_provision(detail: &str) -> Self {
        Self {
            provision_error: Some(detail.to_string()),
            ..Self::default()
        }
    }

    pub fn failing_teardown() -> Self {
        Self {
            fail_teardown: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn log(&self, event: String) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn provision(&self, config: &SandboxConfig) -> sandbox::Result<()> {
        tokio::time::sleep(self.provision_delay).await;
        if let Some(detail) = &self.provision_error {
            return Err(SandboxError::ProvisioningFailed(detail.clone()));
        }
        self.log(format!("provisioned {}", config.id));
        Ok(())
    }

    async fn exec(&self, id: &str, request: &ExecRequest<'_>) -> sandbox::Result<CommandResult> {
        self.log(format!("exec {id} {}", request.cmd));

        if let Some(secs) = request.cmd.strip_prefix("sleep ") {
            let nap = Duration::from_secs_f64(secs.parse().unwrap_or(0.0));
            return Ok(
                match tokio::time::timeout(request.timeout, tokio::time::sleep(nap)).await {
                    Ok(()) => CommandResult {
                        exit_code: 0,
                        stdout: String::new(),
                        stderr: String::new(),
                    },
                    Err(_) => CommandResult::timed_out(),
                },
            );
        }

        match request.cmd {
            "fail" => Ok(CommandResult {
                exit_code: 1,
                stdout: String::new(),
                stderr: "failed".into(),
            }),
            "explode" => Err(SandboxError::ExecFailed("runtime unavailable".into())),
            cmd => Ok(CommandResult {
                exit_code: 0,
                stdout: cmd.to_string(),
                stderr: String::new(),
            }),
        }
    }

    async fn teardown(&self, id: &str) -> sandbox::Result<()> {
        self.log(format!("teardown {id}"));
        if self.fail_teardown {
            return Err(SandboxError::ExecFailed("rm failed".into()));
        }
        Ok(())
    }
}
