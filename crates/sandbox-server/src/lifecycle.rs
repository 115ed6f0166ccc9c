//! Per-sandbox state machine: `Provisioning -> {Ready, Failed}`, `Ready -> Stopped`.
//!
//! Provisioning runs as a background task per sandbox. Every later operation
//! on the same id joins that task first (lazy join), so requests for many
//! sandboxes never wait on each other's container start.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use sandbox::{
    CommandResult, ContainerRuntime, ExecRequest, SandboxConfig, SandboxError, SandboxState,
};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// Result published by a provisioning task.
#[derive(Debug, Clone)]
enum Outcome {
    Pending,
    Ready,
    Failed(String),
}

enum Phase {
    /// In-flight provisioning task. Dropped once an operation has joined it.
    Provisioning(watch::Receiver<Outcome>),
    Ready,
    Failed(String),
}

impl Phase {
    fn state(&self) -> SandboxState {
        match self {
            Self::Provisioning(rx) => match &*rx.borrow() {
                Outcome::Pending => SandboxState::Provisioning,
                Outcome::Ready => SandboxState::Ready,
                Outcome::Failed(_) => SandboxState::Failed,
            },
            Self::Ready => SandboxState::Ready,
            Self::Failed(_) => SandboxState::Failed,
        }
    }
}

#[derive(Default)]
struct Table {
    live: HashMap<String, Phase>,
    /// Stopped ids. Kept so they are never provisioned again.
    retired: HashSet<String>,
}

/// Owns every sandbox tracked by this server.
///
/// Share via `Arc<Lifecycle>`. The table lock is only held for lookups and
/// updates, never across provisioning or command execution.
pub struct Lifecycle {
    runtime: Arc<dyn ContainerRuntime>,
    sandboxes: Mutex<Table>,
}

impl Lifecycle {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            sandboxes: Mutex::new(Table::default()),
        }
    }

    pub fn runtime_name(&self) -> &str {
        self.runtime.name()
    }

    /// Start provisioning in the background and return immediately.
    ///
    /// Fails if the id was ever used on this server, including ids whose
    /// provisioning failed and ids already stopped.
    pub async fn start_provisioning(&self, config: SandboxConfig) -> sandbox::Result<()> {
        config.resources.validate()?;

        let (tx, rx) = watch::channel(Outcome::Pending);
        {
            let mut table = self.sandboxes.lock().await;
            if table.live.contains_key(&config.id) || table.retired.contains(&config.id) {
                return Err(SandboxError::AlreadyExists(config.id));
            }
            table.live.insert(config.id.clone(), Phase::Provisioning(rx));
        }

        info!(
            sandbox_id = %config.id,
            memory_gb = config.resources.memory_gb,
            cpus = config.resources.cpus,
            init = config.init_command.is_some(),
            "provisioning sandbox"
        );

        let runtime = Arc::clone(&self.runtime);
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = match runtime.provision(&config).await {
                Ok(()) => {
                    info!(
                        sandbox_id = %config.id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "sandbox ready"
                    );
                    Outcome::Ready
                }
                Err(e) => {
                    warn!(sandbox_id = %config.id, error = %e, "provisioning failed");
                    Outcome::Failed(match e {
                        SandboxError::ProvisioningFailed(detail) => detail,
                        other => other.to_string(),
                    })
                }
            };
            tx.send_replace(outcome);
        });

        Ok(())
    }

    /// Block this request until provisioning of `id` has finished.
    pub async fn await_ready(&self, id: &str) -> sandbox::Result<()> {
        let mut rx = {
            let table = self.sandboxes.lock().await;
            match table.live.get(id) {
                None => return Err(SandboxError::UnknownSandbox(id.to_string())),
                Some(Phase::Ready) => return Ok(()),
                Some(Phase::Failed(detail)) => return Err(provisioning_failed(id, detail)),
                Some(Phase::Provisioning(rx)) => rx.clone(),
            }
        };

        let outcome = match rx.wait_for(|o| !matches!(o, Outcome::Pending)).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => Outcome::Failed("provisioning task ended without a result".into()),
        };

        let mut table = self.sandboxes.lock().await;
        if let Some(phase) = table.live.get_mut(id)
            && matches!(phase, Phase::Provisioning(_))
        {
            debug!(sandbox_id = %id, "joined provisioning task");
            *phase = match &outcome {
                Outcome::Failed(detail) => Phase::Failed(detail.clone()),
                Outcome::Ready | Outcome::Pending => Phase::Ready,
            };
        }

        match outcome {
            Outcome::Failed(detail) => Err(provisioning_failed(id, &detail)),
            Outcome::Ready | Outcome::Pending => Ok(()),
        }
    }

    /// Run one command once the sandbox is ready.
    pub async fn execute(
        &self,
        id: &str,
        command: &str,
        timeout: Duration,
    ) -> sandbox::Result<CommandResult> {
        self.await_ready(id).await?;
        debug!(sandbox_id = %id, timeout_ms = timeout.as_millis() as u64, "exec");
        self.runtime
            .exec(
                id,
                &ExecRequest {
                    cmd: command,
                    timeout,
                },
            )
            .await
    }

    /// Tear down a sandbox after its provisioning has finished.
    ///
    /// Cleanup is best-effort: provisioning and teardown failures are logged,
    /// and the id is retired either way.
    pub async fn stop(&self, id: &str) -> sandbox::Result<()> {
        match self.await_ready(id).await {
            Ok(()) => {}
            Err(SandboxError::UnknownSandbox(_)) => {
                debug!(sandbox_id = %id, "stop for untracked sandbox");
            }
            Err(e) => {
                warn!(sandbox_id = %id, error = %e, "stopping sandbox that never became ready");
            }
        }

        if let Err(e) = self.runtime.teardown(id).await {
            warn!(sandbox_id = %id, error = %e, "teardown failed");
        }

        {
            let mut table = self.sandboxes.lock().await;
            table.live.remove(id);
            table.retired.insert(id.to_string());
        }
        info!(sandbox_id = %id, state = %SandboxState::Stopped, "sandbox stopped");
        Ok(())
    }

    /// Stop every tracked sandbox. Called when the server exits.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = self.sandboxes.lock().await.live.keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        info!(count = ids.len(), "stopping all sandboxes");
        join_all(ids.iter().map(|id| self.stop(id))).await;
    }

    /// Current state of `id`, or `None` if it was never started.
    pub async fn state(&self, id: &str) -> Option<SandboxState> {
        let table = self.sandboxes.lock().await;
        match table.live.get(id) {
            Some(phase) => Some(phase.state()),
            None if table.retired.contains(id) => Some(SandboxState::Stopped),
            None => None,
        }
    }

    /// Number of sandboxes not yet stopped.
    pub async fn len(&self) -> usize {
        self.sandboxes.lock().await.live.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

fn provisioning_failed(id: &str, detail: &str) -> SandboxError {
    SandboxError::ProvisioningFailed(format!("{id}: {detail}"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sandbox::ResourceLimits;
    use tokio::time::Instant;

    use super::*;
    use crate::testing::FakeRuntime;

    fn config(id: &str) -> SandboxConfig {
        SandboxConfig {
            id: id.into(),
            init_command: None,
            resources: ResourceLimits::default(),
        }
    }

    fn lifecycle(runtime: &Arc<FakeRuntime>) -> Lifecycle {
        Lifecycle::new(Arc::clone(runtime) as Arc<dyn ContainerRuntime>)
    }

    #[tokio::test(start_paused = true)]
    async fn start_returns_before_provisioning_finishes() {
        let runtime = Arc::new(FakeRuntime::with_provision_delay(Duration::from_secs(30)));
        let lc = lifecycle(&runtime);

        let started = Instant::now();
        lc.start_provisioning(config("sb-1")).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(lc.state("sb-1").await, Some(SandboxState::Provisioning));
    }

    #[tokio::test(start_paused = true)]
    async fn execute_waits_for_provisioning() {
        let runtime = Arc::new(FakeRuntime::with_provision_delay(Duration::from_secs(5)));
        let lc = lifecycle(&runtime);

        lc.start_provisioning(config("sb-1")).await.unwrap();
        let result = lc
            .execute("sb-1", "echo hi", Duration::from_secs(10))
            .await
            .unwrap();

        assert_eq!(result.stdout, "echo hi");
        assert_eq!(lc.state("sb-1").await, Some(SandboxState::Ready));
        assert_eq!(runtime.events(), ["provisioned sb-1", "exec sb-1 echo hi"]);
    }

    #[tokio::test(start_paused = true)]
    async fn sandboxes_provision_concurrently() {
        let runtime = Arc::new(FakeRuntime::with_provision_delay(Duration::from_secs(5)));
        let lc = lifecycle(&runtime);

        let started = Instant::now();
        for id in ["sb-1", "sb-2", "sb-3"] {
            lc.start_provisioning(config(id)).await.unwrap();
        }
        let (a, b, c) = tokio::join!(
            lc.await_ready("sb-1"),
            lc.await_ready("sb-2"),
            lc.await_ready("sb-3"),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();
        assert!(
            started.elapsed() < Duration::from_secs(6),
            "took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn failed_provisioning_is_terminal() {
        let runtime = Arc::new(FakeRuntime::failing_provision("image missing"));
        let lc = lifecycle(&runtime);

        lc.start_provisioning(config("sb-1")).await.unwrap();
        for _ in 0..2 {
            let err = lc
                .execute("sb-1", "echo hi", Duration::from_secs(1))
                .await
                .unwrap_err();
            assert!(matches!(err, SandboxError::ProvisioningFailed(_)), "got: {err}");
            assert!(err.to_string().contains("image missing"), "got: {err}");
        }
        assert_eq!(lc.state("sb-1").await, Some(SandboxState::Failed));

        let err = lc.start_provisioning(config("sb-1")).await.unwrap_err();
        assert!(matches!(err, SandboxError::AlreadyExists(_)), "got: {err}");
        assert!(runtime.events().iter().all(|e| !e.starts_with("exec")));
    }

    #[tokio::test]
    async fn duplicate_start_is_rejected() {
        let runtime = Arc::new(FakeRuntime::default());
        let lc = lifecycle(&runtime);

        lc.start_provisioning(config("sb-1")).await.unwrap();
        let err = lc.start_provisioning(config("sb-1")).await.unwrap_err();
        assert!(matches!(err, SandboxError::AlreadyExists(_)), "got: {err}");
    }

    #[tokio::test]
    async fn invalid_limits_are_rejected_up_front() {
        let runtime = Arc::new(FakeRuntime::default());
        let lc = lifecycle(&runtime);
        let mut cfg = config("sb-1");
        cfg.resources.memory_gb = -1.0;

        let err = lc.start_provisioning(cfg).await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidConfig(_)), "got: {err}");
        assert!(lc.is_empty().await);
    }

    #[tokio::test]
    async fn unknown_sandbox_is_an_error() {
        let runtime = Arc::new(FakeRuntime::default());
        let lc = lifecycle(&runtime);

        let err = lc
            .execute("missing", "true", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::UnknownSandbox(_)), "got: {err}");
    }

    #[tokio::test(start_paused = true)]
    async fn stop_waits_for_provisioning_then_tears_down() {
        let runtime = Arc::new(FakeRuntime::with_provision_delay(Duration::from_secs(5)));
        let lc = lifecycle(&runtime);

        lc.start_provisioning(config("sb-1")).await.unwrap();
        lc.stop("sb-1").await.unwrap();

        assert_eq!(runtime.events(), ["provisioned sb-1", "teardown sb-1"]);
        assert_eq!(lc.state("sb-1").await, Some(SandboxState::Stopped));
        assert!(lc.is_empty().await);
    }

    #[tokio::test]
    async fn stopped_ids_are_never_reused() {
        let runtime = Arc::new(FakeRuntime::failing_provision("boom"));
        let lc = lifecycle(&runtime);

        lc.start_provisioning(config("sb-1")).await.unwrap();
        lc.stop("sb-1").await.unwrap();
        lc.stop("never-started").await.unwrap();

        for id in ["sb-1", "never-started"] {
            let err = lc.start_provisioning(config(id)).await.unwrap_err();
            assert!(matches!(err, SandboxError::AlreadyExists(_)), "got: {err}");
        }
        let err = lc
            .execute("sb-1", "true", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::UnknownSandbox(_)), "got: {err}");
        assert!(lc.is_empty().await);
    }

    #[tokio::test]
    async fn stop_cleans_up_failed_and_unknown_sandboxes() {
        let runtime = Arc::new(FakeRuntime::failing_provision("boom"));
        let lc = lifecycle(&runtime);

        lc.start_provisioning(config("sb-1")).await.unwrap();
        lc.stop("sb-1").await.unwrap();
        lc.stop("never-started").await.unwrap();

        let events = runtime.events();
        assert!(events.contains(&"teardown sb-1".to_string()), "{events:?}");
        assert!(events.contains(&"teardown never-started".to_string()), "{events:?}");
        assert!(lc.is_empty().await);
    }

    #[tokio::test]
    async fn teardown_failure_is_not_fatal() {
        let runtime = Arc::new(FakeRuntime::failing_teardown());
        let lc = lifecycle(&runtime);

        lc.start_provisioning(config("sb-1")).await.unwrap();
        lc.stop("sb-1").await.unwrap();
        assert!(lc.is_empty().await);
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let runtime = Arc::new(FakeRuntime::default());
        let lc = lifecycle(&runtime);

        for id in ["sb-1", "sb-2"] {
            lc.start_provisioning(config(id)).await.unwrap();
        }
        lc.shutdown().await;

        assert!(lc.is_empty().await);
        let teardowns = runtime
            .events()
            .into_iter()
            .filter(|e| e.starts_with("teardown"))
            .count();
        assert_eq!(teardowns, 2);
    }
}
