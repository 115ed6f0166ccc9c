use crate::error::{Result, SandboxError};

/// Prefix of every sandbox id handed out by [`new_sandbox_id`].
const ID_PREFIX: &str = "sandbox";

/// Smallest memory quota docker accepts (6 MiB), in gigabytes.
pub const MIN_MEMORY_GB: f64 = 6.0 / 1024.0;

/// Smallest CPU quota docker accepts.
pub const MIN_CPUS: f64 = 0.01;

/// Resource quota for one sandbox. Fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    /// Memory quota in gigabytes. Fractional values are allowed.
    pub memory_gb: f64,
    /// CPU quota in cores. Fractional values are allowed.
    pub cpus: f64,
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<()> {
        if !(self.memory_gb.is_finite() && self.memory_gb >= MIN_MEMORY_GB) {
            return Err(SandboxError::InvalidConfig(format!(
                "memory_gb must be at least {MIN_MEMORY_GB} (6 MiB), got {}",
                self.memory_gb
            )));
        }
        if !(self.cpus.is_finite() && self.cpus >= MIN_CPUS) {
            return Err(SandboxError::InvalidConfig(format!(
                "cpus must be at least {MIN_CPUS}, got {}",
                self.cpus
            )));
        }
        Ok(())
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_gb: 1.0,
            cpus: 1.0,
        }
    }
}

/// Everything needed to provision one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Container name. Unique per sandbox, never reused.
    pub id: String,
    /// Shell command run once inside the container after it starts.
    pub init_command: Option<String>,
    pub resources: ResourceLimits,
}

/// Generate a fresh sandbox id (`sandbox-<uuid v4>`).
pub fn new_sandbox_id() -> String {
    format!("{ID_PREFIX}-{}", uuid::Uuid::new_v4())
}
