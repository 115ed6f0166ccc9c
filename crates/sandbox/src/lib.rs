mod config;
mod error;
mod runtime;
mod types;

pub use config::{MIN_CPUS, MIN_MEMORY_GB, ResourceLimits, SandboxConfig, new_sandbox_id};
pub use error::{Result, SandboxError};
pub use runtime::ContainerRuntime;
pub use types::{CommandResult, ExecRequest, SandboxState, TIMED_OUT};
