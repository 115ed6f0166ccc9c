#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("provisioning failed: {0}")]
    ProvisioningFailed(String),

    #[error("unknown sandbox: {0}")]
    UnknownSandbox(String),

    #[error("sandbox already exists: {0}")]
    AlreadyExists(String),

    #[error("execution failed: {0}")]
    ExecFailed(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
