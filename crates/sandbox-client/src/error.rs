use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("all sandbox endpoints are unhealthy")]
    AllEndpointsUnhealthy,

    #[error("provisioning failed on {endpoint}: {detail}")]
    ProvisioningFailed { endpoint: String, detail: String },

    #[error("malformed {function} response from {endpoint}: {detail}")]
    MalformedResponse {
        endpoint: String,
        function: &'static str,
        detail: String,
    },

    #[error("{endpoint} unreachable: {detail}")]
    TransportUnavailable { endpoint: String, detail: String },

    #[error("{endpoint} rejected {function} ({status}): {detail}")]
    Rejected {
        endpoint: String,
        function: &'static str,
        status: u16,
        detail: String,
    },

    #[error("config error: {0}")]
    Config(String),

    #[error("read {}: {source}", path.display())]
    LocalFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("upload to {remote} exited with {exit_code}: {stderr}")]
    UploadFailed {
        remote: String,
        exit_code: i32,
        stderr: String,
    },
}

pub type ClientResult<T> = Result<T, ClientError>;
