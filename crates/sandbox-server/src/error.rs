use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use sandbox::SandboxError;
use sandbox_proto::{ErrorBody, ProtoError};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ServerResult<T> = Result<T, ServerError>;

impl From<ProtoError> for ServerError {
    fn from(e: ProtoError) -> Self {
        Self::InvalidRequest(e.to_string())
    }
}

impl ServerError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Sandbox(err) => match err {
                SandboxError::ProvisioningFailed(_) => StatusCode::FAILED_DEPENDENCY,
                SandboxError::UnknownSandbox(_) => StatusCode::NOT_FOUND,
                SandboxError::AlreadyExists(_) => StatusCode::CONFLICT,
                SandboxError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
                SandboxError::ExecFailed(_) | SandboxError::Io(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::Config(_) | Self::Internal(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let code = self.status_code();
        let body = ErrorBody {
            error: self.to_string(),
        };
        (code, Json(body)).into_response()
    }
}
