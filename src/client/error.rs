use crate::utils::error::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("Request {id} failed: timeout {timeout_ms}ms exceeded")]
    Timeout { id: String, timeout_ms: u64 },
    /// The broker reported a routing failure; `message` comes from the
    /// error-code table.
    #[error("{message}")]
    Remote {
        code: Option<ErrorCode>,
        message: String,
    },
    #[error("request {0} was acknowledged without a reply")]
    Dropped(String),
    #[error("client is shut down")]
    Closed,
}

impl ClientError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ClientError::Remote { code, .. } => *code,
            ClientError::Timeout { .. } => Some(ErrorCode::Timeout),
            _ => None,
        }
    }
}
