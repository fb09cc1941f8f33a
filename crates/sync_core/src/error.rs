use shared::error::ApiError;
use thiserror::Error;

/// Failures surfaced by the synchronization core. Transport failures stay
/// inside the connection manager; write failures go back to the caller of the
/// mutation that caused them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("handshake rejected: {0}")]
    HandshakeFailure(String),
    #[error("transport failure: {0}")]
    TransportFailure(String),
    #[error("write rejected: {message}")]
    WriteFailure {
        status: Option<u16>,
        message: String,
    },
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("no credential available")]
    NotAuthenticated,
}

impl SyncError {
    pub fn write(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::WriteFailure {
            status,
            message: message.into(),
        }
    }

    pub fn from_api(status: u16, api: ApiError) -> Self {
        Self::write(Some(status), format!("{:?}: {}", api.code, api.message))
    }

    pub fn requires_reauth(&self) -> bool {
        matches!(self, Self::HandshakeFailure(_) | Self::NotAuthenticated)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("server refused credentials: {0}")]
    Unauthorized(String),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request failed: {0}")]
    Network(String),
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("no credential available")]
    NotAuthenticated,
}

impl From<RequestError> for SyncError {
    fn from(value: RequestError) -> Self {
        match value {
            RequestError::NotAuthenticated => SyncError::NotAuthenticated,
            other => SyncError::write(None, other.to_string()),
        }
    }
}
