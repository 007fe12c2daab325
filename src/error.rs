use hyper::StatusCode;
use thiserror::Error;

/// Unified error type for the Gyre proxy
#[derive(Error, Debug)]
pub enum GyreError {
    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database connection failed: {0}")]
    DatabaseConnection(String),

    // Selection errors
    #[error("No upstream proxies available")]
    NoUpstreams,

    #[error("All upstreams have reached the rate limit ({max_requests} requests/{window_secs}s)")]
    AllRateLimited { max_requests: i64, window_secs: i64 },

    #[error("Failed to load upstreams: {0}")]
    SelectorLoad(String),

    // Forwarding errors
    #[error("Upstream connection failed: {0}")]
    UpstreamConnectFailed(String),

    #[error("Upstream rejected CONNECT: {0}")]
    ConnectRejected(String),

    #[error("All upstreams failed after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("Invalid upstream address: {0}")]
    InvalidUpstreamAddress(String),

    #[error("Unsupported upstream protocol: {0}")]
    UnsupportedProtocol(String),

    // Client-facing request errors
    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Rate limit exceeded for {client_ip}")]
    RateLimitExceeded { client_ip: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation timed out")]
    Timeout,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O and HTTP plumbing
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Gyre operations
pub type Result<T> = std::result::Result<T, GyreError>;

impl GyreError {
    /// HTTP status code presented to the proxy client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GyreError::InvalidRequest(_)
            | GyreError::InvalidUpstreamAddress(_)
            | GyreError::UnsupportedProtocol(_)
            | GyreError::InvalidConfig(_) => StatusCode::BAD_REQUEST,

            GyreError::AuthenticationFailed => StatusCode::PROXY_AUTHENTICATION_REQUIRED,

            GyreError::AllRateLimited { .. } | GyreError::RateLimitExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }

            GyreError::NoUpstreams
            | GyreError::SelectorLoad(_)
            | GyreError::UpstreamConnectFailed(_)
            | GyreError::ConnectRejected(_)
            | GyreError::Exhausted { .. }
            | GyreError::Http(_) => StatusCode::BAD_GATEWAY,

            GyreError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            GyreError::DatabaseConnection(_) => StatusCode::SERVICE_UNAVAILABLE,

            GyreError::Database(_) | GyreError::Io(_) | GyreError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Value for the `Retry-After` header, where one applies
    pub fn retry_after_secs(&self) -> Option<i64> {
        match self {
            GyreError::AllRateLimited { window_secs, .. } => Some(*window_secs),
            _ => None,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl From<hyper::Error> for GyreError {
    fn from(err: hyper::Error) -> Self {
        GyreError::Http(err.to_string())
    }
}

impl From<url::ParseError> for GyreError {
    fn from(err: url::ParseError) -> Self {
        GyreError::InvalidUpstreamAddress(err.to_string())
    }
}
