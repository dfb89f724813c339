use thiserror::Error;

/// Core error type for beacon operations.
#[derive(Error, Debug)]
pub enum BeaconError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

}

impl From<serde_json::Error> for BeaconError {
    fn from(e: serde_json::Error) -> Self {
        BeaconError::Serialization(e.to_string())
    }
}

/// Result type alias using BeaconError.
pub type Result<T> = std::result::Result<T, BeaconError>;

/// Error returned by a discovery backend call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend could not be contacted (connect failure, timeout, reset).
    #[error("backend unreachable: {0}")]
    Unreachable(String),

    /// The backend answered but refused the request.
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The backend answered with a payload of an unexpected shape.
    #[error("failed to decode backend response: {0}")]
    Decode(String),
}

impl BackendError {
    /// Server-side failures (5xx) are worth retrying; client errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unreachable(_) => true,
            Self::Rejected { status, .. } => *status >= 500,
            Self::Decode(_) => false,
        }
    }
}

/// Startup failure while registering the local service. Fatal to startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("discovery backend unreachable: {0}")]
    Unreachable(String),

    #[error("registration rejected: {0}")]
    Rejected(String),

    #[error("service '{0}' is already registered by this process")]
    AlreadyRegistered(String),

    /// Refused locally before the backend was contacted.
    #[error("invalid registration: {0}")]
    Invalid(String),
}

impl From<BackendError> for RegistrationError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Unreachable(msg) => Self::Unreachable(msg),
            BackendError::Rejected { status, message } => {
                Self::Rejected(format!("status {}: {}", status, message))
            }
            BackendError::Decode(msg) => Self::Rejected(msg),
        }
    }
}

/// Failed TTL update. Recovered locally by the heartbeat loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatError {
    #[error("transient failure updating check '{check_id}': {source}")]
    TransientNetwork {
        check_id: String,
        #[source]
        source: BackendError,
    },
}

/// Failed watch cycle. Recovered locally by the membership watcher.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WatchError {
    #[error("transient failure querying membership: {0}")]
    TransientNetwork(BackendError),

    #[error("blocking index went backwards ({previous} -> {current})")]
    IndexRegression { previous: u64, current: u64 },

    #[error("unexpected membership payload: {0}")]
    DecodeFailure(String),
}

impl WatchError {
    /// Whether a retry after the normal backoff can succeed. A request the
    /// backend refused outright (4xx) will fail the same way until the
    /// configuration changes.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::TransientNetwork(source) => source.is_transient(),
            Self::IndexRegression { .. } | Self::DecodeFailure(_) => true,
        }
    }
}

impl From<BackendError> for WatchError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Decode(msg) => Self::DecodeFailure(msg),
            other => Self::TransientNetwork(other),
        }
    }
}
