use thiserror::Error;

/// Call core error type
#[derive(Error, Debug)]
pub enum CallError {
    /// Device permission denied or no matching capture device
    #[error("Media access error: {0}")]
    MediaAccess(String),

    /// The call record could not be created or updated
    #[error("Signaling setup failed: {0}")]
    SignalingSetup(String),

    /// The signaling channel rejected a payload (never retried)
    #[error("Signaling delivery failed: {0}")]
    Delivery(String),

    /// A signaling message arrived in a state where it makes no sense
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The peer connection reported failed/disconnected/closed or timed out
    #[error("Connection failure: {0}")]
    ConnectionFailure(String),

    #[error("A call is already in progress: {0}")]
    CallInProgress(String),

    #[error("No active call")]
    NoActiveCall,

    #[error("WebRTC error: {0}")]
    WebRtc(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl CallError {
    /// Short machine-readable kind, used in notices and logs
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::MediaAccess(_) => "media_access",
            CallError::SignalingSetup(_) => "signaling_setup",
            CallError::Delivery(_) => "delivery",
            CallError::ProtocolViolation(_) => "protocol_violation",
            CallError::ConnectionFailure(_) => "connection_failure",
            CallError::CallInProgress(_) => "call_in_progress",
            CallError::NoActiveCall => "no_active_call",
            CallError::WebRtc(_) => "webrtc",
            CallError::Storage(_) | CallError::Database(_) => "storage",
            CallError::Serialization(_) => "serialization",
            CallError::Io(_) => "io",
            CallError::Config(_) => "config",
        }
    }
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, CallError>;
