use thiserror::Error;

/// Error types for the event streamer
#[derive(Error, Debug)]
pub enum StreamerError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Startup preflight failures (server versions, wal_level, replica identities)
    #[error("Preflight check failed: {0}")]
    Preflight(String),

    /// Durable state could not be decoded
    #[error("Malformed state: {0}")]
    MalformedState(String),

    /// Table filter pattern could not be parsed
    #[error("Bad filter pattern: {0}")]
    BadPattern(String),

    /// Schema registry lookup for an unregistered name
    #[error("Unknown schema: {0}")]
    UnknownSchema(String),

    /// Column value conversion failed
    #[error("Value conversion failed: {0}")]
    ConversionFailed(String),

    /// Event filter evaluation failed
    #[error("Event filter error: {0}")]
    Filter(String),

    /// Sink emission failed (retryable)
    #[error("Sink failure: {0}")]
    SinkFailure(String),

    /// Dispatcher is draining, no new tasks accepted
    #[error("Shutdown active, draining only")]
    ShuttingDown,

    /// Replication slot exists but has no restart LSN
    #[error("Replication slot has no restart LSN: {0}")]
    NoRestartPoint(String),

    /// Side channel / catalog query errors
    #[error("Database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors collected during shutdown
    #[error("Shutdown errors: {}", .0.join("; "))]
    Shutdown(Vec<String>),

    /// Non-retryable errors
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl StreamerError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        StreamerError::Config(msg.into())
    }

    /// Create a new preflight error
    pub fn preflight<S: Into<String>>(msg: S) -> Self {
        StreamerError::Preflight(msg.into())
    }

    /// Create a new malformed state error
    pub fn malformed_state<S: Into<String>>(msg: S) -> Self {
        StreamerError::MalformedState(msg.into())
    }

    /// Create a new bad pattern error
    pub fn bad_pattern<S: Into<String>>(msg: S) -> Self {
        StreamerError::BadPattern(msg.into())
    }

    /// Create a new conversion error
    pub fn conversion<S: Into<String>>(msg: S) -> Self {
        StreamerError::ConversionFailed(msg.into())
    }

    /// Create a new sink failure
    pub fn sink<S: Into<String>>(msg: S) -> Self {
        StreamerError::SinkFailure(msg.into())
    }

    /// Create a new fatal error
    pub fn fatal<S: Into<String>>(msg: S) -> Self {
        StreamerError::Fatal(msg.into())
    }

    /// Whether the error is worth retrying at the sink boundary
    pub fn is_retryable(&self) -> bool {
        matches!(self, StreamerError::SinkFailure(_))
    }
}

/// Process exit codes, matching the CLI contract
pub mod exit_codes {
    pub const CLEAN: i32 = 0;
    pub const STARTUP_FAILURE: i32 = 1;
    pub const POSTGRES_TOO_OLD: i32 = 11;
    pub const TIMESCALE_TOO_OLD: i32 = 12;
    pub const WAL_LEVEL_NOT_LOGICAL: i32 = 16;
    pub const REPLICATION_CONTEXT_FAILED: i32 = 18;
    pub const EMITTER_START_FAILED: i32 = 24;
    pub const KNOWN_TABLES_LOAD_FAILED: i32 = 25;
    pub const NO_RESTART_POINT: i32 = 30;
    pub const SHUTDOWN_ERRORS: i32 = 250;
}

/// An error annotated with the process exit code to report
#[derive(Error, Debug)]
#[error("{source}")]
pub struct ExitError {
    #[source]
    pub source: StreamerError,
    pub code: i32,
}

impl ExitError {
    pub fn new(source: StreamerError, code: i32) -> Self {
        Self { source, code }
    }
}

impl From<StreamerError> for ExitError {
    fn from(source: StreamerError) -> Self {
        let code = match &source {
            StreamerError::NoRestartPoint(_) => exit_codes::NO_RESTART_POINT,
            StreamerError::Shutdown(_) => exit_codes::SHUTDOWN_ERRORS,
            _ => exit_codes::STARTUP_FAILURE,
        };
        Self { source, code }
    }
}

/// Result type for streamer operations
pub type Result<T> = std::result::Result<T, StreamerError>;
