//! Unified error handling for the rhilex gateway
//!
//! Every crate in the workspace reports failures through [`RhilexError`].
//! Messages that callers (scripts, the supervisor, tests) match on are kept
//! as fixed strings.

use thiserror::Error;

// ============================================================================
// RhilexError - Main error type
// ============================================================================

/// Main error type for all gateway crates
#[derive(Debug, Error)]
pub enum RhilexError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    // ======================================
    // Database Errors
    // ======================================
    #[error("Database error: {0}")]
    Database(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    // ======================================
    // Protocol & Communication Errors
    // ======================================
    #[error("Protocol error: {protocol}: {message}")]
    Protocol { protocol: String, message: String },

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Connection failed: {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Timeout waiting for response from {0}")]
    Timeout(String),

    #[error("Modbus error: {0}")]
    Modbus(String),

    #[error("MQTT error: {0}")]
    Mqtt(String),

    // ======================================
    // Resource & Registry Errors
    // ======================================
    #[error("{kind} not exists:{id}")]
    NotFound { kind: String, id: String },

    #[error("unsupported {kind} type:{type_tag}")]
    UnsupportedType { kind: String, type_tag: String },

    #[error("{kind} already exists:{id}")]
    AlreadyExists { kind: String, id: String },

    #[error("{0} is down")]
    ResourceDown(String),

    #[error("Cecolla already bind to device:{device}")]
    BindingConflict { cecolla: String, device: String },

    #[error("UART busy, occupied by {owner}")]
    PortBusy { port: String, owner: String },

    #[error("supervisor with UUID {0} not found")]
    SupervisorNotFound(String),

    #[error("operation not supported: {0}")]
    Unsupported(String),

    // ======================================
    // Pipeline Errors
    // ======================================
    #[error("queue full: {0}")]
    QueueFull(String),

    #[error("max store size reached")]
    StoreFull,

    #[error("Script error: {0}")]
    Script(String),

    #[error("Invalid script: {0}")]
    InvalidScript(String),

    #[error("Cecollalet already started:{0}")]
    AlreadyRunning(String),

    #[error("Operation cancelled")]
    Cancelled,

    // ======================================
    // Validation Errors
    // ======================================
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid parameter: {param}: {reason}")]
    InvalidParameter { param: String, reason: String },

    // ======================================
    // File & I/O Errors
    // ======================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Parse error: {file}: {error}")]
    ParseError { file: String, error: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ======================================
    // Service & Runtime Errors
    // ======================================
    #[error("Service startup failed: {0}")]
    StartupFailed(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Internal error: {0}")]
    Internal(String),

    // ======================================
    // External Service Errors
    // ======================================
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using RhilexError
pub type RhilexResult<T> = Result<T, RhilexError>;

impl RhilexError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn protocol(protocol: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            protocol: protocol.into(),
            message: message.into(),
        }
    }

    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn unsupported_type(kind: impl Into<String>, type_tag: impl Into<String>) -> Self {
        Self::UnsupportedType {
            kind: kind.into(),
            type_tag: type_tag.into(),
        }
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::Runtime(msg.into())
    }

    /// Stable code for logs and snapshot output
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",
            Self::MissingConfig(_) => "MISSING_CONFIG",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Sqlite(_) => "SQLITE_ERROR",
            Self::Protocol { .. } => "PROTOCOL_ERROR",
            Self::Communication(_) => "COMMUNICATION_ERROR",
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Modbus(_) => "MODBUS_ERROR",
            Self::Mqtt(_) => "MQTT_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::UnsupportedType { .. } => "UNSUPPORTED_TYPE",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::ResourceDown(_) => "RESOURCE_DOWN",
            Self::BindingConflict { .. } => "BINDING_CONFLICT",
            Self::PortBusy { .. } => "PORT_BUSY",
            Self::SupervisorNotFound(_) => "SUPERVISOR_NOT_FOUND",
            Self::Unsupported(_) => "UNSUPPORTED",
            Self::QueueFull(_) => "QUEUE_FULL",
            Self::StoreFull => "STORE_FULL",
            Self::Script(_) => "SCRIPT_ERROR",
            Self::InvalidScript(_) => "INVALID_SCRIPT",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::Cancelled => "CANCELLED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidParameter { .. } => "INVALID_PARAMETER",
            Self::Io(_) => "IO_ERROR",
            Self::FileNotFound(_) => "FILE_NOT_FOUND",
            Self::ParseError { .. } => "PARSE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::StartupFailed(_) => "STARTUP_FAILED",
            Self::Runtime(_) => "RUNTIME_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::HttpClient(_) => "HTTP_CLIENT_ERROR",
            Self::Other(_) => "OTHER_ERROR",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::InvalidConfig { .. } | Self::MissingConfig(_) => {
                ErrorCategory::Configuration
            },

            Self::Database(_) | Self::Sqlite(_) => ErrorCategory::Database,

            Self::Protocol { .. } | Self::Modbus(_) => ErrorCategory::Protocol,

            Self::ConnectionFailed { .. } | Self::Mqtt(_) => ErrorCategory::Connection,

            Self::Communication(_) | Self::HttpClient(_) | Self::Io(_) => ErrorCategory::Network,

            Self::Timeout(_) => ErrorCategory::Timeout,

            Self::Validation(_)
            | Self::InvalidParameter { .. }
            | Self::UnsupportedType { .. }
            | Self::Unsupported(_) => ErrorCategory::Validation,

            Self::NotFound { .. } | Self::FileNotFound(_) | Self::SupervisorNotFound(_) => {
                ErrorCategory::NotFound
            },

            Self::AlreadyExists { .. } | Self::BindingConflict { .. } => ErrorCategory::Conflict,

            Self::PortBusy { .. } | Self::AlreadyRunning(_) | Self::ResourceDown(_) => {
                ErrorCategory::ResourceBusy
            },

            Self::QueueFull(_) | Self::StoreFull => ErrorCategory::ResourceExhausted,

            Self::Script(_) | Self::InvalidScript(_) => ErrorCategory::Script,

            Self::Cancelled
            | Self::ParseError { .. }
            | Self::Serialization(_)
            | Self::StartupFailed(_)
            | Self::Runtime(_)
            | Self::Internal(_) => ErrorCategory::Internal,

            Self::Other(_) => ErrorCategory::Unknown,
        }
    }

    /// Transient failures a poll loop may retry
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::Connection
                | ErrorCategory::ResourceBusy
        )
    }
}

/// Error category enum - used for classification in logs and snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Database,
    Network,
    Timeout,
    Validation,
    NotFound,
    Conflict,
    Protocol,
    Connection,
    Script,
    Internal,
    ResourceBusy,
    ResourceExhausted,
    Unknown,
}

// Conversion traits for common error types
impl From<serde_json::Error> for RhilexError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::num::ParseIntError> for RhilexError {
    fn from(err: std::num::ParseIntError) -> Self {
        Self::Validation(format!("Invalid integer: {}", err))
    }
}

impl From<std::num::ParseFloatError> for RhilexError {
    fn from(err: std::num::ParseFloatError) -> Self {
        Self::Validation(format!("Invalid float: {}", err))
    }
}

// Helper macros for creating errors
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::RhilexError::Configuration($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::RhilexError::Configuration(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! protocol_error {
    ($protocol:expr, $msg:expr) => {
        $crate::RhilexError::Protocol {
            protocol: $protocol.to_string(),
            message: $msg.to_string(),
        }
    };
}
