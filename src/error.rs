use thiserror::Error;
use tracing::warn;

/// Boxed error returned by external collaborators (transport, codec, storage).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for the distributed quota engine
#[derive(Debug, Error)]
pub enum QuotaError {
    /// Transport could not connect; fatal to `start`
    #[error("Transport connect error: {0}")]
    TransportConnect(#[source] BoxError),

    /// Inbound subscription could not be registered; fatal to `start`
    #[error("Subscription error: {0}")]
    Subscription(#[source] BoxError),

    /// Broadcast publish failed
    #[error("Publish error: {0}")]
    Publish(#[source] BoxError),

    /// Quota table could not be encoded for broadcast
    #[error("Serialization error: {0}")]
    Serialization(#[source] BoxError),

    /// Received payload could not be decoded into a quota table
    #[error("Deserialization error: {0}")]
    Deserialization(#[source] BoxError),

    /// Leader flush to storage failed
    #[error("Persistence error: {0}")]
    Persistence(#[source] BoxError),

    /// `start` was called before `bind_transport`
    #[error("Transport not bound: call bind_transport before start")]
    NotBound,

    /// `start` was called twice on the same engine
    #[error("Engine already started")]
    AlreadyStarted,

    /// Internal lock poisoning
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration or CLI argument errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl QuotaError {
    /// Errors that abort `start` rather than flowing through the error queue
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            QuotaError::TransportConnect(_)
                | QuotaError::Subscription(_)
                | QuotaError::NotBound
                | QuotaError::AlreadyStarted
        )
    }

    /// Get the error type identifier
    pub fn error_type(&self) -> &'static str {
        match self {
            QuotaError::TransportConnect(_) => "transport_connect_error",
            QuotaError::Subscription(_) => "subscription_error",
            QuotaError::Publish(_) => "publish_error",
            QuotaError::Serialization(_) => "serialization_error",
            QuotaError::Deserialization(_) => "deserialization_error",
            QuotaError::Persistence(_) => "persistence_error",
            QuotaError::NotBound => "not_bound",
            QuotaError::AlreadyStarted => "already_started",
            QuotaError::Concurrency(_) => "concurrency_error",
            QuotaError::Config(_) => "configuration_error",
        }
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, QuotaError>;

/// Receives every asynchronous failure from an engine, one at a time, in
/// arrival order. Implementations must return promptly.
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, err: QuotaError);
}

impl<F> ErrorHandler for F
where
    F: Fn(QuotaError) + Send + Sync,
{
    fn handle(&self, err: QuotaError) {
        self(err)
    }
}

/// Default handler: report and carry on.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogErrorHandler;

impl ErrorHandler for LogErrorHandler {
    fn handle(&self, err: QuotaError) {
        warn!(error_type = err.error_type(), "Quota engine error: {}", err);
    }
}

#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::QuotaError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::QuotaError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! concurrency_error {
    ($msg:expr) => {
        $crate::error::QuotaError::Concurrency($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::QuotaError::Concurrency(format!($fmt, $($arg)*))
    };
}
