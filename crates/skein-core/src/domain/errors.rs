//! Errors - キューエラーの分類
//!
//! Every failure that crosses the provider contract is one of four kinds.
//! The kind and code drive application logic; the cause is kept only for
//! diagnostics.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Shared, clonable cause attached to a [`QueueError`].
pub type Cause = Arc<dyn StdError + Send + Sync + 'static>;

/// `source()` for a stored cause: the error inside the `Arc`, not the `Arc`
/// itself, so `downcast_ref` along the chain sees the original type.
pub(crate) fn cause_source(cause: &Option<Cause>) -> Option<&(dyn StdError + 'static)> {
    cause.as_deref().map(|c| c as &(dyn StdError + 'static))
}

/// Boxed error accepted at the mapper boundary.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Crate-wide result alias.
pub type Result<T, E = QueueError> = std::result::Result<T, E>;

/// Caller misuse: unsupported capability, invalid option, unknown queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigurationCode {
    InvalidOption,
    UnsupportedCapability,
    QueueNotFound,
}

/// Payload and identity conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataCode {
    Duplicate,
    Serialization,
    PayloadTooLarge,
}

/// Operational failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeCode {
    Connection,
    Timeout,
    Processing,
    RateLimit,
}

macro_rules! code_display {
    ($ty:ty { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

code_display!(ConfigurationCode {
    InvalidOption => "INVALID_OPTION",
    UnsupportedCapability => "UNSUPPORTED_CAPABILITY",
    QueueNotFound => "QUEUE_NOT_FOUND",
});

code_display!(DataCode {
    Duplicate => "DUPLICATE",
    Serialization => "SERIALIZATION",
    PayloadTooLarge => "PAYLOAD_TOO_LARGE",
});

code_display!(RuntimeCode {
    Connection => "CONNECTION",
    Timeout => "TIMEOUT",
    Processing => "PROCESSING",
    RateLimit => "RATE_LIMIT",
});

/// The closed error taxonomy of the queue layer.
///
/// Values are normally produced by [`crate::domain::ErrorMapper`]; the
/// constructors below exist for the mapper and for validation code that
/// already knows the exact kind.
#[derive(Debug, Clone)]
pub enum QueueError {
    Configuration {
        code: ConfigurationCode,
        message: String,
        cause: Option<Cause>,
    },
    Data {
        code: DataCode,
        message: String,
        cause: Option<Cause>,
    },
    NotFound {
        message: String,
        cause: Option<Cause>,
    },
    Runtime {
        code: RuntimeCode,
        retryable: bool,
        message: String,
        cause: Option<Cause>,
    },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration { code, message, .. } => {
                write!(f, "configuration error [{code}]: {message}")
            }
            Self::Data { code, message, .. } => write!(f, "data error [{code}]: {message}"),
            Self::NotFound { message, .. } => write!(f, "not found: {message}"),
            Self::Runtime {
                code,
                retryable,
                message,
                ..
            } => write!(f, "runtime error [{code}] (retryable={retryable}): {message}"),
        }
    }
}

impl StdError for QueueError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Configuration { cause, .. }
            | Self::Data { cause, .. }
            | Self::NotFound { cause, .. }
            | Self::Runtime { cause, .. } => cause_source(cause),
        }
    }
}

/// Discriminant of [`QueueError`], handy for matching and serialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Data,
    NotFound,
    Runtime,
}

impl QueueError {
    pub fn configuration(code: ConfigurationCode, message: impl Into<String>) -> Self {
        Self::Configuration {
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn invalid_option(message: impl Into<String>) -> Self {
        Self::configuration(ConfigurationCode::InvalidOption, message)
    }

    pub fn unsupported(capability: &str) -> Self {
        Self::configuration(
            ConfigurationCode::UnsupportedCapability,
            format!("provider does not support {capability}"),
        )
    }

    pub fn data(code: DataCode, message: impl Into<String>) -> Self {
        Self::Data {
            code,
            message: message.into(),
            cause: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            cause: None,
        }
    }

    pub fn runtime(code: RuntimeCode, retryable: bool, message: impl Into<String>) -> Self {
        Self::Runtime {
            code,
            retryable,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach the original failure for diagnostics.
    pub fn with_cause(mut self, new_cause: Cause) -> Self {
        match &mut self {
            Self::Configuration { cause, .. }
            | Self::Data { cause, .. }
            | Self::NotFound { cause, .. }
            | Self::Runtime { cause, .. } => *cause = Some(new_cause),
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Data { .. } => ErrorKind::Data,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Runtime { .. } => ErrorKind::Runtime,
        }
    }

    /// Code string (`None` for NotFound, which has no sub-code).
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Configuration { code, .. } => Some(code.as_str()),
            Self::Data { code, .. } => Some(code.as_str()),
            Self::NotFound { .. } => None,
            Self::Runtime { code, .. } => Some(code.as_str()),
        }
    }

    /// Only runtime errors can be retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Runtime { retryable: true, .. })
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Configuration { message, .. }
            | Self::Data { message, .. }
            | Self::NotFound { message, .. }
            | Self::Runtime { message, .. } => message,
        }
    }

    pub fn cause(&self) -> Option<&Cause> {
        match self {
            Self::Configuration { cause, .. }
            | Self::Data { cause, .. }
            | Self::NotFound { cause, .. }
            | Self::Runtime { cause, .. } => cause.as_ref(),
        }
    }

    pub fn info(&self) -> ErrorInfo {
        ErrorInfo::from(self)
    }
}

/// Serializable projection of a [`QueueError`] carried by events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub retryable: bool,
    pub message: String,
}

impl From<&QueueError> for ErrorInfo {
    fn from(err: &QueueError) -> Self {
        Self {
            kind: err.kind(),
            code: err.code().map(str::to_string),
            retryable: err.is_retryable(),
            message: err.message().to_string(),
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{:?}/{}: {}", self.kind, code, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

/// Failure reported by job handler code.
///
/// Handlers return this unmodified to the adapter's retry engine. `permanent`
/// is the only hint the handler can give: it asks the adapter not to retry.
#[derive(Debug, Clone)]
pub struct JobFailure {
    message: String,
    permanent: bool,
    cause: Option<Cause>,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for JobFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        cause_source(&self.cause)
    }
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permanent: false,
            cause: None,
        }
    }

    /// A failure the adapter must not retry.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            permanent: true,
            ..Self::new(message)
        }
    }

    pub fn from_error<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self {
            message: err.to_string(),
            permanent: false,
            cause: Some(Arc::new(err)),
        }
    }

    pub fn with_cause(mut self, cause: Cause) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn mark_permanent(mut self) -> Self {
        self.permanent = true;
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    pub fn cause(&self) -> Option<&Cause> {
        self.cause.as_ref()
    }
}

impl From<QueueError> for JobFailure {
    /// Configuration and data problems cannot be fixed by running again.
    fn from(err: QueueError) -> Self {
        let permanent = matches!(
            err.kind(),
            ErrorKind::Configuration | ErrorKind::Data
        );
        Self {
            message: err.to_string(),
            permanent,
            cause: Some(Arc::new(err)),
        }
    }
}

impl From<String> for JobFailure {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for JobFailure {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_serialize_screaming_snake() {
        let s = serde_json::to_string(&RuntimeCode::RateLimit).unwrap();
        assert_eq!(s, "\"RATE_LIMIT\"");
        assert_eq!(DataCode::PayloadTooLarge.to_string(), "PAYLOAD_TOO_LARGE");
    }

    #[test]
    fn only_runtime_errors_are_retryable() {
        assert!(QueueError::runtime(RuntimeCode::Connection, true, "down").is_retryable());
        assert!(!QueueError::runtime(RuntimeCode::Processing, false, "x").is_retryable());
        assert!(!QueueError::data(DataCode::Duplicate, "dup").is_retryable());
        assert!(!QueueError::not_found("gone").is_retryable());
    }

    #[test]
    fn cause_is_exposed_as_source() {
        let io = std::io::Error::other("boom");
        let err = QueueError::runtime(RuntimeCode::Processing, false, "wrapped")
            .with_cause(Arc::new(io));
        let source = StdError::source(&err).expect("source");
        assert_eq!(source.to_string(), "boom");
    }

    #[test]
    fn source_downcasts_to_the_wrapped_type() {
        let io = std::io::Error::from(std::io::ErrorKind::TimedOut);
        let failure = JobFailure::from_error(io);
        let source = StdError::source(&failure).expect("source");
        assert_eq!(
            source.downcast_ref::<std::io::Error>().map(|e| e.kind()),
            Some(std::io::ErrorKind::TimedOut)
        );

        let inner = QueueError::runtime(RuntimeCode::RateLimit, true, "slow down");
        let failure = JobFailure::from(inner);
        let source = StdError::source(&failure).expect("source");
        assert!(source.downcast_ref::<QueueError>().is_some());
    }

    #[test]
    fn error_info_projection() {
        let info = QueueError::data(DataCode::Duplicate, "job 1 exists").info();
        assert_eq!(info.kind, ErrorKind::Data);
        assert_eq!(info.code.as_deref(), Some("DUPLICATE"));
        assert!(!info.retryable);

        let v = serde_json::to_value(&info).unwrap();
        assert_eq!(v["kind"], "data");
    }

    #[test]
    fn data_errors_become_permanent_failures() {
        let failure = JobFailure::from(QueueError::data(DataCode::Serialization, "bad"));
        assert!(failure.is_permanent());

        let failure = JobFailure::from(QueueError::runtime(RuntimeCode::Timeout, true, "slow"));
        assert!(!failure.is_permanent());
    }
}
