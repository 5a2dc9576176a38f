//! Error Mapper: backend failures -> [`QueueError`].
//!
//! Classification is an ordered rule list that always ends in a default, so
//! it is total and new backend error types degrade to the conservative
//! default instead of slipping through unmapped.
//!
//! Order:
//! 1. errors that already are `QueueError` pass through
//! 2. adapter-registered structural rules (downcast to a native SDK type)
//! 3. built-in structural rules (`serde_json::Error`, tokio `Elapsed`)
//! 4. system-level codes (`io::ErrorKind`, `BackendFailure` code / status)
//! 5. case-insensitive message patterns
//! 6. default: runtime / PROCESSING, not retryable

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::sync::Arc;

use super::errors::{
    BoxError, Cause, ConfigurationCode, DataCode, JobFailure, QueueError, RuntimeCode,
    cause_source,
};

/// Generic carrier for adapters whose SDK only exposes a message, a code
/// string and/or an HTTP-style status.
#[derive(Debug, Clone)]
pub struct BackendFailure {
    message: String,
    code: Option<String>,
    status: Option<u16>,
    cause: Option<Cause>,
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl StdError for BackendFailure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        cause_source(&self.cause)
    }
}

impl BackendFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            status: None,
            cause: None,
        }
    }

    /// System or driver code, e.g. `ECONNREFUSED` or SQLSTATE `23505`.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_cause(mut self, cause: Cause) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }
}

type StructuralRule =
    Arc<dyn Fn(&(dyn StdError + 'static)) -> Option<QueueError> + Send + Sync>;

/// Message pattern: any needle matching selects the builder.
struct MessagePattern {
    needles: &'static [&'static str],
    build: fn(String) -> QueueError,
}

const MESSAGE_PATTERNS: &[MessagePattern] = &[
    MessagePattern {
        needles: &["queue does not exist", "no such queue", "queue not found"],
        build: |m| QueueError::configuration(ConfigurationCode::QueueNotFound, m),
    },
    MessagePattern {
        needles: &["already exists", "duplicate"],
        build: |m| QueueError::data(DataCode::Duplicate, m),
    },
    MessagePattern {
        needles: &[
            "connection refused",
            "econnrefused",
            "connection reset",
            "econnreset",
            "not connected",
            "broken pipe",
        ],
        build: |m| QueueError::runtime(RuntimeCode::Connection, true, m),
    },
    MessagePattern {
        needles: &["timed out", "timeout", "etimedout"],
        build: |m| QueueError::runtime(RuntimeCode::Timeout, true, m),
    },
    MessagePattern {
        needles: &["rate limit", "too many requests", "throttl"],
        build: |m| QueueError::runtime(RuntimeCode::RateLimit, true, m),
    },
    MessagePattern {
        needles: &["stalled"],
        build: |m| QueueError::runtime(RuntimeCode::Processing, true, m),
    },
    MessagePattern {
        needles: &["lock"],
        build: |m| QueueError::runtime(RuntimeCode::Processing, false, m),
    },
    MessagePattern {
        needles: &["script"],
        build: |m| QueueError::runtime(RuntimeCode::Processing, false, m),
    },
    MessagePattern {
        needles: &["serializ", "deserializ", "invalid json"],
        build: |m| QueueError::data(DataCode::Serialization, m),
    },
    MessagePattern {
        needles: &["not found", "does not exist"],
        build: QueueError::not_found,
    },
];

/// Total classification function from arbitrary errors to [`QueueError`].
#[derive(Clone, Default)]
pub struct ErrorMapper {
    structural: Vec<StructuralRule>,
}

impl fmt::Debug for ErrorMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorMapper")
            .field("structural_rules", &self.structural.len())
            .finish()
    }
}

impl ErrorMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule for a native error type `E`.
    ///
    /// Rules run in registration order, before every built-in rule except
    /// the `QueueError` pass-through. Returning `None` defers to later rules.
    pub fn with_structural<E, F>(mut self, rule: F) -> Self
    where
        E: StdError + 'static,
        F: Fn(&E) -> Option<QueueError> + Send + Sync + 'static,
    {
        self.structural.push(Arc::new(move |err: &(dyn StdError + 'static)| {
            err.downcast_ref::<E>().and_then(&rule)
        }));
        self
    }

    /// Classify an owned error and attach it as the cause.
    pub fn map(&self, err: impl Into<BoxError>) -> QueueError {
        let cause: Cause = Arc::from(err.into());
        if let Some(already) = cause.downcast_ref::<QueueError>() {
            return already.clone();
        }
        self.classify(cause.as_ref()).with_cause(cause)
    }

    /// Classify a handler failure for reporting; the failure itself is what
    /// the adapter's retry engine receives.
    pub fn map_failure(&self, failure: &JobFailure) -> QueueError {
        self.map(failure.clone())
    }

    /// Classify without attaching a cause.
    pub fn classify(&self, err: &(dyn StdError + 'static)) -> QueueError {
        let mapped = self.classify_inner(err);
        tracing::debug!(
            kind = ?mapped.kind(),
            code = mapped.code().unwrap_or("-"),
            retryable = mapped.is_retryable(),
            "classified backend error: {err}"
        );
        mapped
    }

    fn classify_inner(&self, err: &(dyn StdError + 'static)) -> QueueError {
        // 1. pass-through, anywhere in the chain
        for e in chain(err) {
            if let Some(q) = e.downcast_ref::<QueueError>() {
                return q.clone();
            }
        }

        // 2. adapter structural rules
        for e in chain(err) {
            for rule in &self.structural {
                if let Some(q) = rule(e) {
                    return q;
                }
            }
        }

        let message = err.to_string();

        // 3. built-in structural rules
        for e in chain(err) {
            if e.downcast_ref::<serde_json::Error>().is_some() {
                return QueueError::data(DataCode::Serialization, message);
            }
            if e.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
                return QueueError::runtime(RuntimeCode::Timeout, true, message);
            }
        }

        // 4. system-level codes
        for e in chain(err) {
            if let Some(io) = e.downcast_ref::<io::Error>()
                && let Some(q) = from_io_kind(io.kind(), &message)
            {
                return q;
            }
            if let Some(bf) = e.downcast_ref::<BackendFailure>() {
                if let Some(q) = bf.code().and_then(|c| from_system_code(c, &message)) {
                    return q;
                }
                if let Some(q) = bf.status().and_then(|s| from_status(s, &message)) {
                    return q;
                }
            }
        }

        // 5. message patterns over the whole chain text
        let haystack = chain(err)
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join(": ")
            .to_lowercase();
        for pattern in MESSAGE_PATTERNS {
            if pattern.needles.iter().any(|n| haystack.contains(n)) {
                return (pattern.build)(message);
            }
        }

        // 6. unknown failure modes are never retried automatically
        QueueError::runtime(RuntimeCode::Processing, false, message)
    }
}

fn chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |&e| e.source())
}

fn from_io_kind(kind: io::ErrorKind, message: &str) -> Option<QueueError> {
    use io::ErrorKind::*;
    let q = match kind {
        ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected | BrokenPipe => {
            QueueError::runtime(RuntimeCode::Connection, true, message)
        }
        TimedOut => QueueError::runtime(RuntimeCode::Timeout, true, message),
        AlreadyExists => QueueError::data(DataCode::Duplicate, message),
        _ => return None,
    };
    Some(q)
}

fn from_system_code(code: &str, message: &str) -> Option<QueueError> {
    let q = match code.to_ascii_uppercase().as_str() {
        "ECONNREFUSED" | "ECONNRESET" | "ECONNABORTED" | "ENOTCONN" | "EPIPE" | "EHOSTUNREACH" => {
            QueueError::runtime(RuntimeCode::Connection, true, message)
        }
        "ETIMEDOUT" | "ESOCKETTIMEDOUT" => QueueError::runtime(RuntimeCode::Timeout, true, message),
        // SQLSTATE unique_violation
        "23505" | "EEXIST" => QueueError::data(DataCode::Duplicate, message),
        _ => return None,
    };
    Some(q)
}

fn from_status(status: u16, message: &str) -> Option<QueueError> {
    let q = match status {
        404 => QueueError::not_found(message),
        409 => QueueError::data(DataCode::Duplicate, message),
        408 | 504 => QueueError::runtime(RuntimeCode::Timeout, true, message),
        413 => QueueError::data(DataCode::PayloadTooLarge, message),
        429 => QueueError::runtime(RuntimeCode::RateLimit, true, message),
        502 | 503 => QueueError::runtime(RuntimeCode::Connection, true, message),
        _ => return None,
    };
    Some(q)
}
