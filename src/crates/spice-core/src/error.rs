//! Error types and retry classification for graph execution
//!
//! All node and tool operations return `Result<T, SpiceError>`; exceptions
//! from foreign code are converted at the boundary (`SpiceError::from_std`)
//! into typed errors. The retry supervisor classifies errors through
//! [`SpiceError::is_retryable`] and [`SpiceError::retry_after_hint`]:
//!
//! - Retryable: `Retryable`, `Network` with status 408/429/5xx (or no
//!   status), `Timeout`, `RateLimit`, `Tool` with a retryable status
//! - Non-retryable: other 4xx, `Validation`, `Authentication`,
//!   `Configuration`, and anything hinted with `skip_retry`

use crate::state::ExecutionState;
use std::time::Duration;
use thiserror::Error;

/// Convenience result type using [`SpiceError`]
pub type Result<T> = std::result::Result<T, SpiceError>;

/// Explicit retry guidance attached to an error
///
/// A hint overrides classification: `skip_retry` forces failure even for a
/// transient error, and `retry_after` replaces the computed backoff delay.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RetryHint {
    pub skip_retry: bool,
    pub retry_after: Option<Duration>,
}

/// Error taxonomy for graph construction and execution
#[derive(Error, Debug)]
pub enum SpiceError {
    /// Graph structure or input validation failed (non-retryable)
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Credentials missing or rejected (non-retryable)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Graph or node configuration is invalid (non-retryable)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Transient failure with no further structure
    #[error("Retryable error: {0}")]
    Retryable(String),

    /// Network-level failure; retryability depends on the status code
    #[error("Network error{}: {message}", status_code.map(|c| format!(" (status {})", c)).unwrap_or_default())]
    Network {
        status_code: Option<u16>,
        message: String,
    },

    /// Operation exceeded its time budget
    #[error("Operation timed out after {duration_ms}ms: {operation}")]
    Timeout { operation: String, duration_ms: u64 },

    /// Rate limited by an upstream; `retry_after_ms` is honored by backoff
    #[error("Rate limited: {message}")]
    RateLimit {
        retry_after_ms: Option<u64>,
        message: String,
    },

    /// Tool invocation failed; retryability inferred from the status
    #[error("Tool '{tool_name}' failed{}: {message}", status.map(|c| format!(" (status {})", c)).unwrap_or_default())]
    Tool {
        tool_name: String,
        status: Option<u16>,
        message: String,
    },

    /// Terminal wrapper around an exhausted retry or non-retryable failure
    #[error("Execution failed after {total_attempts} attempt(s): {message}")]
    Execution {
        message: String,
        retries_exhausted: bool,
        total_attempts: u32,
        last_status_code: Option<u16>,
        elapsed_ms: u64,
    },

    /// State-machine violation
    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: ExecutionState,
        to: ExecutionState,
    },

    /// Subgraph recursion exceeded its depth ceiling
    #[error("Subgraph depth {depth} exceeds maximum {max_depth}")]
    DepthExceeded { depth: u32, max_depth: u32 },

    /// A node was revisited in a graph that disallows cycles
    #[error("Cycle detected: node '{node}' already executed in this run")]
    CycleDetected { node: String },

    /// Strict dynamic tool resolution found no tool
    #[error("Tool resolver found no tool named '{tool}'")]
    ResolverMissing { tool: String },

    /// Another attempt holds the idempotency claim for this operation
    #[error("Concurrent attempt in flight for fingerprint {fingerprint}")]
    ConcurrentAttempt { fingerprint: String },

    /// The run was cancelled
    #[error("Run cancelled")]
    Cancelled,

    /// Checkpoint or idempotency storage failure
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] spice_checkpoint::CheckpointError),

    /// Event-plane failure
    #[error("Event bus error: {0}")]
    Event(#[from] spice_events::EventBusError),

    /// Snapshot (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error carrying an explicit retry hint
    #[error("{source}")]
    Hinted {
        hint: RetryHint,
        #[source]
        source: Box<SpiceError>,
    },

    /// Application-defined error (non-retryable by default)
    #[error("{0}")]
    Custom(String),
}

impl SpiceError {
    /// Attach a retry hint to this error
    pub fn with_hint(self, hint: RetryHint) -> Self {
        Self::Hinted {
            hint,
            source: Box::new(self),
        }
    }

    /// Shorthand for hinting that retries must be skipped
    pub fn skip_retry(self) -> Self {
        self.with_hint(RetryHint {
            skip_retry: true,
            retry_after: None,
        })
    }

    /// Convert a foreign error into a typed error at the boundary
    ///
    /// I/O errors with connection-flavored kinds become transient network
    /// errors; timeouts become `Timeout`; everything else is `Custom`.
    pub fn from_std(error: &(dyn std::error::Error + 'static)) -> Self {
        if let Some(io) = error.downcast_ref::<std::io::Error>() {
            return Self::from(std::io::Error::new(io.kind(), io.to_string()));
        }
        Self::Custom(error.to_string())
    }

    fn status_is_retryable(status: u16) -> bool {
        matches!(status, 408 | 429) || (500..=599).contains(&status)
    }

    /// Whether the retry supervisor may re-attempt after this error
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Hinted { hint, source } => {
                if hint.skip_retry {
                    return false;
                }
                source.is_retryable()
            }
            Self::Retryable(_) => true,
            Self::Timeout { .. } => true,
            Self::RateLimit { .. } => true,
            Self::Network { status_code, .. } => {
                status_code.map(Self::status_is_retryable).unwrap_or(true)
            }
            Self::Tool { status, .. } => status.map(Self::status_is_retryable).unwrap_or(false),
            Self::ConcurrentAttempt { .. } => true,
            _ => false,
        }
    }

    /// Upstream-supplied delay overriding computed backoff, if any
    pub fn retry_after_hint(&self) -> Option<Duration> {
        match self {
            Self::Hinted { hint, source } => hint.retry_after.or_else(|| source.retry_after_hint()),
            Self::RateLimit { retry_after_ms, .. } => retry_after_ms.map(Duration::from_millis),
            _ => None,
        }
    }

    /// HTTP-style status code carried by this error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Hinted { source, .. } => source.status_code(),
            Self::Network { status_code, .. } => *status_code,
            Self::Tool { status, .. } => *status,
            Self::Execution {
                last_status_code, ..
            } => *last_status_code,
            _ => None,
        }
    }
}

impl From<std::io::Error> for SpiceError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match error.kind() {
            ErrorKind::TimedOut => Self::Timeout {
                operation: error.to_string(),
                duration_ms: 0,
            },
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::AddrNotAvailable
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => Self::Network {
                status_code: None,
                message: error.to_string(),
            },
            _ => Self::Custom(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_status_classification() {
        let retryable = [408u16, 429, 500, 502, 599];
        for status in retryable {
            let err = SpiceError::Network {
                status_code: Some(status),
                message: "upstream".into(),
            };
            assert!(err.is_retryable(), "status {} should retry", status);
        }

        let terminal = [400u16, 401, 403, 404, 422];
        for status in terminal {
            let err = SpiceError::Network {
                status_code: Some(status),
                message: "upstream".into(),
            };
            assert!(!err.is_retryable(), "status {} should not retry", status);
        }

        // No status at all (connection-level failure) is transient.
        assert!(SpiceError::Network {
            status_code: None,
            message: "refused".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_tool_errors_default_non_retryable() {
        let no_status = SpiceError::Tool {
            tool_name: "search".into(),
            status: None,
            message: "boom".into(),
        };
        assert!(!no_status.is_retryable());

        let server_side = SpiceError::Tool {
            tool_name: "search".into(),
            status: Some(503),
            message: "unavailable".into(),
        };
        assert!(server_side.is_retryable());
    }

    #[test]
    fn test_skip_retry_hint_wins() {
        let err = SpiceError::Retryable("flaky".into()).skip_retry();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rate_limit_carries_retry_after() {
        let err = SpiceError::RateLimit {
            retry_after_ms: Some(1500),
            message: "slow down".into(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.retry_after_hint(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_io_errors_map_to_transient_variants() {
        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(SpiceError::from(refused).is_retryable());

        let timeout = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow");
        let converted = SpiceError::from(timeout);
        assert!(matches!(converted, SpiceError::Timeout { .. }));
        assert!(converted.is_retryable());

        let perm = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(!SpiceError::from(perm).is_retryable());
    }
}
