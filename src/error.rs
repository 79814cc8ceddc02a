use thiserror::Error;

/// Convenience alias for `Result<T, ArbiterError>`.
pub type Result<T> = std::result::Result<T, ArbiterError>;

/// Stable error taxonomy shared by every component.
///
/// This is the `kind`, not the type: every [`ArbiterError`] carries one of
/// these so callers can branch on propagation policy (retry, surface,
/// audit) without matching on display text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Unauthorized,
    Forbidden,
    RateLimited,
    NotFound,
    Conflict,
    Unavailable,
    Timeout,
    Exhausted,
    Internal,
}

impl ErrorKind {
    /// Errors on idempotent operations that C1 is allowed to retry.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Unavailable | ErrorKind::Timeout)
    }
}

#[derive(Error, Debug)]
pub enum ArbiterError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("retry budget exhausted after {attempts} attempts: {last_cause}")]
    Exhausted { attempts: u32, last_cause: String },

    #[error("internal error ({correlation_id}): {message}")]
    Internal {
        correlation_id: String,
        message: String,
    },

    #[error("queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("no eligible agent for task {task_id}")]
    NoEligibleAgent { task_id: String },

    #[error("agent {0} is gone")]
    AgentGone(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    ConfigLoad(#[from] config::ConfigError),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ArbiterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArbiterError::Validation(_) => ErrorKind::Validation,
            ArbiterError::Unauthorized => ErrorKind::Unauthorized,
            ArbiterError::Forbidden(_) => ErrorKind::Forbidden,
            ArbiterError::RateLimited { .. } => ErrorKind::RateLimited,
            ArbiterError::NotFound(_) => ErrorKind::NotFound,
            ArbiterError::Conflict(_) => ErrorKind::Conflict,
            ArbiterError::Unavailable(_) => ErrorKind::Unavailable,
            ArbiterError::Timeout(_) => ErrorKind::Timeout,
            ArbiterError::Exhausted { .. } => ErrorKind::Exhausted,
            ArbiterError::QueueFull { .. } => ErrorKind::Validation,
            ArbiterError::NoEligibleAgent { .. } => ErrorKind::Unavailable,
            ArbiterError::AgentGone(_) => ErrorKind::NotFound,
            ArbiterError::Configuration(_)
            | ArbiterError::ConfigLoad(_)
            | ArbiterError::Serialization(_)
            | ArbiterError::Io(_)
            | ArbiterError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Short stable code suitable for API responses and audit entries.
    pub fn code(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Validation => "validation",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Exhausted => "exhausted",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn internal(correlation_id: impl Into<String>, message: impl Into<String>) -> Self {
        ArbiterError::Internal {
            correlation_id: correlation_id.into(),
            message: message.into(),
        }
    }
}
