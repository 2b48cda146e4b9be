use serde::{Deserialize, Serialize};

/// Classification of orchestrator failures. Drives retry policy, error-handler
/// matching, and the status code the API layer maps the failure to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Malformed IR or bad input variables.
    Validation,
    /// No registered agent or tool can handle the (channel, action) pair.
    NoExecutor,
    /// HTTP transport failure, non-2xx status, or a bad response envelope.
    Dispatch,
    /// The agent answered with `status = "error"`.
    AgentError,
    /// Token bucket could not yield a token before the deadline.
    RateLimit,
    /// Resource lease could not be acquired within the wait budget.
    LeaseTimeout,
    Cancelled,
    ApprovalTimeout,
    /// Bug or unexpected condition.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NoExecutor => "no-executor",
            ErrorKind::Dispatch => "dispatch",
            ErrorKind::AgentError => "agent-error",
            ErrorKind::RateLimit => "rate-limit",
            ErrorKind::LeaseTimeout => "lease-timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ApprovalTimeout => "approval-timeout",
            ErrorKind::Internal => "internal",
        }
    }

    /// Kinds that the per-step retry loop is allowed to wrap. `validation`
    /// and `no-executor` are deterministic; retrying them cannot help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Dispatch
                | ErrorKind::AgentError
                | ErrorKind::RateLimit
                | ErrorKind::LeaseTimeout
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator error: a kind plus a human-readable message.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct OrchError {
    pub kind: ErrorKind,
    pub message: String,
}

impl OrchError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn no_executor(channel: &str, action: &str) -> Self {
        Self::new(
            ErrorKind::NoExecutor,
            format!(
                "no executor registered for channel '{channel}', action '{action}'; \
                 register an agent for this channel"
            ),
        )
    }

    pub fn dispatch(action: &str, reason: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorKind::Dispatch,
            format!("action '{action}' failed: {reason}"),
        )
    }

    pub fn agent(action: &str, reason: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorKind::AgentError,
            format!("agent reported error for action '{action}': {reason}"),
        )
    }

    pub fn rate_limit(key: &str) -> Self {
        Self::new(
            ErrorKind::RateLimit,
            format!("rate limit exceeded for '{key}': max_requests_per_minute reached"),
        )
    }

    pub fn lease_timeout(resource_key: &str) -> Self {
        Self::new(
            ErrorKind::LeaseTimeout,
            format!("could not acquire lease on '{resource_key}' within the wait budget"),
        )
    }

    pub fn cancelled(run_id: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::Cancelled, format!("run {run_id} was cancelled"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<anyhow::Error> for OrchError {
    fn from(err: anyhow::Error) -> Self {
        OrchError::internal(format!("{err:#}"))
    }
}

pub type OrchResult<T> = Result<T, OrchError>;
