//! Error types for the sandbox layer.

use serde::{Deserialize, Serialize};

use super::capability::Capability;

/// Errors produced by gated calls, the search engine, flow combinators and
/// script runs.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SandboxError {
    #[error("capability denied: '{capability}' was not declared for this run")]
    CapabilityDenied { capability: Capability },

    #[error("budget exceeded: '{capability}' is limited to {limit} call(s) per run")]
    BudgetExceeded { capability: Capability, limit: u32 },

    #[error("timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("path not found after {iterations} iteration(s): {reason}")]
    PathNotFound { iterations: usize, reason: String },

    #[error("agent disconnected: {0}")]
    Disconnected(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("operation failed: {0}")]
    OperationFailed(String),

    #[error("script error: {0}")]
    ScriptError(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid sandbox configuration: {0}")]
    InvalidConfig(String),
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SandboxError::CapabilityDenied { .. } => ErrorKind::CapabilityDenied,
            SandboxError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            SandboxError::Timeout { .. } => ErrorKind::Timeout,
            SandboxError::PathNotFound { .. } => ErrorKind::PathNotFound,
            SandboxError::Disconnected(_) => ErrorKind::Disconnected,
            SandboxError::Precondition(_) => ErrorKind::Precondition,
            SandboxError::OperationFailed(_) => ErrorKind::OperationFailed,
            SandboxError::ScriptError(_) => ErrorKind::ScriptError,
            SandboxError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            SandboxError::InvalidConfig(_) => ErrorKind::InvalidConfig,
        }
    }

    pub fn to_record(&self) -> ErrorRecord {
        ErrorRecord {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Stable, serializable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CapabilityDenied,
    BudgetExceeded,
    Timeout,
    PathNotFound,
    Disconnected,
    Precondition,
    OperationFailed,
    ScriptError,
    InvalidArgument,
    InvalidConfig,
    /// The script completed through `fail(...)`.
    Failed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CapabilityDenied => "capability_denied",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::Timeout => "timeout",
            ErrorKind::PathNotFound => "path_not_found",
            ErrorKind::Disconnected => "disconnected",
            ErrorKind::Precondition => "precondition",
            ErrorKind::OperationFailed => "operation_failed",
            ErrorKind::ScriptError => "script_error",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            ErrorKind::CapabilityDenied,
            ErrorKind::BudgetExceeded,
            ErrorKind::Timeout,
            ErrorKind::PathNotFound,
            ErrorKind::Disconnected,
            ErrorKind::Precondition,
            ErrorKind::OperationFailed,
            ErrorKind::ScriptError,
            ErrorKind::InvalidArgument,
            ErrorKind::InvalidConfig,
            ErrorKind::Failed,
        ]
        .into_iter()
        .find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error as carried in results and script-visible outcomes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<SandboxError> for ErrorRecord {
    fn from(err: SandboxError) -> Self {
        err.to_record()
    }
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_exceeded_display() {
        let err = SandboxError::BudgetExceeded {
            capability: Capability::Dig,
            limit: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains("dig"));
        assert!(msg.contains('3'));
        assert_eq!(err.kind(), ErrorKind::BudgetExceeded);
    }

    #[test]
    fn test_record_carries_kind_and_message() {
        let record = SandboxError::Precondition("expected stone, found dirt".into()).to_record();
        assert_eq!(record.kind, ErrorKind::Precondition);
        assert!(record.message.contains("found dirt"));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "precondition");
    }

    #[test]
    fn test_kind_parse_matches_as_str() {
        for kind in [ErrorKind::Timeout, ErrorKind::ScriptError, ErrorKind::Failed] {
            assert_eq!(ErrorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ErrorKind::parse("nope"), None);
    }
}
