//! Function-execution sandbox: catalog, safety guards, gated executor,
//! and host side effects.

pub mod catalog;
pub mod executor;
pub mod guards;
pub mod host;

pub use catalog::{FunctionCatalog, FunctionDef};
pub use executor::{
    ConfirmationRequest, ExecutionOutcome, FunctionExecutor, error_payload, validate_args,
};
pub use guards::WindowAction;

/// Typed failure of a function call. Every variant is surfaced to the
/// backend as a tool-result error; the session continues.
#[derive(Debug, thiserror::Error)]
pub enum FunctionError {
    /// The name is in the configured blocked set.
    #[error("function '{0}' is blocked by policy")]
    Blocked(String),

    /// The name is not in the catalog.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// Arguments failed schema validation.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Path resolves outside the allowed base directories.
    #[error("path not permitted: {0}")]
    PathDenied(String),

    /// URL scheme or host is not permitted.
    #[error("url not permitted: {0}")]
    UrlDenied(String),

    /// Shell command failed the read-only filter.
    #[error("command not permitted: {0}")]
    CommandDenied(String),

    /// Application is not in the launch whitelist.
    #[error("application not whitelisted: {0}")]
    AppDenied(String),

    /// The user (or the absence of a confirmation channel) denied the call.
    #[error("not approved: {0}")]
    NotApproved(String),

    /// The host side effect failed.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The spawned process exceeded its wall-clock budget.
    #[error("execution timed out after {0}s")]
    Timeout(u64),
}

impl FunctionError {
    /// Stable snake_case code, safe to match on programmatically.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Blocked(_) => "blocked",
            Self::UnknownFunction(_) => "unknown_function",
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::PathDenied(_) => "path_denied",
            Self::UrlDenied(_) => "url_denied",
            Self::CommandDenied(_) => "command_denied",
            Self::AppDenied(_) => "app_denied",
            Self::NotApproved(_) => "not_approved",
            Self::Execution(_) => "execution_failed",
            Self::Timeout(_) => "timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_snake_case_and_distinct() {
        let errors = [
            FunctionError::Blocked("x".into()),
            FunctionError::UnknownFunction("x".into()),
            FunctionError::InvalidArguments("x".into()),
            FunctionError::PathDenied("x".into()),
            FunctionError::UrlDenied("x".into()),
            FunctionError::CommandDenied("x".into()),
            FunctionError::AppDenied("x".into()),
            FunctionError::NotApproved("x".into()),
            FunctionError::Execution("x".into()),
            FunctionError::Timeout(30),
        ];
        let mut seen = std::collections::HashSet::new();
        for err in &errors {
            let code = err.code();
            assert!(
                code.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "code {code:?} is not snake_case"
            );
            assert!(seen.insert(code), "duplicate code {code:?}");
        }
    }
}
