//! Error classification for retry decisions.
//!
//! Worker and LLM failures are split into retryable (transient network /
//! rate-limit / known flaky exit codes) and permanent. The agent loop and
//! the worker-review path both consult this table.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Permanent,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::Retryable => write!(f, "retryable"),
            ErrorClass::Permanent => write!(f, "permanent"),
        }
    }
}

/// Substrings that mark a transient failure. Matched case-insensitively.
const RETRYABLE_PATTERNS: &[&str] = &[
    "connection reset",
    "connection refused",
    "broken pipe",
    "unexpected eof",
    "eof",
    "i/o timeout",
    "timed out",
    "timeout",
    "temporary failure",
    "no such host",
    "dns",
    "rate limit",
    "rate_limit",
    "too many requests",
    "overloaded",
    "overloaded_error",
    "service unavailable",
    "status 429",
    "status 500",
    "status 502",
    "status 503",
    "status 529",
];

/// Exit codes conventionally produced by transient infrastructure trouble
/// (SIGKILL from an OOM killer, SIGTERM from a supervisor).
const RETRYABLE_EXIT_CODES: &[i32] = &[137, 143];

/// Classify an error message alone.
pub fn classify_message(message: &str) -> ErrorClass {
    let lower = message.to_ascii_lowercase();
    if RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p)) {
        ErrorClass::Retryable
    } else {
        ErrorClass::Permanent
    }
}

/// Classify a worker failure from its message and exit code.
pub fn classify_with_exit_code(message: &str, exit_code: Option<i32>) -> ErrorClass {
    if let Some(code) = exit_code {
        if RETRYABLE_EXIT_CODES.contains(&code) {
            return ErrorClass::Retryable;
        }
    }
    classify_message(message)
}

/// Whether an HTTP status from an LLM provider warrants a retry.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 529)
}
