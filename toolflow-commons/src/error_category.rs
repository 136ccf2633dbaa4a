//! Canonical failure taxonomy used for every retry decision in toolflow.
//!
//! Shell commands, provider turns, and custom tool handlers all report their
//! failures through [`ErrorCategory`] so a single retry loop can decide what
//! to do next without knowing where the failure came from.
//!
//! # Error Categories
//!
//! Failures are split into **retryable** (transient) and **non-retryable**
//! (permanent) groups. [`ErrorCategory::Unknown`] sits in the retryable group:
//! an unclassified failure gets the benefit of the doubt.
//!
//! # Classification Order
//!
//! - Typed information wins over text: process exit codes and timeout flags
//!   are checked before stderr, HTTP status codes before provider messages.
//! - Marker groups are checked in priority order so overlapping patterns
//!   resolve deterministically (e.g. "504 gateway timeout" is a server
//!   failure, not a timeout).

use std::borrow::Cow;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

/// Canonical failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    // === Retryable (Transient) ===
    /// Connection reset, DNS failure, refused connection.
    Network,
    /// The attempt exceeded its deadline and was terminated.
    Timeout,
    /// HTTP 429 or provider throttling.
    RateLimit,
    /// HTTP 5xx or an overloaded upstream.
    ServiceUnavailable,

    // === Non-Retryable (Permanent) ===
    /// Invalid credentials, 401/403, OS permission denial.
    Authentication,
    /// Malformed input or another 4xx-style client error.
    InvalidRequest,
    /// The shell could not find the program (exit code 127).
    CommandNotFound,
    /// Rejected by the command policy before execution.
    PolicyDenied,
    /// Cancelled by the caller.
    Cancelled,

    // === Unclassified ===
    /// Nothing matched; treated as transient.
    Unknown,
}

impl ErrorCategory {
    /// Whether a failure in this category may be retried.
    #[inline]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::RateLimit
                | ErrorCategory::ServiceUnavailable
                | ErrorCategory::Unknown
        )
    }

    /// Stable machine-readable identifier, used in events and context records.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::ServiceUnavailable => "service_unavailable",
            ErrorCategory::Authentication => "authentication",
            ErrorCategory::InvalidRequest => "invalid_request",
            ErrorCategory::CommandNotFound => "command_not_found",
            ErrorCategory::PolicyDenied => "policy_denied",
            ErrorCategory::Cancelled => "cancelled",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Concise, user-facing label.
    pub const fn user_label(&self) -> &'static str {
        match self {
            ErrorCategory::Network => "Network error",
            ErrorCategory::Timeout => "Timed out",
            ErrorCategory::RateLimit => "Rate limit exceeded",
            ErrorCategory::ServiceUnavailable => "Service temporarily unavailable",
            ErrorCategory::Authentication => "Authentication failed",
            ErrorCategory::InvalidRequest => "Invalid request",
            ErrorCategory::CommandNotFound => "Command not found",
            ErrorCategory::PolicyDenied => "Blocked by policy",
            ErrorCategory::Cancelled => "Operation cancelled",
            ErrorCategory::Unknown => "Execution failed",
        }
    }

    /// Recovery hints shown next to a failed flow.
    pub fn recovery_suggestions(&self) -> Vec<Cow<'static, str>> {
        match self {
            ErrorCategory::Network => vec![
                Cow::Borrowed("Check network connectivity"),
                Cow::Borrowed("Verify the remote host is reachable"),
            ],
            ErrorCategory::Timeout => vec![
                Cow::Borrowed("Increase timeoutMs for this step"),
                Cow::Borrowed("Break the command into smaller pieces"),
            ],
            ErrorCategory::RateLimit => vec![
                Cow::Borrowed("Raise delayMs or maxAttempts in the retry block"),
                Cow::Borrowed("Reduce request frequency"),
            ],
            ErrorCategory::ServiceUnavailable => vec![
                Cow::Borrowed("The service is temporarily unavailable"),
                Cow::Borrowed("Retry after a brief delay"),
            ],
            ErrorCategory::Authentication => vec![
                Cow::Borrowed("Verify your API key or credentials"),
                Cow::Borrowed("Check file and directory permissions"),
            ],
            ErrorCategory::InvalidRequest => vec![
                Cow::Borrowed("Check the step arguments against the tool's expectations"),
            ],
            ErrorCategory::CommandNotFound => vec![
                Cow::Borrowed("Verify the program is installed and on PATH"),
                Cow::Borrowed("Check the spelling of the command"),
            ],
            ErrorCategory::PolicyDenied => vec![
                Cow::Borrowed("Review the [policy] deny patterns in toolflow.toml"),
            ],
            ErrorCategory::Cancelled => vec![Cow::Borrowed("The operation was cancelled")],
            ErrorCategory::Unknown => vec![Cow::Borrowed("Review stderr for details")],
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.user_label())
    }
}

// ---------------------------------------------------------------------------
// Classify shell command outcomes
// ---------------------------------------------------------------------------

/// Exit code POSIX shells use when the program could not be found.
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;
/// Exit code POSIX shells use when the program was found but is not executable.
pub const EXIT_NOT_EXECUTABLE: i32 = 126;

/// Classify a failed command attempt.
///
/// The timeout flag and well-known shell exit codes take priority; the
/// remaining cases fall back to scanning stderr, then stdout.
pub fn classify_exit(
    exit_code: Option<i32>,
    timed_out: bool,
    stderr: &str,
    stdout: &str,
) -> ErrorCategory {
    if timed_out {
        return ErrorCategory::Timeout;
    }

    match exit_code {
        Some(EXIT_COMMAND_NOT_FOUND) => return ErrorCategory::CommandNotFound,
        Some(EXIT_NOT_EXECUTABLE) => return ErrorCategory::Authentication,
        _ => {}
    }

    match classify_error_message(stderr) {
        ErrorCategory::Unknown => classify_error_message(stdout),
        category => category,
    }
}

/// Classify an `anyhow::Error` chain by its rendered message.
pub fn classify_anyhow_error(err: &anyhow::Error) -> ErrorCategory {
    classify_error_message(&format!("{err:#}"))
}

/// Classify an error message string into an [`ErrorCategory`].
pub fn classify_error_message(msg: &str) -> ErrorCategory {
    let msg = if msg.as_bytes().iter().any(|b| b.is_ascii_uppercase()) {
        Cow::Owned(msg.to_ascii_lowercase())
    } else {
        Cow::Borrowed(msg)
    };

    // --- Priority 1: Policy denials ---
    if contains_any(
        &msg,
        &["denied by policy", "blocked by policy", "policy violation"],
    ) {
        return ErrorCategory::PolicyDenied;
    }

    // --- Priority 2: Missing programs ---
    if contains_any(
        &msg,
        &[
            "command not found",
            "is not recognized as the name of a cmdlet",
            "is not recognized as an internal or external command",
        ],
    ) {
        return ErrorCategory::CommandNotFound;
    }

    // --- Priority 3: Authentication / Authorization ---
    if contains_any(
        &msg,
        &[
            "invalid api key",
            "authentication failed",
            "unauthorized",
            "invalid credentials",
            "forbidden",
            "permission denied",
            "access denied",
        ],
    ) {
        return ErrorCategory::Authentication;
    }

    // --- Priority 4: Cancellation ---
    if contains_any(&msg, &["cancelled", "canceled", "interrupted"]) {
        return ErrorCategory::Cancelled;
    }

    // --- Priority 5: Rate limiting (before general network) ---
    if contains_any(&msg, &["rate limit", "too many requests", "throttl"]) {
        return ErrorCategory::RateLimit;
    }

    // --- Priority 6: Server-side (before timeout, so 504 lands here) ---
    if contains_any(
        &msg,
        &[
            "internal server error",
            "bad gateway",
            "service unavailable",
            "gateway timeout",
            "overloaded",
        ],
    ) {
        return ErrorCategory::ServiceUnavailable;
    }

    // --- Priority 7: Network (before status codes; ports and hosts carry digits) ---
    if contains_any(
        &msg,
        &[
            "network",
            "connection reset",
            "connection refused",
            "could not resolve host",
            "name resolution",
            "dns",
            "broken pipe",
            "tls handshake",
            "temporarily unavailable",
            "try again",
            "econnreset",
            "etimedout",
        ],
    ) {
        return ErrorCategory::Network;
    }

    // --- Priority 8: HTTP status codes, only where a status is announced ---
    if let Some(status) = http_status(&msg) {
        return category_for_status(status);
    }

    // --- Priority 9: Client errors ---
    if contains_any(
        &msg,
        &[
            "bad request",
            "invalid argument",
            "invalid option",
            "unrecognized option",
            "malformed",
            "missing required",
        ],
    ) {
        return ErrorCategory::InvalidRequest;
    }

    // --- Priority 10: Timeout ---
    if contains_any(&msg, &["timeout", "timed out", "deadline exceeded"]) {
        return ErrorCategory::Timeout;
    }

    ErrorCategory::Unknown
}

/// `HTTP/1.1 503`, `status: 404`, `error 401`, `returned error: 429`.
static HTTP_STATUS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:https?/\d(?:\.\d)?|https?|status(?:\s+code)?|error|returned)\s*[:=]?\s*([45]\d\d)\b")
        .unwrap_or_else(|err| unreachable!("status pattern is valid: {err}"))
});

fn http_status(message: &str) -> Option<u16> {
    HTTP_STATUS
        .captures(message)
        .and_then(|captures| captures.get(1))
        .and_then(|status| status.as_str().parse().ok())
}

/// Category for an HTTP status code.
pub fn category_for_status(status: u16) -> ErrorCategory {
    match status {
        401 | 403 => ErrorCategory::Authentication,
        408 => ErrorCategory::Timeout,
        429 => ErrorCategory::RateLimit,
        500..=599 => ErrorCategory::ServiceUnavailable,
        400..=499 => ErrorCategory::InvalidRequest,
        _ => ErrorCategory::Unknown,
    }
}

#[inline]
fn contains_any(message: &str, markers: &[&str]) -> bool {
    markers.iter().any(|marker| message.contains(marker))
}

// ---------------------------------------------------------------------------
// Typed conversions from known error types
// ---------------------------------------------------------------------------

impl From<&crate::llm::LLMError> for ErrorCategory {
    fn from(err: &crate::llm::LLMError) -> Self {
        use crate::llm::LLMError;

        match err {
            LLMError::Authentication { .. } => ErrorCategory::Authentication,
            LLMError::RateLimit { .. } => ErrorCategory::RateLimit,
            LLMError::InvalidRequest { .. } => ErrorCategory::InvalidRequest,
            LLMError::Network { .. } => ErrorCategory::Network,
            LLMError::Cancelled => ErrorCategory::Cancelled,
            LLMError::Provider { message, metadata } => {
                match metadata.as_ref().and_then(|meta| meta.status).map(category_for_status) {
                    Some(ErrorCategory::Unknown) | None => classify_error_message(message),
                    Some(category) => category,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LLMError, LLMErrorMetadata};
    use pretty_assertions::assert_eq;

    #[test]
    fn exit_127_is_command_not_found() {
        assert_eq!(
            classify_exit(Some(127), false, "sh: 1: nope: not found", ""),
            ErrorCategory::CommandNotFound
        );
        assert!(!ErrorCategory::CommandNotFound.is_retryable());
    }

    #[test]
    fn timeout_flag_wins_over_stderr() {
        assert_eq!(
            classify_exit(None, true, "429 too many requests", ""),
            ErrorCategory::Timeout
        );
    }

    #[test]
    fn curl_rate_limit_signature() {
        assert_eq!(
            classify_exit(
                Some(22),
                false,
                "curl: (22) The requested URL returned error: 429",
                ""
            ),
            ErrorCategory::RateLimit
        );
    }

    #[test]
    fn stdout_is_consulted_when_stderr_is_silent() {
        assert_eq!(
            classify_exit(Some(1), false, "", "HTTP/1.1 503 Service Unavailable"),
            ErrorCategory::ServiceUnavailable
        );
    }

    #[test]
    fn gateway_timeout_is_server_side() {
        assert_eq!(
            classify_error_message("504 Gateway Timeout"),
            ErrorCategory::ServiceUnavailable
        );
    }

    #[test]
    fn network_errors() {
        assert_eq!(
            classify_error_message("curl: (6) Could not resolve host: example.invalid"),
            ErrorCategory::Network
        );
        assert_eq!(
            classify_error_message("connection reset by peer"),
            ErrorCategory::Network
        );
    }

    #[test]
    fn digits_in_ports_and_hosts_are_not_status_codes() {
        assert_eq!(
            classify_exit(
                Some(7),
                false,
                "curl: (7) Failed to connect to localhost port 4000 after 0 ms: Connection refused",
                ""
            ),
            ErrorCategory::Network
        );
        assert_eq!(
            classify_error_message("curl: (6) Could not resolve host: api401.example.com"),
            ErrorCategory::Network
        );
        assert_eq!(
            classify_error_message("fetch failed for build 5003 on runner 403b"),
            ErrorCategory::Unknown
        );
    }

    #[test]
    fn announced_status_codes_are_classified() {
        assert_eq!(classify_error_message("HTTP 401"), ErrorCategory::Authentication);
        assert_eq!(classify_error_message("status: 404"), ErrorCategory::InvalidRequest);
        assert_eq!(
            classify_error_message("upstream returned error 502"),
            ErrorCategory::ServiceUnavailable
        );
        assert_eq!(classify_error_message("Status Code 408"), ErrorCategory::Timeout);
    }

    #[test]
    fn powershell_missing_cmdlet() {
        assert_eq!(
            classify_error_message(
                "frob : The term 'frob' is not recognized as the name of a cmdlet"
            ),
            ErrorCategory::CommandNotFound
        );
    }

    #[test]
    fn client_errors_are_not_retryable() {
        let category = classify_error_message("400 Bad Request: malformed body");
        assert_eq!(category, ErrorCategory::InvalidRequest);
        assert!(!category.is_retryable());
    }

    #[test]
    fn unmatched_message_is_unknown_and_retryable() {
        let category = classify_error_message("something odd happened");
        assert_eq!(category, ErrorCategory::Unknown);
        assert!(category.is_retryable());
    }

    #[test]
    fn retryable_partition() {
        for category in [
            ErrorCategory::Network,
            ErrorCategory::Timeout,
            ErrorCategory::RateLimit,
            ErrorCategory::ServiceUnavailable,
            ErrorCategory::Unknown,
        ] {
            assert!(category.is_retryable(), "{category:?} should retry");
        }
        for category in [
            ErrorCategory::Authentication,
            ErrorCategory::InvalidRequest,
            ErrorCategory::CommandNotFound,
            ErrorCategory::PolicyDenied,
            ErrorCategory::Cancelled,
        ] {
            assert!(!category.is_retryable(), "{category:?} should not retry");
        }
    }

    #[test]
    fn llm_provider_status_codes() {
        let err = LLMError::Provider {
            message: "error".to_string(),
            metadata: Some(LLMErrorMetadata::new("openai", Some(503), None)),
        };
        assert_eq!(ErrorCategory::from(&err), ErrorCategory::ServiceUnavailable);

        let err = LLMError::Provider {
            message: "error".to_string(),
            metadata: Some(LLMErrorMetadata::new("openai", Some(404), None)),
        };
        assert_eq!(ErrorCategory::from(&err), ErrorCategory::InvalidRequest);
    }

    #[test]
    fn llm_typed_variants() {
        assert_eq!(
            ErrorCategory::from(&LLMError::RateLimit { metadata: None }),
            ErrorCategory::RateLimit
        );
        assert_eq!(
            ErrorCategory::from(&LLMError::Network {
                message: "reset".into(),
                metadata: None
            }),
            ErrorCategory::Network
        );
    }

    #[test]
    fn display_matches_user_label() {
        assert_eq!(
            format!("{}", ErrorCategory::RateLimit),
            ErrorCategory::RateLimit.user_label()
        );
    }

    #[test]
    fn anyhow_chain_is_classified() {
        let err = anyhow::anyhow!("connection refused").context("calling weather tool");
        assert_eq!(classify_anyhow_error(&err), ErrorCategory::Network);
    }
}
