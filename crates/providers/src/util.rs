//! Shared utility functions for provider adapters.

use rawi_domain::config::AuthConfig;
use rawi_domain::error::{Error, Result};

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
///
/// Timeout errors map to [`Error::Timeout`]; everything else maps to
/// [`Error::Http`].
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Resolve the API key from an [`AuthConfig`].
///
/// Precedence: `key` field (plaintext — warn), then the `env` field.
pub fn resolve_api_key(auth: &AuthConfig) -> Result<String> {
    if let Some(ref key) = auth.key {
        tracing::warn!(
            "API key loaded from plaintext config field 'key' — prefer 'env' instead"
        );
        return Ok(key.clone());
    }

    if let Some(ref env_var) = auth.env {
        return std::env::var(env_var).map_err(|_| {
            Error::Auth(format!(
                "environment variable '{env_var}' not set or not valid UTF-8"
            ))
        });
    }

    Err(Error::Auth(
        "no API key configured: set 'key' or 'env' in the auth section".into(),
    ))
}

/// Classify an error as transient (worth one retry with backoff).
///
/// Network-level failures and timeouts are transient. Provider errors
/// carrying an HTTP status are transient for 408, 429, and 5xx.
pub fn is_transient(e: &Error) -> bool {
    match e {
        Error::Timeout(_) | Error::Http(_) => true,
        Error::Provider { message, .. } => provider_status(message)
            .map(|code| code == 408 || code == 429 || code >= 500)
            .unwrap_or(false),
        _ => false,
    }
}

/// Extract the status code from a provider error message formatted as
/// `"HTTP {status} - {body}"`.
fn provider_status(message: &str) -> Option<u16> {
    message
        .strip_prefix("HTTP ")?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_err(message: &str) -> Error {
        Error::Provider {
            provider: "anthropic".into(),
            message: message.into(),
        }
    }

    #[test]
    fn resolve_api_key_plaintext() {
        let auth = AuthConfig {
            key: Some("sk-test-123".into()),
            ..Default::default()
        };
        assert_eq!(resolve_api_key(&auth).unwrap(), "sk-test-123");
    }

    #[test]
    fn resolve_api_key_env_var() {
        let var_name = "RAWI_TEST_RESOLVE_ENV_KEY_1234";
        std::env::set_var(var_name, "env-secret-value");
        let auth = AuthConfig {
            env: Some(var_name.into()),
            ..Default::default()
        };
        assert_eq!(resolve_api_key(&auth).unwrap(), "env-secret-value");
        std::env::remove_var(var_name);
    }

    #[test]
    fn resolve_api_key_env_var_missing() {
        let auth = AuthConfig {
            env: Some("RAWI_TEST_NONEXISTENT_VAR_8888".into()),
            ..Default::default()
        };
        let err = resolve_api_key(&auth).unwrap_err();
        assert!(err.to_string().contains("RAWI_TEST_NONEXISTENT_VAR_8888"));
    }

    #[test]
    fn resolve_api_key_no_config() {
        let err = resolve_api_key(&AuthConfig::default()).unwrap_err();
        assert!(err.to_string().contains("no API key configured"));
    }

    #[test]
    fn timeouts_are_transient() {
        assert!(is_transient(&Error::Timeout("deadline".into())));
        assert!(is_transient(&Error::Http("connection reset".into())));
    }

    #[test]
    fn rate_limits_and_server_errors_are_transient() {
        assert!(is_transient(&provider_err("HTTP 429 - rate limited")));
        assert!(is_transient(&provider_err("HTTP 503 - overloaded")));
        assert!(is_transient(&provider_err("HTTP 408 - request timeout")));
    }

    #[test]
    fn client_errors_are_permanent() {
        assert!(!is_transient(&provider_err("HTTP 400 - bad request")));
        assert!(!is_transient(&provider_err("HTTP 401 - unauthorized")));
        assert!(!is_transient(&provider_err("malformed body")));
        assert!(!is_transient(&Error::Config("bad".into())));
    }
}
