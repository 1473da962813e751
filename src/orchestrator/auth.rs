//! Shared-secret bearer authentication for the trigger endpoint.

use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

use crate::config::CRON_SECRET_VAR;
use crate::error::ConfigError;

/// Outcome of checking one request's `authorization` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Authorized,
    Rejected,
}

/// Compares the presented header against `Bearer <secret>`.
///
/// Fails closed: a gate built without a secret refuses every request with a
/// configuration error instead of authorizing anything.
#[derive(Clone)]
pub struct AuthGate {
    expected: Option<SecretString>,
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("configured", &self.is_configured())
            .finish()
    }
}

impl AuthGate {
    pub fn new(secret: Option<SecretString>) -> Self {
        let expected = secret
            .filter(|s| !s.expose_secret().is_empty())
            .map(|s| SecretString::from(format!("Bearer {}", s.expose_secret())));
        Self { expected }
    }

    pub fn is_configured(&self) -> bool {
        self.expected.is_some()
    }

    /// Check the raw `authorization` header value, if any.
    pub fn check(&self, header: Option<&str>) -> Result<AuthDecision, ConfigError> {
        let expected = self
            .expected
            .as_ref()
            .ok_or_else(|| ConfigError::MissingRequired(CRON_SECRET_VAR.to_string()))?;

        let Some(presented) = header else {
            return Ok(AuthDecision::Rejected);
        };

        // ct_eq on slices of different length is already false, but only
        // leaks the length.
        let matches = presented
            .as_bytes()
            .ct_eq(expected.expose_secret().as_bytes())
            .unwrap_u8()
            == 1;

        Ok(if matches {
            AuthDecision::Authorized
        } else {
            AuthDecision::Rejected
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> AuthGate {
        AuthGate::new(Some(SecretString::from("s3cret")))
    }

    #[test]
    fn exact_bearer_is_authorized() {
        assert_eq!(
            gate().check(Some("Bearer s3cret")).unwrap(),
            AuthDecision::Authorized
        );
    }

    #[test]
    fn anything_else_is_rejected() {
        let gate = gate();
        for header in [
            None,
            Some(""),
            Some("s3cret"),
            Some("bearer s3cret"),
            Some("Bearer s3cret "),
            Some("Bearer s3cre"),
            Some("Basic s3cret"),
        ] {
            assert_eq!(gate.check(header).unwrap(), AuthDecision::Rejected, "{:?}", header);
        }
    }

    #[test]
    fn missing_secret_fails_closed() {
        let gate = AuthGate::new(None);
        assert!(!gate.is_configured());
        let err = gate.check(Some("Bearer anything")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingRequired(ref k) if k == "CRON_SECRET"));
    }

    #[test]
    fn empty_secret_counts_as_missing() {
        let gate = AuthGate::new(Some(SecretString::from("")));
        assert!(gate.check(Some("Bearer ")).is_err());
    }

    #[test]
    fn debug_does_not_print_secret() {
        assert!(!format!("{:?}", gate()).contains("s3cret"));
    }
}
