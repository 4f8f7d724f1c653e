//! Secret redaction
//!
//! Protected settings and storage keys must never reach the logs or a status
//! document. Values are registered once they are known and any text leaving
//! the handler is passed through [`SecretRegistry::redact_text`].

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// Minimum length for a value to be considered for redaction
const MIN_REDACTION_LENGTH: usize = 4;

/// Replacement text for redacted secrets
pub const REDACTION_PLACEHOLDER: &str = "****";

/// Thread-safe set of values to redact; clones share the same set
#[derive(Debug, Clone, Default)]
pub struct SecretRegistry {
    inner: Arc<RwLock<HashSet<String>>>,
}

impl SecretRegistry {
    /// Create a new empty secret registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret value. Values shorter than the minimum length are ignored
    /// to avoid redacting common substrings.
    pub fn add_secret(&self, secret: &str) {
        if secret.len() < MIN_REDACTION_LENGTH {
            return;
        }
        if let Ok(mut inner) = self.inner.write() {
            inner.insert(secret.to_string());
        }
    }

    /// Add multiple secrets to the registry
    pub fn add_secrets<I>(&self, secrets: I)
    where
        I: IntoIterator<Item = String>,
    {
        for secret in secrets {
            self.add_secret(&secret);
        }
    }

    /// Replace every registered secret in `text` with the placeholder.
    ///
    /// Longer secrets are replaced first so a secret containing another one
    /// is redacted as a whole.
    pub fn redact_text(&self, text: &str) -> String {
        let Ok(inner) = self.inner.read() else {
            return text.to_string();
        };
        let mut secrets: Vec<&String> = inner.iter().collect();
        secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));

        let mut result = text.to_string();
        for secret in secrets {
            if result.contains(secret.as_str()) {
                result = result.replace(secret.as_str(), REDACTION_PLACEHOLDER);
            }
        }
        result
    }

    /// Number of registered secrets
    pub fn secret_count(&self) -> usize {
        self.inner.read().map(|inner| inner.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_registered_secret() {
        let registry = SecretRegistry::new();
        registry.add_secret("s3cr3t-key");

        assert_eq!(
            registry.redact_text("key=s3cr3t-key; again s3cr3t-key"),
            "key=****; again ****"
        );
    }

    #[test]
    fn test_short_values_ignored() {
        let registry = SecretRegistry::new();
        registry.add_secret("ab");
        assert_eq!(registry.secret_count(), 0);
        assert_eq!(registry.redact_text("abc"), "abc");
    }

    #[test]
    fn test_longest_secret_first() {
        let registry = SecretRegistry::new();
        registry.add_secrets(vec!["token".to_string(), "token-extended".to_string()]);

        assert_eq!(registry.redact_text("x token-extended y"), "x **** y");
    }

    #[test]
    fn test_clones_share_secrets() {
        let registry = SecretRegistry::new();
        let clone = registry.clone();
        registry.add_secret("shared-value");

        assert_eq!(clone.redact_text("shared-value"), "****");
    }
}
