// Replaces registered secret values (database password, registry credentials)
// in log output.

use parking_lot::RwLock;
use std::sync::Arc;

const MASK: &str = "***";

/// A thread-safe set of secret values masked out of every string passed
/// through `mask_secrets`. Clones share the same set.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    secrets: Arc<RwLock<Vec<String>>>,
}

impl SecretMasker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret. Blank values are ignored.
    pub fn add_value(&self, secret: &str) {
        let trimmed = secret.trim();
        if trimmed.is_empty() {
            return;
        }

        let mut secrets = self.secrets.write();
        if !secrets.iter().any(|s| s == trimmed) {
            secrets.push(trimmed.to_string());
            // Longest first, so a secret containing another is masked whole.
            secrets.sort_by(|a, b| b.len().cmp(&a.len()));
        }
    }

    pub fn mask_secrets(&self, input: &str) -> String {
        let secrets = self.secrets.read();
        let mut result = input.to_string();
        for secret in secrets.iter() {
            if result.contains(secret.as_str()) {
                result = result.replace(secret.as_str(), MASK);
            }
        }
        result
    }
}
