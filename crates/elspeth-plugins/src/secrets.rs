// crates/elspeth-plugins/src/secrets.rs
// ============================================================================
// Module: Environment Secrets Provider
// Description: Fingerprint key retrieval from the process environment.
// Purpose: Supply export-signing key material without embedding secrets.
// Dependencies: elspeth-core
// ============================================================================

//! ## Overview
//! The environment provider reads the fingerprint key from
//! `ELSPETH_FINGERPRINT_KEY`. Absence or an empty value is an error, never
//! an empty key: export signing must fail closed.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::env;

use elspeth_core::FingerprintKey;
use elspeth_core::SecretsError;
use elspeth_core::SecretsProvider;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Environment variable holding the fingerprint key.
pub const FINGERPRINT_KEY_ENV: &str = "ELSPETH_FINGERPRINT_KEY";

// ============================================================================
// SECTION: Provider
// ============================================================================

/// Secrets provider backed by the process environment.
///
/// # Invariants
/// - Never yields an empty key.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecretsProvider;

impl EnvSecretsProvider {
    /// Creates an environment-backed provider.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl SecretsProvider for EnvSecretsProvider {
    fn fingerprint_key(&self) -> Result<FingerprintKey, SecretsError> {
        let value = env::var(FINGERPRINT_KEY_ENV).map_err(|_| {
            SecretsError::Unavailable(format!("{FINGERPRINT_KEY_ENV} is not set"))
        })?;
        FingerprintKey::new(Some(FINGERPRINT_KEY_ENV.to_string()), value.into_bytes())
            .ok_or_else(|| {
                SecretsError::Unavailable(format!("{FINGERPRINT_KEY_ENV} is empty"))
            })
    }
}

/// Secrets provider with a fixed in-memory key, for tests and embedding.
#[derive(Debug, Clone)]
pub struct StaticSecretsProvider {
    /// Key material.
    material: Vec<u8>,
    /// Key identifier.
    key_id: Option<String>,
}

impl StaticSecretsProvider {
    /// Creates a static provider over key material.
    #[must_use]
    pub fn new(material: Vec<u8>, key_id: Option<String>) -> Self {
        Self {
            material,
            key_id,
        }
    }
}

impl SecretsProvider for StaticSecretsProvider {
    fn fingerprint_key(&self) -> Result<FingerprintKey, SecretsError> {
        FingerprintKey::new(self.key_id.clone(), self.material.clone())
            .ok_or_else(|| SecretsError::Unavailable("static key is empty".to_string()))
    }
}
