//! The OAuth refresh contract this crate consumes but does not implement
//! (SPEC_FULL.md §1 "Out of scope"). Provider-specific HTTP refresh flows
//! belong to the caller; this module only names the input/output shape.

use crate::provider::Provider;
use std::collections::HashMap;

/// Tokens returned by a successful refresh call.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RefreshedTokens {
    pub access_token: String,
    pub refresh_token: String,
    /// Expiry timestamp in milliseconds since epoch.
    pub expires_at: Option<i64>,
    /// Provider-specific extra fields (e.g. Gemini's `projectId`).
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("refresh token rejected by provider")]
    InvalidGrant,
    #[error("network error during refresh: {0}")]
    Network(String),
    #[error("unexpected response from provider: {0}")]
    Protocol(String),
}

/// The contract callers implement: `fn(refresh_token) -> Result<RefreshedTokens, RefreshError>`,
/// one per [`Provider`]. Boxed rather than generic so a caller can hold a
/// `HashMap<Provider, RefreshFn>` of heterogeneous closures.
pub type RefreshFn = Box<dyn Fn(&str) -> Result<RefreshedTokens, RefreshError> + Send + Sync>;

/// A per-provider table of refresh callbacks, built by the caller and
/// threaded through to whatever part of the front-end needs to refresh a
/// near-expiry profile before activation.
#[derive(Default)]
pub struct RefreshRegistry {
    callbacks: HashMap<Provider, RefreshFn>,
}

impl RefreshRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Provider, callback: RefreshFn) {
        self.callbacks.insert(provider, callback);
    }

    pub fn refresh(&self, provider: Provider, refresh_token: &str) -> Result<RefreshedTokens, RefreshError> {
        match self.callbacks.get(&provider) {
            Some(callback) => callback(refresh_token),
            None => Err(RefreshError::Protocol(format!("no refresh callback registered for {provider}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_dispatches_to_registered_provider() {
        let mut registry = RefreshRegistry::new();
        registry.register(
            Provider::Codex,
            Box::new(|token| {
                Ok(RefreshedTokens { access_token: format!("new-{token}"), refresh_token: token.to_string(), expires_at: Some(1), extra: HashMap::new() })
            }),
        );

        let result = registry.refresh(Provider::Codex, "rt-1").unwrap();
        assert_eq!(result.access_token, "new-rt-1");
    }

    #[test]
    fn unregistered_provider_is_a_protocol_error() {
        let registry = RefreshRegistry::new();
        let err = registry.refresh(Provider::Gemini, "rt").unwrap_err();
        assert!(matches!(err, RefreshError::Protocol(_)));
    }
}
