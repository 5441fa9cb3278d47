//! # Credential Resolution
//!
//! Finds the access token a client authenticates with. Sources are tried in
//! order and the first non-empty token wins:
//!
//! 1. `access_token` in the `[graphapi]` config section
//! 2. the [`FBPCS_GRAPH_API_TOKEN`] environment variable
//!
//! A config section that does not normalize into [`GraphApiConfig`] counts as
//! "no token in config"; the only error surfaced is
//! [`CoordinatorError::CredentialNotFound`].

use log::{error, info};
use std::env;
use std::fmt;

use crate::common::config::GraphApiConfig;
use crate::common::constants::FBPCS_GRAPH_API_TOKEN;
use crate::common::error::{CoordinatorError, Result};

/// Opaque access token. Never printed in full.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Resolves an [`AccessToken`] from config first, then the environment.
pub struct CredentialResolver {
    env_var: String,
    lookup: EnvLookup,
}

impl Default for CredentialResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialResolver {
    /// Resolver reading [`FBPCS_GRAPH_API_TOKEN`] from the process environment.
    pub fn new() -> Self {
        Self {
            env_var: FBPCS_GRAPH_API_TOKEN.to_string(),
            lookup: Box::new(|name| env::var(name).ok()),
        }
    }

    /// Replace the environment lookup (tests use this instead of `set_var`).
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.lookup = Box::new(lookup);
        self
    }

    /// Resolve the token for the given `[graphapi]` section.
    ///
    /// # Returns
    /// - `Ok(token)`: From config if present, otherwise from the environment
    /// - `Err(CredentialNotFound)`: Neither source yielded a non-empty token
    pub fn resolve(&self, config: &toml::Value) -> Result<AccessToken> {
        self.token_from_config(config)
            .or_else(|| self.token_from_env())
            .ok_or_else(|| {
                let err = CoordinatorError::CredentialNotFound {
                    env_var: self.env_var.clone(),
                };
                error!("❌ {}", err);
                err
            })
    }

    fn token_from_config(&self, config: &toml::Value) -> Option<AccessToken> {
        info!("🔑 Attempting to read graph api token from the config file");

        let token = match GraphApiConfig::from_value(config) {
            Ok(section) => section.access_token,
            Err(e) => {
                info!("Config section has no usable access_token: {}", e);
                return None;
            }
        };

        if token.is_empty() {
            info!("Config access_token is empty");
            return None;
        }

        info!("✅ Successfully read graph api token from the config file");
        Some(AccessToken(token))
    }

    fn token_from_env(&self) -> Option<AccessToken> {
        info!(
            "🔑 Attempting to read graph api token from {} env var",
            self.env_var
        );

        let token = (self.lookup)(&self.env_var).filter(|t| !t.is_empty())?;

        info!(
            "✅ Successfully read graph api token from {} env var",
            self.env_var
        );
        Some(AccessToken(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn config(src: &str) -> toml::Value {
        toml::from_str(src).unwrap()
    }

    fn resolver_with_env(value: Option<&str>) -> CredentialResolver {
        let value = value.map(str::to_string);
        CredentialResolver::new().with_env_lookup(move |_| value.clone())
    }

    #[test]
    fn test_config_token_wins_and_env_not_consulted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let resolver = CredentialResolver::new().with_env_lookup(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Some("tok-env".to_string())
        });

        let token = resolver.resolve(&config(r#"access_token = "tok-A""#)).unwrap();
        assert_eq!(token.as_str(), "tok-A");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_malformed_config_falls_back_to_env() {
        let resolver = resolver_with_env(Some("tok-B"));
        let token = resolver.resolve(&config("")).unwrap();
        assert_eq!(token.as_str(), "tok-B");

        let token = resolver.resolve(&config("access_token = 7")).unwrap();
        assert_eq!(token.as_str(), "tok-B");
    }

    #[test]
    fn test_empty_config_token_falls_back_to_env() {
        let resolver = resolver_with_env(Some("tok-B"));
        let token = resolver.resolve(&config(r#"access_token = """#)).unwrap();
        assert_eq!(token.as_str(), "tok-B");
    }

    #[test]
    fn test_env_lookup_uses_shared_constant() {
        let resolver = CredentialResolver::new().with_env_lookup(|name| {
            (name == FBPCS_GRAPH_API_TOKEN).then(|| "tok-C".to_string())
        });
        assert_eq!(resolver.resolve(&config("")).unwrap().as_str(), "tok-C");
    }

    #[test]
    fn test_no_token_anywhere() {
        let err = resolver_with_env(None).resolve(&config("")).unwrap_err();
        assert!(err.is_credential_not_found());

        let err = resolver_with_env(Some("")).resolve(&config("")).unwrap_err();
        assert!(err.is_credential_not_found());
    }

    #[test]
    fn test_token_is_redacted_in_debug() {
        let token = AccessToken::new("secret-token");
        assert!(!format!("{:?}", token).contains("secret-token"));
    }
}
