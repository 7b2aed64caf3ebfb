//! Static bearer-token gate
//!
//! Tokens are loaded once at startup from the config (and an optional key
//! file) and never change afterwards.

use std::collections::HashSet;
use std::path::Path;

use thiserror::Error;

use crate::config::AuthConfig;
use crate::error::{RelayError, Result};

const BEARER_PREFIX: &str = "Bearer ";

/// Reasons a request fails the auth gate
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing auth header")]
    MissingHeader,

    #[error("auth header must use the Bearer scheme")]
    InvalidScheme,

    #[error("unknown key")]
    UnknownKey,
}

/// Immutable set of accepted bearer tokens
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    keys: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys
                .into_iter()
                .map(Into::into)
                .filter(|k: &String| !k.is_empty())
                .collect(),
        }
    }

    /// Build the allow-list from config keys plus the optional key file
    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let mut list = Self::new(config.keys.iter().map(|k| k.trim().to_string()));

        if let Some(path) = &config.keys_file {
            list.keys.extend(read_key_file(path)?);
        }

        tracing::info!("Loaded {} auth keys", list.len());
        Ok(list)
    }

    /// Validate a raw header value and return the accepted token
    pub fn authorize<'a>(&self, header: Option<&'a str>) -> std::result::Result<&'a str, AuthError> {
        let header = header.ok_or(AuthError::MissingHeader)?;
        let token = header
            .strip_prefix(BEARER_PREFIX)
            .ok_or(AuthError::InvalidScheme)?;

        if self.keys.contains(token) {
            Ok(token)
        } else {
            Err(AuthError::UnknownKey)
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn read_key_file(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        RelayError::Config(format!("Failed to read auth key file {}: {}", path.display(), e))
    })?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allow_list() -> AllowList {
        AllowList::new(["alpha", "beta"])
    }

    #[test]
    fn test_authorize_known_key() {
        assert_eq!(allow_list().authorize(Some("Bearer alpha")), Ok("alpha"));
    }

    #[test]
    fn test_authorize_missing_header() {
        assert_eq!(allow_list().authorize(None), Err(AuthError::MissingHeader));
    }

    #[test]
    fn test_authorize_wrong_scheme() {
        assert_eq!(
            allow_list().authorize(Some("Basic alpha")),
            Err(AuthError::InvalidScheme)
        );
        assert_eq!(
            allow_list().authorize(Some("bearer alpha")),
            Err(AuthError::InvalidScheme)
        );
        assert_eq!(allow_list().authorize(Some("alpha")), Err(AuthError::InvalidScheme));
    }

    #[test]
    fn test_authorize_unknown_key() {
        assert_eq!(
            allow_list().authorize(Some("Bearer gamma")),
            Err(AuthError::UnknownKey)
        );
        assert_eq!(allow_list().authorize(Some("Bearer ")), Err(AuthError::UnknownKey));
    }

    #[test]
    fn test_authorize_is_exact_match() {
        assert_eq!(
            allow_list().authorize(Some("Bearer alpha ")),
            Err(AuthError::UnknownKey)
        );
        assert_eq!(
            allow_list().authorize(Some("Bearer alph")),
            Err(AuthError::UnknownKey)
        );
    }

    #[test]
    fn test_empty_keys_are_dropped() {
        let list = AllowList::new(["", "x"]);
        assert_eq!(list.len(), 1);
        assert_eq!(list.authorize(Some("Bearer ")), Err(AuthError::UnknownKey));
    }

    #[test]
    fn test_from_config_merges_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth_keys.txt");
        std::fs::write(&path, "file-key\n\n  padded  \n").unwrap();

        let config = AuthConfig {
            keys: vec!["inline".to_string()],
            keys_file: Some(path),
            ..AuthConfig::default()
        };

        let list = AllowList::from_config(&config).unwrap();
        assert_eq!(list.len(), 3);
        assert!(list.authorize(Some("Bearer padded")).is_ok());
        assert!(list.authorize(Some("Bearer file-key")).is_ok());
        assert!(list.authorize(Some("Bearer inline")).is_ok());
    }

    #[test]
    fn test_from_config_missing_key_file() {
        let config = AuthConfig {
            keys_file: Some("/no/such/auth_keys.txt".into()),
            ..AuthConfig::default()
        };
        assert!(matches!(
            AllowList::from_config(&config),
            Err(RelayError::Config(_))
        ));
    }
}
