//! Keyword denylist checked before any upstream call

use std::collections::HashSet;
use std::path::Path;

use serde_json::Value;

use crate::config::FilterConfig;
use crate::error::{RelayError, Result};

/// Immutable set of banned substrings
#[derive(Debug, Clone, Default)]
pub struct Denylist {
    words: HashSet<String>,
}

impl Denylist {
    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            words: words
                .into_iter()
                .map(|w| w.as_ref().trim().to_string())
                .filter(|w| !w.is_empty())
                .collect(),
        }
    }

    /// Load a newline-delimited word file; blank lines are ignored
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!(
                "Failed to read banned words list {}: {}",
                path.display(),
                e
            ))
        })?;

        Ok(Self::new(content.lines()))
    }

    /// Load according to config; a missing optional file yields an empty list
    pub fn from_config(config: &FilterConfig) -> Result<Self> {
        if !config.required && !config.banwords_path.exists() {
            tracing::warn!(
                "Banwords file {} not found, no banwords will be loaded",
                config.banwords_path.display()
            );
            return Ok(Self::default());
        }

        let list = Self::load(&config.banwords_path)?;
        tracing::info!("Loaded {} banwords", list.len());
        Ok(list)
    }

    /// True when any banned word occurs in the query (case-sensitive)
    pub fn is_blocked(&self, query: &str) -> bool {
        self.words.iter().any(|word| query.contains(word.as_str()))
    }

    /// Like [`Denylist::is_blocked`], but only text values are scanned
    pub fn is_blocked_value(&self, query: &Value) -> bool {
        query.as_str().is_some_and(|q| self.is_blocked(q))
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_substring_match() {
        let list = Denylist::new(["bomb"]);
        assert!(list.is_blocked("bomb recipe"));
        assert!(list.is_blocked("how to make a bombshell"));
        assert!(!list.is_blocked("balloon recipe"));
    }

    #[test]
    fn test_case_sensitive() {
        let list = Denylist::new(["bomb"]);
        assert!(!list.is_blocked("BOMB recipe"));
    }

    #[test]
    fn test_cjk_substring() {
        let list = Denylist::new(["敏感"]);
        assert!(list.is_blocked("这是一个敏感问题"));
        assert!(!list.is_blocked("这是一个普通问题"));
    }

    #[test]
    fn test_empty_list_blocks_nothing() {
        let list = Denylist::default();
        assert!(list.is_empty());
        assert!(!list.is_blocked("anything"));
        assert!(!list.is_blocked(""));
    }

    #[test]
    fn test_blank_words_are_ignored() {
        let list = Denylist::new(["", "  ", "x"]);
        assert_eq!(list.len(), 1);
        assert!(!list.is_blocked("hello"));
    }

    #[test]
    fn test_non_text_values_are_not_blocked() {
        let list = Denylist::new(["1"]);
        assert!(!list.is_blocked_value(&json!(12345)));
        assert!(!list.is_blocked_value(&json!(["1"])));
        assert!(!list.is_blocked_value(&Value::Null));
        assert!(list.is_blocked_value(&json!("route 1")));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("banwords.txt");
        std::fs::write(&path, "alpha\n\n beta \r\ngamma\n").unwrap();

        let list = Denylist::load(&path).unwrap();
        assert_eq!(list.len(), 3);
        assert!(list.is_blocked("xx beta xx"));
        assert!(list.is_blocked("gamma"));
    }

    #[test]
    fn test_from_config_required_missing_file_fails() {
        let config = FilterConfig {
            banwords_path: "/no/such/banwords.txt".into(),
            required: true,
            ..FilterConfig::default()
        };
        assert!(Denylist::from_config(&config).is_err());
    }

    #[test]
    fn test_from_config_optional_missing_file_is_empty() {
        let config = FilterConfig {
            banwords_path: "/no/such/banwords.txt".into(),
            required: false,
            ..FilterConfig::default()
        };
        assert!(Denylist::from_config(&config).unwrap().is_empty());
    }
}
