//! Prompt shaping for query routes
//!
//! Resolves the model, system prompt and knowledge base for one request from
//! the route defaults, the selected profile and the request's own overrides,
//! then applies the POI table and the optional local-time hint.

pub mod poi;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use std::fmt::Write;
use chrono_tz::Tz;
use thiserror::Error;

use crate::config::{PromptConfig, RouteConfig};
use crate::error::{RelayError, Result};

pub use poi::{POI_PLACEHOLDER, PoiEntry, PoiTable};

/// Profile used when a route has profiles and the request names none
pub const DEFAULT_PROFILE: &str = "default";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PromptError {
    #[error("unknown profile '{0}'")]
    UnknownProfile(String),
}

/// Reject strftime formats that chrono cannot render
pub fn check_time_format(format: &str) -> Result<()> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(RelayError::Config(format!(
            "Invalid prompt.time_format '{format}'"
        )));
    }
    Ok(())
}

/// Request-supplied values that may override route defaults
#[derive(Debug, Clone, Copy, Default)]
pub struct Overrides<'a> {
    pub model: Option<&'a str>,
    pub prompt: Option<&'a str>,
    pub profile: Option<&'a str>,
}

/// Everything the upstream invoker needs besides the provider itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPrompt {
    pub model: Option<String>,
    pub system_prompt: String,
    pub query: String,
    pub knowledge_id: Option<String>,
}

/// Process-wide prompt shaping state, built once at startup
#[derive(Debug, Clone)]
pub struct PromptShaper {
    poi: Option<PoiTable>,
    timezone: Tz,
    time_format: String,
    time_keywords: Vec<String>,
}

impl PromptShaper {
    pub fn from_config(config: &PromptConfig) -> Result<Self> {
        let timezone: Tz = config.timezone.parse().map_err(|_| {
            RelayError::Config(format!("Unknown time zone '{}'", config.timezone))
        })?;
        check_time_format(&config.time_format)?;

        let poi = match &config.poi_file {
            Some(path) => Some(PoiTable::load(path)?),
            None => None,
        };

        Ok(Self {
            poi,
            timezone,
            time_format: config.time_format.clone(),
            time_keywords: config.time_keywords.clone(),
        })
    }

    pub fn with_poi_table(mut self, table: PoiTable) -> Self {
        self.poi = Some(table);
        self
    }

    pub fn poi_table(&self) -> Option<&PoiTable> {
        self.poi.as_ref()
    }

    /// Resolve the prompt for one request at the current time
    pub fn resolve(
        &self,
        route: &RouteConfig,
        query: &str,
        overrides: Overrides<'_>,
    ) -> std::result::Result<ResolvedPrompt, PromptError> {
        self.resolve_at(route, query, overrides, Utc::now())
    }

    /// Resolve the prompt for one request at a fixed instant
    pub fn resolve_at(
        &self,
        route: &RouteConfig,
        query: &str,
        overrides: Overrides<'_>,
        now: DateTime<Utc>,
    ) -> std::result::Result<ResolvedPrompt, PromptError> {
        let mut model = route.model.clone();
        let mut system_prompt = route.prompt.clone();
        let mut knowledge_id = route.knowledge_id.clone();

        let profile = match overrides.profile {
            Some(name) => Some(
                route
                    .profiles
                    .get(name)
                    .ok_or_else(|| PromptError::UnknownProfile(name.to_string()))?,
            ),
            None => route.profiles.get(DEFAULT_PROFILE),
        };

        if let Some(profile) = profile {
            if let Some(m) = &profile.model {
                model = Some(m.clone());
            }
            if let Some(p) = &profile.prompt {
                system_prompt = p.clone();
            }
            if let Some(k) = &profile.knowledge_id {
                knowledge_id = Some(k.clone());
            }
        }

        if route.allow_overrides {
            if let Some(m) = overrides.model.filter(|m| !m.is_empty()) {
                model = Some(m.to_string());
            }
            if let Some(p) = overrides.prompt {
                system_prompt = p.to_string();
            }
        }

        if let Some(table) = &self.poi {
            if system_prompt.contains(POI_PLACEHOLDER) {
                system_prompt = system_prompt.replace(POI_PLACEHOLDER, &table.render());
            }
        }

        let mut query = query.to_string();
        if route.time_hint {
            let hint = self.time_hint(now);
            system_prompt.push_str(&hint);
            if self.mentions_time(&query) {
                query.push_str(&hint);
            }
        }

        Ok(ResolvedPrompt {
            model,
            system_prompt,
            query,
            knowledge_id,
        })
    }

    fn time_hint(&self, now: DateTime<Utc>) -> String {
        let mut hint = String::new();
        let local = now.with_timezone(&self.timezone);
        if write!(hint, "{}", local.format(&self.time_format)).is_err() {
            tracing::warn!(format = %self.time_format, "Time hint format failed to render");
            hint.clear();
        }
        hint
    }

    fn mentions_time(&self, query: &str) -> bool {
        self.time_keywords
            .iter()
            .any(|keyword| !keyword.is_empty() && query.contains(keyword.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProfileConfig, ProviderKind};
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn route() -> RouteConfig {
        RouteConfig {
            path: "/".to_string(),
            provider: ProviderKind::Zhipu,
            model: Some("glm-4".to_string()),
            bot_id: None,
            prompt: "You are a guide.".to_string(),
            knowledge_id: Some("kb-1".to_string()),
            prompt_template: String::new(),
            stream: false,
            allow_overrides: true,
            time_hint: false,
            blocked_response: None,
            profiles: HashMap::new(),
        }
    }

    fn shaper() -> PromptShaper {
        PromptShaper::from_config(&PromptConfig::default()).unwrap()
    }

    fn noon_utc() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 4, 7, 0).unwrap()
    }

    #[test]
    fn test_route_defaults() {
        let resolved = shaper()
            .resolve(&route(), "hello", Overrides::default())
            .unwrap();
        assert_eq!(resolved.model.as_deref(), Some("glm-4"));
        assert_eq!(resolved.system_prompt, "You are a guide.");
        assert_eq!(resolved.query, "hello");
        assert_eq!(resolved.knowledge_id.as_deref(), Some("kb-1"));
    }

    #[test]
    fn test_request_overrides() {
        let overrides = Overrides {
            model: Some("glm-3-turbo"),
            prompt: Some("Be brief."),
            profile: None,
        };
        let resolved = shaper().resolve(&route(), "hello", overrides).unwrap();
        assert_eq!(resolved.model.as_deref(), Some("glm-3-turbo"));
        assert_eq!(resolved.system_prompt, "Be brief.");
    }

    #[test]
    fn test_overrides_ignored_when_disallowed() {
        let mut route = route();
        route.allow_overrides = false;
        let overrides = Overrides {
            model: Some("glm-3-turbo"),
            prompt: Some("Be brief."),
            profile: None,
        };
        let resolved = shaper().resolve(&route, "hello", overrides).unwrap();
        assert_eq!(resolved.model.as_deref(), Some("glm-4"));
        assert_eq!(resolved.system_prompt, "You are a guide.");
    }

    #[test]
    fn test_profile_selection() {
        let mut route = route();
        route.profiles.insert(
            "default".to_string(),
            ProfileConfig {
                prompt: Some("Default profile".to_string()),
                ..ProfileConfig::default()
            },
        );
        route.profiles.insert(
            "museum".to_string(),
            ProfileConfig {
                model: Some("glm-4-air".to_string()),
                prompt: Some("Museum guide".to_string()),
                knowledge_id: Some("kb-museum".to_string()),
            },
        );

        let default = shaper().resolve(&route, "q", Overrides::default()).unwrap();
        assert_eq!(default.system_prompt, "Default profile");
        assert_eq!(default.model.as_deref(), Some("glm-4"));

        let museum = shaper()
            .resolve(
                &route,
                "q",
                Overrides {
                    profile: Some("museum"),
                    ..Overrides::default()
                },
            )
            .unwrap();
        assert_eq!(museum.system_prompt, "Museum guide");
        assert_eq!(museum.model.as_deref(), Some("glm-4-air"));
        assert_eq!(museum.knowledge_id.as_deref(), Some("kb-museum"));
    }

    #[test]
    fn test_unknown_profile() {
        let result = shaper().resolve(
            &route(),
            "q",
            Overrides {
                profile: Some("nope"),
                ..Overrides::default()
            },
        );
        assert_eq!(result, Err(PromptError::UnknownProfile("nope".to_string())));
    }

    #[test]
    fn test_poi_substitution() {
        let mut route = route();
        route.prompt = "Places:\n{poi}\nPick one.".to_string();
        let shaper = shaper().with_poi_table(PoiTable::parse("石门关,石门\n游客中心"));

        let resolved = shaper.resolve(&route, "q", Overrides::default()).unwrap();
        assert_eq!(
            resolved.system_prompt,
            "Places:\n石门关（石门）\n游客中心\nPick one."
        );
    }

    #[test]
    fn test_time_hint_appended_to_prompt() {
        let mut route = route();
        route.time_hint = true;

        // 04:07 UTC is 12:07 in Asia/Shanghai
        let resolved = shaper()
            .resolve_at(&route, "门票多少钱", Overrides::default(), noon_utc())
            .unwrap();
        assert_eq!(resolved.system_prompt, "You are a guide.(现在时间是12点07分)");
        assert_eq!(resolved.query, "门票多少钱");
    }

    #[test]
    fn test_time_hint_appended_to_time_queries() {
        let mut route = route();
        route.time_hint = true;

        let resolved = shaper()
            .resolve_at(&route, "现在去哪玩", Overrides::default(), noon_utc())
            .unwrap();
        assert_eq!(resolved.query, "现在去哪玩(现在时间是12点07分)");
    }

    #[test]
    fn test_invalid_time_format_rejected() {
        let config = PromptConfig {
            time_format: "(%Q)".to_string(),
            ..PromptConfig::default()
        };
        assert!(check_time_format(&config.time_format).is_err());
        assert!(PromptShaper::from_config(&config).is_err());
        assert!(check_time_format("(现在时间是%H点%M分)").is_ok());
    }

    #[test]
    fn test_no_time_hint_by_default() {
        let resolved = shaper()
            .resolve_at(&route(), "现在去哪玩", Overrides::default(), noon_utc())
            .unwrap();
        assert_eq!(resolved.query, "现在去哪玩");
        assert_eq!(resolved.system_prompt, "You are a guide.");
    }
}
