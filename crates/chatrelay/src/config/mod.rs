use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{RelayError, Result};
use crate::prompt::{DEFAULT_PROFILE, check_time_format};

/// Main configuration structure for chatrelay
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Bearer-token gate configuration
    #[serde(default)]
    pub auth: AuthConfig,
    /// Keyword denylist configuration
    #[serde(default)]
    pub filter: FilterConfig,
    /// Reasoning block markers used by the stream relay
    #[serde(default)]
    pub relay: RelayConfig,
    /// Prompt shaping shared by all routes
    #[serde(default)]
    pub prompt: PromptConfig,
    /// Upstream provider credentials and endpoints
    #[serde(default)]
    pub providers: ProvidersConfig,
    /// Query routes exposed by the server
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "0.0.0.0:9000")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Upstream connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Maximum idle time between two upstream reads, in seconds
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// Overall timeout for non-streaming upstream calls, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    120
}

/// Bearer-token gate configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Disable to serve without authentication (local testing only)
    #[serde(default = "default_auth_enabled")]
    pub enabled: bool,
    /// Request header carrying `Bearer <token>`
    #[serde(default = "default_auth_header")]
    pub header: String,
    /// Allow-listed tokens
    #[serde(default)]
    pub keys: Vec<String>,
    /// Optional newline-delimited file of additional tokens
    #[serde(default)]
    pub keys_file: Option<PathBuf>,
    /// Message returned with 401 responses
    #[serde(default = "default_auth_rejection_message")]
    pub rejection_message: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: default_auth_enabled(),
            header: default_auth_header(),
            keys: Vec::new(),
            keys_file: None,
            rejection_message: default_auth_rejection_message(),
        }
    }
}

fn default_auth_enabled() -> bool {
    true
}

fn default_auth_header() -> String {
    "auth-key".to_string()
}

fn default_auth_rejection_message() -> String {
    "Invalid key".to_string()
}

/// Keyword denylist configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    /// Newline-delimited file of banned substrings
    #[serde(default = "default_banwords_path")]
    pub banwords_path: PathBuf,
    /// Refuse to start when the banwords file is missing
    #[serde(default = "default_filter_required")]
    pub required: bool,
    /// Answer returned for blocked queries
    #[serde(default = "default_filter_rejection_message")]
    pub rejection_message: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            banwords_path: default_banwords_path(),
            required: default_filter_required(),
            rejection_message: default_filter_rejection_message(),
        }
    }
}

fn default_banwords_path() -> PathBuf {
    PathBuf::from("banwords.txt")
}

fn default_filter_required() -> bool {
    true
}

fn default_filter_rejection_message() -> String {
    "对不起，我无法回答这个问题。".to_string()
}

/// Markers wrapped around relayed reasoning content
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RelayConfig {
    #[serde(default = "default_reasoning_open")]
    pub reasoning_open: String,
    #[serde(default = "default_reasoning_close")]
    pub reasoning_close: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            reasoning_open: default_reasoning_open(),
            reasoning_close: default_reasoning_close(),
        }
    }
}

fn default_reasoning_open() -> String {
    "<think>".to_string()
}

fn default_reasoning_close() -> String {
    "</think>".to_string()
}

/// Prompt shaping shared by all routes
#[derive(Debug, Clone, Deserialize)]
pub struct PromptConfig {
    /// IANA time zone used for the time hint
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// strftime format of the time hint
    #[serde(default = "default_time_format")]
    pub time_format: String,
    /// Queries containing any of these also get the time hint appended
    #[serde(default = "default_time_keywords")]
    pub time_keywords: Vec<String>,
    /// Optional `name,alias,alias` file substituted for `{poi}` in prompts
    #[serde(default)]
    pub poi_file: Option<PathBuf>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            time_format: default_time_format(),
            time_keywords: default_time_keywords(),
            poi_file: None,
        }
    }
}

fn default_timezone() -> String {
    "Asia/Shanghai".to_string()
}

fn default_time_format() -> String {
    "(现在时间是%H点%M分)".to_string()
}

fn default_time_keywords() -> Vec<String> {
    ["路线", "目前", "现在", "当前", "时间", "几点"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Upstream provider configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub zhipu: Option<ZhipuConfig>,
    #[serde(default)]
    pub coze: Option<CozeConfig>,
}

/// Zhipu (GLM) chat completion API
#[derive(Debug, Clone, Deserialize)]
pub struct ZhipuConfig {
    /// API base URL, without the `/chat/completions` suffix
    #[serde(default = "default_zhipu_base_url")]
    pub base_url: String,
    /// Inline API key (takes precedence over `api_key_env`)
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the API key
    #[serde(default = "default_zhipu_api_key_env")]
    pub api_key_env: String,
}

impl Default for ZhipuConfig {
    fn default() -> Self {
        Self {
            base_url: default_zhipu_base_url(),
            api_key: None,
            api_key_env: default_zhipu_api_key_env(),
        }
    }
}

impl ZhipuConfig {
    pub fn resolve_api_key(&self) -> Result<String> {
        resolve_api_key("zhipu", self.api_key.as_deref(), &self.api_key_env)
    }
}

fn default_zhipu_base_url() -> String {
    "https://open.bigmodel.cn/api/paas/v4".to_string()
}

fn default_zhipu_api_key_env() -> String {
    "ZHIPU_API_KEY".to_string()
}

/// Coze agent platform chat API
#[derive(Debug, Clone, Deserialize)]
pub struct CozeConfig {
    /// API base URL, without the `/v3/chat` suffix
    #[serde(default = "default_coze_base_url")]
    pub base_url: String,
    /// Inline API key (takes precedence over `api_key_env`)
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the API key
    #[serde(default = "default_coze_api_key_env")]
    pub api_key_env: String,
    /// User id reported to Coze for every conversation
    #[serde(default = "default_coze_user_id")]
    pub user_id: String,
}

impl Default for CozeConfig {
    fn default() -> Self {
        Self {
            base_url: default_coze_base_url(),
            api_key: None,
            api_key_env: default_coze_api_key_env(),
            user_id: default_coze_user_id(),
        }
    }
}

impl CozeConfig {
    pub fn resolve_api_key(&self) -> Result<String> {
        resolve_api_key("coze", self.api_key.as_deref(), &self.api_key_env)
    }
}

fn default_coze_base_url() -> String {
    "https://api.coze.cn".to_string()
}

fn default_coze_api_key_env() -> String {
    "COZE_API_KEY".to_string()
}

fn default_coze_user_id() -> String {
    "api_user".to_string()
}

fn resolve_api_key(provider: &str, inline: Option<&str>, env_var: &str) -> Result<String> {
    if let Some(key) = inline.filter(|k| !k.trim().is_empty()) {
        return Ok(key.to_string());
    }

    match std::env::var(env_var) {
        Ok(key) if !key.trim().is_empty() => Ok(key),
        _ => Err(RelayError::Config(format!(
            "No API key for provider '{provider}': set api_key or the '{env_var}' environment variable"
        ))),
    }
}

/// Which upstream a route talks to
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Zhipu,
    Coze,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Zhipu => "zhipu",
            ProviderKind::Coze => "coze",
        }
    }
}

/// A query route (`POST <path>`)
#[derive(Debug, Clone, Deserialize)]
pub struct RouteConfig {
    /// Route path, e.g. "/fast"
    pub path: String,
    /// Upstream provider for this route
    pub provider: ProviderKind,
    /// Default model id (Zhipu)
    #[serde(default)]
    pub model: Option<String>,
    /// Coze bot id
    #[serde(default)]
    pub bot_id: Option<String>,
    /// Default system prompt
    #[serde(default)]
    pub prompt: String,
    /// Knowledge base attached as a retrieval tool (Zhipu)
    #[serde(default)]
    pub knowledge_id: Option<String>,
    /// Retrieval prompt template, with `{{knowledge}}` and `{{question}}` slots
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
    /// Streaming mode when the request does not say
    #[serde(default)]
    pub stream: bool,
    /// Let requests override `model` and `prompt`
    #[serde(default = "default_allow_overrides")]
    pub allow_overrides: bool,
    /// Append the local time to the prompt (and to time-related queries)
    #[serde(default)]
    pub time_hint: bool,
    /// Answer for blocked queries, replacing `filter.rejection_message`
    #[serde(default)]
    pub blocked_response: Option<String>,
    /// Named overrides selectable per request
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

fn default_prompt_template() -> String {
    "从你的知识库\n\"\"\"\n{{knowledge}}\n\"\"\"\n中找问题\n\"\"\"\n{{question}}\n\"\"\"\n的答案，并参考知识库进行回答，\
     不要让用户知道有知识库的存在。知识库里找不到答案，就直接用自身知识回答。\n不要复述问题，直接开始回答。"
        .to_string()
}

fn default_allow_overrides() -> bool {
    true
}

/// Per-request selectable overrides within a route
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProfileConfig {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub knowledge_id: Option<String>,
}

impl Config {
    /// Parse a TOML configuration string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RelayError::Config(format!("Failed to parse config: {e}")))
    }

    /// Parse a JSON configuration string
    pub fn from_json_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| RelayError::Config(format!("Failed to parse config: {e}")))
    }

    /// Read a config file; `.json` files are parsed as JSON, anything else as TOML
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    /// Load the config from an explicit path or the default search locations
    ///
    /// The relay serves nothing without routes, so finding no config file is
    /// an error.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = config_path {
            tracing::info!("Loading config from: {}", path.display());
            return Self::from_file(path);
        }

        for path in Self::default_paths() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(&path);
            }
        }

        Err(RelayError::Config(
            "No config file found (tried ~/.chatrelay/config.toml, the user config dir, ./config.toml and ./config.json)"
                .to_string(),
        ))
    }

    fn default_paths() -> Vec<PathBuf> {
        [
            dirs::home_dir().map(|h| h.join(".chatrelay").join("config.toml")),
            dirs::config_dir().map(|c| c.join("chatrelay").join("config.toml")),
            Some(PathBuf::from("config.toml")),
            Some(PathBuf::from("config.json")),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Check everything a request would otherwise trip over at runtime
    pub fn validate(&self) -> Result<()> {
        if self.routes.is_empty() {
            return Err(RelayError::Config("At least one [[routes]] entry is required".to_string()));
        }

        let mut seen = HashSet::new();
        for route in &self.routes {
            if !route.path.starts_with('/') {
                return Err(RelayError::Config(format!(
                    "Route path '{}' must start with '/'",
                    route.path
                )));
            }
            if route.path == "/health" {
                return Err(RelayError::Config("Route path '/health' is reserved".to_string()));
            }
            if !seen.insert(route.path.as_str()) {
                return Err(RelayError::Config(format!("Duplicate route path '{}'", route.path)));
            }

            match route.provider {
                ProviderKind::Zhipu => {
                    let zhipu = self.providers.zhipu.as_ref().ok_or_else(|| {
                        RelayError::Config(format!(
                            "Route '{}' uses zhipu but [providers.zhipu] is missing",
                            route.path
                        ))
                    })?;
                    zhipu.resolve_api_key()?;

                    // Requests without a profile use the route model or the `default` profile's
                    let non_empty = |m: &Option<String>| m.as_deref().is_some_and(|m| !m.is_empty());
                    let has_model = non_empty(&route.model)
                        || (route.profiles.get(DEFAULT_PROFILE).is_some_and(|p| non_empty(&p.model))
                            && route.profiles.values().all(|p| non_empty(&p.model)));
                    if !has_model {
                        return Err(RelayError::Config(format!(
                            "Route '{}' needs a model",
                            route.path
                        )));
                    }
                }
                ProviderKind::Coze => {
                    let coze = self.providers.coze.as_ref().ok_or_else(|| {
                        RelayError::Config(format!(
                            "Route '{}' uses coze but [providers.coze] is missing",
                            route.path
                        ))
                    })?;
                    coze.resolve_api_key()?;

                    if route.bot_id.as_deref().is_none_or(str::is_empty) {
                        return Err(RelayError::Config(format!(
                            "Route '{}' needs a bot_id",
                            route.path
                        )));
                    }
                }
            }
        }

        if self.auth.enabled && self.auth.keys.is_empty() && self.auth.keys_file.is_none() {
            return Err(RelayError::Config(
                "auth.keys or auth.keys_file is required while auth is enabled".to_string(),
            ));
        }

        check_time_format(&self.prompt.time_format)?;

        if self.prompt.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(RelayError::Config(format!(
                "Unknown time zone '{}'",
                self.prompt.timezone
            )));
        }

        Ok(())
    }
}
