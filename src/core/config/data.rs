use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 60;
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 5;
pub const DEFAULT_MAX_TOKENS: u32 = 1000;
pub const DEFAULT_SYSTEM_MESSAGE: &str =
    "You are a helpful assistant. Use the available tools when they help answer the user.";

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub servers: ServersConfig,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct ApiConfig {
    /// Chat endpoint; `OPENAI_BASE_URL` takes precedence. When unset, the
    /// model name picks the vendor and its public endpoint.
    pub base_url: Option<String>,
    /// API key; the vendor's key variable (`OPENAI_API_KEY`,
    /// `ANTHROPIC_API_KEY`, `GEMINI_API_KEY`) takes precedence
    pub api_key: Option<String>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct ModelsConfig {
    pub selected: Option<String>,
    #[serde(default)]
    pub available: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct SystemConfig {
    /// System prompt prepended to every LLM call
    pub message: Option<String>,
    /// Per-request timeout for backend traffic
    pub timeout_seconds: Option<u64>,
    /// Let the LLM pick a backend when the user did not name one
    pub auto_select: Option<bool>,
    /// Upper bound on LLM rounds that may request tools within a single turn
    pub max_tool_rounds: Option<usize>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct ServersConfig {
    /// Backend used when neither the user nor the LLM picks one
    pub default: Option<String>,
    /// Backends connected eagerly at startup
    #[serde(default)]
    pub preload: Vec<String>,
    /// Base directory for relative script paths and for script discovery
    pub directory: Option<PathBuf>,
    #[serde(default)]
    pub instances: Vec<BackendConfig>,
}

/// One tool-provider backend as declared in the config file.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct BackendConfig {
    pub name: String,
    /// `piped-script` (alias `stdio`), `launched-command` (alias `command`)
    /// or `event-stream` (alias `sse`)
    #[serde(default = "default_transport", alias = "type")]
    pub transport: String,
    /// Script path for piped-script backends
    pub script: Option<PathBuf>,
    /// Executable for launched-command backends
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// Stream URL for event-stream backends
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    pub description: Option<String>,
    pub enabled: Option<bool>,
    /// When set, only these tools are exposed to the LLM
    pub allowed_tools: Option<Vec<String>>,
}

fn default_transport() -> String {
    "piped-script".to_string()
}

impl BackendConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn display_description(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }

    pub fn allows_tool(&self, tool: &str) -> bool {
        match &self.allowed_tools {
            Some(allowed) => allowed.iter().any(|name| name == tool),
            None => true,
        }
    }

    #[cfg(test)]
    pub fn piped_script(name: &str, script: &str) -> Self {
        Self {
            name: name.to_string(),
            transport: "piped-script".to_string(),
            script: Some(PathBuf::from(script)),
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn launched_command(name: &str, command: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            transport: "launched-command".to_string(),
            command: Some(command.to_string()),
            args: args.iter().map(|arg| arg.to_string()).collect(),
            ..Self::default()
        }
    }

    #[cfg(test)]
    pub fn event_stream(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            transport: "event-stream".to_string(),
            url: Some(url.to_string()),
            ..Self::default()
        }
    }
}

impl Config {
    /// Explicit chat endpoint, if any.
    pub fn base_url(&self) -> Option<String> {
        std::env::var("OPENAI_BASE_URL")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.api.base_url.clone())
            .filter(|value| !value.trim().is_empty())
    }

    /// Key from `env_var`, else `api.api_key`.
    pub fn api_key(&self, env_var: &str) -> Option<String> {
        std::env::var(env_var)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.api.api_key.clone())
    }

    pub fn max_tokens(&self) -> u32 {
        self.api.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)
    }

    pub fn selected_model(&self) -> String {
        self.models
            .selected
            .clone()
            .or_else(|| self.models.available.first().cloned())
            .unwrap_or_else(|| DEFAULT_MODEL.to_string())
    }

    pub fn system_message(&self) -> String {
        self.system
            .message
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_MESSAGE.to_string())
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.system
                .timeout_seconds
                .unwrap_or(DEFAULT_TIMEOUT_SECONDS),
        )
    }

    pub fn auto_select(&self) -> bool {
        self.system.auto_select.unwrap_or(true)
    }

    pub fn max_tool_rounds(&self) -> usize {
        self.system
            .max_tool_rounds
            .unwrap_or(DEFAULT_MAX_TOOL_ROUNDS)
    }

    /// The config written by `switchboard init`.
    pub fn starter(servers_directory: PathBuf) -> Self {
        Config {
            api: ApiConfig {
                base_url: None,
                api_key: None,
                max_tokens: Some(DEFAULT_MAX_TOKENS),
            },
            models: ModelsConfig {
                selected: Some(DEFAULT_MODEL.to_string()),
                available: vec![DEFAULT_MODEL.to_string(), "gpt-4o-mini".to_string()],
            },
            system: SystemConfig {
                message: Some(DEFAULT_SYSTEM_MESSAGE.to_string()),
                timeout_seconds: Some(DEFAULT_TIMEOUT_SECONDS),
                auto_select: Some(true),
                max_tool_rounds: Some(DEFAULT_MAX_TOOL_ROUNDS),
                debug: false,
            },
            servers: ServersConfig {
                default: Some("weather".to_string()),
                preload: Vec::new(),
                directory: Some(servers_directory),
                instances: vec![BackendConfig {
                    name: "weather".to_string(),
                    transport: "piped-script".to_string(),
                    script: Some(PathBuf::from("weather.py")),
                    description: Some("Weather forecasts and alerts".to_string()),
                    ..BackendConfig::default()
                }],
            },
        }
    }
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}
