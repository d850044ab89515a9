//! Configuration management for Bull Vision.
//!
//! Handles loading configuration from TOML files and turning server entries
//! into launch specs.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mcp::{ConnectionError, SessionSettings, ToolServerSpec};

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session timeouts
    pub session: SessionConfig,

    /// Agent settings
    pub agent: AgentConfig,

    /// Tool servers, started in this order
    pub servers: Vec<ServerEntry>,
}

/// Timeouts of the tool server sessions, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Spawn-to-ready limit
    pub handshake_timeout_secs: u64,

    /// Default limit for a single tool call
    pub call_timeout_secs: u64,

    /// Limit for each shutdown step of a server
    pub shutdown_grace_secs: u64,
}

/// Agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Maximum model steps per turn
    pub max_iterations: usize,

    /// System instructions (built-in default when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Configuration for a single tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    /// Server name (unique identifier)
    pub name: String,

    /// Command to run the server
    pub command: String,

    /// Command arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables; `${VAR}` is expanded at launch
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// Text encoding of the server's stdio
    #[serde(default = "default_encoding")]
    pub encoding: String,

    /// Whether to cache the server's tool list
    #[serde(default = "default_true")]
    pub cache_tools_list: bool,

    /// Per-server call timeout override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_timeout_secs: Option<u64>,
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn default_true() -> bool {
    true
}

impl ServerEntry {
    /// Create a new server entry.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            encoding: default_encoding(),
            cache_tools_list: true,
            call_timeout_secs: None,
        }
    }

    /// Add arguments.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Add environment variables.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Convert to a launch spec.
    pub fn to_spec(&self) -> ToolServerSpec {
        let mut spec = ToolServerSpec::new(&self.name, &self.command)
            .args(self.args.iter().cloned())
            .encoding(&self.encoding)
            .cache_tools_list(self.cache_tools_list);

        spec.env.clone_from(&self.env);
        if let Some(cwd) = &self.cwd {
            spec = spec.cwd(shellexpand::tilde(cwd).as_ref());
        }
        if let Some(secs) = self.call_timeout_secs {
            spec = spec.call_timeout(Duration::from_secs(secs));
        }
        spec
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Looks for config in:
    /// 1. `.bullvision.toml` in current directory
    /// 2. `~/.config/bullvision/config.toml`
    /// 3. Falls back to defaults
    pub fn load() -> anyhow::Result<Self> {
        let local_config = PathBuf::from(".bullvision.toml");
        if local_config.exists() {
            return Self::load_from_file(&local_config);
        }

        if let Some(config_dir) = Self::config_dir() {
            let global_config = config_dir.join("config.toml");
            if global_config.exists() {
                return Self::load_from_file(&global_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Get the config directory path.
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("bullvision"))
    }

    /// Session timeouts as durations.
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            handshake_timeout: Duration::from_secs(self.session.handshake_timeout_secs),
            call_timeout: Duration::from_secs(self.session.call_timeout_secs),
            shutdown_grace: Duration::from_secs(self.session.shutdown_grace_secs),
        }
    }

    /// Launch specs for every configured server, validated.
    pub fn server_specs(&self) -> Result<Vec<ToolServerSpec>, ConnectionError> {
        let mut names = HashSet::new();
        let mut specs = Vec::with_capacity(self.servers.len());

        for entry in &self.servers {
            if !names.insert(entry.name.as_str()) {
                return Err(ConnectionError::DuplicateName(entry.name.clone()));
            }
            let spec = entry.to_spec();
            spec.validate()?;
            specs.push(spec);
        }

        Ok(specs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { handshake_timeout_secs: 30, call_timeout_secs: 60, shutdown_grace_secs: 5 }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { max_iterations: 10, instructions: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.servers.is_empty());
        assert_eq!(config.agent.max_iterations, 10);

        let settings = config.session_settings();
        assert_eq!(settings.handshake_timeout, Duration::from_secs(30));
        assert_eq!(settings.call_timeout, Duration::from_secs(60));
        assert_eq!(settings.shutdown_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [session]
            call_timeout_secs = 90

            [agent]
            instructions = "Be brief."

            [[servers]]
            name = "search-stock-news"
            command = "uvx"
            args = ["search-stock-news"]
            env = { TAVILY_API_KEY = "${TAVILY_API_KEY}" }

            [[servers]]
            name = "volume-wall-detector"
            command = "uvx"
            args = ["volume-wall-detector"]
            encoding = "latin1"
            cache_tools_list = false
            call_timeout_secs = 120
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.session.call_timeout_secs, 90);
        assert_eq!(config.session.handshake_timeout_secs, 30);
        assert_eq!(config.agent.instructions.as_deref(), Some("Be brief."));
        assert_eq!(config.servers.len(), 2);

        let news = &config.servers[0];
        assert_eq!(news.encoding, "utf-8");
        assert!(news.cache_tools_list);
        assert_eq!(news.env["TAVILY_API_KEY"], "${TAVILY_API_KEY}");

        let specs = config.server_specs().unwrap();
        assert_eq!(specs[1].name, "volume-wall-detector");
        assert_eq!(specs[1].encoding, "latin1");
        assert!(!specs[1].cache_tools_list);
        assert_eq!(specs[1].call_timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_duplicate_server_names() {
        let config = Config {
            servers: vec![ServerEntry::new("news", "a"), ServerEntry::new("news", "b")],
            ..Config::default()
        };
        assert!(matches!(config.server_specs(), Err(ConnectionError::DuplicateName(_))));
    }

    #[test]
    fn test_unknown_encoding_rejected() {
        let mut entry = ServerEntry::new("news", "uvx");
        entry.encoding = "ebcdic-klingon".to_string();
        let config = Config { servers: vec![entry], ..Config::default() };
        assert!(matches!(config.server_specs(), Err(ConnectionError::InvalidSpec { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[[servers]]\nname = \"echo\"\ncommand = \"cat\"\n").unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.servers[0].name, "echo");

        std::fs::write(&path, "servers = 3").unwrap();
        assert!(Config::load_from_file(&path).is_err());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.servers.push(ServerEntry::new("news", "uvx").with_args(vec!["news".into()]));

        let toml_str = toml::to_string(&config).unwrap();
        assert!(toml_str.contains("[session]"));
        assert!(toml_str.contains("[[servers]]"));
        assert!(toml_str.contains("name = \"news\""));
    }
}
