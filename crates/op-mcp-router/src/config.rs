//! Configuration for the MCP router
//!
//! Supports loading from JSON/YAML files or building programmatically.

use crate::error::RouterError;
use crate::namespace::ServerId;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Main configuration for the router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Downstream MCP servers to aggregate
    #[serde(default)]
    pub servers: Vec<ServerDefinition>,

    /// Named profiles, each a set of server ids
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileConfig>,

    /// Reject duplicate friendly aliases instead of falling back to
    /// namespaced ids
    #[serde(default)]
    pub strict: bool,

    /// Per-call deadline for downstream requests
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    /// Deadline for the initialize handshake
    #[serde(default = "default_init_timeout")]
    pub init_timeout_secs: u64,

    /// How long a local process gets to exit after stdin is closed
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    /// Capacity of per-server notification and per-session outbound queues
    #[serde(default = "default_notification_buffer")]
    pub notification_buffer: usize,
}

fn default_call_timeout() -> u64 {
    60
}

fn default_init_timeout() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    2000
}

fn default_notification_buffer() -> usize {
    256
}

fn default_true() -> bool {
    true
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            servers: vec![],
            profiles: BTreeMap::new(),
            strict: false,
            call_timeout_secs: default_call_timeout(),
            init_timeout_secs: default_init_timeout(),
            shutdown_grace_ms: default_shutdown_grace(),
            reconnect: ReconnectPolicy::default(),
            notification_buffer: default_notification_buffer(),
        }
    }
}

impl RouterConfig {
    /// Load configuration from a JSON or YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config = Self::parse(&content, is_yaml(path))
            .with_context(|| format!("Invalid config in {}", path.display()))?;

        info!("Loaded router config from {}", path.display());
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn parse(content: &str, yaml: bool) -> Result<Self> {
        let config: Self = if yaml {
            serde_yaml::from_str(content).context("Failed to parse YAML config")?
        } else {
            serde_json::from_str(content).context("Failed to parse JSON config")?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load from default paths, with fallbacks
    pub fn load_default() -> Result<Self> {
        for path in Self::default_paths() {
            if path.exists() {
                return Self::load(path);
            }
        }

        info!("No router config found, using defaults");
        Ok(Self::default())
    }

    pub fn default_paths() -> Vec<PathBuf> {
        vec![
            PathBuf::from("/etc/op-dbus/mcp-router.json"),
            PathBuf::from("/etc/op-dbus/mcp-router.yaml"),
            PathBuf::from("mcp-router.json"),
            PathBuf::from("mcp-router.yaml"),
        ]
    }

    /// Reject duplicate server ids and invalid timing values
    pub fn validate(&self) -> std::result::Result<(), RouterError> {
        let mut seen = HashSet::new();
        for server in &self.servers {
            if !seen.insert(server.id.as_str()) {
                return Err(RouterError::DuplicateServer { id: server.id.to_string() });
            }
        }
        if self.call_timeout_secs == 0 {
            return Err(RouterError::Config("call_timeout_secs must be positive".into()));
        }
        if self.notification_buffer == 0 {
            return Err(RouterError::Config("notification_buffer must be positive".into()));
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Create a builder for programmatic configuration
    pub fn builder() -> RouterConfigBuilder {
        RouterConfigBuilder::default()
    }
}

pub(crate) fn is_yaml(path: &Path) -> bool {
    path.extension().map(|e| e == "yaml" || e == "yml").unwrap_or(false)
}

/// Builder for RouterConfig
#[derive(Default)]
pub struct RouterConfigBuilder {
    config: RouterConfig,
}

impl RouterConfigBuilder {
    pub fn server(mut self, server: ServerDefinition) -> Self {
        self.config.servers.push(server);
        self
    }

    pub fn profile(mut self, name: &str, profile: ProfileConfig) -> Self {
        self.config.profiles.insert(name.to_string(), profile);
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.config.strict = strict;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect = policy;
        self
    }

    pub fn build(self) -> RouterConfig {
        self.config
    }
}

/// Registration record for one downstream server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDefinition {
    /// Unique identifier, used as the namespace prefix
    pub id: ServerId,

    /// Whether this server is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Overrides the router-wide call timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    pub transport: TransportConfig,
}

impl ServerDefinition {
    /// A server spawned as a local process speaking over stdio
    pub fn local(id: ServerId, command: &str, args: &[&str]) -> Self {
        Self {
            id,
            enabled: true,
            timeout_secs: None,
            transport: TransportConfig::Local {
                command: command.to_string(),
                args: args.iter().map(|a| a.to_string()).collect(),
                env: BTreeMap::new(),
                cwd: None,
            },
        }
    }

    /// A remote server reached over streamable HTTP
    pub fn remote(id: ServerId, url: &str) -> Self {
        Self {
            id,
            enabled: true,
            timeout_secs: None,
            transport: TransportConfig::Remote {
                url: url.to_string(),
                headers: BTreeMap::new(),
                auth: None,
                mode: RemoteMode::default(),
            },
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        if let TransportConfig::Local { env, .. } = &mut self.transport {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let TransportConfig::Remote { headers, .. } = &mut self.transport {
            headers.insert(name.to_string(), value.to_string());
        }
        self
    }

    pub fn with_auth(mut self, server_auth: ServerAuth) -> Self {
        if let TransportConfig::Remote { auth, .. } = &mut self.transport {
            *auth = Some(server_auth);
        }
        self
    }

    pub fn with_mode(mut self, remote_mode: RemoteMode) -> Self {
        if let TransportConfig::Remote { mode, .. } = &mut self.transport {
            *mode = remote_mode;
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }
}

/// How the router reaches a downstream server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Spawned process, JSON-RPC over stdin/stdout
    Local {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        /// Values may reference the router's environment as `${VAR}`
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    /// Remote HTTP endpoint
    Remote {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        auth: Option<ServerAuth>,
        #[serde(default)]
        mode: RemoteMode,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Local { .. } => TransportKind::Local,
            Self::Remote { .. } => TransportKind::Remote,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Local,
    Remote,
}

/// Wire mode for remote servers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteMode {
    /// Streamable HTTP: POST per message, JSON or event-stream replies
    #[default]
    Http,
    /// Legacy HTTP+SSE: persistent GET stream plus a POST endpoint
    Sse,
}

/// Authentication configuration for remote servers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerAuth {
    /// Bearer token authentication
    Bearer {
        /// Token value (can be env var reference like ${GITHUB_TOKEN})
        token: String,
    },
    /// Basic authentication
    Basic { username: String, password: String },
    /// Custom header
    Header { name: String, value: String },
}

impl ServerAuth {
    /// Header name and value to send with every request
    pub fn header(&self) -> (String, String) {
        use base64::Engine;
        match self {
            Self::Bearer { token } => (
                "Authorization".to_string(),
                format!("Bearer {}", resolve_env_var(token)),
            ),
            Self::Basic { username, password } => {
                let credentials = base64::engine::general_purpose::STANDARD.encode(format!(
                    "{}:{}",
                    resolve_env_var(username),
                    resolve_env_var(password)
                ));
                ("Authorization".to_string(), format!("Basic {}", credentials))
            }
            Self::Header { name, value } => (name.clone(), resolve_env_var(value)),
        }
    }
}

/// Resolve environment variable references like ${VAR_NAME}
pub fn resolve_env_var(value: &str) -> String {
    match value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) {
        Some(var_name) => std::env::var(var_name).unwrap_or_else(|_| value.to_string()),
        None => value.to_string(),
    }
}

/// Profile membership: which servers a session on this profile may use
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileConfig {
    #[serde(default)]
    pub description: String,

    /// May name servers that are not registered
    #[serde(default)]
    pub servers: BTreeSet<ServerId>,
}

impl ProfileConfig {
    pub fn new(description: &str) -> Self {
        Self {
            description: description.to_string(),
            ..Default::default()
        }
    }

    pub fn with_servers<I: IntoIterator<Item = ServerId>>(mut self, servers: I) -> Self {
        self.servers = servers.into_iter().collect();
        self
    }
}

/// Exponential backoff for reconnect attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Give up after this many consecutive failures (None = never)
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// A link that stays up this long clears the failure count. Links
    /// lost sooner count as failed attempts.
    #[serde(default = "default_stable_after")]
    pub stable_after_ms: u64,
}

fn default_initial_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_stable_after() -> u64 {
    30_000
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            max_attempts: None,
            stable_after_ms: default_stable_after(),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.initial_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.map(|max| attempts >= max).unwrap_or(false)
    }

    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.stable_after_ms)
    }
}
