use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the wrapper
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Public listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// How to launch the supervised gateway
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Readiness probing of a freshly started gateway
    #[serde(default)]
    pub readiness: ReadinessConfig,

    /// WebSocket bridge tuning
    #[serde(default)]
    pub websocket: WebSocketConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,

    /// Base path of the gateway's browser UI, target of the access redirect
    #[serde(default = "default_ui_base_path")]
    pub ui_base_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            pid_file: None,
            ui_base_path: default_ui_base_path(),
        }
    }
}

/// Configuration for the supervised gateway process
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// wrapper. Configuration files must be protected accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Executable that runs the gateway
    #[serde(default = "default_gateway_command")]
    pub command: String,

    /// Leading arguments; bind/port/auth arguments are appended at spawn time
    #[serde(default = "default_gateway_args")]
    pub args: Vec<String>,

    /// Working directory for the gateway
    pub working_dir: Option<String>,

    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Loopback port the gateway listens on
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Directory holding the persisted access token and gateway state
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// File whose presence means the gateway has been configured
    /// (default: `<state_dir>/gateway.json`)
    pub config_file: Option<String>,

    /// Fixed access token; generated and persisted when absent
    pub token: Option<String>,

    /// Grace period between SIGTERM and SIGKILL when stopping the gateway
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_ms: u64,

    /// Max time to wait for the gateway to answer a proxied request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            command: default_gateway_command(),
            args: default_gateway_args(),
            working_dir: None,
            env: HashMap::new(),
            port: default_gateway_port(),
            state_dir: default_state_dir(),
            config_file: None,
            token: None,
            shutdown_grace_period_ms: default_shutdown_grace_period(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl GatewayConfig {
    /// Create a gateway config for the given command with defaults
    pub fn new(command: &str, port: u16) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            port,
            ..Self::default()
        }
    }

    /// Set leading arguments (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set the state directory (builder pattern)
    pub fn with_state_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.state_dir = dir.as_ref().to_string_lossy().into_owned();
        self
    }

    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(&self.state_dir)
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_file
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.state_dir().join("gateway.json"))
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_period_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Base URL of the gateway on loopback
    pub fn target(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReadinessConfig {
    /// Total time budget for a freshly spawned gateway to become ready
    #[serde(default = "default_ready_timeout")]
    pub timeout_ms: u64,

    /// Spacing between health probes
    #[serde(default = "default_ready_poll_interval")]
    pub poll_interval_ms: u64,

    /// Timeout of a single health probe
    #[serde(default = "default_ready_request_timeout")]
    pub request_timeout_ms: u64,

    /// Health endpoint path
    #[serde(default = "default_ready_path")]
    pub path: String,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_ready_timeout(),
            poll_interval_ms: default_ready_poll_interval(),
            request_timeout_ms: default_ready_request_timeout(),
            path: default_ready_path(),
        }
    }
}

impl ReadinessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebSocketConfig {
    /// TCP keep-alive idle time applied to both legs of a pairing
    #[serde(default = "default_ws_keepalive")]
    pub keepalive_ms: u64,

    /// Application-level ping interval, per side
    #[serde(default = "default_ws_ping_interval")]
    pub ping_interval_ms: u64,

    /// How long a graceful close of the peer may take before it is dropped
    #[serde(default = "default_ws_close_timeout")]
    pub close_timeout_ms: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            keepalive_ms: default_ws_keepalive(),
            ping_interval_ms: default_ws_ping_interval(),
            close_timeout_ms: default_ws_close_timeout(),
        }
    }
}

impl WebSocketConfig {
    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_ui_base_path() -> String {
    "/ui".to_string()
}

fn default_gateway_command() -> String {
    "gateway".to_string()
}

fn default_gateway_args() -> Vec<String> {
    vec!["run".to_string()]
}

fn default_gateway_port() -> u16 {
    18789
}

fn default_state_dir() -> String {
    "./.gatehouse".to_string()
}

fn default_shutdown_grace_period() -> u64 {
    750
}

fn default_request_timeout() -> u64 {
    120
}

fn default_ready_timeout() -> u64 {
    60_000 // cold starts can be slow
}

fn default_ready_poll_interval() -> u64 {
    250
}

fn default_ready_request_timeout() -> u64 {
    2_000
}

fn default_ready_path() -> String {
    "/healthz".to_string()
}

fn default_ws_keepalive() -> u64 {
    30_000
}

fn default_ws_ping_interval() -> u64 {
    25_000
}

fn default_ws_close_timeout() -> u64 {
    5_000
}

impl Config {
    /// Load from a TOML file; a missing file yields the defaults
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config: Config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            Config::default()
        };
        Ok(config)
    }

    /// Load, apply `GATEHOUSE_*` environment overrides and validate
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment-style overrides. `lookup` is injected so tests do not
    /// have to mutate the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid value for {}: {:?}", key, value))
        }

        if let Some(v) = lookup("GATEHOUSE_PORT") {
            self.server.port = parse("GATEHOUSE_PORT", &v)?;
        }
        if let Some(v) = lookup("GATEHOUSE_BIND") {
            self.server.bind = v;
        }
        if let Some(v) = lookup("GATEHOUSE_STATE_DIR") {
            self.gateway.state_dir = v;
        }
        if let Some(v) = lookup("GATEHOUSE_GATEWAY_TOKEN") {
            if !v.trim().is_empty() {
                self.gateway.token = Some(v.trim().to_string());
            }
        }
        if let Some(v) = lookup("GATEHOUSE_GATEWAY_PORT") {
            self.gateway.port = parse("GATEHOUSE_GATEWAY_PORT", &v)?;
        }
        if let Some(v) = lookup("GATEHOUSE_READY_TIMEOUT_MS") {
            self.readiness.timeout_ms = parse("GATEHOUSE_READY_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("GATEHOUSE_READY_POLL_INTERVAL_MS") {
            self.readiness.poll_interval_ms = parse("GATEHOUSE_READY_POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("GATEHOUSE_READY_REQUEST_TIMEOUT_MS") {
            self.readiness.request_timeout_ms = parse("GATEHOUSE_READY_REQUEST_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = lookup("GATEHOUSE_READY_PATH") {
            self.readiness.path = v;
        }
        if let Some(v) = lookup("GATEHOUSE_WS_KEEPALIVE_MS") {
            self.websocket.keepalive_ms = parse("GATEHOUSE_WS_KEEPALIVE_MS", &v)?;
        }
        if let Some(v) = lookup("GATEHOUSE_WS_PING_INTERVAL_MS") {
            self.websocket.ping_interval_ms = parse("GATEHOUSE_WS_PING_INTERVAL_MS", &v)?;
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.gateway.command.trim().is_empty() {
            errors.push("gateway: 'command' must not be empty".to_string());
        }
        if self.gateway.port == 0 {
            errors.push("gateway: 'port' must be greater than 0".to_string());
        }
        if !self.readiness.path.starts_with('/') {
            errors.push(format!(
                "readiness: 'path' must start with '/', got {:?}",
                self.readiness.path
            ));
        }
        if self.readiness.poll_interval_ms == 0 {
            errors.push("readiness: 'poll_interval_ms' must be greater than 0".to_string());
        }
        if self.websocket.ping_interval_ms == 0 {
            errors.push("websocket: 'ping_interval_ms' must be greater than 0".to_string());
        }
        if !self.server.ui_base_path.starts_with('/') || self.server.ui_base_path.len() < 2 {
            errors.push(format!(
                "server: 'ui_base_path' must be a non-root absolute path, got {:?}",
                self.server.ui_base_path
            ));
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
