//! Engine configuration
//!
//! Loaded from a TOML file with a `[server]` table and an optional `[engine]` table.
//! Everything except the server address and the username has a default.

use crate::imap::{ImapError, ImapResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;

/// How the bootstrap task authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMechanism {
    /// `LOGIN user pass`
    #[default]
    Login,
    /// `AUTHENTICATE PLAIN` with an initial response, when the server offers SASL-IR
    Plain,
}

/// Credentials handed to each connection bootstrap
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub mechanism: AuthMechanism,
}

impl Credentials {
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            mechanism: AuthMechanism::Login,
        }
    }

    pub fn with_mechanism(mut self, mechanism: AuthMechanism) -> Self {
        self.mechanism = mechanism;
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("mechanism", &self.mechanism)
            .finish()
    }
}

/// Complete configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineSettings,
}

/// Where and how to connect
#[derive(Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub auth: AuthMechanism,
    #[serde(default = "default_use_tls")]
    pub use_tls: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

fn default_port() -> u16 {
    993
}

fn default_use_tls() -> bool {
    true
}

fn default_timeout_seconds() -> u64 {
    60
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("auth", &self.auth)
            .field("use_tls", &self.use_tls)
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

impl ServerConfig {
    /// Create a new server configuration with password auth
    pub fn new(hostname: String, port: u16, username: String, password: String) -> Self {
        Self {
            hostname,
            port,
            username,
            password,
            auth: AuthMechanism::Login,
            use_tls: port == 993, // Default to TLS for port 993
            timeout_seconds: default_timeout_seconds(),
        }
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_auth(mut self, auth: AuthMechanism) -> Self {
        self.auth = auth;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.username.clone(), self.password.clone()).with_mechanism(self.auth)
    }
}

/// Engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Idle time after which a NOOP is sent on the open connection
    pub keepalive_seconds: u64,
    /// Capacity of the request channel between handles and the engine
    pub request_queue: usize,
    pub retry: RetrySettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            keepalive_seconds: 240,
            request_queue: 64,
            retry: RetrySettings::default(),
        }
    }
}

/// Backoff applied when a transport cannot be established
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl EngineConfig {
    pub fn new(server: ServerConfig) -> Self {
        Self {
            server,
            engine: EngineSettings::default(),
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> ImapResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ImapError::invalid_config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from disk
    pub fn load<P: AsRef<Path>>(path: P) -> ImapResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ImapError::invalid_config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!("Loaded engine configuration from {:?}", path);
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ImapResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ImapError::invalid_config(format!("Failed to serialize config: {}", e)))
    }

    pub fn validate(&self) -> ImapResult<()> {
        if self.server.hostname.trim().is_empty() {
            return Err(ImapError::invalid_config("server.hostname must not be empty"));
        }
        if self.server.username.trim().is_empty() {
            return Err(ImapError::invalid_config("server.username must not be empty"));
        }
        if self.server.port == 0 {
            return Err(ImapError::invalid_config("server.port must not be 0"));
        }
        if self.server.timeout_seconds == 0 {
            return Err(ImapError::invalid_config("server.timeout_seconds must be positive"));
        }
        if self.engine.keepalive_seconds == 0 {
            return Err(ImapError::invalid_config("engine.keepalive_seconds must be positive"));
        }
        if self.engine.request_queue == 0 {
            return Err(ImapError::invalid_config("engine.request_queue must be positive"));
        }
        if self.engine.retry.backoff_multiplier < 1.0 {
            return Err(ImapError::invalid_config(
                "engine.retry.backoff_multiplier must be at least 1.0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [server]
            hostname = "imap.example.com"
            username = "alice"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 993);
        assert!(config.server.use_tls);
        assert_eq!(config.server.auth, AuthMechanism::Login);
        assert_eq!(config.engine.keepalive_seconds, 240);
        assert_eq!(config.engine.retry.max_attempts, 3);
    }

    #[test]
    fn test_full_config() {
        let config = EngineConfig::from_toml_str(
            r#"
            [server]
            hostname = "localhost"
            port = 143
            username = "bob"
            password = "secret"
            auth = "plain"
            use_tls = false

            [engine]
            keepalive_seconds = 30

            [engine.retry]
            max_attempts = 5
            jitter = false
            "#,
        )
        .unwrap();

        assert_eq!(config.server.address(), "localhost:143");
        assert_eq!(config.server.credentials().mechanism, AuthMechanism::Plain);
        assert_eq!(config.engine.keepalive_seconds, 30);
        assert_eq!(config.engine.retry.max_attempts, 5);
        assert!(!config.engine.retry.jitter);
        assert_eq!(config.engine.retry.base_delay_ms, 500);
    }

    #[test]
    fn test_validation_errors() {
        let result = EngineConfig::from_toml_str(
            r#"
            [server]
            hostname = ""
            username = "bob"
            "#,
        );
        assert!(matches!(result, Err(ImapError::InvalidConfig(_))));

        let result = EngineConfig::from_toml_str("[server]\nhostname = 3\n");
        assert!(matches!(result, Err(ImapError::InvalidConfig(_))));
    }

    #[test]
    fn test_password_is_not_logged() {
        let server = ServerConfig::new(
            "imap.example.com".to_string(),
            993,
            "alice".to_string(),
            "hunter2".to_string(),
        );
        assert!(!format!("{:?}", server).contains("hunter2"));
        assert!(!format!("{:?}", server.credentials()).contains("hunter2"));
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = EngineConfig::new(
            ServerConfig::new("h".to_string(), 143, "u".to_string(), "p".to_string())
                .with_timeout(5),
        );
        let text = config.to_toml_string().unwrap();
        let parsed = EngineConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed.server.timeout_seconds, 5);
        assert!(!parsed.server.use_tls);
    }
}
