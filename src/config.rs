use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;

use crate::auth::AuthHeaders;

pub const DEFAULT_NATS_SERVERS: &str = "nats://localhost:4222";
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_TOOLS_WAIT_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_TOOL_CALL_TIMEOUT: Duration = Duration::from_millis(30_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Stdio,
    Http,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub transport: TransportMode,
    pub bind_addr: String,
    pub bind_port: u16,
    pub nats_servers: String,
    pub master_key: Option<String>,
    pub toolset_key: Option<String>,
    pub toolset_name: Option<String>,
    pub settings: RuntimeSettings,
}

/// Knobs shared by every session, carried in the application state.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub dns_rebinding_protection: bool,
    pub allowed_origins: Vec<String>,
    pub handshake_timeout: Duration,
    pub tools_wait_timeout: Duration,
    pub tool_call_timeout: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            dns_rebinding_protection: false,
            allowed_origins: Vec::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            tools_wait_timeout: DEFAULT_TOOLS_WAIT_TIMEOUT,
            tool_call_timeout: DEFAULT_TOOL_CALL_TIMEOUT,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MCP_TRANSPORT must be one of: stdio, http")]
    InvalidTransport,
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("{0} must be a positive number of milliseconds")]
    InvalidTimeout(&'static str),
    #[error("MCP_DNS_REBINDING_PROTECTION must be true or false")]
    InvalidFlag,
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let transport = match non_empty_var("MCP_TRANSPORT")
            .map(|value| value.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("stdio") => TransportMode::Stdio,
            Some("http") => TransportMode::Http,
            Some(_) => return Err(ConfigError::InvalidTransport),
        };

        let bind_addr = non_empty_var("BIND_ADDR").unwrap_or_else(|| "127.0.0.1".to_string());
        let bind_port = non_empty_var("BIND_PORT")
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8080);

        let dns_rebinding_protection = match non_empty_var("MCP_DNS_REBINDING_PROTECTION")
            .map(|value| value.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("false") | Some("0") => false,
            Some("true") | Some("1") => true,
            Some(_) => return Err(ConfigError::InvalidFlag),
        };

        let allowed_origins = non_empty_var("MCP_ALLOWED_ORIGINS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let config = Self {
            transport,
            bind_addr,
            bind_port,
            nats_servers: non_empty_var("NATS_SERVERS")
                .unwrap_or_else(|| DEFAULT_NATS_SERVERS.to_string()),
            master_key: non_empty_var("MASTER_KEY"),
            toolset_key: non_empty_var("TOOLSET_KEY"),
            toolset_name: non_empty_var("TOOLSET_NAME"),
            settings: RuntimeSettings {
                dns_rebinding_protection,
                allowed_origins,
                handshake_timeout: timeout_var("HANDSHAKE_TIMEOUT_MS", DEFAULT_HANDSHAKE_TIMEOUT)?,
                tools_wait_timeout: timeout_var(
                    "TOOLS_WAIT_TIMEOUT_MS",
                    DEFAULT_TOOLS_WAIT_TIMEOUT,
                )?,
                tool_call_timeout: timeout_var("TOOL_CALL_TIMEOUT_MS", DEFAULT_TOOL_CALL_TIMEOUT)?,
            },
        };

        if config.transport == TransportMode::Http {
            let _ = config.bind_socket()?;
        }
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }

    /// Credentials for the stdio transport, which has no request headers.
    pub fn stdio_auth_headers(&self) -> AuthHeaders {
        AuthHeaders {
            master_key: self.master_key.clone(),
            toolset_key: self.toolset_key.clone(),
            toolset_name: self.toolset_name.clone(),
        }
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn timeout_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    non_empty_var(name)
        .map(|value| {
            value
                .parse::<u64>()
                .ok()
                .filter(|millis| *millis > 0)
                .map(Duration::from_millis)
                .ok_or(ConfigError::InvalidTimeout(name))
        })
        .transpose()
        .map(|value| value.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    // Tests below mutate the process environment.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "MCP_TRANSPORT",
        "BIND_ADDR",
        "BIND_PORT",
        "NATS_SERVERS",
        "MASTER_KEY",
        "TOOLSET_KEY",
        "TOOLSET_NAME",
        "MCP_DNS_REBINDING_PROTECTION",
        "MCP_ALLOWED_ORIGINS",
        "HANDSHAKE_TIMEOUT_MS",
        "TOOLS_WAIT_TIMEOUT_MS",
        "TOOL_CALL_TIMEOUT_MS",
    ];

    fn clear_env() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn parse_defaults() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();

        let config = Config::from_env().expect("config should parse");
        assert_eq!(config.transport, TransportMode::Stdio);
        assert_eq!(config.bind_addr, "127.0.0.1");
        assert_eq!(config.bind_port, 8080);
        assert_eq!(config.nats_servers, DEFAULT_NATS_SERVERS);
        assert!(!config.settings.dns_rebinding_protection);
        assert!(config.settings.allowed_origins.is_empty());
        assert_eq!(config.settings.handshake_timeout, DEFAULT_HANDSHAKE_TIMEOUT);
    }

    #[test]
    fn http_transport_with_origins_and_timeouts() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();
        env::set_var("MCP_TRANSPORT", "HTTP");
        env::set_var("MCP_DNS_REBINDING_PROTECTION", "true");
        env::set_var(
            "MCP_ALLOWED_ORIGINS",
            "https://app.example.com, http://localhost:5173 ,",
        );
        env::set_var("TOOL_CALL_TIMEOUT_MS", "1500");

        let config = Config::from_env().expect("config should parse");
        assert_eq!(config.transport, TransportMode::Http);
        assert!(config.settings.dns_rebinding_protection);
        assert_eq!(
            config.settings.allowed_origins,
            vec!["https://app.example.com", "http://localhost:5173"]
        );
        assert_eq!(
            config.settings.tool_call_timeout,
            Duration::from_millis(1500)
        );
        clear_env();
    }

    #[test]
    fn stdio_credentials_come_from_env() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();
        env::set_var("TOOLSET_KEY", "tsk_123");
        env::set_var("TOOLSET_NAME", "  ");

        let headers = Config::from_env()
            .expect("config should parse")
            .stdio_auth_headers();
        assert_eq!(headers.toolset_key.as_deref(), Some("tsk_123"));
        assert!(headers.master_key.is_none());
        assert!(headers.toolset_name.is_none());
        clear_env();
    }

    #[test]
    fn invalid_values_fail() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();

        env::set_var("MCP_TRANSPORT", "carrier-pigeon");
        let err = Config::from_env().expect_err("expected invalid transport");
        assert!(matches!(err, ConfigError::InvalidTransport));
        env::remove_var("MCP_TRANSPORT");

        env::set_var("HANDSHAKE_TIMEOUT_MS", "0");
        let err = Config::from_env().expect_err("expected invalid timeout");
        assert!(matches!(err, ConfigError::InvalidTimeout("HANDSHAKE_TIMEOUT_MS")));
        env::remove_var("HANDSHAKE_TIMEOUT_MS");

        env::set_var("MCP_DNS_REBINDING_PROTECTION", "maybe");
        let err = Config::from_env().expect_err("expected invalid flag");
        assert!(matches!(err, ConfigError::InvalidFlag));
        clear_env();
    }
}
