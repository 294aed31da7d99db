//! Runtime configuration for the dir2mcp server core.
//!
//! The core is configured through a plain [`Config`] value handed to
//! [`crate::mcp::server::McpServer::new`]. Loading that value from YAML or
//! the environment is the embedding process's concern; the core only
//! validates what it is given.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// HTTP path the MCP endpoint is mounted on. Must start with `/`.
    pub mcp_path: String,
    /// Socket address the server binds to.
    pub listen_addr: String,
    /// Directory being served. `open_file` resolution is confined to it.
    pub root: PathBuf,
    /// Directory for core-owned state (settlement log).
    pub state_dir: PathBuf,
    pub auth: AuthConfig,
    /// Normalized origin allow-set. Empty means the origin check is skipped.
    pub allowed_origins: Vec<String>,
    /// CIDR blocks (or single addresses) whose `X-Forwarded-For` is trusted.
    pub trusted_proxies: Vec<String>,
    /// Sustained requests per second per client IP. Zero disables limiting.
    pub rate_limit_rps: f64,
    /// Token bucket capacity per client IP. Zero disables limiting.
    pub rate_limit_burst: f64,
    /// Idle time after which a client's bucket is swept.
    #[serde(with = "duration_secs")]
    pub rate_limit_idle_ttl: Duration,
    /// Zero means unset; the registry substitutes its default.
    #[serde(with = "duration_secs")]
    pub session_inactivity_timeout: Duration,
    /// Zero means unset; the registry substitutes its default.
    #[serde(with = "duration_secs")]
    pub session_max_lifetime: Duration,
    /// SSE heartbeat cadence.
    #[serde(with = "duration_secs")]
    pub health_check_interval: Duration,
    pub body_limit_bytes: usize,
    /// Sub-query overfetch multiplier for `index=both` merging, in [1,100].
    pub overfetch_multiplier: u32,
    /// Additional exclusion globs on top of the built-in set.
    pub exclude_globs: Vec<String>,
    pub server_name: String,
    pub server_version: String,
    pub protocol_version: String,
    pub x402: X402Config,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub mode: AuthMode,
    /// Shared bearer token for `token` mode.
    pub token: Option<String>,
    /// Accepted bearer tokens for `allowlist` mode.
    pub allowlist: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    None,
    Token,
    Allowlist,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum X402Mode {
    Off,
    /// Gate tool calls, but fall open to unpaid service when the
    /// requirement tuple does not validate.
    On,
    /// Gate tool calls; an invalid requirement tuple is a startup error.
    Required,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct X402Config {
    pub mode: X402Mode,
    /// Payment scheme identifier, e.g. `exact`.
    pub scheme: String,
    /// CAIP-2 network identifier, e.g. `eip155:84532`.
    pub network: String,
    /// Price per tool call in atomic units, as a decimal string.
    pub price_atomic: String,
    pub max_amount_required: String,
    /// Asset contract address.
    pub asset: String,
    pub pay_to: String,
    pub resource_base_url: String,
    pub facilitator_url: String,
    pub facilitator_token: Option<String>,
    /// The gate only ever applies to `tools/call`, and only when this is set.
    pub tools_call_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mcp_path: "/mcp".to_string(),
            listen_addr: "127.0.0.1:8948".to_string(),
            root: PathBuf::from("."),
            state_dir: PathBuf::from(".dir2mcp"),
            auth: AuthConfig {
                mode: AuthMode::None,
                token: None,
                allowlist: Vec::new(),
            },
            allowed_origins: Vec::new(),
            trusted_proxies: Vec::new(),
            rate_limit_rps: 10.0,
            rate_limit_burst: 20.0,
            rate_limit_idle_ttl: Duration::from_secs(300),
            session_inactivity_timeout: Duration::ZERO,
            session_max_lifetime: Duration::ZERO,
            health_check_interval: Duration::from_secs(30),
            body_limit_bytes: 1024 * 1024,
            overfetch_multiplier: 5,
            exclude_globs: Vec::new(),
            server_name: "dir2mcp".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: "2025-06-18".to_string(),
            x402: X402Config::default(),
        }
    }
}

impl Default for X402Config {
    fn default() -> Self {
        Self {
            mode: X402Mode::Off,
            scheme: "exact".to_string(),
            network: "eip155:84532".to_string(),
            price_atomic: "1000".to_string(),
            max_amount_required: "1000".to_string(),
            asset: String::new(),
            pay_to: String::new(),
            resource_base_url: "http://127.0.0.1:8948".to_string(),
            facilitator_url: "https://facilitator.x402.rs".to_string(),
            facilitator_token: None,
            tools_call_enabled: true,
        }
    }
}

impl Config {
    /// Validate the parts of the configuration the core depends on.
    ///
    /// x402 requirement-tuple strictness is checked separately by the
    /// payment gate so that `on` mode can fall open instead of failing.
    pub fn validate(&self) -> Result<()> {
        if !self.mcp_path.starts_with('/') || self.mcp_path.len() < 2 {
            bail!("mcp_path must be a non-root path starting with '/'");
        }
        self.listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("listen_addr '{}' is not a socket address", self.listen_addr))?;
        match self.auth.mode {
            AuthMode::Token => {
                if self.auth.token.as_deref().unwrap_or("").is_empty() {
                    bail!("auth mode 'token' requires a non-empty auth token");
                }
            }
            AuthMode::Allowlist => {
                if self.auth.allowlist.iter().all(|t| t.is_empty()) {
                    bail!("auth mode 'allowlist' requires at least one non-empty token");
                }
            }
            AuthMode::None => {}
        }
        if self.body_limit_bytes == 0 {
            bail!("body_limit_bytes must be positive");
        }
        if !(1..=100).contains(&self.overfetch_multiplier) {
            bail!(
                "overfetch_multiplier {} outside [1,100]",
                self.overfetch_multiplier
            );
        }
        if self.rate_limit_rps < 0.0 || self.rate_limit_burst < 0.0 {
            bail!("rate limit parameters must not be negative");
        }
        if self.health_check_interval.is_zero() {
            bail!("health_check_interval must be positive");
        }
        for glob in &self.exclude_globs {
            glob::Pattern::new(glob)
                .with_context(|| format!("invalid exclude glob '{glob}'"))?;
        }
        Ok(())
    }
}

// Durations are carried as integer seconds on the wire.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().expect("default config");
    }

    #[test]
    fn token_mode_requires_token() {
        let mut config = Config::default();
        config.auth.mode = AuthMode::Token;
        assert!(config.validate().is_err());

        config.auth.token = Some("secret".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_listen_addr() {
        let mut config = Config::default();
        config.listen_addr = "not-an-addr".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_exclude_glob() {
        let mut config = Config::default();
        config.exclude_globs = vec!["[".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_overfetch_out_of_range() {
        let mut config = Config::default();
        config.overfetch_multiplier = 0;
        assert!(config.validate().is_err());
        config.overfetch_multiplier = 101;
        assert!(config.validate().is_err());
    }
}
