//! Server configuration
//!
//! Loaded from the environment (after `.env`), with defaults for every key.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

/// Upstream proxy for browser contexts
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    /// Accepts `scheme://host:port`, `host:port:user:pass` (http) and
    /// `scheme:host:port:user:pass`
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Some((scheme, rest)) = raw.split_once("://") {
            let (host, port) = rest.trim_end_matches('/').rsplit_once(':')?;
            return Self::build(scheme, host, port, None);
        }

        let parts: Vec<&str> = raw.split(':').collect();
        match parts.as_slice() {
            [host, port, user, pass] => Self::build("http", host, port, Some((*user, *pass))),
            [scheme, host, port, user, pass] => {
                Self::build(scheme, host, port, Some((*user, *pass)))
            }
            _ => None,
        }
    }

    fn build(scheme: &str, host: &str, port: &str, auth: Option<(&str, &str)>) -> Option<Self> {
        let scheme = scheme.to_ascii_lowercase();
        if !matches!(scheme.as_str(), "http" | "https" | "socks4" | "socks5") || host.is_empty() {
            return None;
        }
        Some(Self {
            scheme,
            host: host.to_string(),
            port: port.parse().ok()?,
            username: auth.map(|(u, _)| u.to_string()),
            password: auth.map(|(_, p)| p.to_string()),
        })
    }

    /// `host:port`, the form WebDriver proxy capabilities expect
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub headless: bool,
    /// Browser contexts opened at startup
    pub threads: usize,
    /// Tabs per context
    pub page_count: usize,
    pub proxy: Option<ProxyConfig>,
    pub cleanup_interval: Duration,
    pub result_sweep_interval: Duration,
    pub result_retention: Duration,
    pub recycle_delay: Duration,
    pub webdriver_url: String,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the environment in production)
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.into());

        let port = var("PORT", "5032");
        let port = port
            .parse::<u16>()
            .with_context(|| format!("Invalid PORT: {}", port))?;

        let threads = parse_count(&var("THREAD", "1"), "THREAD")?;
        let page_count = parse_count(&var("PAGE_COUNT", "1"), "PAGE_COUNT")?;

        let proxy = match lookup("PROXY").filter(|p| !p.trim().is_empty()) {
            Some(raw) => {
                let parsed = ProxyConfig::parse(&raw);
                if parsed.is_none() {
                    warn!("Invalid proxy format: {}, using a proxyless context", raw);
                }
                parsed
            }
            None => None,
        };

        Ok(Self {
            host: var("HOST", "127.0.0.1"),
            port,
            headless: var("HEADLESS", "false").eq_ignore_ascii_case("true"),
            threads,
            page_count,
            proxy,
            cleanup_interval: Duration::from_secs(
                parse_u64(&var("CLEANUP_INTERVAL_MINUTES", "60"), "CLEANUP_INTERVAL_MINUTES")? * 60,
            ),
            result_sweep_interval: Duration::from_secs(parse_u64(
                &var("RESULT_SWEEP_INTERVAL_SECS", "3600"),
                "RESULT_SWEEP_INTERVAL_SECS",
            )?),
            result_retention: Duration::from_secs(parse_u64(
                &var("RESULT_RETENTION_SECS", "3600"),
                "RESULT_RETENTION_SECS",
            )?),
            recycle_delay: Duration::from_millis(parse_u64(
                &var("RECYCLE_DELAY_MS", "1500"),
                "RECYCLE_DELAY_MS",
            )?),
            webdriver_url: var("WEBDRIVER_URL", "http://localhost:4444")
                .trim_end_matches('/')
                .to_string(),
        })
    }

    /// Pool size and admission ceiling
    pub fn capacity(&self) -> usize {
        self.threads * self.page_count
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}

fn parse_u64(value: &str, key: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .with_context(|| format!("Invalid {}: {}", key, value))
}

fn parse_count(value: &str, key: &str) -> Result<usize> {
    let n = parse_u64(value, key)?;
    if n == 0 {
        anyhow::bail!("Invalid {}: must be at least 1", key);
    }
    Ok(n as usize)
}
