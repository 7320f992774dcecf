//! Configuration for the proxy.
//!
//! Loaded once at startup from environment variables, optionally overlaid
//! by a TOML file, and shared across tasks via `Arc`. Listener specs use a
//! compact `addr;key=value;...` form so the same parser serves both
//! sources.

use crate::error::{ProxyError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Listener protocol selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Http,
    Https,
    Grpc,
    Grpcs,
    Tcp,
    TcpSni,
    TcpDynamic,
    HttpsTcpSni,
}

impl FromStr for Proto {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "http" => Ok(Proto::Http),
            "https" => Ok(Proto::Https),
            "grpc" => Ok(Proto::Grpc),
            "grpcs" => Ok(Proto::Grpcs),
            "tcp" => Ok(Proto::Tcp),
            "tcp+sni" => Ok(Proto::TcpSni),
            "tcp-dynamic" => Ok(Proto::TcpDynamic),
            "https+tcp+sni" => Ok(Proto::HttpsTcpSni),
            other => Err(ProxyError::Config(format!("invalid protocol {:?}", other))),
        }
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Proto::Http => "http",
            Proto::Https => "https",
            Proto::Grpc => "grpc",
            Proto::Grpcs => "grpcs",
            Proto::Tcp => "tcp",
            Proto::TcpSni => "tcp+sni",
            Proto::TcpDynamic => "tcp-dynamic",
            Proto::HttpsTcpSni => "https+tcp+sni",
        };
        f.write_str(s)
    }
}

/// Target selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Uniform draw over the weighted wheel.
    #[default]
    Random,
    /// Per-route counter over the weighted wheel.
    RoundRobin,
}

impl FromStr for Strategy {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rnd" => Ok(Strategy::Random),
            "rr" => Ok(Strategy::RoundRobin),
            other => Err(ProxyError::Config(format!("invalid strategy {:?}", other))),
        }
    }
}

/// Path matching mode for route lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Matcher {
    /// Case-sensitive prefix comparison.
    #[default]
    Prefix,
    /// Case-insensitive prefix comparison.
    IPrefix,
    /// Glob pattern match via the process-wide glob cache.
    Glob,
}

impl FromStr for Matcher {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "prefix" => Ok(Matcher::Prefix),
            "iprefix" => Ok(Matcher::IPrefix),
            "glob" => Ok(Matcher::Glob),
            other => Err(ProxyError::Config(format!("invalid matcher {:?}", other))),
        }
    }
}

/// File-based certificate source for a listener.
#[derive(Debug, Clone)]
pub struct CertSourceConfig {
    /// Path to the certificate chain (PEM).
    pub cert_path: String,
    /// Path to the private key (PEM).
    pub key_path: String,
    /// How often to re-read the PEM material for hot rotation.
    pub poll: Duration,
}

/// A single listener record.
#[derive(Debug, Clone)]
pub struct ListenConfig {
    pub addr: String,
    pub proto: Proto,
    pub cert_source: Option<CertSourceConfig>,
    /// Reject handshakes whose SNI has no matching certificate.
    pub strict_match: bool,
    pub tls_min: Option<String>,
    pub tls_max: Option<String>,
    pub tls_ciphers: Vec<String>,
    /// Rescan interval for `tcp-dynamic` listeners.
    pub refresh: Duration,
}

impl ListenConfig {
    /// Parses a compact listener spec: `addr;proto=https;cs=cert.pem:key.pem;...`.
    ///
    /// Recognized keys: `proto`, `cs` (cert:key paths), `cspoll`,
    /// `strictmatch`, `tlsmin`, `tlsmax`, `tlsciphers` (colon-separated),
    /// `refresh`.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut parts = spec.split(';');
        let addr = parts
            .next()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| ProxyError::Config(format!("listener spec {:?} has no address", spec)))?
            .to_string();

        let mut proto = Proto::Http;
        let mut cert = None;
        let mut cert_poll = Duration::from_secs(0);
        let mut strict_match = false;
        let mut tls_min = None;
        let mut tls_max = None;
        let mut tls_ciphers = Vec::new();
        let mut refresh = Duration::from_secs(5);

        for kv in parts {
            if kv.is_empty() {
                continue;
            }
            let (key, value) = kv
                .split_once('=')
                .ok_or_else(|| ProxyError::Config(format!("malformed listener option {:?}", kv)))?;
            match key {
                "proto" => proto = value.parse()?,
                "cs" => {
                    let (c, k) = value.split_once(':').ok_or_else(|| {
                        ProxyError::Config(format!("cert source {:?} must be cert:key", value))
                    })?;
                    cert = Some((c.to_string(), k.to_string()));
                }
                "cspoll" => cert_poll = parse_duration(value)?,
                "strictmatch" => strict_match = value == "true",
                "tlsmin" => tls_min = Some(value.to_string()),
                "tlsmax" => tls_max = Some(value.to_string()),
                "tlsciphers" => {
                    tls_ciphers = value.split(':').map(|s| s.to_string()).collect();
                }
                "refresh" => refresh = parse_duration(value)?,
                other => {
                    return Err(ProxyError::Config(format!(
                        "unknown listener option {:?}",
                        other
                    )))
                }
            }
        }

        let cert_source = cert.map(|(cert_path, key_path)| CertSourceConfig {
            cert_path,
            key_path,
            poll: cert_poll,
        });

        // TLS-terminating protocols need certificate material up front.
        if cert_source.is_none() {
            match proto {
                Proto::Https | Proto::Grpcs | Proto::HttpsTcpSni => {
                    return Err(ProxyError::Config(format!(
                        "listener {} with proto {} requires a cert source",
                        addr, proto
                    )));
                }
                _ => {}
            }
        }

        Ok(Self {
            addr,
            proto,
            cert_source,
            strict_match,
            tls_min,
            tls_max,
            tls_ciphers,
            refresh,
        })
    }
}

/// Registry backend selection and retry bounds.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// `static` or `file`.
    pub backend: String,
    /// Route commands for the static backend.
    pub static_routes: String,
    /// No-route HTML for the static backend.
    pub static_noroute_html: String,
    /// Routes file for the file backend.
    pub file_path: String,
    /// Optional no-route HTML file for the file backend.
    pub noroute_html_path: String,
    /// Re-read interval for the file backend. Zero reads once.
    pub poll: Duration,
    /// Total time to keep retrying registry startup before giving up.
    pub timeout: Duration,
    /// Pause between registry startup retries.
    pub retry: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: "static".to_string(),
            static_routes: String::new(),
            static_noroute_html: String::new(),
            file_path: String::new(),
            noroute_html_path: String::new(),
            poll: Duration::from_secs(0),
            timeout: Duration::from_secs(30),
            retry: Duration::from_secs(1),
        }
    }
}

/// Proxy configuration loaded at startup.
///
/// # Environment Variables
///
/// * `PROXY_LISTEN` - comma-separated listener specs (default `:9999;proto=http`)
/// * `PROXY_ADMIN_ADDR` - admin endpoint address (default `127.0.0.1:9998`)
/// * `PROXY_STRATEGY` - `rnd` or `rr` (default `rnd`)
/// * `PROXY_MATCHER` - `prefix`, `iprefix`, or `glob` (default `prefix`)
/// * `PROXY_CONFIG_FILE` - optional TOML file overlaying the defaults
/// * `REGISTRY_BACKEND` / `REGISTRY_STATIC_ROUTES` / `REGISTRY_FILE_PATH`
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen: Vec<ListenConfig>,
    pub admin_addr: String,
    pub strategy: Strategy,
    pub matcher: Matcher,

    pub dial_timeout: Duration,
    pub response_header_timeout: Duration,
    pub keep_alive_timeout: Duration,
    pub idle_conn_timeout: Duration,
    /// Per-target idle connection cap for the pooled transports, and the
    /// per-listener concurrent handler cap.
    pub max_conn: usize,
    pub shutdown_wait: Duration,

    pub glob_cache_size: usize,
    pub glob_matching_disabled: bool,

    /// Header carrying an opaque tracing token to propagate upstream.
    pub trace_header: String,
    /// Header carrying the comma-separated request tag set.
    pub tag_header: String,
    /// Diff format for table updates: `delta`, `detail`, or `all`.
    pub routes_format: String,

    /// Named auth schemes: scheme name to htpasswd-style credential file.
    pub auth_schemes: HashMap<String, String>,

    pub registry: RegistryConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: vec![ListenConfig::parse(":9999;proto=http").expect("default listener")],
            admin_addr: "127.0.0.1:9998".to_string(),
            strategy: Strategy::Random,
            matcher: Matcher::Prefix,
            dial_timeout: Duration::from_secs(30),
            response_header_timeout: Duration::from_secs(0),
            keep_alive_timeout: Duration::from_secs(0),
            idle_conn_timeout: Duration::from_secs(15),
            max_conn: 10_000,
            shutdown_wait: Duration::from_secs(0),
            glob_cache_size: 1000,
            glob_matching_disabled: false,
            trace_header: "Trace-Id".to_string(),
            tag_header: "X-Route-Tags".to_string(),
            routes_format: "delta".to_string(),
            auth_schemes: HashMap::new(),
            registry: RegistryConfig::default(),
        }
    }
}

impl ProxyConfig {
    /// Loads configuration from environment variables, overlaying the TOML
    /// file named by `PROXY_CONFIG_FILE` first when present.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Ok(path) = env::var("PROXY_CONFIG_FILE") {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| ProxyError::Config(format!("cannot read {}: {}", path, e)))?;
            cfg = Self::from_toml(&content)?;
        }

        if let Ok(specs) = env::var("PROXY_LISTEN") {
            cfg.listen = specs
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ListenConfig::parse)
                .collect::<Result<_>>()?;
        }
        if let Ok(addr) = env::var("PROXY_ADMIN_ADDR") {
            cfg.admin_addr = addr;
        }
        if let Ok(s) = env::var("PROXY_STRATEGY") {
            cfg.strategy = s.parse()?;
        }
        if let Ok(m) = env::var("PROXY_MATCHER") {
            cfg.matcher = m.parse()?;
        }
        if let Ok(v) = env::var("PROXY_SHUTDOWN_WAIT") {
            cfg.shutdown_wait = parse_duration(&v)?;
        }
        if let Ok(b) = env::var("REGISTRY_BACKEND") {
            cfg.registry.backend = b;
        }
        if let Ok(r) = env::var("REGISTRY_STATIC_ROUTES") {
            cfg.registry.static_routes = r;
        }
        if let Ok(p) = env::var("REGISTRY_FILE_PATH") {
            cfg.registry.file_path = p;
        }

        if cfg.listen.is_empty() {
            return Err(ProxyError::Config("no listeners configured".to_string()));
        }
        Ok(cfg)
    }

    /// Loads configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(content)
            .map_err(|e| ProxyError::Config(format!("toml: {}", e)))?;
        raw.into_config()
    }
}

/// Serde shape of the TOML file. Durations are written as strings
/// (`"30s"`, `"250ms"`), listener specs in the compact form.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    proxy: RawProxy,
    #[serde(default)]
    registry: RawRegistry,
}

#[derive(Debug, Default, Deserialize)]
struct RawProxy {
    listen: Option<Vec<String>>,
    admin_addr: Option<String>,
    strategy: Option<String>,
    matcher: Option<String>,
    dial_timeout: Option<String>,
    response_header_timeout: Option<String>,
    keep_alive_timeout: Option<String>,
    idle_conn_timeout: Option<String>,
    max_conn: Option<usize>,
    shutdown_wait: Option<String>,
    glob_cache_size: Option<usize>,
    glob_matching_disabled: Option<bool>,
    trace_header: Option<String>,
    tag_header: Option<String>,
    routes_format: Option<String>,
    #[serde(default)]
    auth_schemes: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRegistry {
    backend: Option<String>,
    static_routes: Option<String>,
    static_noroute_html: Option<String>,
    file_path: Option<String>,
    noroute_html_path: Option<String>,
    poll: Option<String>,
    timeout: Option<String>,
    retry: Option<String>,
}

impl RawConfig {
    fn into_config(self) -> Result<ProxyConfig> {
        let mut cfg = ProxyConfig::default();
        let p = self.proxy;

        if let Some(specs) = p.listen {
            cfg.listen = specs
                .iter()
                .map(|s| ListenConfig::parse(s))
                .collect::<Result<_>>()?;
        }
        if let Some(v) = p.admin_addr {
            cfg.admin_addr = v;
        }
        if let Some(v) = p.strategy {
            cfg.strategy = v.parse()?;
        }
        if let Some(v) = p.matcher {
            cfg.matcher = v.parse()?;
        }
        if let Some(v) = p.dial_timeout {
            cfg.dial_timeout = parse_duration(&v)?;
        }
        if let Some(v) = p.response_header_timeout {
            cfg.response_header_timeout = parse_duration(&v)?;
        }
        if let Some(v) = p.keep_alive_timeout {
            cfg.keep_alive_timeout = parse_duration(&v)?;
        }
        if let Some(v) = p.idle_conn_timeout {
            cfg.idle_conn_timeout = parse_duration(&v)?;
        }
        if let Some(v) = p.max_conn {
            cfg.max_conn = v;
        }
        if let Some(v) = p.shutdown_wait {
            cfg.shutdown_wait = parse_duration(&v)?;
        }
        if let Some(v) = p.glob_cache_size {
            cfg.glob_cache_size = v;
        }
        if let Some(v) = p.glob_matching_disabled {
            cfg.glob_matching_disabled = v;
        }
        if let Some(v) = p.trace_header {
            cfg.trace_header = v;
        }
        if let Some(v) = p.tag_header {
            cfg.tag_header = v;
        }
        if let Some(v) = p.routes_format {
            cfg.routes_format = v;
        }
        cfg.auth_schemes = p.auth_schemes;

        let r = self.registry;
        if let Some(v) = r.backend {
            cfg.registry.backend = v;
        }
        if let Some(v) = r.static_routes {
            cfg.registry.static_routes = v;
        }
        if let Some(v) = r.static_noroute_html {
            cfg.registry.static_noroute_html = v;
        }
        if let Some(v) = r.file_path {
            cfg.registry.file_path = v;
        }
        if let Some(v) = r.noroute_html_path {
            cfg.registry.noroute_html_path = v;
        }
        if let Some(v) = r.poll {
            cfg.registry.poll = parse_duration(&v)?;
        }
        if let Some(v) = r.timeout {
            cfg.registry.timeout = parse_duration(&v)?;
        }
        if let Some(v) = r.retry {
            cfg.registry.retry = parse_duration(&v)?;
        }

        Ok(cfg)
    }
}

/// Parses `"30s"`, `"250ms"`, `"1m"`, `"2h"`, or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (num, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let n: u64 = num
        .parse()
        .map_err(|_| ProxyError::Config(format!("invalid duration {:?}", s)))?;
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        other => Err(ProxyError::Config(format!(
            "invalid duration unit {:?} in {:?}",
            other, s
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("abc").is_err());
    }

    #[test]
    fn test_listen_spec_basic() {
        let l = ListenConfig::parse(":9999;proto=tcp+sni").unwrap();
        assert_eq!(l.addr, ":9999");
        assert_eq!(l.proto, Proto::TcpSni);
        assert!(l.cert_source.is_none());
    }

    #[test]
    fn test_listen_spec_tls() {
        let l =
            ListenConfig::parse(":443;proto=https;cs=cert.pem:key.pem;tlsmin=1.2;refresh=10s")
                .unwrap();
        assert_eq!(l.proto, Proto::Https);
        let cs = l.cert_source.unwrap();
        assert_eq!(cs.cert_path, "cert.pem");
        assert_eq!(cs.key_path, "key.pem");
        assert_eq!(l.tls_min.as_deref(), Some("1.2"));
        assert_eq!(l.refresh, Duration::from_secs(10));
    }

    #[test]
    fn test_listen_spec_requires_cert_for_tls_protos() {
        assert!(ListenConfig::parse(":443;proto=https").is_err());
        assert!(ListenConfig::parse(":443;proto=https+tcp+sni").is_err());
    }

    #[test]
    fn test_unknown_proto_rejected() {
        assert!(ListenConfig::parse(":80;proto=quic").is_err());
    }

    #[test]
    fn test_from_toml() {
        let cfg = ProxyConfig::from_toml(
            r#"
            [proxy]
            listen = [":8080;proto=http", ":8443;proto=https;cs=c.pem:k.pem"]
            strategy = "rr"
            matcher = "iprefix"
            shutdown_wait = "5s"
            max_conn = 512

            [registry]
            backend = "file"
            file_path = "routes.txt"
            poll = "2s"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.listen.len(), 2);
        assert_eq!(cfg.strategy, Strategy::RoundRobin);
        assert_eq!(cfg.matcher, Matcher::IPrefix);
        assert_eq!(cfg.shutdown_wait, Duration::from_secs(5));
        assert_eq!(cfg.max_conn, 512);
        assert_eq!(cfg.registry.backend, "file");
        assert_eq!(cfg.registry.poll, Duration::from_secs(2));
    }

    #[test]
    fn test_default_config() {
        let cfg = ProxyConfig::default();
        assert_eq!(cfg.listen.len(), 1);
        assert_eq!(cfg.listen[0].proto, Proto::Http);
        assert_eq!(cfg.routes_format, "delta");
    }
}
