//! Pluggable authentication schemes for targets.
//!
//! A target opting into auth names a scheme via `opts "auth=<name>"`. The
//! scheme inspects the request headers before forwarding; a failure
//! short-circuits the request with the scheme's status code.

use crate::error::{ProxyError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use http::header::AUTHORIZATION;
use http::{HeaderMap, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// An authentication scheme applied before forwarding.
pub trait AuthScheme: Send + Sync {
    /// True when the request may proceed.
    fn authorized(&self, headers: &HeaderMap) -> bool;

    /// Status returned on failure.
    fn failure_status(&self) -> StatusCode {
        StatusCode::UNAUTHORIZED
    }

    /// Extra response headers on failure (e.g. a challenge).
    fn failure_headers(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }
}

/// Loads the schemes named in the config. Values are paths to
/// `user:password` credential files.
pub fn load_auth_schemes(
    schemes: &HashMap<String, String>,
) -> Result<HashMap<String, Arc<dyn AuthScheme>>> {
    let mut out: HashMap<String, Arc<dyn AuthScheme>> = HashMap::new();
    for (name, path) in schemes {
        let scheme = BasicAuth::from_file(name.clone(), path)?;
        info!(scheme = %name, file = %path, "loaded auth scheme");
        out.insert(name.clone(), Arc::new(scheme));
    }
    Ok(out)
}

/// HTTP Basic authentication against a static credential file.
pub struct BasicAuth {
    realm: String,
    /// user -> password
    credentials: HashMap<String, String>,
}

impl BasicAuth {
    pub fn from_file(realm: String, path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("cannot read auth file {}: {}", path, e))
        })?;
        Ok(Self::from_content(realm, &content))
    }

    pub fn from_content(realm: String, content: &str) -> Self {
        let credentials = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter_map(|l| {
                l.split_once(':')
                    .map(|(u, p)| (u.to_string(), p.to_string()))
            })
            .collect();
        Self { realm, credentials }
    }

    fn check(&self, header: &str) -> bool {
        let encoded = match header.strip_prefix("Basic ") {
            Some(e) => e,
            None => return false,
        };
        let decoded = match STANDARD.decode(encoded) {
            Ok(d) => d,
            Err(_) => return false,
        };
        let pair = match std::str::from_utf8(&decoded) {
            Ok(p) => p,
            Err(_) => return false,
        };
        match pair.split_once(':') {
            Some((user, pass)) => self
                .credentials
                .get(user)
                .is_some_and(|expected| expected == pass),
            None => false,
        }
    }
}

impl AuthScheme for BasicAuth {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| self.check(v))
    }

    fn failure_headers(&self) -> Vec<(&'static str, String)> {
        vec![(
            "WWW-Authenticate",
            format!("Basic realm=\"{}\"", self.realm),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn scheme() -> BasicAuth {
        BasicAuth::from_content("test".to_string(), "admin:secret\n# comment\nbob:hunter2\n")
    }

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_basic_auth_accepts_valid() {
        // admin:secret
        let headers = headers_with_auth("Basic YWRtaW46c2VjcmV0");
        assert!(scheme().authorized(&headers));
    }

    #[test]
    fn test_basic_auth_rejects_bad_password() {
        // admin:wrong
        let headers = headers_with_auth("Basic YWRtaW46d3Jvbmc=");
        assert!(!scheme().authorized(&headers));
    }

    #[test]
    fn test_basic_auth_rejects_missing_header() {
        assert!(!scheme().authorized(&HeaderMap::new()));
    }

    #[test]
    fn test_failure_challenge() {
        let headers = scheme().failure_headers();
        assert_eq!(headers[0].0, "WWW-Authenticate");
        assert!(headers[0].1.contains("realm=\"test\""));
    }
}
