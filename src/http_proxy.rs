//! HTTP(S) forwarder: per-request lookup, transport selection, header
//! policy, and upstream call.
//!
//! Every request loads the current table snapshot once, resolves a target
//! by host/path/tags, and forwards over a transport chosen by the target
//! scheme: the pooled plain-HTTP client, a TLS connection (with an
//! insecure variant for `tlsskipverify` targets), or the local
//! filesystem for `file` targets. Upgrade requests are hijacked and
//! spliced bidirectionally.

use crate::auth::AuthScheme;
use crate::config::{parse_duration, ProxyConfig};
use crate::error::{ProxyError, Result};
use crate::glob::GlobCache;
use crate::metrics::Metrics;
use crate::noroute;
use crate::table::{normalize_host, TableHandle, Target};
use http::header::{HeaderName, HeaderValue, CONNECTION, HOST, UPGRADE};
use http::{Request, Response, StatusCode, Uri};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tower::Service;
use tracing::{debug, instrument, warn};

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Hop-by-hop headers stripped before forwarding.
const HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Per-connection request context set by the listener.
#[derive(Debug, Clone, Copy)]
pub struct ConnContext {
    pub peer_addr: SocketAddr,
    pub local_port: u16,
    /// Listener terminated TLS for this connection.
    pub tls: bool,
}

/// HTTP proxy service that forwards requests via the routing table.
///
/// Implements `tower::Service` for composability; cloned per connection
/// with the connection's context attached.
#[derive(Clone)]
pub struct HttpProxy {
    cfg: Arc<ProxyConfig>,
    table: Arc<TableHandle>,
    glob: Arc<GlobCache>,
    auth: Arc<HashMap<String, Arc<dyn AuthScheme>>>,
    client: Client<HttpConnector, Incoming>,
    tls: Arc<rustls::ClientConfig>,
    insecure_tls: Arc<rustls::ClientConfig>,
    ctx: ConnContext,
}

impl HttpProxy {
    pub fn new(
        cfg: Arc<ProxyConfig>,
        table: Arc<TableHandle>,
        glob: Arc<GlobCache>,
        auth: Arc<HashMap<String, Arc<dyn AuthScheme>>>,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(cfg.dial_timeout));
        if !cfg.keep_alive_timeout.is_zero() {
            connector.set_keepalive(Some(cfg.keep_alive_timeout));
        }
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(cfg.idle_conn_timeout)
            .pool_max_idle_per_host(cfg.max_conn)
            .build(connector);

        Self {
            client,
            tls: Arc::new(crate::tls::client_config()),
            insecure_tls: Arc::new(crate::tls::insecure_client_config()),
            cfg,
            table,
            glob,
            auth,
            ctx: ConnContext {
                peer_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
                local_port: 0,
                tls: false,
            },
        }
    }

    /// Returns a clone bound to an accepted connection.
    pub fn with_conn(&self, peer_addr: SocketAddr, local_port: u16, tls: bool) -> Self {
        let mut this = self.clone();
        this.ctx = ConnContext {
            peer_addr,
            local_port,
            tls,
        };
        this
    }

    /// Resolves the target for a request against the current table.
    fn lookup(&self, req: &Request<Incoming>) -> Option<Arc<Target>> {
        let host_raw = req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .or_else(|| {
                req.headers()
                    .get(HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(String::from)
            })
            .unwrap_or_default();
        let host = normalize_host(&host_raw, self.ctx.tls);
        let path = req.uri().path();

        let tags_owned: Option<Vec<String>> = req
            .headers()
            .get(self.cfg.tag_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect()
            });
        let tag_set: Option<HashSet<&str>> = tags_owned
            .as_ref()
            .map(|v| v.iter().map(String::as_str).collect());

        let trace = req
            .headers()
            .get(self.cfg.trace_header.as_str())
            .and_then(|v| v.to_str().ok());

        let table = self.table.load();
        table.lookup(
            &host,
            path,
            tag_set.as_ref(),
            trace,
            self.cfg.strategy,
            self.cfg.matcher,
            &self.glob,
            self.cfg.glob_matching_disabled,
        )
    }

    #[instrument(level = "debug", skip(self, req), fields(method = %req.method(), uri = %req.uri()))]
    async fn forward_request(&self, mut req: Request<Incoming>) -> Result<Response<ProxyBody>> {
        let start = Instant::now();
        let method = req.method().to_string();

        let target = match self.lookup(&req) {
            Some(t) => t,
            None => {
                Metrics::inc_noroute("http");
                warn!(host = ?req.headers().get(HOST), uri = %req.uri(), "no route");
                return Ok(noroute_response());
            }
        };

        // Auth runs before any forwarding work.
        if let Some(name) = target.opts.get("auth") {
            match self.auth.get(name) {
                Some(scheme) if scheme.authorized(req.headers()) => {}
                Some(scheme) => return Ok(auth_failure_response(scheme.as_ref())),
                None => {
                    warn!(scheme = %name, "unknown auth scheme");
                    return Ok(error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "unknown auth scheme",
                    ));
                }
            }
        }

        let fwd_path = forwarded_path(&target, req.uri());

        if let Some(code) = target.opts.get("redirect") {
            return Ok(redirect_response(&target, code, &fwd_path));
        }

        let deadline = target
            .opts
            .get("timeout")
            .and_then(|v| parse_duration(v).ok())
            .unwrap_or(self.cfg.response_header_timeout);

        let response = match target.proto() {
            "http" | "https" => {
                if is_upgrade_request(&req) {
                    self.forward_upgrade(req, &target, &fwd_path).await
                } else {
                    self.forward_http(req, &target, &fwd_path, deadline).await
                }
            }
            "file" => serve_file(&target, &fwd_path).await,
            other => {
                warn!(proto = %other, upstream = %target.url, "target not reachable via http listener");
                Ok(error_response(
                    StatusCode::BAD_GATEWAY,
                    "target protocol not reachable via http listener",
                ))
            }
        };

        let duration = start.elapsed().as_secs_f64();
        if let Ok(resp) = &response {
            Metrics::record_request("http", &method, resp.status().as_u16(), duration);
            Metrics::record_target(&target.timer_name, duration);
            debug!(
                method = %method,
                status = resp.status().as_u16(),
                upstream = %target.url,
                duration_ms = duration * 1000.0,
                "request completed"
            );
        }
        response
    }

    /// Forwards over the pooled plain client or a fresh TLS connection.
    async fn forward_http(
        &self,
        mut req: Request<Incoming>,
        target: &Target,
        fwd_path: &str,
        deadline: Duration,
    ) -> Result<Response<ProxyBody>> {
        self.apply_header_policy(&mut req, target, false);

        let authority = target_authority(target)?;
        let secure = target.proto() == "https";

        let result = if secure {
            let uri: Uri = fwd_path
                .parse()
                .map_err(|e| ProxyError::Config(format!("bad forward path: {}", e)))?;
            *req.uri_mut() = uri;
            let insecure = target.opts.get("tlsskipverify").map(String::as_str) == Some("true");
            let (host, port) = target_host_port(target, 443)?;
            with_deadline(deadline, self.https_request(req, &host, port, insecure, false)).await
        } else {
            let uri: Uri = format!("http://{}{}", authority, fwd_path)
                .parse()
                .map_err(|e| ProxyError::Config(format!("bad upstream uri: {}", e)))?;
            *req.uri_mut() = uri;
            with_deadline(deadline, async {
                self.client.request(req).await.map_err(|e| {
                    ProxyError::UpstreamConnect {
                        addr: authority.clone(),
                        source: std::io::Error::other(e),
                    }
                })
            })
            .await
        };

        match result {
            Ok(resp) => {
                let (parts, body) = resp.into_parts();
                Ok(Response::from_parts(parts, body.boxed()))
            }
            Err(ProxyError::UpstreamTimeout { duration_ms }) => {
                warn!(upstream = %target.url, timeout_ms = duration_ms, "upstream timed out");
                Ok(error_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    "upstream request timed out",
                ))
            }
            Err(e) => {
                warn!(upstream = %target.url, error = %e, "upstream request failed");
                Ok(error_response(
                    StatusCode::BAD_GATEWAY,
                    "upstream request failed",
                ))
            }
        }
    }

    /// Sends one request over a dedicated TLS connection.
    ///
    /// TLS upstreams skip the shared pool; each request carries its own
    /// handshake.
    async fn https_request(
        &self,
        req: Request<Incoming>,
        host: &str,
        port: u16,
        insecure: bool,
        upgrades: bool,
    ) -> Result<Response<Incoming>> {
        let tcp = timeout(self.cfg.dial_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ProxyError::UpstreamTimeout {
                duration_ms: self.cfg.dial_timeout.as_millis() as u64,
            })?
            .map_err(|e| ProxyError::UpstreamConnect {
                addr: format!("{}:{}", host, port),
                source: e,
            })?;

        let config = if insecure {
            Arc::clone(&self.insecure_tls)
        } else {
            Arc::clone(&self.tls)
        };
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|e| ProxyError::TlsHandshake(e.to_string()))?;
        let tls = TlsConnector::from(config)
            .connect(server_name, tcp)
            .await
            .map_err(|e| ProxyError::TlsHandshake(e.to_string()))?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls)).await?;
        if upgrades {
            tokio::spawn(conn.with_upgrades());
        } else {
            tokio::spawn(conn);
        }
        Ok(sender.send_request(req).await?)
    }

    /// Hijacks an Upgrade request (WebSocket and friends): performs the
    /// upstream handshake on a dedicated connection and, on 101, splices
    /// both upgraded halves until either side closes.
    async fn forward_upgrade(
        &self,
        mut req: Request<Incoming>,
        target: &Target,
        fwd_path: &str,
    ) -> Result<Response<ProxyBody>> {
        self.apply_header_policy(&mut req, target, true);

        let authority = target_authority(target)?;
        let client_upgrade = hyper::upgrade::on(&mut req);

        let uri: Uri = fwd_path
            .parse()
            .map_err(|e| ProxyError::Config(format!("bad forward path: {}", e)))?;
        *req.uri_mut() = uri;

        let mut upstream_resp = if target.proto() == "https" {
            let insecure = target.opts.get("tlsskipverify").map(String::as_str) == Some("true");
            let (host, port) = target_host_port(target, 443)?;
            self.https_request(req, &host, port, insecure, true).await?
        } else {
            let (host, port) = target_host_port(target, 80)?;
            let tcp = timeout(self.cfg.dial_timeout, TcpStream::connect((host.as_str(), port)))
                .await
                .map_err(|_| ProxyError::UpstreamTimeout {
                    duration_ms: self.cfg.dial_timeout.as_millis() as u64,
                })?
                .map_err(|e| ProxyError::UpstreamConnect {
                    addr: authority.clone(),
                    source: e,
                })?;
            let (mut sender, conn) =
                hyper::client::conn::http1::handshake(TokioIo::new(tcp)).await?;
            tokio::spawn(conn.with_upgrades());
            sender.send_request(req).await?
        };

        if upstream_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
            let (parts, body) = upstream_resp.into_parts();
            return Ok(Response::from_parts(parts, body.boxed()));
        }

        let upstream_upgrade = hyper::upgrade::on(&mut upstream_resp);
        tokio::spawn(async move {
            match (client_upgrade.await, upstream_upgrade.await) {
                (Ok(client_io), Ok(upstream_io)) => {
                    let mut client_io = TokioIo::new(client_io);
                    let mut upstream_io = TokioIo::new(upstream_io);
                    if let Err(e) =
                        tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await
                    {
                        debug!(error = %e, "upgrade splice ended");
                    }
                }
                (c, u) => {
                    warn!(client = c.is_ok(), upstream = u.is_ok(), "upgrade failed");
                }
            }
        });

        let (parts, _) = upstream_resp.into_parts();
        Ok(Response::from_parts(
            parts,
            Empty::new().map_err(|never| match never {}).boxed(),
        ))
    }

    /// Applies the proxy header policy: forwarding headers, hop-by-hop
    /// stripping, and the upstream Host override.
    fn apply_header_policy(&self, req: &mut Request<Incoming>, target: &Target, upgrading: bool) {
        // Names listed in the Connection header are connection-scoped.
        let mut connection_scoped: Vec<HeaderName> = Vec::new();
        for value in req.headers().get_all(CONNECTION) {
            if let Ok(v) = value.to_str() {
                for name in v.split(',') {
                    if let Ok(h) = name.trim().parse::<HeaderName>() {
                        connection_scoped.push(h);
                    }
                }
            }
        }

        let upgrade_value = req.headers().get(UPGRADE).cloned();

        let headers = req.headers_mut();
        for name in HOP_HEADERS {
            headers.remove(name);
        }
        for name in connection_scoped {
            headers.remove(&name);
        }
        if upgrading {
            if let Some(v) = upgrade_value {
                headers.insert(UPGRADE, v);
                headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
            }
        }

        let peer_ip = self.ctx.peer_addr.ip().to_string();
        let proto = if self.ctx.tls { "https" } else { "http" };

        match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(existing) => {
                let combined = format!("{}, {}", existing, peer_ip);
                if let Ok(v) = HeaderValue::from_str(&combined) {
                    headers.insert("x-forwarded-for", v);
                }
            }
            None => {
                if let Ok(v) = HeaderValue::from_str(&peer_ip) {
                    headers.insert("x-forwarded-for", v);
                }
            }
        }
        if !headers.contains_key("x-forwarded-proto") {
            let v = if self.ctx.tls {
                HeaderValue::from_static("https")
            } else {
                HeaderValue::from_static("http")
            };
            headers.insert("x-forwarded-proto", v);
        }
        if !headers.contains_key("x-forwarded-port") {
            if let Ok(v) = HeaderValue::from_str(&self.ctx.local_port.to_string()) {
                headers.insert("x-forwarded-port", v);
            }
        }
        if !headers.contains_key("forwarded") {
            let forwarded = format!("for={}; proto={}", peer_ip, proto);
            if let Ok(v) = HeaderValue::from_str(&forwarded) {
                headers.insert("forwarded", v);
            }
        }

        // Host policy: preserve inbound Host unless the target overrides.
        match target.opts.get("host").map(String::as_str) {
            Some("dst") => {
                if let Some(authority) = target.url.authority() {
                    if let Ok(v) = HeaderValue::from_str(authority.as_str()) {
                        headers.insert(HOST, v);
                    }
                }
            }
            Some(literal) => {
                if let Ok(v) = HeaderValue::from_str(literal) {
                    headers.insert(HOST, v);
                }
            }
            None => {}
        }
    }
}

impl Service<Request<Incoming>> for HttpProxy {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            let response = match this.forward_request(req).await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!("proxy error: {}", e);
                    error_response(StatusCode::BAD_GATEWAY, "proxy error")
                }
            };
            Ok(response)
        })
    }
}

/// Runs `fut` under the response-header deadline. Zero disables it.
async fn with_deadline<F>(deadline: Duration, fut: F) -> Result<Response<Incoming>>
where
    F: Future<Output = Result<Response<Incoming>>>,
{
    if deadline.is_zero() {
        return fut.await;
    }
    match timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::UpstreamTimeout {
            duration_ms: deadline.as_millis() as u64,
        }),
    }
}

/// Joins the target base path, the (optionally stripped) request path,
/// and the query string.
fn forwarded_path(target: &Target, uri: &Uri) -> String {
    let mut path = uri.path().to_string();
    if let Some(prefix) = target.opts.get("strip") {
        if let Some(rest) = path.strip_prefix(prefix.as_str()) {
            path = if rest.starts_with('/') {
                rest.to_string()
            } else {
                format!("/{}", rest)
            };
        }
    }

    let base = target.url.path().trim_end_matches('/');
    let mut full = if base.is_empty() {
        path
    } else {
        format!("{}{}", base, path)
    };
    if let Some(q) = uri.query() {
        full.push('?');
        full.push_str(q);
    }
    full
}

fn target_authority(target: &Target) -> Result<String> {
    target
        .url
        .authority()
        .map(|a| a.to_string())
        .ok_or_else(|| ProxyError::Config(format!("target URL {} has no authority", target.url)))
}

fn target_host_port(target: &Target, default_port: u16) -> Result<(String, u16)> {
    let host = target
        .url
        .host()
        .ok_or_else(|| ProxyError::Config(format!("target URL {} has no host", target.url)))?
        .to_string();
    Ok((host, target.url.port_u16().unwrap_or(default_port)))
}

fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let has_upgrade = req.headers().contains_key(UPGRADE);
    let connection_upgrade = req
        .headers()
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| {
            v.split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
        });
    has_upgrade && connection_upgrade
}

/// Serves a `file` target: the target path is the root directory, the
/// request path selects the file.
async fn serve_file(target: &Target, fwd_path: &str) -> Result<Response<ProxyBody>> {
    // The target URL path is the directory root, so drop it from the
    // forwarded path again before joining with the filesystem root.
    let root = target.url.path();
    let rel = fwd_path
        .strip_prefix(root.trim_end_matches('/'))
        .unwrap_or(fwd_path)
        .trim_start_matches('/');
    let rel = rel.split('?').next().unwrap_or(rel);

    if rel.split('/').any(|seg| seg == "..") {
        return Ok(error_response(StatusCode::BAD_REQUEST, "invalid path"));
    }

    let full = std::path::Path::new(root).join(rel);
    match tokio::fs::read(&full).await {
        Ok(bytes) => {
            let mime = content_type(&full);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", mime)
                .body(Full::new(Bytes::from(bytes)).map_err(|never| match never {}).boxed())?)
        }
        Err(e) => {
            debug!(path = %full.display(), error = %e, "file target read failed");
            Ok(error_response(StatusCode::NOT_FOUND, "not found"))
        }
    }
}

fn content_type(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

fn redirect_response(target: &Target, code: &str, fwd_path: &str) -> Response<ProxyBody> {
    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|c| StatusCode::from_u16(c).ok())
        .filter(StatusCode::is_redirection);
    let status = match status {
        Some(s) => s,
        None => {
            warn!(code = %code, "invalid redirect code");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "invalid redirect");
        }
    };

    let scheme = target.url.scheme_str().unwrap_or("http");
    let authority = target
        .url
        .authority()
        .map(|a| a.as_str())
        .unwrap_or_default();
    let location = format!("{}://{}{}", scheme, authority, fwd_path);

    Response::builder()
        .status(status)
        .header("Location", location)
        .body(Empty::new().map_err(|never| match never {}).boxed())
        .unwrap_or_else(|_| error_response(StatusCode::INTERNAL_SERVER_ERROR, "redirect"))
}

/// Renders the configured no-route body with status 404.
pub fn noroute_response() -> Response<ProxyBody> {
    let html = noroute::html();
    let builder = Response::builder().status(StatusCode::NOT_FOUND);
    let resp = if html.is_empty() {
        builder.body(Empty::new().map_err(|never| match never {}).boxed())
    } else {
        builder
            .header("Content-Type", "text/html; charset=utf-8")
            .body(
                Full::new(Bytes::from(html.as_bytes().to_vec()))
                    .map_err(|never| match never {})
                    .boxed(),
            )
    };
    resp.unwrap_or_else(|_| error_response(StatusCode::NOT_FOUND, ""))
}

fn auth_failure_response(scheme: &dyn AuthScheme) -> Response<ProxyBody> {
    let mut builder = Response::builder().status(scheme.failure_status());
    for (name, value) in scheme.failure_headers() {
        builder = builder.header(name, value);
    }
    builder
        .body(Empty::new().map_err(|never| match never {}).boxed())
        .unwrap_or_else(|_| error_response(StatusCode::UNAUTHORIZED, ""))
}

pub fn error_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(message.to_string()))
        .map_err(|never| match never {})
        .boxed();
    Response::builder()
        .status(status)
        .body(body)
        .unwrap_or_else(|_| Response::new(Empty::new().map_err(|never| match never {}).boxed()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target_with_opts(url: &str, opts: &[(&str, &str)]) -> Target {
        Target {
            service: "svc".to_string(),
            url: url.parse().unwrap(),
            tags: Vec::new(),
            opts: opts
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            fixed_weight: None,
            weight: 1.0,
            timer_name: "svc.test".to_string(),
        }
    }

    #[test]
    fn test_forwarded_path_joins_base() {
        let t = target_with_opts("http://10.0.0.1:80/base/", &[]);
        let uri: Uri = "/v1/users?x=1".parse().unwrap();
        assert_eq!(forwarded_path(&t, &uri), "/base/v1/users?x=1");
    }

    #[test]
    fn test_forwarded_path_strips_prefix() {
        let t = target_with_opts("http://10.0.0.1:80/", &[("strip", "/api")]);
        let uri: Uri = "/api/v1/users".parse().unwrap();
        assert_eq!(forwarded_path(&t, &uri), "/v1/users");
    }

    #[test]
    fn test_target_host_port() {
        let t = target_with_opts("http://10.0.0.1:8080/", &[]);
        assert_eq!(target_host_port(&t, 80).unwrap(), ("10.0.0.1".to_string(), 8080));
        let t = target_with_opts("https://example.com/", &[]);
        assert_eq!(target_host_port(&t, 443).unwrap(), ("example.com".to_string(), 443));
    }

    #[test]
    fn test_redirect_response() {
        let t = target_with_opts("https://example.com:443/", &[("redirect", "301")]);
        let resp = redirect_response(&t, "301", "/new");
        assert_eq!(resp.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            resp.headers().get("Location").unwrap(),
            "https://example.com:443/new"
        );
    }

    #[test]
    fn test_redirect_rejects_non_redirect_code() {
        let t = target_with_opts("http://example.com/", &[]);
        let resp = redirect_response(&t, "200", "/");
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_noroute_response_uses_html_cell() {
        noroute::set_html("<h1>404</h1>".to_string());
        let resp = noroute_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            resp.headers().get("Content-Type").unwrap(),
            "text/html; charset=utf-8"
        );
        noroute::set_html(String::new());
    }

    #[test]
    fn test_content_type() {
        assert_eq!(
            content_type(std::path::Path::new("index.html")),
            "text/html; charset=utf-8"
        );
        assert_eq!(
            content_type(std::path::Path::new("data.bin")),
            "application/octet-stream"
        );
    }
}
