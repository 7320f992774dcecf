//! gRPC forwarder: transparent HTTP/2 relay over the routing table.
//!
//! The director consults the table for every unknown service invocation,
//! using the `:authority` pseudo-header as host and the full method path
//! (`/package.Service/Method`) as path. Frames are relayed as opaque
//! bytes; messages are never decoded. Backend TLS is selected by the
//! `grpcs` scheme.

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::glob::GlobCache;
use crate::http_proxy::ProxyBody;
use crate::metrics::Metrics;
use crate::table::{normalize_host, TableHandle, Target};
use http::header::HOST;
use http::{Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use std::collections::HashSet;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tower::Service;
use tracing::{debug, instrument, warn};

/// gRPC proxy service for the `grpc`/`grpcs` listeners.
#[derive(Clone)]
pub struct GrpcProxy {
    cfg: Arc<ProxyConfig>,
    table: Arc<TableHandle>,
    glob: Arc<GlobCache>,
    tls: Arc<rustls::ClientConfig>,
    /// Listener terminated TLS for the inbound connection.
    inbound_tls: bool,
}

impl GrpcProxy {
    pub fn new(
        cfg: Arc<ProxyConfig>,
        table: Arc<TableHandle>,
        glob: Arc<GlobCache>,
        inbound_tls: bool,
    ) -> Self {
        Self {
            cfg,
            table,
            glob,
            tls: Arc::new(crate::tls::h2_client_config()),
            inbound_tls,
        }
    }

    /// Director: resolves the target for an invocation.
    fn lookup(&self, req: &Request<Incoming>) -> Option<Arc<Target>> {
        let authority = req
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
        let host = normalize_host(&authority, self.inbound_tls);
        let method = req.uri().path();

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

        let table = self.table.load();
        table.lookup(
            &host,
            method,
            tag_set.as_ref(),
            None,
            self.cfg.strategy,
            self.cfg.matcher,
            &self.glob,
            self.cfg.glob_matching_disabled,
        )
    }

    #[instrument(level = "debug", skip(self, req), fields(method = %req.uri().path()))]
    async fn relay(&self, mut req: Request<Incoming>) -> Result<Response<ProxyBody>> {
        let start = Instant::now();
        let method = req.uri().path().to_string();

        let target = match self.lookup(&req) {
            Some(t) if matches!(t.proto(), "grpc" | "grpcs") => t,
            Some(t) => {
                warn!(upstream = %t.url, proto = %t.proto(), "target is not a grpc backend");
                Metrics::inc_noroute("grpc");
                return grpc_error_response(12, "route is not a grpc backend");
            }
            None => {
                Metrics::inc_noroute("grpc");
                debug!(method = %method, "no route");
                return grpc_error_response(14, "no route");
            }
        };

        let secure = target.proto() == "grpcs";
        let host = target
            .url
            .host()
            .ok_or_else(|| ProxyError::Config(format!("target URL {} has no host", target.url)))?
            .to_string();
        let port = target.url.port_u16().unwrap_or(if secure { 443 } else { 80 });
        let scheme = if secure { "https" } else { "http" };

        let uri: Uri = format!("{}://{}:{}{}", scheme, host, port, method)
            .parse()
            .map_err(|e| ProxyError::Config(format!("bad upstream uri: {}", e)))?;
        *req.uri_mut() = uri;

        let response = match self.dispatch(req, &host, port, secure).await {
            Ok(resp) => {
                let (parts, body) = resp.into_parts();
                Response::from_parts(parts, body.boxed())
            }
            Err(e) => {
                warn!(upstream = %target.url, error = %e, "grpc relay failed");
                return grpc_error_response(14, "upstream unavailable");
            }
        };

        let duration = start.elapsed().as_secs_f64();
        Metrics::record_request("grpc", &method, response.status().as_u16(), duration);
        Metrics::record_target(&target.timer_name, duration);
        Ok(response)
    }

    /// Opens an HTTP/2 connection to the backend and relays the stream.
    async fn dispatch(
        &self,
        req: Request<Incoming>,
        host: &str,
        port: u16,
        secure: bool,
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

        if secure {
            let server_name = ServerName::try_from(host.to_string())
                .map_err(|e| ProxyError::TlsHandshake(e.to_string()))?;
            let tls = TlsConnector::from(Arc::clone(&self.tls))
                .connect(server_name, tcp)
                .await
                .map_err(|e| ProxyError::TlsHandshake(e.to_string()))?;
            let (mut sender, conn) =
                hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(tls))
                    .await?;
            tokio::spawn(conn);
            Ok(sender.send_request(req).await?)
        } else {
            let (mut sender, conn) =
                hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(tcp))
                    .await?;
            tokio::spawn(conn);
            Ok(sender.send_request(req).await?)
        }
    }
}

impl Service<Request<Incoming>> for GrpcProxy {
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
            let response = match this.relay(req).await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!("grpc proxy error: {}", e);
                    grpc_error_response(13, "internal error")
                        .unwrap_or_else(|_| Response::new(empty_body()))
                }
            };
            Ok(response)
        })
    }
}

fn empty_body() -> ProxyBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

/// A gRPC status response: HTTP 200 with `grpc-status`/`grpc-message`
/// trailers-only framing in the headers.
fn grpc_error_response(code: u32, message: &str) -> Result<Response<ProxyBody>> {
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/grpc")
        .header("grpc-status", code.to_string())
        .header("grpc-message", message)
        .body(empty_body())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grpc_error_response_shape() {
        let resp = grpc_error_response(14, "no route").unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers().get("grpc-status").unwrap(), "14");
        assert_eq!(resp.headers().get("content-type").unwrap(), "application/grpc");
    }
}
