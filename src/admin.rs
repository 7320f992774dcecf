//! Admin endpoints: health, metrics, routes, and version.

use crate::metrics::Metrics;
use crate::table::TableHandle;
use http::{Request, Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;
use tracing::{debug, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Admin service exposing the proxy's observable state.
///
/// Serves:
/// - `/health` - liveness probe
/// - `/metrics` - Prometheus text exposition
/// - `/routes` - current routing table as route commands
/// - `/api/routes` - the same command list as a JSON array
/// - `/version` - build version
#[derive(Clone)]
pub struct AdminService {
    table: Arc<TableHandle>,
}

impl AdminService {
    pub fn new(table: Arc<TableHandle>) -> Self {
        Self { table }
    }

    async fn handle_request(
        self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
        let path = req.uri().path();

        match path {
            "/health" => {
                debug!("health check requested");
                Ok(Self::text_response(StatusCode::OK, "healthy"))
            }
            "/metrics" => match Metrics::encode() {
                Ok(metrics) => Ok(Self::metrics_response(metrics)),
                Err(e) => {
                    warn!("failed to encode metrics: {}", e);
                    Ok(Self::text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "failed to encode metrics",
                    ))
                }
            },
            "/routes" => {
                let table = self.table.load();
                Ok(Self::text_response(StatusCode::OK, &table.dump()))
            }
            "/api/routes" => {
                let table = self.table.load();
                let dump = table.dump();
                let commands: Vec<&str> = dump.lines().collect();
                match serde_json::to_string(&commands) {
                    Ok(body) => Ok(Self::json_response(&body)),
                    Err(e) => {
                        warn!("failed to encode routes: {}", e);
                        Ok(Self::text_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "failed to encode routes",
                        ))
                    }
                }
            }
            "/version" => Ok(Self::text_response(StatusCode::OK, VERSION)),
            _ => Ok(Self::text_response(StatusCode::NOT_FOUND, "not found")),
        }
    }

    fn text_response(status: StatusCode, body: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        Response::builder()
            .status(status)
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(
                Full::new(Bytes::from(body.to_string()))
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .unwrap_or_else(|_| {
                Response::new(
                    Full::new(Bytes::new())
                        .map_err(|never| match never {})
                        .boxed(),
                )
            })
    }

    fn json_response(body: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/json")
            .body(
                Full::new(Bytes::from(body.to_string()))
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .unwrap_or_else(|_| {
                Response::new(
                    Full::new(Bytes::new())
                        .map_err(|never| match never {})
                        .boxed(),
                )
            })
    }

    fn metrics_response(metrics: String) -> Response<BoxBody<Bytes, hyper::Error>> {
        Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(
                Full::new(Bytes::from(metrics))
                    .map_err(|never| match never {})
                    .boxed(),
            )
            .unwrap_or_else(|_| {
                Response::new(
                    Full::new(Bytes::new())
                        .map_err(|never| match never {})
                        .boxed(),
                )
            })
    }
}

impl Service<Request<Incoming>> for AdminService {
    type Response = Response<BoxBody<Bytes, hyper::Error>>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Incoming>) -> Self::Future {
        Box::pin(self.clone().handle_request(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::Table;

    #[test]
    fn test_text_response() {
        let resp = AdminService::text_response(StatusCode::OK, "healthy");
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn test_metrics_response_content_type() {
        let resp = AdminService::metrics_response("m 1".to_string());
        assert_eq!(
            resp.headers().get("Content-Type").unwrap(),
            "text/plain; version=0.0.4"
        );
    }

    #[test]
    fn test_routes_dump_available() {
        let handle = Arc::new(TableHandle::new());
        handle.store(Table::parse("route add a example.com/ http://10.0.0.1:80/").unwrap());
        let svc = AdminService::new(Arc::clone(&handle));
        let dump = svc.table.load().dump();
        assert!(dump.contains("route add a example.com/"));
    }

    #[test]
    fn test_json_response_shape() {
        let commands = vec!["route add a example.com/ http://10.0.0.1:80/"];
        let body = serde_json::to_string(&commands).unwrap();
        let resp = AdminService::json_response(&body);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }
}
