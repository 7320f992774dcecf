//! Admin listener for health checks, metrics, and the routes dump.

use crate::admin::AdminService;
use crate::error::{ProxyError, Result};
use crate::table::TableHandle;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::Service;
use tracing::{debug, info, instrument, warn};

/// Admin HTTP listener on a separate port.
///
/// Serves plain HTTP/1.1 only; the admin surface carries no proxied
/// traffic and never terminates TLS.
pub struct AdminListener {
    tcp_listener: TcpListener,
    admin_service: AdminService,
    addr: SocketAddr,
}

impl AdminListener {
    /// Binds the admin endpoint address.
    #[instrument(level = "info", skip(table))]
    pub async fn bind(addr: &str, table: Arc<TableHandle>) -> Result<Self> {
        let bind_err = |e| ProxyError::ListenerBind {
            addr: addr.to_string(),
            source: e,
        };
        let tcp_listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        let local_addr = tcp_listener.local_addr().map_err(bind_err)?;

        info!(addr = %local_addr, "admin endpoint bound");

        Ok(Self {
            tcp_listener,
            admin_service: AdminService::new(table),
            addr: local_addr,
        })
    }

    /// Returns the local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Accepts admin connections until the shutdown broadcast fires.
    /// Each connection is served on its own task.
    #[instrument(level = "info", skip(self, shutdown_rx), fields(addr = %self.addr))]
    pub async fn serve(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("serving admin endpoints");

        loop {
            tokio::select! {
                accepted = self.tcp_listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "admin accept failed");
                            continue;
                        }
                    };
                    let service = self.admin_service.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_admin_conn(stream, service).await {
                            debug!(peer = %peer_addr, error = %e, "admin connection ended");
                        }
                    });
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown: admin listener stopping");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Serves one admin connection over HTTP/1.1.
#[instrument(level = "debug", skip_all)]
async fn serve_admin_conn(stream: tokio::net::TcpStream, service: AdminService) -> Result<()> {
    let svc = service_fn(move |req: Request<Incoming>| {
        let mut service = service.clone();
        async move { service.call(req).await }
    });

    http1::Builder::new()
        .serve_connection(TokioIo::new(stream), svc)
        .await
        .map_err(ProxyError::Http)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bind_reports_ephemeral_port() {
        let table = Arc::new(TableHandle::new());
        let listener = AdminListener::bind("127.0.0.1:0", table).await.unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_bind_failure_is_listener_bind_error() {
        let table = Arc::new(TableHandle::new());
        let result = AdminListener::bind("999.999.999.999:0", table).await;
        assert!(matches!(result, Err(ProxyError::ListenerBind { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_serve_stops_on_shutdown() {
        let table = Arc::new(TableHandle::new());
        let listener = AdminListener::bind("127.0.0.1:0", table).await.unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(listener.serve(shutdown_rx));
        shutdown_tx.send(()).unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("serve did not stop on shutdown")
            .unwrap();
        assert!(result.is_ok());
    }
}
